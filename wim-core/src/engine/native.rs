//! Engine backed by the system libwim.
//!
//! # Safety
//!
//! Raw session ids are the libwim object pointers themselves. The layers
//! above guarantee that an id is only used while its session is alive and
//! is freed exactly once, which is what every `unsafe` block here relies on.
//! Progress and iteration callbacks receive a pointer to a sink that lives on
//! the calling thread's stack for the whole libwim call.
#![allow(unsafe_code)]

use std::ffi::{CStr, CString, OsStr};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;

use libc::{c_char, c_int, c_uint, c_void, size_t};
use tracing::{debug, error};

use super::{
    Engine, ProgressSink, RawCompressor, RawDecompressor, RawWim, RawWimInfo, ResourceSink,
};
use crate::error::status;
use crate::progress::{
    ExtractProgress, IntegrityProgress, ProgressInfo, ProgressMsg, ScanProgress, ScanStatus,
    SplitProgress, VerifyImageProgress, VerifyStreamsProgress, WriteStreamsProgress,
};
use crate::resource::{ResourceEntry, ResourceHash};

#[repr(C)]
struct WimStruct {
    _private: [u8; 0],
}

#[repr(C)]
struct WimlibCompressor {
    _private: [u8; 0],
}

#[repr(C)]
struct WimlibDecompressor {
    _private: [u8; 0],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy, Default)]
struct WimInfoC {
    guid: [u8; 16],
    image_count: u32,
    boot_index: u32,
    wim_version: u32,
    chunk_size: u32,
    part_number: u16,
    total_parts: u16,
    compression_type: i32,
    total_bytes: u64,
    flags: u32,
    reserved: [u32; 9],
}

const INFO_HAS_INTEGRITY_TABLE: u32 = 1 << 0;
const INFO_OPENED_FROM_FILE: u32 = 1 << 1;
const INFO_IS_READONLY: u32 = 1 << 2;
const INFO_HAS_RPFIX: u32 = 1 << 3;
const INFO_IS_MARKED_READONLY: u32 = 1 << 4;
const INFO_SPANNED: u32 = 1 << 5;
const INFO_WRITE_IN_PROGRESS: u32 = 1 << 6;
const INFO_METADATA_ONLY: u32 = 1 << 7;
const INFO_RESOURCE_ONLY: u32 = 1 << 8;
const INFO_PIPABLE: u32 = 1 << 9;

impl From<&WimInfoC> for RawWimInfo {
    fn from(c: &WimInfoC) -> Self {
        let bit = |b: u32| c.flags & b != 0;
        Self {
            guid: c.guid,
            image_count: c.image_count,
            boot_index: c.boot_index,
            wim_version: c.wim_version,
            chunk_size: c.chunk_size,
            part_number: c.part_number,
            total_parts: c.total_parts,
            compression_type: c.compression_type,
            total_bytes: c.total_bytes,
            has_integrity_table: bit(INFO_HAS_INTEGRITY_TABLE),
            opened_from_file: bit(INFO_OPENED_FROM_FILE),
            is_readonly: bit(INFO_IS_READONLY),
            has_rpfix: bit(INFO_HAS_RPFIX),
            is_marked_readonly: bit(INFO_IS_MARKED_READONLY),
            spanned: bit(INFO_SPANNED),
            write_in_progress: bit(INFO_WRITE_IN_PROGRESS),
            metadata_only: bit(INFO_METADATA_ONLY),
            resource_only: bit(INFO_RESOURCE_ONLY),
            pipable: bit(INFO_PIPABLE),
        }
    }
}

impl From<&RawWimInfo> for WimInfoC {
    fn from(info: &RawWimInfo) -> Self {
        let flags = [
            (info.has_integrity_table, INFO_HAS_INTEGRITY_TABLE),
            (info.opened_from_file, INFO_OPENED_FROM_FILE),
            (info.is_readonly, INFO_IS_READONLY),
            (info.has_rpfix, INFO_HAS_RPFIX),
            (info.is_marked_readonly, INFO_IS_MARKED_READONLY),
            (info.spanned, INFO_SPANNED),
            (info.write_in_progress, INFO_WRITE_IN_PROGRESS),
            (info.metadata_only, INFO_METADATA_ONLY),
            (info.resource_only, INFO_RESOURCE_ONLY),
            (info.pipable, INFO_PIPABLE),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit);
        Self {
            guid: info.guid,
            image_count: info.image_count,
            boot_index: info.boot_index,
            wim_version: info.wim_version,
            chunk_size: info.chunk_size,
            part_number: info.part_number,
            total_parts: info.total_parts,
            compression_type: info.compression_type,
            total_bytes: info.total_bytes,
            flags,
            reserved: [0; 9],
        }
    }
}

#[repr(C)]
#[allow(dead_code)]
struct ResourceEntryC {
    uncompressed_size: u64,
    compressed_size: u64,
    offset: u64,
    sha1_hash: [u8; 20],
    part_number: u32,
    reference_count: u32,
    flags: u32,
    raw_resource_offset_in_wim: u64,
    raw_resource_compressed_size: u64,
    raw_resource_uncompressed_size: u64,
    reserved: [u64; 1],
}

impl From<&ResourceEntryC> for ResourceEntry {
    fn from(c: &ResourceEntryC) -> Self {
        let bit = |n: u32| c.flags & (1 << n) != 0;
        Self {
            uncompressed_size: c.uncompressed_size,
            compressed_size: c.compressed_size,
            offset: c.offset,
            hash: ResourceHash(c.sha1_hash),
            part_number: c.part_number,
            reference_count: c.reference_count,
            is_compressed: bit(0),
            is_metadata: bit(1),
            is_free: bit(2),
            is_spanned: bit(3),
            is_missing: bit(4),
            packed: bit(5),
            raw_resource_offset: c.raw_resource_offset_in_wim,
            raw_resource_compressed_size: c.raw_resource_compressed_size,
            raw_resource_uncompressed_size: c.raw_resource_uncompressed_size,
        }
    }
}

// Progress payloads. Each is one member of libwim's progress union, which
// places every member at offset 0.

#[repr(C)]
#[allow(dead_code)]
struct WriteStreamsC {
    total_bytes: u64,
    total_streams: u64,
    completed_bytes: u64,
    completed_streams: u64,
    num_threads: u32,
    compression_type: i32,
    total_parts: u32,
    completed_parts: u32,
    completed_compressed_bytes: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct ScanC {
    source: *const c_char,
    cur_path: *const c_char,
    status: c_int,
    target_path: *const c_char,
    num_dirs_scanned: u64,
    num_nondirs_scanned: u64,
    num_bytes_scanned: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct ExtractC {
    image: u32,
    extract_flags: u32,
    wimfile_name: *const c_char,
    image_name: *const c_char,
    target: *const c_char,
    reserved: *const c_char,
    total_bytes: u64,
    completed_bytes: u64,
    total_streams: u64,
    completed_streams: u64,
    part_number: u32,
    total_parts: u32,
    guid: [u8; 16],
    current_file_count: u64,
    end_file_count: u64,
}

#[repr(C)]
struct RenameC {
    from: *const c_char,
    to: *const c_char,
}

#[repr(C)]
struct IntegrityC {
    total_bytes: u64,
    completed_bytes: u64,
    total_chunks: u32,
    completed_chunks: u32,
    chunk_size: u32,
    filename: *const c_char,
}

#[repr(C)]
struct SplitC {
    total_bytes: u64,
    completed_bytes: u64,
    cur_part_number: c_uint,
    total_parts: c_uint,
    part_name: *const c_char,
}

#[repr(C)]
struct DoneWithFileC {
    path_to_file: *const c_char,
}

#[repr(C)]
struct VerifyImageC {
    wimfile: *const c_char,
    total_images: u32,
    current_image: u32,
}

#[repr(C)]
struct VerifyStreamsC {
    wimfile: *const c_char,
    total_streams: u64,
    total_bytes: u64,
    completed_streams: u64,
    completed_bytes: u64,
}

type ProgressFn = unsafe extern "C" fn(c_int, *mut c_void, *mut c_void) -> c_int;
type IterateFn = unsafe extern "C" fn(*const ResourceEntryC, *mut c_void) -> c_int;

#[link(name = "wim")]
unsafe extern "C" {
    fn wimlib_global_init(init_flags: c_int) -> c_int;
    fn wimlib_global_cleanup();
    fn wimlib_get_version() -> u32;
    fn wimlib_set_print_errors(show_messages: bool) -> c_int;
    fn wimlib_set_error_file_by_name(path: *const c_char) -> c_int;
    fn wimlib_get_error_string(code: c_int) -> *const c_char;

    fn wimlib_open_wim_with_progress(
        wim_file: *const c_char,
        open_flags: c_int,
        wim_ret: *mut *mut WimStruct,
        progfunc: Option<ProgressFn>,
        progctx: *mut c_void,
    ) -> c_int;
    fn wimlib_create_new_wim(ctype: c_int, wim_ret: *mut *mut WimStruct) -> c_int;
    fn wimlib_free(wim: *mut WimStruct);
    fn wimlib_register_progress_function(
        wim: *mut WimStruct,
        progfunc: Option<ProgressFn>,
        progctx: *mut c_void,
    );
    fn wimlib_write(
        wim: *mut WimStruct,
        path: *const c_char,
        image: c_int,
        write_flags: c_int,
        num_threads: c_uint,
    ) -> c_int;
    fn wimlib_write_to_fd(
        wim: *mut WimStruct,
        fd: c_int,
        image: c_int,
        write_flags: c_int,
        num_threads: c_uint,
    ) -> c_int;
    fn wimlib_overwrite(wim: *mut WimStruct, write_flags: c_int, num_threads: c_uint) -> c_int;
    fn wimlib_get_wim_info(wim: *mut WimStruct, info: *mut WimInfoC) -> c_int;
    fn wimlib_set_wim_info(wim: *mut WimStruct, info: *const WimInfoC, which: c_int) -> c_int;
    fn wimlib_get_xml_data(
        wim: *mut WimStruct,
        buf_ret: *mut *mut c_void,
        bufsize_ret: *mut size_t,
    ) -> c_int;
    fn wimlib_verify_wim(wim: *mut WimStruct, verify_flags: c_int) -> c_int;
    fn wimlib_split(
        wim: *mut WimStruct,
        swm_name: *const c_char,
        part_size: u64,
        write_flags: c_int,
    ) -> c_int;
    fn wimlib_reference_template_image(
        wim: *mut WimStruct,
        new_image: c_int,
        template_wim: *mut WimStruct,
        template_image: c_int,
        flags: c_int,
    ) -> c_int;
    fn wimlib_reference_resource_files(
        wim: *mut WimStruct,
        resource_wimfiles_or_globs: *const *const c_char,
        count: c_uint,
        ref_flags: c_int,
        open_flags: c_int,
    ) -> c_int;
    fn wimlib_reference_resources(
        wim: *mut WimStruct,
        resource_wims: *mut *mut WimStruct,
        num_resource_wims: c_uint,
        ref_flags: c_int,
    ) -> c_int;
    fn wimlib_iterate_lookup_table(
        wim: *mut WimStruct,
        flags: c_int,
        cb: Option<IterateFn>,
        user_ctx: *mut c_void,
    ) -> c_int;
    fn wimlib_set_output_compression_type(wim: *mut WimStruct, ctype: c_int) -> c_int;
    fn wimlib_set_output_chunk_size(wim: *mut WimStruct, chunk_size: u32) -> c_int;
    fn wimlib_set_output_pack_compression_type(wim: *mut WimStruct, ctype: c_int) -> c_int;
    fn wimlib_set_output_pack_chunk_size(wim: *mut WimStruct, chunk_size: u32) -> c_int;

    fn wimlib_add_empty_image(
        wim: *mut WimStruct,
        name: *const c_char,
        new_idx_ret: *mut c_int,
    ) -> c_int;
    fn wimlib_add_image(
        wim: *mut WimStruct,
        source: *const c_char,
        name: *const c_char,
        config_file: *const c_char,
        add_flags: c_int,
    ) -> c_int;
    fn wimlib_delete_image(wim: *mut WimStruct, image: c_int) -> c_int;
    fn wimlib_export_image(
        src_wim: *mut WimStruct,
        src_image: c_int,
        dest_wim: *mut WimStruct,
        dest_name: *const c_char,
        dest_description: *const c_char,
        export_flags: c_int,
    ) -> c_int;
    fn wimlib_extract_image(
        wim: *mut WimStruct,
        image: c_int,
        target: *const c_char,
        extract_flags: c_int,
    ) -> c_int;
    fn wimlib_get_image_property(
        wim: *const WimStruct,
        image: c_int,
        property_name: *const c_char,
    ) -> *const c_char;
    fn wimlib_set_image_property(
        wim: *mut WimStruct,
        image: c_int,
        property_name: *const c_char,
        property_value: *const c_char,
    ) -> c_int;

    fn wimlib_create_compressor(
        ctype: c_int,
        max_block_size: size_t,
        compression_level: c_uint,
        compressor_ret: *mut *mut WimlibCompressor,
    ) -> c_int;
    fn wimlib_compress(
        uncompressed_data: *const c_void,
        uncompressed_size: size_t,
        compressed_data: *mut c_void,
        compressed_size_avail: size_t,
        compressor: *mut WimlibCompressor,
    ) -> size_t;
    fn wimlib_free_compressor(compressor: *mut WimlibCompressor);
    fn wimlib_create_decompressor(
        ctype: c_int,
        max_block_size: size_t,
        decompressor_ret: *mut *mut WimlibDecompressor,
    ) -> c_int;
    fn wimlib_decompress(
        compressed_data: *const c_void,
        compressed_size: size_t,
        uncompressed_data: *mut c_void,
        uncompressed_size: size_t,
        decompressor: *mut WimlibDecompressor,
    ) -> c_int;
    fn wimlib_free_decompressor(decompressor: *mut WimlibDecompressor);
    fn wimlib_get_compressor_needed_memory(
        ctype: c_int,
        max_block_size: size_t,
        compression_level: c_uint,
    ) -> u64;
    fn wimlib_set_default_compression_level(ctype: c_int, compression_level: c_uint) -> c_int;
}

fn wim_ptr(wim: RawWim) -> *mut WimStruct {
    wim.0 as usize as *mut WimStruct
}

fn c_path(path: &Path) -> Result<CString, i32> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| status::INVALID_PARAM)
}

fn c_str(s: &str) -> Result<CString, i32> {
    CString::new(s).map_err(|_| status::INVALID_PARAM)
}

fn opt_c_str(s: Option<&str>) -> Result<Option<CString>, i32> {
    s.map(c_str).transpose()
}

fn ptr_or_null(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

fn code_of(result: Result<c_int, i32>) -> i32 {
    result.unwrap_or_else(|code| code)
}

/// # Safety
/// `p` must be null or a valid NUL-terminated string.
unsafe fn path_from(p: *const c_char) -> Option<PathBuf> {
    if p.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller.
    let bytes = unsafe { CStr::from_ptr(p) }.to_bytes();
    Some(PathBuf::from(OsStr::from_bytes(bytes)))
}

/// # Safety
/// `info` must point at the union member libwim sends with `msg`, or be
/// null.
unsafe fn decode_progress(msg: ProgressMsg, info: *const c_void) -> ProgressInfo {
    use ProgressMsg as M;
    if info.is_null() {
        return ProgressInfo::Empty;
    }
    // SAFETY: every arm reads the member libwim documents for that message.
    unsafe {
        match msg {
            M::ExtractImageBegin
            | M::ExtractTreeBegin
            | M::ExtractFileStructure
            | M::ExtractStreams
            | M::ExtractSpwmPartBegin
            | M::ExtractMetadata
            | M::ExtractImageEnd
            | M::ExtractTreeEnd => {
                let c = &*(info as *const ExtractC);
                ProgressInfo::Extract(ExtractProgress {
                    image: c.image,
                    extract_flags: c.extract_flags,
                    wimfile_name: path_from(c.wimfile_name),
                    image_name: path_from(c.image_name).map(|p| p.to_string_lossy().into_owned()),
                    target: path_from(c.target).unwrap_or_default(),
                    total_bytes: c.total_bytes,
                    completed_bytes: c.completed_bytes,
                    total_streams: c.total_streams,
                    completed_streams: c.completed_streams,
                    current_file_count: c.current_file_count,
                    end_file_count: c.end_file_count,
                })
            }
            M::ScanBegin | M::ScanDentry | M::ScanEnd => {
                let c = &*(info as *const ScanC);
                ProgressInfo::Scan(ScanProgress {
                    source: path_from(c.source).unwrap_or_default(),
                    cur_path: path_from(c.cur_path),
                    status: match c.status {
                        1 => ScanStatus::Excluded,
                        2 => ScanStatus::Unsupported,
                        3 => ScanStatus::FixedSymlink,
                        4 => ScanStatus::NotFixedSymlink,
                        _ => ScanStatus::Ok,
                    },
                    num_dirs_scanned: c.num_dirs_scanned,
                    num_nondirs_scanned: c.num_nondirs_scanned,
                    num_bytes_scanned: c.num_bytes_scanned,
                })
            }
            M::WriteStreams => {
                let c = &*(info as *const WriteStreamsC);
                ProgressInfo::WriteStreams(WriteStreamsProgress {
                    total_bytes: c.total_bytes,
                    total_streams: c.total_streams,
                    completed_bytes: c.completed_bytes,
                    completed_streams: c.completed_streams,
                    num_threads: c.num_threads,
                    compression_type: c.compression_type,
                    total_parts: c.total_parts,
                    completed_parts: c.completed_parts,
                })
            }
            M::Rename => {
                let c = &*(info as *const RenameC);
                ProgressInfo::Rename {
                    from: path_from(c.from).unwrap_or_default(),
                    to: path_from(c.to).unwrap_or_default(),
                }
            }
            M::VerifyIntegrity | M::CalcIntegrity => {
                let c = &*(info as *const IntegrityC);
                ProgressInfo::Integrity(IntegrityProgress {
                    total_bytes: c.total_bytes,
                    completed_bytes: c.completed_bytes,
                    total_chunks: c.total_chunks,
                    completed_chunks: c.completed_chunks,
                    chunk_size: c.chunk_size,
                    filename: path_from(c.filename),
                })
            }
            M::SplitBeginPart | M::SplitEndPart => {
                let c = &*(info as *const SplitC);
                ProgressInfo::Split(SplitProgress {
                    total_bytes: c.total_bytes,
                    completed_bytes: c.completed_bytes,
                    cur_part_number: c.cur_part_number,
                    total_parts: c.total_parts,
                    part_name: path_from(c.part_name).unwrap_or_default(),
                })
            }
            M::DoneWithFile => {
                let c = &*(info as *const DoneWithFileC);
                ProgressInfo::DoneWithFile {
                    path: path_from(c.path_to_file).unwrap_or_default(),
                }
            }
            M::BeginVerifyImage | M::EndVerifyImage => {
                let c = &*(info as *const VerifyImageC);
                ProgressInfo::VerifyImage(VerifyImageProgress {
                    wimfile: path_from(c.wimfile),
                    total_images: c.total_images,
                    current_image: c.current_image,
                })
            }
            M::VerifyStreams => {
                let c = &*(info as *const VerifyStreamsC);
                ProgressInfo::VerifyStreams(VerifyStreamsProgress {
                    wimfile: path_from(c.wimfile),
                    total_streams: c.total_streams,
                    total_bytes: c.total_bytes,
                    completed_streams: c.completed_streams,
                    completed_bytes: c.completed_bytes,
                })
            }
            _ => ProgressInfo::Empty,
        }
    }
}

unsafe extern "C" fn progress_trampoline(
    msg: c_int,
    info: *mut c_void,
    ctx: *mut c_void,
) -> c_int {
    if ctx.is_null() {
        return 0;
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `ctx` is the `&mut ProgressSink` registered by
        // `with_progress`, alive for the duration of the call.
        let sink = unsafe { &mut *(ctx as *mut &mut ProgressSink<'_>) };
        let msg = ProgressMsg::from_raw(msg as u32);
        // SAFETY: libwim pairs `info` with `msg`.
        let info = unsafe { decode_progress(msg, info) };
        sink(msg, &info)
    }));
    outcome.unwrap_or_else(|_| {
        error!("progress handler panicked; aborting the operation");
        1
    })
}

unsafe extern "C" fn iterate_trampoline(entry: *const ResourceEntryC, ctx: *mut c_void) -> c_int {
    if ctx.is_null() || entry.is_null() {
        return 0;
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `ctx` is the sink passed to `wimlib_iterate_lookup_table`
        // and `entry` is valid for this callback.
        let sink = unsafe { &mut *(ctx as *mut &mut ResourceSink<'_>) };
        let entry = ResourceEntry::from(unsafe { &*entry });
        sink(&entry)
    }));
    outcome.unwrap_or_else(|_| {
        error!("resource visitor panicked; stopping iteration");
        status::UNKNOWN_PROGRESS_STATUS
    })
}

/// Runs `call` with `progress` registered on `wim`, unregistering afterwards.
fn with_progress<T>(
    wim: *mut WimStruct,
    progress: Option<&mut ProgressSink<'_>>,
    call: impl FnOnce() -> T,
) -> T {
    let Some(sink) = progress else {
        return call();
    };
    let mut sink: &mut ProgressSink<'_> = sink;
    let ctx = &mut sink as *mut &mut ProgressSink<'_> as *mut c_void;
    // SAFETY: `sink` outlives the call and the registration is removed
    // before it goes out of scope.
    unsafe { wimlib_register_progress_function(wim, Some(progress_trampoline), ctx) };
    let out = call();
    unsafe { wimlib_register_progress_function(wim, None, ptr::null_mut()) };
    out
}

/// Engine calling into libwim.
#[derive(Debug, Default)]
pub struct NativeEngine {
    _private: (),
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for NativeEngine {
    fn name(&self) -> &'static str {
        "libwim"
    }

    fn version(&self) -> u32 {
        unsafe { wimlib_get_version() }
    }

    fn global_init(&self, flags: u32) -> i32 {
        unsafe { wimlib_global_init(flags as c_int) }
    }

    fn global_cleanup(&self) {
        debug!("libwim global cleanup");
        unsafe { wimlib_global_cleanup() }
    }

    fn set_print_errors(&self, show: bool) -> i32 {
        unsafe { wimlib_set_print_errors(show) }
    }

    fn set_error_file_by_name(&self, path: Option<&Path>) -> i32 {
        let path = match path.map(c_path).transpose() {
            Ok(p) => p,
            Err(code) => return code,
        };
        unsafe { wimlib_set_error_file_by_name(ptr_or_null(&path)) }
    }

    fn error_string(&self, code: i32) -> String {
        // SAFETY: libwim returns a static string or null.
        let p = unsafe { wimlib_get_error_string(code) };
        if p.is_null() {
            return status::describe(code).to_string();
        }
        unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
    }

    // ---- archives ----

    fn open(
        &self,
        path: &Path,
        open_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<RawWim, i32> {
        let path = c_path(path)?;
        let mut wim = ptr::null_mut();
        let code = match progress {
            None => unsafe {
                wimlib_open_wim_with_progress(
                    path.as_ptr(),
                    open_flags as c_int,
                    &mut wim,
                    None,
                    ptr::null_mut(),
                )
            },
            Some(sink) => {
                let mut sink: &mut ProgressSink<'_> = sink;
                let ctx = &mut sink as *mut &mut ProgressSink<'_> as *mut c_void;
                let code = unsafe {
                    wimlib_open_wim_with_progress(
                        path.as_ptr(),
                        open_flags as c_int,
                        &mut wim,
                        Some(progress_trampoline),
                        ctx,
                    )
                };
                if code == status::SUCCESS && !wim.is_null() {
                    // the context registered at open would dangle after return
                    unsafe { wimlib_register_progress_function(wim, None, ptr::null_mut()) };
                }
                code
            }
        };
        match code {
            status::SUCCESS if !wim.is_null() => Ok(RawWim(wim as usize as u64)),
            status::SUCCESS => Err(status::NOMEM),
            code => Err(code),
        }
    }

    fn create_new(&self, compression_type: i32) -> Result<RawWim, i32> {
        let mut wim = ptr::null_mut();
        match unsafe { wimlib_create_new_wim(compression_type, &mut wim) } {
            status::SUCCESS if !wim.is_null() => Ok(RawWim(wim as usize as u64)),
            status::SUCCESS => Err(status::NOMEM),
            code => Err(code),
        }
    }

    fn free(&self, wim: RawWim) {
        unsafe { wimlib_free(wim_ptr(wim)) }
    }

    fn write(
        &self,
        wim: RawWim,
        path: &Path,
        image: i32,
        write_flags: u32,
        num_threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        code_of(c_path(path).map(|path| {
            with_progress(wim_ptr(wim), progress, || unsafe {
                wimlib_write(
                    wim_ptr(wim),
                    path.as_ptr(),
                    image,
                    write_flags as c_int,
                    num_threads,
                )
            })
        }))
    }

    fn write_to_fd(
        &self,
        wim: RawWim,
        fd: BorrowedFd<'_>,
        image: i32,
        write_flags: u32,
        num_threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        with_progress(wim_ptr(wim), progress, || unsafe {
            wimlib_write_to_fd(
                wim_ptr(wim),
                fd.as_raw_fd(),
                image,
                write_flags as c_int,
                num_threads,
            )
        })
    }

    fn overwrite(
        &self,
        wim: RawWim,
        write_flags: u32,
        num_threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        with_progress(wim_ptr(wim), progress, || unsafe {
            wimlib_overwrite(wim_ptr(wim), write_flags as c_int, num_threads)
        })
    }

    fn get_info(&self, wim: RawWim) -> Result<RawWimInfo, i32> {
        let mut info = WimInfoC::default();
        match unsafe { wimlib_get_wim_info(wim_ptr(wim), &mut info) } {
            status::SUCCESS => Ok(RawWimInfo::from(&info)),
            code => Err(code),
        }
    }

    fn set_info(&self, wim: RawWim, info: &RawWimInfo, which: u32) -> i32 {
        let info = WimInfoC::from(info);
        unsafe { wimlib_set_wim_info(wim_ptr(wim), &info, which as c_int) }
    }

    fn get_xml_data(&self, wim: RawWim) -> Result<Vec<u8>, i32> {
        let mut buf = ptr::null_mut();
        let mut len: size_t = 0;
        let code = unsafe { wimlib_get_xml_data(wim_ptr(wim), &mut buf, &mut len) };
        if code != status::SUCCESS {
            return Err(code);
        }
        if buf.is_null() {
            return Ok(Vec::new());
        }
        // SAFETY: libwim hands over a malloc'd buffer of `len` bytes.
        let out = unsafe { std::slice::from_raw_parts(buf as *const u8, len) }.to_vec();
        unsafe { libc::free(buf) };
        Ok(out)
    }

    fn verify(
        &self,
        wim: RawWim,
        verify_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        with_progress(wim_ptr(wim), progress, || unsafe {
            wimlib_verify_wim(wim_ptr(wim), verify_flags as c_int)
        })
    }

    fn split(
        &self,
        wim: RawWim,
        swm_name: &Path,
        part_size: u64,
        write_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        code_of(c_path(swm_name).map(|name| {
            with_progress(wim_ptr(wim), progress, || unsafe {
                wimlib_split(wim_ptr(wim), name.as_ptr(), part_size, write_flags as c_int)
            })
        }))
    }

    fn reference_template_image(
        &self,
        wim: RawWim,
        new_image: i32,
        template_wim: RawWim,
        template_image: i32,
        flags: u32,
    ) -> i32 {
        unsafe {
            wimlib_reference_template_image(
                wim_ptr(wim),
                new_image,
                wim_ptr(template_wim),
                template_image,
                flags as c_int,
            )
        }
    }

    fn reference_resource_files(
        &self,
        wim: RawWim,
        paths: &[&Path],
        ref_flags: u32,
        open_flags: u32,
    ) -> i32 {
        let owned: Result<Vec<CString>, i32> = paths.iter().map(|p| c_path(p)).collect();
        code_of(owned.map(|owned| {
            let ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();
            unsafe {
                wimlib_reference_resource_files(
                    wim_ptr(wim),
                    ptrs.as_ptr(),
                    ptrs.len() as c_uint,
                    ref_flags as c_int,
                    open_flags as c_int,
                )
            }
        }))
    }

    fn reference_resources(&self, wim: RawWim, resource_wims: &[RawWim], ref_flags: u32) -> i32 {
        let mut ptrs: Vec<*mut WimStruct> = resource_wims.iter().copied().map(wim_ptr).collect();
        unsafe {
            wimlib_reference_resources(
                wim_ptr(wim),
                ptrs.as_mut_ptr(),
                ptrs.len() as c_uint,
                ref_flags as c_int,
            )
        }
    }

    fn iterate_lookup_table(&self, wim: RawWim, flags: u32, visitor: &mut ResourceSink<'_>) -> i32 {
        let mut visitor: &mut ResourceSink<'_> = visitor;
        let ctx = &mut visitor as *mut &mut ResourceSink<'_> as *mut c_void;
        unsafe {
            wimlib_iterate_lookup_table(wim_ptr(wim), flags as c_int, Some(iterate_trampoline), ctx)
        }
    }

    fn set_output_compression_type(&self, wim: RawWim, compression_type: i32) -> i32 {
        unsafe { wimlib_set_output_compression_type(wim_ptr(wim), compression_type) }
    }

    fn set_output_chunk_size(&self, wim: RawWim, chunk_size: u32) -> i32 {
        unsafe { wimlib_set_output_chunk_size(wim_ptr(wim), chunk_size) }
    }

    fn set_output_pack_compression_type(&self, wim: RawWim, compression_type: i32) -> i32 {
        unsafe { wimlib_set_output_pack_compression_type(wim_ptr(wim), compression_type) }
    }

    fn set_output_pack_chunk_size(&self, wim: RawWim, chunk_size: u32) -> i32 {
        unsafe { wimlib_set_output_pack_chunk_size(wim_ptr(wim), chunk_size) }
    }

    // ---- images ----

    fn add_empty_image(&self, wim: RawWim, name: &str) -> Result<i32, i32> {
        let name = c_str(name)?;
        let mut index: c_int = 0;
        match unsafe { wimlib_add_empty_image(wim_ptr(wim), name.as_ptr(), &mut index) } {
            status::SUCCESS => Ok(index),
            code => Err(code),
        }
    }

    fn add_image(
        &self,
        wim: RawWim,
        source: &Path,
        name: &str,
        add_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let args = c_path(source).and_then(|s| Ok((s, c_str(name)?)));
        code_of(args.map(|(source, name)| {
            with_progress(wim_ptr(wim), progress, || unsafe {
                wimlib_add_image(
                    wim_ptr(wim),
                    source.as_ptr(),
                    name.as_ptr(),
                    ptr::null(),
                    add_flags as c_int,
                )
            })
        }))
    }

    fn delete_image(&self, wim: RawWim, image: i32) -> i32 {
        unsafe { wimlib_delete_image(wim_ptr(wim), image) }
    }

    fn export_image(
        &self,
        src_wim: RawWim,
        src_image: i32,
        dest_wim: RawWim,
        dest_name: Option<&str>,
        dest_description: Option<&str>,
        export_flags: u32,
    ) -> i32 {
        let args = opt_c_str(dest_name).and_then(|n| Ok((n, opt_c_str(dest_description)?)));
        code_of(args.map(|(name, description)| unsafe {
            wimlib_export_image(
                wim_ptr(src_wim),
                src_image,
                wim_ptr(dest_wim),
                ptr_or_null(&name),
                ptr_or_null(&description),
                export_flags as c_int,
            )
        }))
    }

    fn extract_image(
        &self,
        wim: RawWim,
        image: i32,
        target: &Path,
        extract_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        code_of(c_path(target).map(|target| {
            with_progress(wim_ptr(wim), progress, || unsafe {
                wimlib_extract_image(wim_ptr(wim), image, target.as_ptr(), extract_flags as c_int)
            })
        }))
    }

    fn image_property(&self, wim: RawWim, image: i32, name: &str) -> Option<String> {
        let name = c_str(name).ok()?;
        // SAFETY: the returned string is owned by the archive and copied
        // before any other call on it.
        let p = unsafe { wimlib_get_image_property(wim_ptr(wim), image, name.as_ptr()) };
        if p.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
    }

    fn set_image_property(&self, wim: RawWim, image: i32, name: &str, value: &str) -> i32 {
        let args = c_str(name).and_then(|n| Ok((n, c_str(value)?)));
        code_of(args.map(|(name, value)| unsafe {
            wimlib_set_image_property(wim_ptr(wim), image, name.as_ptr(), value.as_ptr())
        }))
    }

    // ---- codecs ----

    fn create_compressor(
        &self,
        compression_type: i32,
        max_block_size: usize,
        level: u32,
    ) -> Result<RawCompressor, i32> {
        let mut c = ptr::null_mut();
        match unsafe { wimlib_create_compressor(compression_type, max_block_size, level, &mut c) } {
            status::SUCCESS if !c.is_null() => Ok(RawCompressor(c as usize as u64)),
            status::SUCCESS => Err(status::NOMEM),
            code => Err(code),
        }
    }

    fn compress(&self, compressor: RawCompressor, input: &[u8], output: &mut [u8]) -> usize {
        unsafe {
            wimlib_compress(
                input.as_ptr().cast(),
                input.len(),
                output.as_mut_ptr().cast(),
                output.len(),
                compressor.0 as usize as *mut WimlibCompressor,
            )
        }
    }

    fn free_compressor(&self, compressor: RawCompressor) {
        unsafe { wimlib_free_compressor(compressor.0 as usize as *mut WimlibCompressor) }
    }

    fn create_decompressor(
        &self,
        compression_type: i32,
        max_block_size: usize,
    ) -> Result<RawDecompressor, i32> {
        let mut d = ptr::null_mut();
        match unsafe { wimlib_create_decompressor(compression_type, max_block_size, &mut d) } {
            status::SUCCESS if !d.is_null() => Ok(RawDecompressor(d as usize as u64)),
            status::SUCCESS => Err(status::NOMEM),
            code => Err(code),
        }
    }

    fn decompress(&self, decompressor: RawDecompressor, input: &[u8], output: &mut [u8]) -> i32 {
        let code = unsafe {
            wimlib_decompress(
                input.as_ptr().cast(),
                input.len(),
                output.as_mut_ptr().cast(),
                output.len(),
                decompressor.0 as usize as *mut WimlibDecompressor,
            )
        };
        // libwim reports any failure as a non-zero value without a code
        if code == 0 { status::SUCCESS } else { status::DECOMPRESSION }
    }

    fn free_decompressor(&self, decompressor: RawDecompressor) {
        unsafe { wimlib_free_decompressor(decompressor.0 as usize as *mut WimlibDecompressor) }
    }

    fn compressor_needed_memory(&self, compression_type: i32, max_block_size: usize, level: u32) -> u64 {
        unsafe { wimlib_get_compressor_needed_memory(compression_type, max_block_size, level) }
    }

    fn set_default_compression_level(&self, compression_type: i32, level: u32) -> i32 {
        unsafe { wimlib_set_default_compression_level(compression_type, level) }
    }
}
