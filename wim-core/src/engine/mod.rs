//! The boundary to the archive and codec engine.
//!
//! An [`Engine`] exposes the primitive operations the rest of the crate is
//! built on. Sessions cross the boundary as opaque raw identifiers and every
//! fallible primitive reports a raw status code (zero is success); turning
//! those into typed errors and owned handles is the job of the layers above.

use std::path::Path;
use std::sync::Arc;

#[cfg(unix)]
use std::os::fd::BorrowedFd;

use crate::error::status;
use crate::progress::{ProgressInfo, ProgressMsg};
use crate::resource::ResourceEntry;

#[cfg(all(feature = "native", unix))]
pub mod native;
pub mod portable;

#[cfg(all(feature = "native", unix))]
pub use native::NativeEngine;
pub use portable::PortableEngine;

/// Identity of an engine instance, stable for its lifetime.
pub(crate) fn engine_id(engine: &Arc<dyn Engine>) -> usize {
    Arc::as_ptr(engine) as *const () as usize
}

/// Opaque identifier of an open archive session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawWim(pub u64);

/// Opaque identifier of a compressor session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawCompressor(pub u64);

/// Opaque identifier of a decompressor session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawDecompressor(pub u64);

/// Archive-level metadata exactly as the engine reports it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawWimInfo {
    pub guid: [u8; 16],
    pub image_count: u32,
    pub boot_index: u32,
    pub wim_version: u32,
    pub chunk_size: u32,
    pub part_number: u16,
    pub total_parts: u16,
    pub compression_type: i32,
    pub total_bytes: u64,
    pub has_integrity_table: bool,
    pub opened_from_file: bool,
    pub is_readonly: bool,
    pub has_rpfix: bool,
    pub is_marked_readonly: bool,
    pub spanned: bool,
    pub write_in_progress: bool,
    pub metadata_only: bool,
    pub resource_only: bool,
    pub pipable: bool,
}

/// Receives progress events; the return value is the raw progress status.
pub type ProgressSink<'a> = dyn FnMut(ProgressMsg, &ProgressInfo) -> i32 + 'a;

/// Receives resource table rows; a non-zero return stops the iteration and
/// becomes the iteration's status.
pub type ResourceSink<'a> = dyn FnMut(&ResourceEntry) -> i32 + 'a;

/// Primitive archive and codec operations.
///
/// Required methods cover the lifecycle every engine must support. The rest
/// default to reporting `UNSUPPORTED`.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Packed version: major in bits 20 and up, minor in bits 10-19, patch in
    /// bits 0-9.
    fn version(&self) -> u32;

    fn global_init(&self, flags: u32) -> i32;

    fn global_cleanup(&self);

    fn set_print_errors(&self, _show: bool) -> i32 {
        status::UNSUPPORTED
    }

    fn set_error_file_by_name(&self, _path: Option<&Path>) -> i32 {
        status::UNSUPPORTED
    }

    fn error_string(&self, code: i32) -> String {
        status::describe(code).to_string()
    }

    // ---- archives ----

    fn open(
        &self,
        path: &Path,
        open_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<RawWim, i32>;

    fn create_new(&self, compression_type: i32) -> Result<RawWim, i32>;

    /// Releases the session. Called exactly once per session.
    fn free(&self, wim: RawWim);

    fn write(
        &self,
        wim: RawWim,
        path: &Path,
        image: i32,
        write_flags: u32,
        num_threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32;

    #[cfg(unix)]
    fn write_to_fd(
        &self,
        _wim: RawWim,
        _fd: BorrowedFd<'_>,
        _image: i32,
        _write_flags: u32,
        _num_threads: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn overwrite(
        &self,
        _wim: RawWim,
        _write_flags: u32,
        _num_threads: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn get_info(&self, wim: RawWim) -> Result<RawWimInfo, i32>;

    fn set_info(&self, _wim: RawWim, _info: &RawWimInfo, _which: u32) -> i32 {
        status::UNSUPPORTED
    }

    fn get_xml_data(&self, _wim: RawWim) -> Result<Vec<u8>, i32> {
        Err(status::UNSUPPORTED)
    }

    fn verify(
        &self,
        _wim: RawWim,
        _verify_flags: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn split(
        &self,
        _wim: RawWim,
        _swm_name: &Path,
        _part_size: u64,
        _write_flags: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn reference_template_image(
        &self,
        _wim: RawWim,
        _new_image: i32,
        _template_wim: RawWim,
        _template_image: i32,
        _flags: u32,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn reference_resource_files(
        &self,
        _wim: RawWim,
        _paths: &[&Path],
        _ref_flags: u32,
        _open_flags: u32,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn reference_resources(&self, _wim: RawWim, _resource_wims: &[RawWim], _ref_flags: u32) -> i32 {
        status::UNSUPPORTED
    }

    fn iterate_lookup_table(
        &self,
        _wim: RawWim,
        _flags: u32,
        _visitor: &mut ResourceSink<'_>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn set_output_compression_type(&self, _wim: RawWim, _compression_type: i32) -> i32 {
        status::UNSUPPORTED
    }

    fn set_output_chunk_size(&self, _wim: RawWim, _chunk_size: u32) -> i32 {
        status::UNSUPPORTED
    }

    fn set_output_pack_compression_type(&self, _wim: RawWim, _compression_type: i32) -> i32 {
        status::UNSUPPORTED
    }

    fn set_output_pack_chunk_size(&self, _wim: RawWim, _chunk_size: u32) -> i32 {
        status::UNSUPPORTED
    }

    // ---- images ----

    fn add_empty_image(&self, _wim: RawWim, _name: &str) -> Result<i32, i32> {
        Err(status::UNSUPPORTED)
    }

    fn add_image(
        &self,
        _wim: RawWim,
        _source: &Path,
        _name: &str,
        _add_flags: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn delete_image(&self, _wim: RawWim, _image: i32) -> i32 {
        status::UNSUPPORTED
    }

    fn export_image(
        &self,
        _src_wim: RawWim,
        _src_image: i32,
        _dest_wim: RawWim,
        _dest_name: Option<&str>,
        _dest_description: Option<&str>,
        _export_flags: u32,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn extract_image(
        &self,
        _wim: RawWim,
        _image: i32,
        _target: &Path,
        _extract_flags: u32,
        _progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        status::UNSUPPORTED
    }

    fn image_property(&self, _wim: RawWim, _image: i32, _name: &str) -> Option<String> {
        None
    }

    fn set_image_property(&self, _wim: RawWim, _image: i32, _name: &str, _value: &str) -> i32 {
        status::UNSUPPORTED
    }

    // ---- codecs ----

    fn create_compressor(
        &self,
        compression_type: i32,
        max_block_size: usize,
        level: u32,
    ) -> Result<RawCompressor, i32>;

    /// Returns the compressed size, or zero when the input does not fit in
    /// `output` once compressed.
    fn compress(&self, compressor: RawCompressor, input: &[u8], output: &mut [u8]) -> usize;

    fn free_compressor(&self, compressor: RawCompressor);

    fn create_decompressor(
        &self,
        compression_type: i32,
        max_block_size: usize,
    ) -> Result<RawDecompressor, i32>;

    fn decompress(&self, decompressor: RawDecompressor, input: &[u8], output: &mut [u8]) -> i32;

    fn free_decompressor(&self, decompressor: RawDecompressor);

    /// Zero when the combination is invalid.
    fn compressor_needed_memory(&self, compression_type: i32, max_block_size: usize, level: u32)
    -> u64;

    fn set_default_compression_level(&self, _compression_type: i32, _level: u32) -> i32 {
        status::UNSUPPORTED
    }

    fn compression_type_string(&self, compression_type: i32) -> &'static str {
        match compression_type {
            0 => "None",
            1 => "XPRESS",
            2 => "LZX",
            3 => "LZMS",
            _ => "Invalid",
        }
    }
}
