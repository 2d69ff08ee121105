//! Archive state and the work behind each portable-engine operation.
//!
//! Functions here operate on owned snapshots taken from a [`WimState`], so
//! the engine never holds a lock while it does I/O or reports progress.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rayon::ThreadPool;
use rayon::prelude::*;
use walkdir::WalkDir;

use super::codec;
use super::container::{
    self, ArchiveHeader, DirRecord, ENTRY_COMPRESSED, ENTRY_PACKED, ENTRY_SIZE, FLAG_INTEGRITY,
    FLAG_READONLY, FLAG_RPFIX, FLAG_SOLID, FileRecord, HEADER_LEN, ImageRecord, Manifest,
    Superblock, TAIL_LEN, TableEntry,
};
use crate::engine::{ProgressSink, RawWimInfo};
use crate::error::status;
use crate::flags::{ExtractFlags, WriteFlags};
use crate::progress::{
    ExtractProgress, IntegrityProgress, ProgressInfo, ProgressMsg, ScanProgress, ScanStatus,
    SplitProgress, VerifyImageProgress, VerifyStreamsProgress, WriteStreamsProgress,
};
use crate::resource::{ResourceEntry, ResourceHash};

pub(crate) type Status<T> = std::result::Result<T, i32>;

/// Bytes hashed between two integrity progress events.
pub(crate) const INTEGRITY_CHUNK: usize = 10 * 1024 * 1024;

const VERSION_DEFAULT: u32 = 0x10d00;
const VERSION_SOLID: u32 = 0xe00;

/// Forwards events to the caller's sink and turns its answer into a status.
pub(crate) struct Reporter<'p, 's> {
    sink: Option<&'p mut ProgressSink<'s>>,
}

impl<'p, 's> Reporter<'p, 's> {
    pub(crate) fn new(sink: Option<&'p mut ProgressSink<'s>>) -> Self {
        Self { sink }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn emit(&mut self, msg: ProgressMsg, info: ProgressInfo) -> Status<()> {
        let Some(sink) = self.sink.as_deref_mut() else {
            return Ok(());
        };
        match sink(msg, &info) {
            0 => Ok(()),
            1 => Err(status::ABORTED_BY_PROGRESS),
            _ => Err(status::UNKNOWN_PROGRESS_STATUS),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum BlobSource {
    Memory(Arc<[u8]>),
    /// A resource inside an archive file read into memory.
    Packed { file: Arc<[u8]>, entry: TableEntry },
}

#[derive(Clone, Debug)]
pub(crate) struct Blob {
    pub size: u64,
    pub source: BlobSource,
}

impl Blob {
    pub(crate) fn memory(data: Vec<u8>) -> Self {
        Self {
            size: data.len() as u64,
            source: BlobSource::Memory(data.into()),
        }
    }

    fn packed(file: &Arc<[u8]>, entry: TableEntry) -> Self {
        Self {
            size: entry.u_size,
            source: BlobSource::Packed {
                file: Arc::clone(file),
                entry,
            },
        }
    }

    pub(crate) fn read(&self) -> Status<Cow<'_, [u8]>> {
        match &self.source {
            BlobSource::Memory(data) => Ok(Cow::Borrowed(&data[..])),
            BlobSource::Packed { file, entry } => {
                let raw = raw_slice(file, entry)?;
                container::decode_resource(raw, entry.compression_type, entry.chunk_size, entry.u_size)
                    .map(Cow::Owned)
            }
        }
    }

    fn encoded(&self, ctype: i32, chunk_size: u32, level: u32, recompress: bool) -> Status<Vec<u8>> {
        if let BlobSource::Packed { file, entry } = &self.source {
            if !recompress && entry.compression_type == ctype && entry.chunk_size == chunk_size {
                return raw_slice(file, entry).map(<[u8]>::to_vec);
            }
        }
        let data = self.read()?;
        Ok(container::encode_resource(&data, ctype, chunk_size, level))
    }

    fn entry(&self, hash: ResourceHash, reference_count: u32) -> ResourceEntry {
        let mut out = ResourceEntry {
            uncompressed_size: self.size,
            compressed_size: self.size,
            hash,
            part_number: 1,
            reference_count,
            ..ResourceEntry::default()
        };
        if let BlobSource::Packed { entry, .. } = &self.source {
            out.compressed_size = entry.c_size;
            out.offset = entry.data_off;
            out.part_number = entry.part_number.into();
            out.is_compressed = entry.is_compressed();
            out.packed = entry.is_packed();
            out.raw_resource_offset = entry.data_off;
            out.raw_resource_compressed_size = entry.c_size;
            out.raw_resource_uncompressed_size = entry.u_size;
        }
        out
    }
}

fn raw_slice<'f>(file: &'f [u8], entry: &TableEntry) -> Status<&'f [u8]> {
    let start = entry.data_off as usize;
    let end = start
        .checked_add(entry.c_size as usize)
        .ok_or(status::INVALID_LOOKUP_TABLE_ENTRY)?;
    file.get(start..end).ok_or(status::UNEXPECTED_END_OF_FILE)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OutputSettings {
    pub compression_type: i32,
    pub chunk_size: u32,
    pub pack_compression_type: i32,
    pub pack_chunk_size: u32,
}

impl OutputSettings {
    fn for_type(ctype: i32, chunk_size: u32) -> Self {
        Self {
            compression_type: ctype,
            chunk_size,
            pack_compression_type: codec::LZMS,
            pack_chunk_size: codec::default_chunk_size(codec::LZMS),
        }
    }
}

/// Everything the engine knows about one open archive.
#[derive(Clone, Debug)]
pub(crate) struct WimState {
    pub path: Option<PathBuf>,
    /// The archive file as last read or written.
    pub file: Option<Arc<[u8]>>,
    pub header: ArchiveHeader,
    pub compression_type: i32,
    pub chunk_size: u32,
    pub output: OutputSettings,
    pub part_number: u16,
    pub total_parts: u16,
    pub has_integrity: bool,
    pub marked_readonly: bool,
    pub rpfix: bool,
    pub solid: bool,
    pub file_readonly: bool,
    pub images: Vec<ImageRecord>,
    pub blobs: HashMap<ResourceHash, Blob>,
    /// Resources borrowed from referenced archives.
    pub external: HashMap<ResourceHash, Blob>,
}

impl WimState {
    pub(crate) fn new(ctype: i32, guid: [u8; 16], created: i64) -> Self {
        let chunk_size = codec::default_chunk_size(ctype);
        Self {
            path: None,
            file: None,
            header: ArchiveHeader {
                guid,
                boot_index: 0,
                created,
            },
            compression_type: ctype,
            chunk_size,
            output: OutputSettings::for_type(ctype, chunk_size),
            part_number: 1,
            total_parts: 1,
            has_integrity: false,
            marked_readonly: false,
            rpfix: false,
            solid: false,
            file_readonly: false,
            images: Vec::new(),
            blobs: HashMap::new(),
            external: HashMap::new(),
        }
    }

    /// Parses an archive file held in memory.
    pub(crate) fn from_bytes(path: Option<PathBuf>, bytes: Arc<[u8]>) -> Status<Self> {
        let decoded = container::decode(&bytes)?;
        let sb = decoded.superblock;
        let blobs = decoded
            .entries
            .iter()
            .map(|e| (e.hash, Blob::packed(&bytes, *e)))
            .collect();
        Ok(Self {
            path,
            header: decoded.manifest.header,
            compression_type: sb.compression_type,
            chunk_size: sb.chunk_size,
            output: OutputSettings::for_type(sb.compression_type, sb.chunk_size),
            part_number: sb.part_number,
            total_parts: sb.total_parts,
            has_integrity: sb.flags & FLAG_INTEGRITY != 0,
            marked_readonly: sb.flags & FLAG_READONLY != 0,
            rpfix: sb.flags & FLAG_RPFIX != 0,
            solid: sb.flags & FLAG_SOLID != 0,
            file_readonly: false,
            images: decoded.manifest.images,
            blobs,
            external: HashMap::new(),
            file: Some(bytes),
        })
    }

    /// Keeps settings and references while taking images and resources from
    /// a freshly written copy of the archive.
    pub(crate) fn reload(&mut self, bytes: Arc<[u8]>) -> Status<()> {
        let fresh = Self::from_bytes(self.path.clone(), bytes)?;
        let output = self.output;
        let external = std::mem::take(&mut self.external);
        *self = Self {
            output,
            external,
            ..fresh
        };
        Ok(())
    }

    pub(crate) fn lookup(&self, hash: &ResourceHash) -> Option<&Blob> {
        self.blobs.get(hash).or_else(|| self.external.get(hash))
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.marked_readonly || self.file_readonly || self.total_parts > 1
    }

    pub(crate) fn info(&self) -> RawWimInfo {
        RawWimInfo {
            guid: self.header.guid,
            image_count: self.images.len() as u32,
            boot_index: self.header.boot_index,
            wim_version: if self.solid { VERSION_SOLID } else { VERSION_DEFAULT },
            chunk_size: self.chunk_size,
            part_number: self.part_number,
            total_parts: self.total_parts,
            compression_type: self.compression_type,
            total_bytes: self.file.as_ref().map_or(0, |f| f.len() as u64),
            has_integrity_table: self.has_integrity,
            opened_from_file: self.path.is_some(),
            is_readonly: self.is_readonly(),
            has_rpfix: self.rpfix,
            is_marked_readonly: self.marked_readonly,
            spanned: self.total_parts > 1,
            write_in_progress: false,
            metadata_only: false,
            resource_only: self.images.is_empty() && self.part_number > 1,
            pipable: false,
        }
    }

    pub(crate) fn name_in_use(&self, name: &str, except: Option<usize>) -> bool {
        !name.is_empty()
            && self
                .images
                .iter()
                .enumerate()
                .any(|(i, image)| Some(i) != except && image.name == name)
    }

    /// Hash → number of file records pointing at it, over every image.
    pub(crate) fn reference_counts(&self) -> HashMap<ResourceHash, u32> {
        let mut counts = HashMap::new();
        for file in self.images.iter().flat_map(|i| &i.files) {
            if let (Some(hash), true) = (file.hash, file.size > 0) {
                *counts.entry(hash).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Resource table rows: own resources, then resources images need but
    /// nobody can supply.
    pub(crate) fn resource_entries(&self) -> Vec<ResourceEntry> {
        let counts = self.reference_counts();
        let mut own: Vec<_> = self.blobs.iter().collect();
        own.sort_by_key(|(hash, _)| **hash);
        let mut out: Vec<ResourceEntry> = own
            .into_iter()
            .map(|(hash, blob)| blob.entry(*hash, counts.get(hash).copied().unwrap_or(0)))
            .collect();
        let mut missing: Vec<_> = counts
            .iter()
            .filter(|(hash, _)| self.lookup(hash).is_none())
            .collect();
        missing.sort();
        out.extend(missing.into_iter().map(|(hash, refs)| ResourceEntry {
            hash: *hash,
            reference_count: *refs,
            is_missing: true,
            ..ResourceEntry::default()
        }));
        out
    }

    /// Source files of not-yet-read contents in the given images.
    pub(crate) fn pending_sources(&self, images: &[usize]) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        images
            .iter()
            .filter_map(|&i| self.images.get(i))
            .flat_map(|image| &image.files)
            .filter_map(|f| f.pending.clone())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    /// Records contents read from disk, keyed by the path they came from.
    pub(crate) fn commit_pending(&mut self, resolved: Vec<(PathBuf, ResourceHash, Blob)>) {
        let by_path: HashMap<PathBuf, ResourceHash> = resolved
            .iter()
            .map(|(path, hash, _)| (path.clone(), *hash))
            .collect();
        for file in self.images.iter_mut().flat_map(|i| &mut i.files) {
            if let Some(hash) = file.pending.as_ref().and_then(|p| by_path.get(p)) {
                file.hash = Some(*hash);
                file.pending = None;
            }
        }
        for (_, hash, blob) in resolved {
            self.blobs.entry(hash).or_insert(blob);
        }
    }
}

// ---- capture ----

fn mode_from(_md: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        _md.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        if _md.is_dir() { 0o040755 } else { 0o100644 }
    }
}

fn mtime_from(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn archive_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn file_record(path: String, source: &Path, md: &fs::Metadata) -> FileRecord {
    let size = md.len();
    FileRecord {
        path,
        size,
        mtime: mtime_from(md),
        mode: mode_from(md),
        hash: (size == 0).then(|| ResourceHash::of(&[])),
        pending: (size > 0).then(|| source.to_path_buf()),
    }
}

/// Walks `source` and records its tree without reading file contents.
pub(crate) fn capture(
    source: &Path,
    reporter: &mut Reporter<'_, '_>,
) -> Status<(Vec<DirRecord>, Vec<FileRecord>)> {
    let root_md = fs::symlink_metadata(source).map_err(|_| status::STAT)?;
    let mut scan = ScanProgress {
        source: source.to_path_buf(),
        cur_path: None,
        status: ScanStatus::Ok,
        num_dirs_scanned: 0,
        num_nondirs_scanned: 0,
        num_bytes_scanned: 0,
    };
    reporter.emit(ProgressMsg::ScanBegin, ProgressInfo::Scan(scan.clone()))?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    if root_md.is_file() {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(status::INVALID_PARAM)?;
        files.push(file_record(name, source, &root_md));
        scan.num_nondirs_scanned = 1;
        scan.num_bytes_scanned = root_md.len();
        scan.cur_path = Some(source.to_path_buf());
        reporter.emit(ProgressMsg::ScanDentry, ProgressInfo::Scan(scan.clone()))?;
    } else if root_md.is_dir() {
        for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| if e.io_error().is_some() { status::OPENDIR } else { status::STAT })?;
            let md = entry.metadata().map_err(|_| status::STAT)?;
            scan.status = ScanStatus::Ok;
            if entry.depth() == 0 {
                scan.num_dirs_scanned += 1;
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(source)
                .map(archive_path)
                .map_err(|_| status::INVALID_PARAM)?;
            if md.is_dir() {
                dirs.push(DirRecord {
                    path: rel,
                    mode: mode_from(&md),
                    mtime: mtime_from(&md),
                });
                scan.num_dirs_scanned += 1;
            } else if md.is_file() {
                scan.num_nondirs_scanned += 1;
                scan.num_bytes_scanned += md.len();
                files.push(file_record(rel, entry.path(), &md));
            } else {
                // links and special files are not captured
                scan.status = ScanStatus::Unsupported;
            }
            if reporter.is_active() {
                scan.cur_path = Some(entry.path().to_path_buf());
                reporter.emit(ProgressMsg::ScanDentry, ProgressInfo::Scan(scan.clone()))?;
            }
        }
    } else {
        return Err(status::NOTDIR);
    }

    scan.cur_path = None;
    scan.status = ScanStatus::Ok;
    reporter.emit(ProgressMsg::ScanEnd, ProgressInfo::Scan(scan))?;
    Ok((dirs, files))
}

/// Reads and hashes captured files, in parallel on `pool`.
pub(crate) fn read_pending(
    paths: &[PathBuf],
    pool: &ThreadPool,
) -> Status<Vec<(PathBuf, ResourceHash, Blob)>> {
    pool.install(|| {
        paths
            .par_iter()
            .map(|path| -> Status<(PathBuf, ResourceHash, Blob)> {
                let data = fs::read(path).map_err(|_| status::READ)?;
                let hash = ResourceHash::of(&data);
                Ok((path.clone(), hash, Blob::memory(data)))
            })
            .collect()
    })
}

pub(crate) fn thread_pool(threads: u32) -> Status<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads as usize)
        .build()
        .map_err(|_| status::NOMEM)
}

// ---- writing ----

/// A self-contained description of one archive to produce.
pub(crate) struct WriteJob {
    pub header: ArchiveHeader,
    pub images: Vec<ImageRecord>,
    pub blobs: HashMap<ResourceHash, Blob>,
    pub external_only: HashSet<ResourceHash>,
    pub compression_type: i32,
    pub chunk_size: u32,
    pub level: u32,
    pub flags: WriteFlags,
    pub superblock_flags: u16,
    pub threads: u32,
}

impl WriteJob {
    /// Snapshot of `state` limited to `images` (0-based).
    pub(crate) fn from_state(
        state: &WimState,
        images: &[usize],
        flags: WriteFlags,
        level: u32,
        threads: u32,
    ) -> Status<Self> {
        let selected: Vec<ImageRecord> = images
            .iter()
            .map(|&i| state.images.get(i).cloned().ok_or(status::INVALID_IMAGE))
            .collect::<Status<_>>()?;
        if selected.iter().flat_map(|i| &i.files).any(|f| f.hash.is_none()) {
            return Err(status::INVALID_METADATA_RESOURCE);
        }

        let mut blobs = HashMap::new();
        let mut external_only = HashSet::new();
        for file in selected.iter().flat_map(|i| &i.files).filter(|f| f.size > 0) {
            let Some(hash) = file.hash else { continue };
            if let Some(blob) = state.blobs.get(&hash) {
                blobs.insert(hash, blob.clone());
            } else if let Some(blob) = state.external.get(&hash) {
                blobs.insert(hash, blob.clone());
                external_only.insert(hash);
            }
        }

        let mut header = state.header.clone();
        header.boot_index = match images {
            [only] => u32::from(state.header.boot_index as usize == only + 1),
            _ => state.header.boot_index,
        };

        let solid = flags.contains(WriteFlags::SOLID);
        let (compression_type, chunk_size) = if solid {
            (state.output.pack_compression_type, state.output.pack_chunk_size)
        } else {
            (state.output.compression_type, state.output.chunk_size)
        };
        let integrity = flags.contains(WriteFlags::CHECK_INTEGRITY)
            || (state.has_integrity && !flags.contains(WriteFlags::NO_CHECK_INTEGRITY));
        let mut superblock_flags = 0;
        if integrity {
            superblock_flags |= FLAG_INTEGRITY;
        }
        if state.marked_readonly {
            superblock_flags |= FLAG_READONLY;
        }
        if state.rpfix {
            superblock_flags |= FLAG_RPFIX;
        }
        if solid {
            superblock_flags |= FLAG_SOLID;
        }

        Ok(Self {
            header,
            images: selected,
            blobs,
            external_only,
            compression_type,
            chunk_size,
            level,
            flags,
            superblock_flags,
            threads,
        })
    }

    fn superblock(&self, part_number: u16, total_parts: u16) -> Superblock {
        Superblock {
            flags: self.superblock_flags,
            part_number,
            total_parts,
            compression_type: self.compression_type,
            chunk_size: self.chunk_size,
            ..Superblock::default()
        }
    }

    /// Resource hashes in order of first use, with reference counts.
    fn referenced(&self) -> (Vec<ResourceHash>, HashMap<ResourceHash, u32>) {
        let mut order = Vec::new();
        let mut counts: HashMap<ResourceHash, u32> = HashMap::new();
        for file in self.images.iter().flat_map(|i| &i.files).filter(|f| f.size > 0) {
            let Some(hash) = file.hash else { continue };
            let count = counts.entry(hash).or_insert(0);
            if *count == 0 {
                order.push(hash);
            }
            *count += 1;
        }
        (order, counts)
    }
}

pub(crate) struct EncodedBlob {
    hash: ResourceHash,
    u_size: u64,
    reference_count: u32,
    data: Vec<u8>,
}

/// Compresses every resource the job needs, in parallel on `pool`.
pub(crate) fn encode_all(job: &WriteJob, pool: &ThreadPool) -> Status<Vec<EncodedBlob>> {
    let (order, counts) = job.referenced();
    let skip_external = job.flags.contains(WriteFlags::SKIP_EXTERNAL_WIMS);
    let mut wanted = Vec::with_capacity(order.len());
    for hash in order {
        if skip_external && job.external_only.contains(&hash) {
            continue;
        }
        let blob = job.blobs.get(&hash).ok_or(status::RESOURCE_NOT_FOUND)?;
        wanted.push((hash, blob, counts.get(&hash).copied().unwrap_or(1)));
    }
    let recompress = job.flags.contains(WriteFlags::RECOMPRESS);
    pool.install(|| {
        wanted
            .par_iter()
            .map(|(hash, blob, refs)| -> Status<EncodedBlob> {
                Ok(EncodedBlob {
                    hash: *hash,
                    u_size: blob.size,
                    reference_count: *refs,
                    data: blob.encoded(job.compression_type, job.chunk_size, job.level, recompress)?,
                })
            })
            .collect()
    })
}

fn table_entry(job: &WriteJob, blob: &EncodedBlob, part_number: u16, data_off: u64) -> TableEntry {
    let mut flags = 0;
    if job.compression_type != codec::NONE {
        flags |= ENTRY_COMPRESSED;
    }
    if job.flags.contains(WriteFlags::SOLID) {
        flags |= ENTRY_PACKED;
    }
    TableEntry {
        hash: blob.hash,
        flags,
        part_number,
        chunk_size: job.chunk_size,
        compression_type: job.compression_type,
        reference_count: blob.reference_count,
        u_size: blob.u_size,
        c_size: blob.data.len() as u64,
        data_off,
    }
}

/// Produces the complete archive file for `job`.
pub(crate) fn assemble(
    job: &WriteJob,
    encoded: Vec<EncodedBlob>,
    filename: Option<&Path>,
    reporter: &mut Reporter<'_, '_>,
) -> Status<Vec<u8>> {
    let mut progress = WriteStreamsProgress {
        total_bytes: encoded.iter().map(|b| b.u_size).sum(),
        total_streams: encoded.len() as u64,
        num_threads: job.threads,
        compression_type: job.compression_type,
        total_parts: 1,
        ..WriteStreamsProgress::default()
    };
    reporter.emit(ProgressMsg::WriteStreams, ProgressInfo::WriteStreams(progress.clone()))?;

    let mut entries = Vec::with_capacity(encoded.len());
    let mut data = Vec::new();
    for blob in encoded {
        entries.push(table_entry(job, &blob, 1, data.len() as u64));
        data.extend_from_slice(&blob.data);
        progress.completed_bytes += blob.u_size;
        progress.completed_streams += 1;
        if progress.completed_streams == progress.total_streams {
            progress.completed_parts = 1;
        }
        reporter.emit(ProgressMsg::WriteStreams, ProgressInfo::WriteStreams(progress.clone()))?;
    }

    reporter.emit(ProgressMsg::WriteMetadataBegin, ProgressInfo::Empty)?;
    let manifest = container::encode_manifest(&Manifest {
        header: job.header.clone(),
        images: job.images.clone(),
    })?;
    reporter.emit(ProgressMsg::WriteMetadataEnd, ProgressInfo::Empty)?;

    let integrity = job.superblock_flags & FLAG_INTEGRITY != 0;
    let mut calc = IntegrityProgress {
        total_bytes: data.len() as u64,
        total_chunks: data.len().div_ceil(INTEGRITY_CHUNK) as u32,
        chunk_size: INTEGRITY_CHUNK as u32,
        filename: filename.map(Path::to_path_buf),
        ..IntegrityProgress::default()
    };
    if integrity {
        reporter.emit(ProgressMsg::CalcIntegrity, ProgressInfo::Integrity(calc.clone()))?;
    }
    let mut out = Vec::with_capacity(data.len() + manifest.len() + 4096);
    let image_count = u32::try_from(job.images.len()).map_err(|_| status::IMAGE_COUNT)?;
    container::write_container(&mut out, job.superblock(1, 1), &manifest, image_count, &entries, &data)
        .map_err(|_| status::WRITE)?;
    if integrity {
        calc.completed_bytes = calc.total_bytes;
        calc.completed_chunks = calc.total_chunks;
        reporter.emit(ProgressMsg::CalcIntegrity, ProgressInfo::Integrity(calc))?;
    }
    Ok(out)
}

/// Name of part `n` of a split set: part 1 keeps `swm`, later parts insert
/// their number before the extension.
pub(crate) fn part_path(swm: &Path, n: u16) -> PathBuf {
    if n <= 1 {
        return swm.to_path_buf();
    }
    let mut name = swm.file_stem().map(OsStr::to_os_string).unwrap_or_default();
    name.push(n.to_string());
    if let Some(ext) = swm.extension() {
        name.push(".");
        name.push(ext);
    }
    swm.with_file_name(name)
}

/// Writes `job` as a split set. Parts written before a failure are left in
/// place.
pub(crate) fn split(
    job: &WriteJob,
    encoded: Vec<EncodedBlob>,
    swm: &Path,
    part_size: u64,
    reporter: &mut Reporter<'_, '_>,
) -> Status<()> {
    let full = container::encode_manifest(&Manifest {
        header: job.header.clone(),
        images: job.images.clone(),
    })?;
    let bare = container::encode_manifest(&Manifest {
        header: job.header.clone(),
        images: Vec::new(),
    })?;

    let mut parts: Vec<Vec<usize>> = vec![Vec::new()];
    let mut used = HEADER_LEN + full.len() as u64 + TAIL_LEN;
    for (i, blob) in encoded.iter().enumerate() {
        let cost = (ENTRY_SIZE + blob.data.len()) as u64;
        let current_has_blobs = parts.last().is_some_and(|p| !p.is_empty());
        if used + cost > part_size && current_has_blobs {
            parts.push(Vec::new());
            used = HEADER_LEN + bare.len() as u64 + TAIL_LEN;
        }
        if let Some(part) = parts.last_mut() {
            part.push(i);
        }
        used += cost;
    }
    let total_parts = u16::try_from(parts.len()).map_err(|_| status::INVALID_PARAM)?;
    let image_count = u32::try_from(job.images.len()).map_err(|_| status::IMAGE_COUNT)?;

    let mut progress = SplitProgress {
        total_bytes: encoded.iter().map(|b| b.data.len() as u64).sum(),
        total_parts: total_parts.into(),
        ..SplitProgress::default()
    };
    for (n, members) in (1..=total_parts).zip(&parts) {
        let path = part_path(swm, n);
        progress.cur_part_number = n.into();
        progress.part_name = path.clone();
        reporter.emit(ProgressMsg::SplitBeginPart, ProgressInfo::Split(progress.clone()))?;

        let mut entries = Vec::with_capacity(members.len());
        let mut data = Vec::new();
        for &i in members {
            let blob = &encoded[i];
            entries.push(table_entry(job, blob, n, data.len() as u64));
            data.extend_from_slice(&blob.data);
        }
        let (manifest, images) = if n == 1 { (&full, image_count) } else { (&bare, 0) };
        let file = fs::File::create(&path).map_err(|_| status::OPEN)?;
        container::write_container(
            io::BufWriter::new(file),
            job.superblock(n, total_parts),
            manifest,
            images,
            &entries,
            &data,
        )
        .map_err(|_| status::WRITE)?;

        progress.completed_bytes += data.len() as u64;
        reporter.emit(ProgressMsg::SplitEndPart, ProgressInfo::Split(progress.clone()))?;
    }
    Ok(())
}

// ---- extraction ----

pub(crate) struct ExtractJob {
    /// 1-based index and record of each image to extract.
    pub images: Vec<(u32, ImageRecord)>,
    pub blobs: HashMap<ResourceHash, Blob>,
    pub target: PathBuf,
    pub flags: ExtractFlags,
    pub wimfile: Option<PathBuf>,
    /// Put each image in its own directory under `target`.
    pub into_subdirs: bool,
}

fn safe_join(root: &Path, archive_path: &str) -> Status<PathBuf> {
    let rel = Path::new(archive_path);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(status::INVALID_METADATA_RESOURCE);
    }
    Ok(root.join(rel))
}

fn image_dir_name(index: u32, image: &ImageRecord) -> String {
    let usable = !image.name.is_empty()
        && Path::new(&image.name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        && !image.name.contains(['/', '\\']);
    if usable { image.name.clone() } else { index.to_string() }
}

/// One directory per image. Names are used only when every image gets a
/// distinct one; otherwise all images fall back to their index.
fn image_dirs(images: &[(u32, ImageRecord)]) -> Vec<String> {
    let named: Vec<String> = images
        .iter()
        .map(|(index, image)| image_dir_name(*index, image))
        .collect();
    let distinct: HashSet<&str> = named.iter().map(String::as_str).collect();
    if distinct.len() == named.len() {
        named
    } else {
        images.iter().map(|(index, _)| index.to_string()).collect()
    }
}

pub(crate) fn extract(job: &ExtractJob, reporter: &mut Reporter<'_, '_>) -> Status<()> {
    let dirs = if job.into_subdirs { image_dirs(&job.images) } else { Vec::new() };
    for (i, (index, image)) in job.images.iter().enumerate() {
        let root = match dirs.get(i) {
            Some(dir) => job.target.join(dir),
            None => job.target.clone(),
        };
        extract_one(job, *index, image, &root, reporter)?;
    }
    Ok(())
}

fn extract_one(
    job: &ExtractJob,
    index: u32,
    image: &ImageRecord,
    root: &Path,
    reporter: &mut Reporter<'_, '_>,
) -> Status<()> {
    let mut progress = ExtractProgress {
        image: index,
        extract_flags: job.flags.bits(),
        wimfile_name: job.wimfile.clone(),
        image_name: Some(image.name.clone()),
        target: root.to_path_buf(),
        total_bytes: image.total_bytes(),
        total_streams: image.files.iter().filter(|f| f.size > 0).count() as u64,
        end_file_count: (image.files.len() + image.dirs.len()) as u64,
        ..ExtractProgress::default()
    };
    reporter.emit(ProgressMsg::ExtractImageBegin, ProgressInfo::Extract(progress.clone()))?;

    fs::create_dir_all(root).map_err(|_| status::MKDIR)?;
    for dir in &image.dirs {
        fs::create_dir_all(safe_join(root, &dir.path)?).map_err(|_| status::MKDIR)?;
        progress.current_file_count += 1;
    }
    reporter.emit(ProgressMsg::ExtractFileStructure, ProgressInfo::Extract(progress.clone()))?;

    for file in &image.files {
        let dest = safe_join(root, &file.path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|_| status::MKDIR)?;
        }
        let contents: Cow<'_, [u8]> = if file.size == 0 {
            Cow::Borrowed(&[][..])
        } else if let Some(source) = &file.pending {
            Cow::Owned(fs::read(source).map_err(|_| status::READ)?)
        } else {
            let hash = file.hash.ok_or(status::INVALID_METADATA_RESOURCE)?;
            let blob = job.blobs.get(&hash).ok_or(status::RESOURCE_NOT_FOUND)?;
            blob.read()?
        };
        if contents.len() as u64 != file.size {
            return Err(status::INVALID_RESOURCE_HASH);
        }
        fs::write(&dest, &contents).map_err(|_| status::WRITE)?;
        progress.current_file_count += 1;
        if file.size > 0 {
            progress.completed_bytes += file.size;
            progress.completed_streams += 1;
            reporter.emit(ProgressMsg::ExtractStreams, ProgressInfo::Extract(progress.clone()))?;
        }
    }

    reporter.emit(ProgressMsg::ExtractMetadata, ProgressInfo::Extract(progress.clone()))?;
    if job.flags.contains(ExtractFlags::UNIX_DATA) {
        apply_modes(image, root)?;
    }
    reporter.emit(ProgressMsg::ExtractImageEnd, ProgressInfo::Extract(progress))?;
    Ok(())
}

#[cfg(unix)]
fn apply_modes(image: &ImageRecord, root: &Path) -> Status<()> {
    use std::os::unix::fs::PermissionsExt;
    let modes = image
        .files
        .iter()
        .map(|f| (&f.path, f.mode))
        .chain(image.dirs.iter().map(|d| (&d.path, d.mode)));
    for (path, mode) in modes.filter(|(_, mode)| *mode != 0) {
        let dest = safe_join(root, path)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|_| status::WRITE)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_modes(_image: &ImageRecord, _root: &Path) -> Status<()> {
    Ok(())
}

// ---- verification ----

pub(crate) fn verify(state: &WimState, reporter: &mut Reporter<'_, '_>) -> Status<()> {
    let total_images = state.images.len() as u32;
    for (i, image) in state.images.iter().enumerate() {
        let mut progress = VerifyImageProgress {
            wimfile: state.path.clone(),
            total_images,
            current_image: i as u32 + 1,
        };
        reporter.emit(ProgressMsg::BeginVerifyImage, ProgressInfo::VerifyImage(progress.clone()))?;
        for file in image.files.iter().filter(|f| f.size > 0 && f.pending.is_none()) {
            let hash = file.hash.ok_or(status::INVALID_METADATA_RESOURCE)?;
            let blob = state.lookup(&hash).ok_or(status::RESOURCE_NOT_FOUND)?;
            if blob.size != file.size {
                return Err(status::INVALID_RESOURCE_HASH);
            }
        }
        reporter.emit(ProgressMsg::EndVerifyImage, ProgressInfo::VerifyImage(progress))?;
    }

    let mut own: Vec<_> = state.blobs.iter().collect();
    own.sort_by_key(|(hash, _)| **hash);
    let mut progress = VerifyStreamsProgress {
        wimfile: state.path.clone(),
        total_streams: own.len() as u64,
        total_bytes: own.iter().map(|(_, b)| b.size).sum(),
        ..VerifyStreamsProgress::default()
    };
    reporter.emit(ProgressMsg::VerifyStreams, ProgressInfo::VerifyStreams(progress.clone()))?;
    for (hash, blob) in own {
        let data = blob.read()?;
        if data.len() as u64 != blob.size || ResourceHash::of(&data) != *hash {
            return Err(status::INVALID_RESOURCE_HASH);
        }
        progress.completed_streams += 1;
        progress.completed_bytes += blob.size;
        reporter.emit(ProgressMsg::VerifyStreams, ProgressInfo::VerifyStreams(progress.clone()))?;
    }

    if let Some(file) = &state.file {
        let decoded = container::decode(file)?;
        container::check_integrity(file, &decoded, INTEGRITY_CHUNK, |_, _| Ok(()))?;
    }
    Ok(())
}

/// Checks the tail digests of a freshly read archive, reporting
/// `VerifyIntegrity` progress.
pub(crate) fn check_file_integrity(
    bytes: &[u8],
    path: &Path,
    reporter: &mut Reporter<'_, '_>,
) -> Status<()> {
    let decoded = container::decode(bytes)?;
    if decoded.superblock.flags & FLAG_INTEGRITY == 0 {
        return Ok(());
    }
    let mut progress = IntegrityProgress {
        chunk_size: INTEGRITY_CHUNK as u32,
        filename: Some(path.to_path_buf()),
        ..IntegrityProgress::default()
    };
    container::check_integrity(bytes, &decoded, INTEGRITY_CHUNK, |done, total| {
        progress.total_bytes = total;
        progress.completed_bytes = done;
        progress.total_chunks = (total as usize).div_ceil(INTEGRITY_CHUNK) as u32;
        progress.completed_chunks = (done as usize).div_ceil(INTEGRITY_CHUNK) as u32;
        reporter.emit(ProgressMsg::VerifyIntegrity, ProgressInfo::Integrity(progress.clone()))
    })
}

// ---- XML ----

fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Seconds since the Unix epoch as a Windows FILETIME (100ns ticks since 1601).
pub(crate) fn filetime(unix_seconds: i64) -> u64 {
    let since_1601 = unix_seconds.saturating_add(11_644_473_600).max(0) as u64;
    since_1601.saturating_mul(10_000_000)
}

fn push_time(xml: &mut String, tag: &str, unix_seconds: i64) {
    let ft = filetime(unix_seconds);
    xml.push_str(&format!(
        "<{tag}><HIGHPART>0x{:08X}</HIGHPART><LOWPART>0x{:08X}</LOWPART></{tag}>",
        ft >> 32,
        ft & 0xffff_ffff
    ));
}

/// Archive metadata as UTF-16LE XML with a byte order mark.
pub(crate) fn xml_data(state: &WimState) -> Vec<u8> {
    let total: u64 = state.file.as_ref().map_or(0, |f| f.len() as u64);
    let mut xml = format!("<WIM><TOTALBYTES>{total}</TOTALBYTES>");
    for (i, image) in state.images.iter().enumerate() {
        xml.push_str(&format!("<IMAGE INDEX=\"{}\">", i + 1));
        xml.push_str(&format!("<DIRCOUNT>{}</DIRCOUNT>", image.dirs.len()));
        xml.push_str(&format!("<FILECOUNT>{}</FILECOUNT>", image.files.len()));
        xml.push_str(&format!("<TOTALBYTES>{}</TOTALBYTES>", image.total_bytes()));
        push_time(&mut xml, "CREATIONTIME", image.created);
        let modified = image.files.iter().map(|f| f.mtime).max().unwrap_or(image.created);
        push_time(&mut xml, "LASTMODIFICATIONTIME", modified);
        if !image.name.is_empty() {
            xml.push_str(&format!("<NAME>{}</NAME>", escape(&image.name)));
        }
        if let Some(description) = &image.description {
            xml.push_str(&format!("<DESCRIPTION>{}</DESCRIPTION>", escape(description)));
        }
        for (key, value) in &image.properties {
            let tags: Vec<&str> = key.split('/').collect();
            for tag in &tags {
                xml.push_str(&format!("<{tag}>"));
            }
            xml.push_str(&escape(value));
            for tag in tags.iter().rev() {
                xml.push_str(&format!("</{tag}>"));
            }
        }
        xml.push_str("</IMAGE>");
    }
    if state.header.boot_index > 0 {
        xml.push_str(&format!("<BOOTINDEX>{}</BOOTINDEX>", state.header.boot_index));
    }
    xml.push_str("</WIM>");

    let mut out = Vec::with_capacity(2 + xml.len() * 2);
    out.extend_from_slice(&[0xff, 0xfe]);
    for unit in xml.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

// ---- references ----

fn wildcard_match(pattern: &[char], name: &[char]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some('*'), _) => {
            wildcard_match(&pattern[1..], name)
                || (!name.is_empty() && wildcard_match(pattern, &name[1..]))
        }
        (Some('?'), Some(_)) => wildcard_match(&pattern[1..], &name[1..]),
        (Some(p), Some(n)) if p == n => wildcard_match(&pattern[1..], &name[1..]),
        _ => false,
    }
}

/// Expands `*` and `?` in the last component of `pattern`.
pub(crate) fn expand_glob(pattern: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(name) = pattern.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    if !name.contains(['*', '?']) {
        return Ok(if pattern.exists() { vec![pattern.to_path_buf()] } else { Vec::new() });
    }
    let dir = match pattern.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let wanted: Vec<char> = name.chars().collect();
    let mut out = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let candidate: Vec<char> = entry.file_name().to_string_lossy().chars().collect();
        if entry.file_type()?.is_file() && wildcard_match(&wanted, &candidate) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}
