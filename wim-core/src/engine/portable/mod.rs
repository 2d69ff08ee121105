//! Pure-Rust engine.
//!
//! Archives live in a self-describing container (see [`container`]) and
//! compression runs on zstd. Every session is kept in an in-process table
//! keyed by the raw id handed out to callers.

mod archive;
mod codec;
mod container;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(unix)]
use std::os::fd::BorrowedFd;

use tracing::{debug, trace};

use self::archive::{ExtractJob, Reporter, Status, WimState, WriteJob};
use self::container::ImageRecord;
use super::{
    Engine, ProgressSink, RawCompressor, RawDecompressor, RawWim, RawWimInfo, ResourceSink,
};
use crate::error::status;
use crate::flags::{AddFlags, ExportFlags, ExtractFlags, InfoChanges, InitFlags, OpenFlags, RefFlags, WriteFlags};
use crate::image::ALL_IMAGES;
use crate::progress::{ProgressInfo, ProgressMsg};

const VERSION: u32 = 1 << 10;

#[derive(Clone, Copy, Debug)]
struct CodecSession {
    compression_type: i32,
    max_block_size: usize,
    level: u32,
}

#[derive(Default)]
struct Tables {
    wims: HashMap<u64, Arc<Mutex<WimState>>>,
    compressors: HashMap<u64, CodecSession>,
    decompressors: HashMap<u64, CodecSession>,
}

#[derive(Debug)]
struct Settings {
    default_levels: [u32; 4],
    print_errors: bool,
    error_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_levels: [codec::DEFAULT_LEVEL; 4],
            print_errors: false,
            error_file: None,
        }
    }
}

/// The default engine. Needs no system library.
pub struct PortableEngine {
    tables: Mutex<Tables>,
    settings: Mutex<Settings>,
    next_id: AtomicU64,
}

impl Default for PortableEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_guid() -> Status<[u8; 16]> {
    let mut guid = [0u8; 16];
    getrandom::getrandom(&mut guid).map_err(|_| status::NOMEM)?;
    Ok(guid)
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn code_of(result: Status<()>) -> i32 {
    result.err().unwrap_or(status::SUCCESS)
}

/// 0-based positions named by a raw image selector.
fn selected_images(state: &WimState, image: i32) -> Status<Vec<usize>> {
    if image == ALL_IMAGES {
        return Ok((0..state.images.len()).collect());
    }
    if image >= 1 && image as usize <= state.images.len() {
        return Ok(vec![image as usize - 1]);
    }
    Err(status::INVALID_IMAGE)
}

fn image_index(state: &WimState, image: i32) -> Status<usize> {
    if image >= 1 && image as usize <= state.images.len() {
        Ok(image as usize - 1)
    } else {
        Err(status::INVALID_IMAGE)
    }
}

fn valid_property_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

fn write_file(path: &Path, bytes: &[u8], fsync: bool) -> Status<()> {
    let mut file = File::create(path).map_err(|_| status::OPEN)?;
    file.write_all(bytes).map_err(|_| status::WRITE)?;
    if fsync {
        file.sync_all().map_err(|_| status::WRITE)?;
    }
    Ok(())
}

impl PortableEngine {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            settings: Mutex::new(Settings::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_wim(&self, state: WimState) -> RawWim {
        let id = self.next_id();
        lock(&self.tables).wims.insert(id, Arc::new(Mutex::new(state)));
        RawWim(id)
    }

    fn wim(&self, wim: RawWim) -> Status<Arc<Mutex<WimState>>> {
        lock(&self.tables)
            .wims
            .get(&wim.0)
            .cloned()
            .ok_or(status::INVALID_PARAM)
    }

    fn default_level(&self, compression_type: i32) -> u32 {
        usize::try_from(compression_type)
            .ok()
            .and_then(|i| lock(&self.settings).default_levels.get(i).copied())
            .unwrap_or(codec::DEFAULT_LEVEL)
    }

    /// Logs a failed call and, when enabled, prints it for the user.
    fn outcome<T>(&self, op: &'static str, result: Status<T>) -> Status<T> {
        if let Err(code) = &result {
            self.report_failure(op, *code);
        }
        result
    }

    fn report_failure(&self, op: &'static str, code: i32) {
        debug!(op, code, "portable engine call failed");
        let (print, file) = {
            let settings = lock(&self.settings);
            (settings.print_errors, settings.error_file.clone())
        };
        if !print {
            return;
        }
        let line = format!("[ERROR] {op}: {}\n", status::describe(code));
        let written = match file {
            Some(path) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| f.write_all(line.as_bytes())),
            None => io::stderr().write_all(line.as_bytes()),
        };
        if let Err(e) = written {
            trace!(error = %e, "could not print engine error");
        }
    }

    fn status(&self, op: &'static str, result: Status<()>) -> i32 {
        code_of(self.outcome(op, result))
    }

    /// Reads pending file contents for `images`, then snapshots them into a
    /// write job. Locks are never held while reading or reporting.
    fn prepare_write(
        &self,
        state: &Mutex<WimState>,
        image: i32,
        flags: WriteFlags,
        threads: u32,
        pool: &rayon::ThreadPool,
        reporter: &mut Reporter<'_, '_>,
    ) -> Status<WriteJob> {
        let (indices, pending) = {
            let s = lock(state);
            let indices = selected_images(&s, image)?;
            let pending = s.pending_sources(&indices);
            (indices, pending)
        };
        if !pending.is_empty() {
            let resolved = archive::read_pending(&pending, pool)?;
            lock(state).commit_pending(resolved);
            if flags.contains(WriteFlags::SEND_DONE_WITH_FILE_MESSAGES) {
                for path in pending {
                    reporter.emit(ProgressMsg::DoneWithFile, ProgressInfo::DoneWithFile { path })?;
                }
            }
        }
        let s = lock(state);
        let ctype = if flags.contains(WriteFlags::SOLID) {
            s.output.pack_compression_type
        } else {
            s.output.compression_type
        };
        let mut job = WriteJob::from_state(&s, &indices, flags, self.default_level(ctype), threads)?;
        drop(s);
        if !flags.contains(WriteFlags::RETAIN_GUID) {
            job.header.guid = new_guid()?;
        }
        Ok(job)
    }

    fn build(
        &self,
        wim: RawWim,
        image: i32,
        flags: WriteFlags,
        threads: u32,
        filename: Option<&Path>,
        reporter: &mut Reporter<'_, '_>,
    ) -> Status<Vec<u8>> {
        let state = self.wim(wim)?;
        let pool = archive::thread_pool(threads)?;
        let job = self.prepare_write(&state, image, flags, threads, &pool, reporter)?;
        let encoded = archive::encode_all(&job, &pool)?;
        archive::assemble(&job, encoded, filename, reporter)
    }

    fn open_state(
        &self,
        path: &Path,
        flags: OpenFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Status<WimState> {
        let bytes: Arc<[u8]> = fs::read(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => status::OPEN,
                _ => status::READ,
            })?
            .into();
        let mut reporter = Reporter::new(progress);
        if flags.contains(OpenFlags::CHECK_INTEGRITY) {
            archive::check_file_integrity(&bytes, path, &mut reporter)?;
        }
        let mut state = WimState::from_bytes(Some(path.to_path_buf()), bytes)?;
        if flags.contains(OpenFlags::ERROR_IF_SPLIT) && state.total_parts > 1 {
            return Err(status::IS_SPLIT_WIM);
        }
        state.file_readonly = fs::metadata(path)
            .map(|m| m.permissions().readonly())
            .unwrap_or(false);
        Ok(state)
    }

    fn overwrite_inner(
        &self,
        wim: RawWim,
        flags: WriteFlags,
        threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Status<()> {
        let state = self.wim(wim)?;
        let path = {
            let s = lock(&state);
            let path = s.path.clone().ok_or(status::NO_FILENAME)?;
            if s.total_parts > 1 || s.file_readonly {
                return Err(status::WIM_IS_READONLY);
            }
            if s.marked_readonly && !flags.contains(WriteFlags::IGNORE_READONLY_FLAG) {
                return Err(status::WIM_IS_READONLY);
            }
            path
        };

        let mut reporter = Reporter::new(progress);
        let bytes = self.build(
            wim,
            ALL_IMAGES,
            flags | WriteFlags::RETAIN_GUID,
            threads,
            Some(&path),
            &mut reporter,
        )?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|_| status::OPEN)?;
        tmp.write_all(&bytes).map_err(|_| status::WRITE)?;
        if flags.contains(WriteFlags::FSYNC) {
            tmp.as_file().sync_all().map_err(|_| status::WRITE)?;
        }
        reporter.emit(
            ProgressMsg::Rename,
            ProgressInfo::Rename {
                from: tmp.path().to_path_buf(),
                to: path.clone(),
            },
        )?;
        tmp.persist(&path).map_err(|_| status::RENAME)?;
        debug!(path = %path.display(), bytes = bytes.len(), "archive overwritten");
        lock(&state).reload(bytes.into())
    }

    fn split_inner(
        &self,
        wim: RawWim,
        swm_name: &Path,
        part_size: u64,
        flags: WriteFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Status<()> {
        if part_size == 0 || swm_name.as_os_str().is_empty() {
            return Err(status::INVALID_PARAM);
        }
        let state = self.wim(wim)?;
        let mut reporter = Reporter::new(progress);
        let pool = archive::thread_pool(0)?;
        let job = self.prepare_write(
            &state,
            ALL_IMAGES,
            flags | WriteFlags::RETAIN_GUID,
            0,
            &pool,
            &mut reporter,
        )?;
        let encoded = archive::encode_all(&job, &pool)?;
        archive::split(&job, encoded, swm_name, part_size, &mut reporter)
    }

    fn set_info_inner(&self, wim: RawWim, info: &RawWimInfo, which: u32) -> Status<()> {
        let which = InfoChanges::from_bits(which);
        let state = self.wim(wim)?;
        let mut s = lock(&state);
        if which.contains(InfoChanges::BOOT_INDEX) && info.boot_index as usize > s.images.len() {
            return Err(status::INVALID_IMAGE);
        }
        if which.contains(InfoChanges::READONLY_FLAG) {
            s.marked_readonly = info.is_marked_readonly;
        }
        if which.contains(InfoChanges::GUID) {
            s.header.guid = info.guid;
        }
        if which.contains(InfoChanges::BOOT_INDEX) {
            s.header.boot_index = info.boot_index;
        }
        if which.contains(InfoChanges::RPFIX_FLAG) {
            s.rpfix = info.has_rpfix;
        }
        Ok(())
    }

    fn template_inner(
        &self,
        wim: RawWim,
        new_image: i32,
        template_wim: RawWim,
        template_image: i32,
        flags: u32,
    ) -> Status<()> {
        if flags != 0 {
            return Err(status::INVALID_PARAM);
        }
        let (template, blobs) = {
            let t = self.wim(template_wim)?;
            let t = lock(&t);
            let record = t.images[image_index(&t, template_image)?].clone();
            let blobs: HashMap<_, _> = record
                .files
                .iter()
                .filter_map(|f| f.hash)
                .filter_map(|h| t.lookup(&h).map(|b| (h, b.clone())))
                .collect();
            (record, blobs)
        };
        let by_path: HashMap<&str, _> = template
            .files
            .iter()
            .filter(|f| f.hash.is_some())
            .map(|f| (f.path.as_str(), f))
            .collect();

        let state = self.wim(wim)?;
        let mut s = lock(&state);
        let index = image_index(&s, new_image)?;
        let mut reused = Vec::new();
        for file in &mut s.images[index].files {
            if file.pending.is_none() {
                continue;
            }
            let Some(old) = by_path.get(file.path.as_str()) else { continue };
            if old.size == file.size && old.mtime == file.mtime {
                if let Some(blob) = old.hash.and_then(|h| blobs.get(&h).map(|b| (h, b))) {
                    file.hash = Some(blob.0);
                    file.pending = None;
                    reused.push((blob.0, blob.1.clone()));
                }
            }
        }
        debug!(reused = reused.len(), "files matched against template image");
        for (hash, blob) in reused {
            if !s.blobs.contains_key(&hash) {
                s.external.entry(hash).or_insert(blob);
            }
        }
        Ok(())
    }

    fn reference_files_inner(
        &self,
        wim: RawWim,
        paths: &[&Path],
        ref_flags: RefFlags,
        open_flags: OpenFlags,
    ) -> Status<()> {
        let state = self.wim(wim)?;
        let mut files = Vec::new();
        for path in paths {
            if !ref_flags.contains(RefFlags::GLOB_ENABLE) {
                files.push(path.to_path_buf());
                continue;
            }
            let matched = archive::expand_glob(path).map_err(|_| status::READ)?;
            if matched.is_empty() && ref_flags.contains(RefFlags::GLOB_ERR_ON_NOMATCH) {
                return Err(status::GLOB_HAD_NO_MATCHES);
            }
            files.extend(matched);
        }

        let mut borrowed = HashMap::new();
        for file in files {
            let other = self.open_state(&file, open_flags, None)?;
            debug!(path = %file.display(), resources = other.blobs.len(), "referenced resource file");
            borrowed.extend(other.blobs);
        }
        let mut s = lock(&state);
        for (hash, blob) in borrowed {
            if !s.blobs.contains_key(&hash) {
                s.external.entry(hash).or_insert(blob);
            }
        }
        Ok(())
    }

    fn reference_wims_inner(&self, wim: RawWim, others: &[RawWim]) -> Status<()> {
        let state = self.wim(wim)?;
        let mut borrowed = HashMap::new();
        for other in others {
            if other.0 == wim.0 {
                return Err(status::INVALID_PARAM);
            }
            let other = self.wim(*other)?;
            borrowed.extend(lock(&other).blobs.clone());
        }
        let mut s = lock(&state);
        for (hash, blob) in borrowed {
            if !s.blobs.contains_key(&hash) {
                s.external.entry(hash).or_insert(blob);
            }
        }
        Ok(())
    }

    fn add_image_inner(
        &self,
        wim: RawWim,
        source: &Path,
        name: &str,
        flags: AddFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Status<()> {
        let state = self.wim(wim)?;
        if lock(&state).name_in_use(name, None) {
            return Err(status::IMAGE_NAME_COLLISION);
        }
        let mut reporter = Reporter::new(progress);
        let (dirs, files) = archive::capture(source, &mut reporter)?;
        let mut s = lock(&state);
        if s.name_in_use(name, None) {
            return Err(status::IMAGE_NAME_COLLISION);
        }
        s.images.push(ImageRecord {
            name: name.to_string(),
            created: now(),
            dirs,
            files,
            ..ImageRecord::default()
        });
        if flags.contains(AddFlags::BOOT) {
            s.header.boot_index = s.images.len() as u32;
        }
        Ok(())
    }

    fn delete_image_inner(&self, wim: RawWim, image: i32) -> Status<()> {
        let state = self.wim(wim)?;
        let mut s = lock(&state);
        if image == ALL_IMAGES {
            s.images.clear();
            s.header.boot_index = 0;
            return Ok(());
        }
        let index = image_index(&s, image)?;
        s.images.remove(index);
        let removed = index as u32 + 1;
        s.header.boot_index = match s.header.boot_index {
            b if b == removed => 0,
            b if b > removed => b - 1,
            b => b,
        };
        Ok(())
    }

    fn export_inner(
        &self,
        src_wim: RawWim,
        src_image: i32,
        dest_wim: RawWim,
        dest_name: Option<&str>,
        dest_description: Option<&str>,
        flags: ExportFlags,
    ) -> Status<()> {
        if src_wim.0 == dest_wim.0 {
            return Err(status::INVALID_PARAM);
        }
        let (mut images, src_boot, blobs) = {
            let src = self.wim(src_wim)?;
            let s = lock(&src);
            let indices = selected_images(&s, src_image)?;
            let images: Vec<(usize, ImageRecord)> =
                indices.iter().map(|&i| (i, s.images[i].clone())).collect();
            let blobs: HashMap<_, _> = images
                .iter()
                .flat_map(|(_, image)| &image.files)
                .filter_map(|f| f.hash)
                .filter_map(|h| s.lookup(&h).map(|b| (h, b.clone())))
                .collect();
            (images, s.header.boot_index, blobs)
        };
        if images.len() > 1 && (dest_name.is_some() || dest_description.is_some()) {
            return Err(status::INVALID_PARAM);
        }
        for (_, image) in &mut images {
            if let Some(name) = dest_name {
                image.name = name.to_string();
            }
            if let Some(description) = dest_description {
                image.description = Some(description.to_string());
            }
            if flags.contains(ExportFlags::NO_NAMES) {
                image.name.clear();
            }
            if flags.contains(ExportFlags::NO_DESCRIPTIONS) {
                image.description = None;
            }
        }

        let dest = self.wim(dest_wim)?;
        let mut d = lock(&dest);
        for (i, (_, image)) in images.iter().enumerate() {
            let clash_in_batch = images[..i]
                .iter()
                .any(|(_, other)| !image.name.is_empty() && other.name == image.name);
            if d.name_in_use(&image.name, None) || clash_in_batch {
                return Err(status::IMAGE_NAME_COLLISION);
            }
        }
        let single = images.len() == 1;
        for (src_index, image) in images {
            d.images.push(image);
            let is_boot = src_boot as usize == src_index + 1;
            if flags.contains(ExportFlags::BOOT) && (single || is_boot) {
                d.header.boot_index = d.images.len() as u32;
            }
        }
        for (hash, blob) in blobs {
            d.blobs.entry(hash).or_insert(blob);
        }
        Ok(())
    }

    fn extract_inner(
        &self,
        wim: RawWim,
        image: i32,
        target: &Path,
        flags: ExtractFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Status<()> {
        let job = {
            let state = self.wim(wim)?;
            let s = lock(&state);
            let indices = selected_images(&s, image)?;
            let images: Vec<(u32, ImageRecord)> = indices
                .iter()
                .map(|&i| (i as u32 + 1, s.images[i].clone()))
                .collect();
            let blobs = images
                .iter()
                .flat_map(|(_, image)| &image.files)
                .filter_map(|f| f.hash)
                .filter_map(|h| s.lookup(&h).map(|b| (h, b.clone())))
                .collect();
            ExtractJob {
                images,
                blobs,
                target: target.to_path_buf(),
                flags,
                wimfile: s.path.clone(),
                into_subdirs: image == ALL_IMAGES,
            }
        };
        let mut reporter = Reporter::new(progress);
        archive::extract(&job, &mut reporter)
    }

    fn set_property_inner(&self, wim: RawWim, image: i32, name: &str, value: &str) -> Status<()> {
        let state = self.wim(wim)?;
        let mut s = lock(&state);
        let index = image_index(&s, image)?;
        match name {
            "NAME" => {
                if s.name_in_use(value, Some(index)) {
                    return Err(status::IMAGE_NAME_COLLISION);
                }
                s.images[index].name = value.to_string();
            }
            "DESCRIPTION" => {
                s.images[index].description = (!value.is_empty()).then(|| value.to_string());
            }
            _ if !valid_property_name(name) => return Err(status::INVALID_PARAM),
            _ if value.is_empty() => {
                s.images[index].properties.remove(name);
            }
            _ => {
                s.images[index]
                    .properties
                    .insert(name.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn set_output_inner(
        &self,
        wim: RawWim,
        apply: impl FnOnce(&mut archive::OutputSettings) -> Status<()>,
    ) -> Status<()> {
        let state = self.wim(wim)?;
        let mut s = lock(&state);
        apply(&mut s.output)
    }

    fn codec_session(&self, compression_type: i32, max_block_size: usize, level: u32) -> Status<CodecSession> {
        if compression_type == codec::NONE || !codec::is_valid_type(compression_type) {
            return Err(status::INVALID_COMPRESSION_TYPE);
        }
        if max_block_size == 0 || max_block_size > codec::max_block_size(compression_type) {
            return Err(status::INVALID_PARAM);
        }
        let level = if level == 0 { self.default_level(compression_type) } else { level };
        Ok(CodecSession {
            compression_type,
            max_block_size,
            level,
        })
    }
}

impl Engine for PortableEngine {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn version(&self) -> u32 {
        VERSION
    }

    fn global_init(&self, flags: u32) -> i32 {
        let flags = InitFlags::from_bits(flags);
        if flags.contains(InitFlags::DEFAULT_CASE_SENSITIVE)
            && flags.contains(InitFlags::DEFAULT_CASE_INSENSITIVE)
        {
            return status::INVALID_PARAM;
        }
        status::SUCCESS
    }

    fn global_cleanup(&self) {
        *lock(&self.settings) = Settings::default();
    }

    fn set_print_errors(&self, show: bool) -> i32 {
        lock(&self.settings).print_errors = show;
        status::SUCCESS
    }

    fn set_error_file_by_name(&self, path: Option<&Path>) -> i32 {
        let Some(path) = path else {
            lock(&self.settings).error_file = None;
            return status::SUCCESS;
        };
        if OpenOptions::new().create(true).append(true).open(path).is_err() {
            return status::OPEN;
        }
        let mut settings = lock(&self.settings);
        settings.error_file = Some(path.to_path_buf());
        settings.print_errors = true;
        status::SUCCESS
    }

    // ---- archives ----

    fn open(
        &self,
        path: &Path,
        open_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<RawWim, i32> {
        let state = self.open_state(path, OpenFlags::from_bits(open_flags), progress);
        self.outcome("open", state).map(|s| self.insert_wim(s))
    }

    fn create_new(&self, compression_type: i32) -> Result<RawWim, i32> {
        let state = if codec::is_valid_type(compression_type) {
            new_guid().map(|guid| WimState::new(compression_type, guid, now()))
        } else {
            Err(status::INVALID_COMPRESSION_TYPE)
        };
        self.outcome("create_new", state).map(|s| self.insert_wim(s))
    }

    fn free(&self, wim: RawWim) {
        if lock(&self.tables).wims.remove(&wim.0).is_none() {
            trace!(wim = wim.0, "free of unknown archive session");
        }
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
        let flags = WriteFlags::from_bits(write_flags);
        let mut reporter = Reporter::new(progress);
        let result = self
            .build(wim, image, flags, num_threads, Some(path), &mut reporter)
            .and_then(|bytes| write_file(path, &bytes, flags.contains(WriteFlags::FSYNC)));
        self.status("write", result)
    }

    #[cfg(unix)]
    fn write_to_fd(
        &self,
        wim: RawWim,
        fd: BorrowedFd<'_>,
        image: i32,
        write_flags: u32,
        num_threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let flags = WriteFlags::from_bits(write_flags);
        let mut reporter = Reporter::new(progress);
        let result = self
            .build(wim, image, flags, num_threads, None, &mut reporter)
            .and_then(|bytes| {
                let mut file = File::from(fd.try_clone_to_owned().map_err(|_| status::INVALID_PARAM)?);
                file.write_all(&bytes).map_err(|_| status::WRITE)?;
                file.flush().map_err(|_| status::WRITE)
            });
        self.status("write_to_fd", result)
    }

    fn overwrite(
        &self,
        wim: RawWim,
        write_flags: u32,
        num_threads: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let result = self.overwrite_inner(wim, WriteFlags::from_bits(write_flags), num_threads, progress);
        self.status("overwrite", result)
    }

    fn get_info(&self, wim: RawWim) -> Result<RawWimInfo, i32> {
        let info = self.wim(wim).map(|state| lock(&state).info());
        self.outcome("get_info", info)
    }

    fn set_info(&self, wim: RawWim, info: &RawWimInfo, which: u32) -> i32 {
        let result = self.set_info_inner(wim, info, which);
        self.status("set_info", result)
    }

    fn get_xml_data(&self, wim: RawWim) -> Result<Vec<u8>, i32> {
        let xml = self.wim(wim).map(|state| archive::xml_data(&lock(&state)));
        self.outcome("get_xml_data", xml)
    }

    fn verify(
        &self,
        wim: RawWim,
        verify_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let result = if verify_flags != 0 {
            Err(status::INVALID_PARAM)
        } else {
            self.wim(wim).and_then(|state| {
                let snapshot = lock(&state).clone();
                archive::verify(&snapshot, &mut Reporter::new(progress))
            })
        };
        self.status("verify", result)
    }

    fn split(
        &self,
        wim: RawWim,
        swm_name: &Path,
        part_size: u64,
        write_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let result = self.split_inner(
            wim,
            swm_name,
            part_size,
            WriteFlags::from_bits(write_flags),
            progress,
        );
        self.status("split", result)
    }

    fn reference_template_image(
        &self,
        wim: RawWim,
        new_image: i32,
        template_wim: RawWim,
        template_image: i32,
        flags: u32,
    ) -> i32 {
        let result = self.template_inner(wim, new_image, template_wim, template_image, flags);
        self.status("reference_template_image", result)
    }

    fn reference_resource_files(
        &self,
        wim: RawWim,
        paths: &[&Path],
        ref_flags: u32,
        open_flags: u32,
    ) -> i32 {
        let result = self.reference_files_inner(
            wim,
            paths,
            RefFlags::from_bits(ref_flags),
            OpenFlags::from_bits(open_flags),
        );
        self.status("reference_resource_files", result)
    }

    fn reference_resources(&self, wim: RawWim, resource_wims: &[RawWim], _ref_flags: u32) -> i32 {
        let result = self.reference_wims_inner(wim, resource_wims);
        self.status("reference_resources", result)
    }

    fn iterate_lookup_table(&self, wim: RawWim, flags: u32, visitor: &mut ResourceSink<'_>) -> i32 {
        if flags != 0 {
            return status::INVALID_PARAM;
        }
        let entries = match self.wim(wim) {
            Ok(state) => lock(&state).resource_entries(),
            Err(code) => return code,
        };
        for entry in &entries {
            let code = visitor(entry);
            if code != status::SUCCESS {
                return code;
            }
        }
        status::SUCCESS
    }

    fn set_output_compression_type(&self, wim: RawWim, compression_type: i32) -> i32 {
        let result = self.set_output_inner(wim, |out| {
            if !codec::is_valid_type(compression_type) {
                return Err(status::INVALID_COMPRESSION_TYPE);
            }
            out.compression_type = compression_type;
            if !codec::is_valid_chunk_size(compression_type, out.chunk_size) {
                out.chunk_size = codec::default_chunk_size(compression_type);
            }
            Ok(())
        });
        self.status("set_output_compression_type", result)
    }

    fn set_output_chunk_size(&self, wim: RawWim, chunk_size: u32) -> i32 {
        let result = self.set_output_inner(wim, |out| {
            if !codec::is_valid_chunk_size(out.compression_type, chunk_size) {
                return Err(status::INVALID_CHUNK_SIZE);
            }
            out.chunk_size = chunk_size;
            Ok(())
        });
        self.status("set_output_chunk_size", result)
    }

    fn set_output_pack_compression_type(&self, wim: RawWim, compression_type: i32) -> i32 {
        let result = self.set_output_inner(wim, |out| {
            if !codec::is_valid_type(compression_type) {
                return Err(status::INVALID_COMPRESSION_TYPE);
            }
            out.pack_compression_type = compression_type;
            if !codec::is_valid_chunk_size(compression_type, out.pack_chunk_size) {
                out.pack_chunk_size = codec::default_chunk_size(compression_type);
            }
            Ok(())
        });
        self.status("set_output_pack_compression_type", result)
    }

    fn set_output_pack_chunk_size(&self, wim: RawWim, chunk_size: u32) -> i32 {
        let result = self.set_output_inner(wim, |out| {
            if !codec::is_valid_chunk_size(out.pack_compression_type, chunk_size) {
                return Err(status::INVALID_CHUNK_SIZE);
            }
            out.pack_chunk_size = chunk_size;
            Ok(())
        });
        self.status("set_output_pack_chunk_size", result)
    }

    // ---- images ----

    fn add_empty_image(&self, wim: RawWim, name: &str) -> Result<i32, i32> {
        let index = self.wim(wim).and_then(|state| {
            let mut s = lock(&state);
            if s.name_in_use(name, None) {
                return Err(status::IMAGE_NAME_COLLISION);
            }
            s.images.push(ImageRecord {
                name: name.to_string(),
                created: now(),
                ..ImageRecord::default()
            });
            Ok(s.images.len() as i32)
        });
        self.outcome("add_empty_image", index)
    }

    fn add_image(
        &self,
        wim: RawWim,
        source: &Path,
        name: &str,
        add_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let result = self.add_image_inner(wim, source, name, AddFlags::from_bits(add_flags), progress);
        self.status("add_image", result)
    }

    fn delete_image(&self, wim: RawWim, image: i32) -> i32 {
        let result = self.delete_image_inner(wim, image);
        self.status("delete_image", result)
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
        let result = self.export_inner(
            src_wim,
            src_image,
            dest_wim,
            dest_name,
            dest_description,
            ExportFlags::from_bits(export_flags),
        );
        self.status("export_image", result)
    }

    fn extract_image(
        &self,
        wim: RawWim,
        image: i32,
        target: &Path,
        extract_flags: u32,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> i32 {
        let result = self.extract_inner(wim, image, target, ExtractFlags::from_bits(extract_flags), progress);
        self.status("extract_image", result)
    }

    fn image_property(&self, wim: RawWim, image: i32, name: &str) -> Option<String> {
        let state = self.wim(wim).ok()?;
        let s = lock(&state);
        let record = &s.images[image_index(&s, image).ok()?];
        match name {
            "NAME" => (!record.name.is_empty()).then(|| record.name.clone()),
            "DESCRIPTION" => record.description.clone(),
            _ => record.properties.get(name).cloned(),
        }
    }

    fn set_image_property(&self, wim: RawWim, image: i32, name: &str, value: &str) -> i32 {
        let result = self.set_property_inner(wim, image, name, value);
        self.status("set_image_property", result)
    }

    // ---- codecs ----

    fn create_compressor(
        &self,
        compression_type: i32,
        max_block_size: usize,
        level: u32,
    ) -> Result<RawCompressor, i32> {
        let session = self.outcome(
            "create_compressor",
            self.codec_session(compression_type, max_block_size, level),
        )?;
        let id = self.next_id();
        lock(&self.tables).compressors.insert(id, session);
        Ok(RawCompressor(id))
    }

    fn compress(&self, compressor: RawCompressor, input: &[u8], output: &mut [u8]) -> usize {
        let Some(session) = lock(&self.tables).compressors.get(&compressor.0).copied() else {
            return 0;
        };
        if input.len() > session.max_block_size {
            return 0;
        }
        codec::compress_block(session.compression_type, session.level, input, output)
    }

    fn free_compressor(&self, compressor: RawCompressor) {
        lock(&self.tables).compressors.remove(&compressor.0);
    }

    fn create_decompressor(
        &self,
        compression_type: i32,
        max_block_size: usize,
    ) -> Result<RawDecompressor, i32> {
        let session = self.outcome(
            "create_decompressor",
            self.codec_session(compression_type, max_block_size, codec::DEFAULT_LEVEL),
        )?;
        let id = self.next_id();
        lock(&self.tables).decompressors.insert(id, session);
        Ok(RawDecompressor(id))
    }

    fn decompress(&self, decompressor: RawDecompressor, input: &[u8], output: &mut [u8]) -> i32 {
        let Some(session) = lock(&self.tables).decompressors.get(&decompressor.0).copied() else {
            return status::INVALID_PARAM;
        };
        if output.len() > session.max_block_size {
            return status::INVALID_PARAM;
        }
        code_of(codec::decompress_block(session.compression_type, input, output))
    }

    fn free_decompressor(&self, decompressor: RawDecompressor) {
        lock(&self.tables).decompressors.remove(&decompressor.0);
    }

    fn compressor_needed_memory(&self, compression_type: i32, max_block_size: usize, level: u32) -> u64 {
        let level = if level == 0 { self.default_level(compression_type) } else { level };
        codec::needed_memory(compression_type, max_block_size, level)
    }

    fn set_default_compression_level(&self, compression_type: i32, level: u32) -> i32 {
        let mut settings = lock(&self.settings);
        if compression_type == -1 {
            settings.default_levels = [level; 4];
            return status::SUCCESS;
        }
        match usize::try_from(compression_type)
            .ok()
            .and_then(|i| settings.default_levels.get_mut(i))
        {
            Some(slot) => {
                *slot = level;
                status::SUCCESS
            }
            None => status::INVALID_COMPRESSION_TYPE,
        }
    }

    fn compression_type_string(&self, compression_type: i32) -> &'static str {
        codec::type_name(compression_type)
    }
}

impl std::fmt::Debug for PortableEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = lock(&self.tables);
        f.debug_struct("PortableEngine")
            .field("wims", &tables.wims.len())
            .field("compressors", &tables.compressors.len())
            .field("decompressors", &tables.decompressors.len())
            .finish()
    }
}
