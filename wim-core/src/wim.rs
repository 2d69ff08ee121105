//! Archive handles.

use std::cell::Cell;
use std::io::Write;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(unix)]
use std::os::fd::BorrowedFd;

use tracing::debug;

use crate::compression::CompressionType;
use crate::engine::{Engine, ProgressSink, RawWim, engine_id};
use crate::error::{ErrorChannel, ErrorKind, Result, WimError, status};
use crate::flags::{AddFlags, ExportFlags, ExtractFlags, IterateFlags, OpenFlags, RefFlags, VerifyFlags, WriteFlags};
use crate::global::library;
use crate::image::{ImageSelector, Images, TemplateImage};
use crate::info::WimInfo;
use crate::progress::ProgressContext;
use crate::resource::{ResourceEntry, ResourceRef, partition};

/// One live engine session. Freed exactly once, when the last owner lets go.
pub(crate) struct Session {
    engine: Arc<dyn Engine>,
    raw: RawWim,
    // sessions this one reads resources from; freed after this one
    retained: Mutex<Vec<Arc<Session>>>,
}

impl Session {
    pub(crate) fn new(engine: Arc<dyn Engine>, raw: RawWim) -> Arc<Self> {
        Arc::new(Self {
            engine,
            raw,
            retained: Mutex::new(Vec::new()),
        })
    }

    fn retain(&self, others: impl IntoIterator<Item = Arc<Session>>) {
        let mut retained = self
            .retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for other in others {
            if !retained.iter().any(|held| Arc::ptr_eq(held, &other)) {
                retained.push(other);
            }
        }
    }

    fn errors(&self) -> ErrorChannel<'_> {
        ErrorChannel::new(self.engine.as_ref())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(wim = self.raw.0, engine = self.engine.name(), "freeing archive session");
        self.engine.free(self.raw);
    }
}

/// Where a handle without a backing file writes its new archive.
#[derive(Clone, Copy, Debug)]
pub enum Destination<'a> {
    Path(&'a Path),
    #[cfg(unix)]
    Fd(BorrowedFd<'a>),
}

impl<'a> From<&'a Path> for Destination<'a> {
    fn from(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<&'a PathBuf> for Destination<'a> {
    fn from(path: &'a PathBuf) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<&'a str> for Destination<'a> {
    fn from(path: &'a str) -> Self {
        Self::Path(Path::new(path))
    }
}

#[cfg(unix)]
impl<'a> From<BorrowedFd<'a>> for Destination<'a> {
    fn from(fd: BorrowedFd<'a>) -> Self {
        Self::Fd(fd)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOptions {
    pub image: ImageSelector,
    pub flags: WriteFlags,
    /// Compression worker threads. Affects speed only, never the output.
    pub threads: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            image: ImageSelector::All,
            flags: WriteFlags::NONE,
            threads: 4,
        }
    }
}

/// An open or newly created archive.
///
/// The handle owns its engine session and frees it on [`WimFile::release`]
/// or drop, whichever comes first. Archives that this one borrows resources
/// from stay alive until this one is gone.
pub struct WimFile {
    session: Option<Arc<Session>>,
    path: Option<PathBuf>,
    has_backing_file: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl WimFile {
    /// Opens an existing archive through the global library.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        library().open(path.as_ref(), flags)
    }

    pub fn open_with_progress<C: ?Sized>(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<Self> {
        library().open_with_progress(path.as_ref(), flags, progress)
    }

    /// Creates an empty in-memory archive through the global library.
    pub fn create(compression_type: CompressionType) -> Result<Self> {
        library().create(compression_type)
    }

    pub(crate) fn from_session(session: Arc<Session>, path: Option<PathBuf>) -> Self {
        Self {
            has_backing_file: path.is_some(),
            session: Some(session),
            path,
            _not_sync: PhantomData,
        }
    }

    /// File this handle was opened from; `None` for in-memory archives.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_backing_file(&self) -> bool {
        self.has_backing_file
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// Gives up this handle's session. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(wim = session.raw.0, path = ?self.path, "releasing archive handle");
        }
    }

    fn session(&self) -> Result<&Arc<Session>> {
        self.session.as_ref().ok_or_else(|| WimError::Archive {
            code: status::INVALID_PARAM,
            message: "archive handle has been released".to_string(),
        })
    }

    // ---- writing ----

    /// Writes the archive.
    ///
    /// A handle opened from a file is overwritten in place and
    /// `destination` is ignored. Otherwise a new archive is written to
    /// `destination`, which must be given.
    pub fn write<'d>(
        &self,
        destination: Option<Destination<'d>>,
        options: WriteOptions,
    ) -> Result<()> {
        self.write_inner(destination, options, None)
    }

    pub fn write_with_progress<'d, C: ?Sized>(
        &self,
        destination: Option<Destination<'d>>,
        options: WriteOptions,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<()> {
        progress.run(|sink| self.write_inner(destination, options, Some(sink)))
    }

    /// Shorthand for writing every image to `path` with default options.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        self.write(Some(Destination::Path(path.as_ref())), WriteOptions::default())
    }

    fn write_inner(
        &self,
        destination: Option<Destination<'_>>,
        options: WriteOptions,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<()> {
        let session = self.session()?;
        let engine = session.engine.as_ref();
        let flags = options.flags.bits();
        let threads = options.threads;
        let code = if self.has_backing_file {
            debug!(path = ?self.path, threads, "overwriting archive");
            engine.overwrite(session.raw, flags, threads, progress)
        } else {
            let image = options.image.resolve(self)?;
            match destination {
                Some(Destination::Path(path)) if !path.as_os_str().is_empty() => {
                    debug!(path = %path.display(), image, threads, "writing archive");
                    engine.write(session.raw, path, image, flags, threads, progress)
                }
                #[cfg(unix)]
                Some(Destination::Fd(fd)) => {
                    debug!(?fd, image, threads, "writing archive to descriptor");
                    engine.write_to_fd(session.raw, fd, image, flags, threads, progress)
                }
                _ => {
                    return Err(WimError::configuration(
                        "archive has no backing file and no destination was given",
                    ));
                }
            }
        };
        session.errors().check(ErrorKind::Archive, code)
    }

    // ---- references ----

    /// Lets later writes and exports pull resources from other archives
    /// instead of copying them in.
    pub fn reference_resources(
        &self,
        resources: &[ResourceRef<'_>],
        ref_flags: RefFlags,
        open_flags: OpenFlags,
    ) -> Result<()> {
        let session = self.session()?;
        let parts = partition(resources);

        if !parts.files.is_empty() {
            if parts.files.iter().any(|path| path.as_os_str().is_empty()) {
                return Err(WimError::ResourceResolution {
                    code: status::INVALID_PARAM,
                    message: "empty path in resource references".to_string(),
                });
            }
            debug!(count = parts.files.len(), "referencing resource files");
            let code = session.engine.reference_resource_files(
                session.raw,
                &parts.files,
                ref_flags.bits(),
                open_flags.bits(),
            );
            session
                .errors()
                .check(ErrorKind::ResourceResolution, code)?;
        }

        if !parts.archives.is_empty() {
            let mut sessions = Vec::with_capacity(parts.archives.len());
            for wim in parts.archives {
                let other = wim.session().map_err(|_| WimError::ResourceResolution {
                    code: status::INVALID_PARAM,
                    message: "referenced archive has been released".to_string(),
                })?;
                if Arc::ptr_eq(other, session) {
                    return Err(WimError::ResourceResolution {
                        code: status::INVALID_PARAM,
                        message: "an archive cannot reference its own resources".to_string(),
                    });
                }
                if engine_id(&other.engine) != engine_id(&session.engine) {
                    return Err(WimError::ResourceResolution {
                        code: status::INVALID_PARAM,
                        message: "referenced archive belongs to a different engine".to_string(),
                    });
                }
                sessions.push(Arc::clone(other));
            }
            let raws: Vec<RawWim> = sessions.iter().map(|s| s.raw).collect();
            debug!(count = raws.len(), "referencing open archives");
            let code = session
                .engine
                .reference_resources(session.raw, &raws, ref_flags.bits());
            session
                .errors()
                .check(ErrorKind::ResourceResolution, code)?;
            session.retain(sessions);
        }
        Ok(())
    }

    /// Declares that the image at `new_index` is mostly identical to
    /// `template`, so unchanged files can reuse the template's resources.
    pub fn reference_template<'t>(
        &self,
        new_index: i32,
        template: impl Into<TemplateImage<'t>>,
        flags: u32,
    ) -> Result<()> {
        let session = self.session()?;
        let (template_index, owner) = match template.into() {
            TemplateImage::Image(image) => (image.index() as i32, image.wim()),
            TemplateImage::Index { index, wim } => (index, wim.unwrap_or(self)),
        };
        let invalid = |what: String| WimError::configuration(what);

        let own_count = self.image_count()?;
        if new_index <= 0 || new_index as u32 > own_count {
            return Err(invalid(format!(
                "new image index {new_index} does not name an image (archive holds {own_count})"
            )));
        }
        let owner_session = owner
            .session()
            .map_err(|_| invalid("template archive has been released".to_string()))?;
        if engine_id(&owner_session.engine) != engine_id(&session.engine) {
            return Err(invalid(
                "template archive belongs to a different engine".to_string(),
            ));
        }
        let template_count = owner.image_count()?;
        if template_index <= 0 || template_index as u32 > template_count {
            return Err(invalid(format!(
                "template image {template_index} does not name an image (archive holds {template_count})"
            )));
        }

        let code = session.engine.reference_template_image(
            session.raw,
            new_index,
            owner_session.raw,
            template_index,
            flags,
        );
        session.errors().check(ErrorKind::Configuration, code)?;
        if !Arc::ptr_eq(owner_session, session) {
            session.retain([Arc::clone(owner_session)]);
        }
        Ok(())
    }

    // ---- metadata ----

    /// Detached snapshot of the archive header.
    pub fn info(&self) -> Result<WimInfo> {
        let session = self.session()?;
        let raw = session
            .engine
            .get_info(session.raw)
            .map_err(|code| session.errors().error(ErrorKind::Archive, code))?;
        Ok(WimInfo::from_raw(raw, engine_id(&session.engine)))
    }

    /// Commits the fields edited on `info`.
    ///
    /// The snapshot must come from an archive served by the same engine.
    pub fn set_info(&self, info: &WimInfo) -> Result<()> {
        let session = self.session()?;
        if info.origin() != engine_id(&session.engine) {
            return Err(WimError::TypeMismatch {
                expected: "WimInfo snapshot taken from this engine",
                found: "WimInfo snapshot taken from another engine".to_string(),
            });
        }
        let which = info.changes();
        if which.bits() == 0 {
            return Ok(());
        }
        let code = session
            .engine
            .set_info(session.raw, info.raw(), which.bits());
        session.errors().check(ErrorKind::Archive, code)
    }

    pub(crate) fn image_count(&self) -> Result<u32> {
        Ok(self.info()?.image_count())
    }

    /// The archive's XML metadata, exactly as the engine stores it.
    pub fn xml_data(&self) -> Result<Box<[u8]>> {
        let session = self.session()?;
        session
            .engine
            .get_xml_data(session.raw)
            .map(Vec::into_boxed_slice)
            .map_err(|code| session.errors().error(ErrorKind::Archive, code))
    }

    pub fn extract_xml_data(&self, mut writer: impl Write) -> Result<()> {
        let xml = self.xml_data()?;
        writer.write_all(&xml)?;
        writer.flush()?;
        Ok(())
    }

    // ---- checks ----

    pub fn verify(&self, flags: VerifyFlags) -> Result<()> {
        self.verify_inner(flags, None)
    }

    pub fn verify_with_progress<C: ?Sized>(
        &self,
        flags: VerifyFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<()> {
        progress.run(|sink| self.verify_inner(flags, Some(sink)))
    }

    fn verify_inner(&self, flags: VerifyFlags, progress: Option<&mut ProgressSink<'_>>) -> Result<()> {
        let session = self.session()?;
        let code = session.engine.verify(session.raw, flags.bits(), progress);
        session.errors().check(ErrorKind::Integrity, code)
    }

    // ---- split ----

    /// Writes the archive as a set of parts no larger than `part_size`
    /// bytes each (a single resource may exceed it).
    ///
    /// Parts already written stay on disk when a later part fails.
    pub fn split(&self, swm_name: &Path, part_size: u64, flags: WriteFlags) -> Result<()> {
        self.split_inner(swm_name, part_size, flags, None)
    }

    pub fn split_with_progress<C: ?Sized>(
        &self,
        swm_name: &Path,
        part_size: u64,
        flags: WriteFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<()> {
        progress.run(|sink| self.split_inner(swm_name, part_size, flags, Some(sink)))
    }

    fn split_inner(
        &self,
        swm_name: &Path,
        part_size: u64,
        flags: WriteFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<()> {
        let session = self.session()?;
        if part_size == 0 {
            return Err(WimError::configuration("split part size must be positive"));
        }
        if swm_name.as_os_str().is_empty() {
            return Err(WimError::configuration("split needs an output name"));
        }
        debug!(swm = %swm_name.display(), part_size, "splitting archive");
        let code = session
            .engine
            .split(session.raw, swm_name, part_size, flags.bits(), progress);
        session.errors().check(ErrorKind::Archive, code)
    }

    // ---- resource table ----

    /// Calls `visitor` once per resource table entry. Returning
    /// `ControlFlow::Break(code)` with a non-zero `code` stops the walk and
    /// fails it with that status.
    pub fn iterate_resources<F>(&self, flags: IterateFlags, mut visitor: F) -> Result<()>
    where
        F: FnMut(&ResourceEntry) -> ControlFlow<i32>,
    {
        let session = self.session()?;
        let mut sink = |entry: &ResourceEntry| match visitor(entry) {
            ControlFlow::Continue(()) => status::SUCCESS,
            ControlFlow::Break(code) => code,
        };
        let code = session
            .engine
            .iterate_lookup_table(session.raw, flags.bits(), &mut sink);
        session.errors().check(ErrorKind::Archive, code)
    }

    // ---- output settings ----

    pub fn set_output_compression_type(&self, compression_type: CompressionType) -> Result<()> {
        let session = self.session()?;
        let code = session
            .engine
            .set_output_compression_type(session.raw, compression_type.as_raw());
        session.errors().check(ErrorKind::Configuration, code)
    }

    pub fn set_output_chunk_size(&self, chunk_size: u32) -> Result<()> {
        let session = self.session()?;
        let code = session.engine.set_output_chunk_size(session.raw, chunk_size);
        session.errors().check(ErrorKind::Configuration, code)
    }

    pub fn set_output_pack_compression_type(&self, compression_type: CompressionType) -> Result<()> {
        let session = self.session()?;
        let code = session
            .engine
            .set_output_pack_compression_type(session.raw, compression_type.as_raw());
        session.errors().check(ErrorKind::Configuration, code)
    }

    pub fn set_output_pack_chunk_size(&self, chunk_size: u32) -> Result<()> {
        let session = self.session()?;
        let code = session
            .engine
            .set_output_pack_chunk_size(session.raw, chunk_size);
        session.errors().check(ErrorKind::Configuration, code)
    }

    // ---- images ----

    pub fn images(&self) -> Images<'_> {
        Images::new(self)
    }

    /// Appends an image with no files and returns its index.
    pub fn add_empty_image(&self, name: &str) -> Result<u32> {
        let session = self.session()?;
        let index = session
            .engine
            .add_empty_image(session.raw, name)
            .map_err(|code| session.errors().error(ErrorKind::Archive, code))?;
        debug!(index, name, "added empty image");
        Ok(index as u32)
    }

    /// Captures the tree under `source` as a new image and returns its index.
    pub fn add_image(&self, source: &Path, name: &str, flags: AddFlags) -> Result<u32> {
        self.add_image_inner(source, name, flags, None)
    }

    pub fn add_image_with_progress<C: ?Sized>(
        &self,
        source: &Path,
        name: &str,
        flags: AddFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<u32> {
        progress.run(|sink| self.add_image_inner(source, name, flags, Some(sink)))
    }

    fn add_image_inner(
        &self,
        source: &Path,
        name: &str,
        flags: AddFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<u32> {
        let session = self.session()?;
        debug!(source = %source.display(), name, "capturing image");
        let code = session
            .engine
            .add_image(session.raw, source, name, flags.bits(), progress);
        session.errors().check(ErrorKind::Archive, code)?;
        self.image_count()
    }

    pub fn delete_image(&self, image: ImageSelector) -> Result<()> {
        let raw_image = image.resolve(self)?;
        let session = self.session()?;
        let code = session.engine.delete_image(session.raw, raw_image);
        session.errors().check(ErrorKind::Archive, code)
    }

    /// Copies images into `dest`. Resources are shared, not copied, so this
    /// archive stays alive as long as `dest` does.
    pub fn export_image(
        &self,
        image: ImageSelector,
        dest: &WimFile,
        name: Option<&str>,
        description: Option<&str>,
        flags: ExportFlags,
    ) -> Result<()> {
        let session = self.session()?;
        let dest_session = dest.session()?;
        if engine_id(&dest_session.engine) != engine_id(&session.engine) {
            return Err(WimError::configuration(
                "export destination belongs to a different engine",
            ));
        }
        let raw_image = image.resolve(self)?;
        let code = session.engine.export_image(
            session.raw,
            raw_image,
            dest_session.raw,
            name,
            description,
            flags.bits(),
        );
        session.errors().check(ErrorKind::Archive, code)?;
        dest_session.retain([Arc::clone(session)]);
        Ok(())
    }

    pub fn extract_image(&self, image: ImageSelector, target: &Path, flags: ExtractFlags) -> Result<()> {
        self.extract_image_inner(image, target, flags, None)
    }

    pub fn extract_image_with_progress<C: ?Sized>(
        &self,
        image: ImageSelector,
        target: &Path,
        flags: ExtractFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<()> {
        progress.run(|sink| self.extract_image_inner(image, target, flags, Some(sink)))
    }

    fn extract_image_inner(
        &self,
        image: ImageSelector,
        target: &Path,
        flags: ExtractFlags,
        progress: Option<&mut ProgressSink<'_>>,
    ) -> Result<()> {
        let raw_image = image.resolve(self)?;
        let session = self.session()?;
        debug!(image = raw_image, target = %target.display(), "extracting");
        let code = session.engine.extract_image(
            session.raw,
            raw_image,
            target,
            flags.bits(),
            progress,
        );
        session.errors().check(ErrorKind::Archive, code)
    }

    pub(crate) fn image_property(&self, index: u32, name: &str) -> Result<Option<String>> {
        let session = self.session()?;
        Ok(session
            .engine
            .image_property(session.raw, index as i32, name))
    }

    pub(crate) fn set_image_property(&self, index: u32, name: &str, value: &str) -> Result<()> {
        let session = self.session()?;
        let code = session
            .engine
            .set_image_property(session.raw, index as i32, name, value);
        session.errors().check(ErrorKind::Archive, code)
    }
}

impl std::fmt::Debug for WimFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WimFile")
            .field("session", &self.session.as_ref().map(|s| s.raw))
            .field("path", &self.path)
            .field("has_backing_file", &self.has_backing_file)
            .finish()
    }
}
