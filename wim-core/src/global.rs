//! Process-wide engine state.
//!
//! The engine needs one global initialization before first use and allows
//! one cleanup at the end. [`Library`] tracks that lifecycle: `init` may be
//! called any number of times, `cleanup` runs the engine cleanup at most
//! once, and nothing can be opened afterwards.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::compression::{self, CompressionType, Compressor, Decompressor};
use crate::engine::{Engine, PortableEngine};
use crate::error::{ErrorChannel, ErrorKind, Result, WimError, status};
use crate::flags::{InitFlags, OpenFlags};
use crate::progress::ProgressContext;
use crate::wim::{Session, WimFile};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    ShutDown,
}

/// Engine version as `(major, minor, patch)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Decodes the packed form: major in bits 20 and up, minor in bits
    /// 10-19, patch in bits 0-9.
    pub const fn from_packed(packed: u32) -> Self {
        Self {
            major: packed >> 20,
            minor: (packed >> 10) & 0x3ff,
            patch: packed & 0x3ff,
        }
    }

    pub const fn packed(self) -> u32 {
        (self.major << 20) | ((self.minor & 0x3ff) << 10) | (self.patch & 0x3ff)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// An engine plus its global lifecycle.
pub struct Library {
    engine: Arc<dyn Engine>,
    lifecycle: Mutex<Lifecycle>,
}

fn default_engine() -> Arc<dyn Engine> {
    #[cfg(all(feature = "native", unix))]
    {
        Arc::new(crate::engine::NativeEngine::new())
    }
    #[cfg(not(all(feature = "native", unix)))]
    {
        Arc::new(PortableEngine::new())
    }
}

/// The process-wide library used by the free functions and the
/// `WimFile`/`Compressor` constructors.
pub fn library() -> &'static Library {
    static LIBRARY: OnceLock<Library> = OnceLock::new();
    LIBRARY.get_or_init(|| Library::with_engine(default_engine()))
}

impl Library {
    /// A library of its own around `engine`, independent of [`library()`].
    pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    /// A library around a fresh portable engine.
    pub fn portable() -> Self {
        Self::with_engine(Arc::new(PortableEngine::new()))
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn errors(&self) -> ErrorChannel<'_> {
        ErrorChannel::new(self.engine.as_ref())
    }

    /// Runs the engine's global initialization once; later calls are no-ops.
    pub fn init(&self, flags: InitFlags) -> Result<()> {
        let mut state = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            Lifecycle::Ready => Ok(()),
            Lifecycle::ShutDown => Err(WimError::configuration(
                "the engine has been cleaned up and cannot be initialized again",
            )),
            Lifecycle::Uninitialized => {
                let code = self.engine.global_init(flags.bits());
                self.errors().check(ErrorKind::Archive, code)?;
                debug!(engine = self.engine.name(), "engine initialized");
                *state = Lifecycle::Ready;
                Ok(())
            }
        }
    }

    /// Runs the engine's global cleanup. Only the first call does anything.
    pub fn cleanup(&self) {
        let mut state = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            Lifecycle::Ready => {
                self.engine.global_cleanup();
                debug!(engine = self.engine.name(), "engine cleaned up");
            }
            Lifecycle::Uninitialized => debug!("cleanup before init; nothing to release"),
            Lifecycle::ShutDown => return,
        }
        *state = Lifecycle::ShutDown;
    }

    pub fn is_initialized(&self) -> bool {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) == Lifecycle::Ready
    }

    fn ensure_ready(&self) -> Result<()> {
        self.init(InitFlags::NONE)
    }

    pub fn version(&self) -> Version {
        Version::from_packed(self.engine.version())
    }

    pub fn set_print_errors(&self, show: bool) -> Result<()> {
        let code = self.engine.set_print_errors(show);
        self.errors().check(ErrorKind::Configuration, code)
    }

    /// Sends engine error messages to the named file; `None` restores the
    /// default.
    pub fn set_error_file_by_name(&self, path: Option<&Path>) -> Result<()> {
        let code = self.engine.set_error_file_by_name(path);
        self.errors().check(ErrorKind::Configuration, code)
    }

    pub fn set_error_file_handle(&self, _file: &File) -> Result<()> {
        warn!("error redirection to an open file handle was requested");
        Err(WimError::NotSupported(
            "redirecting engine errors to an open file handle",
        ))
    }

    // ---- archives ----

    pub fn open(&self, path: &Path, flags: OpenFlags) -> Result<WimFile> {
        self.open_inner(path, flags, None)
    }

    pub fn open_with_progress<C: ?Sized>(
        &self,
        path: &Path,
        flags: OpenFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<WimFile> {
        progress.run(|sink| self.open_inner(path, flags, Some(sink)))
    }

    fn open_inner(
        &self,
        path: &Path,
        flags: OpenFlags,
        progress: Option<&mut crate::engine::ProgressSink<'_>>,
    ) -> Result<WimFile> {
        self.ensure_ready()?;
        let raw = self
            .engine
            .open(path, flags.bits(), progress)
            .map_err(|code| self.errors().error(ErrorKind::Archive, code))?;
        debug!(path = %path.display(), wim = raw.0, "opened archive");
        Ok(WimFile::from_session(
            Session::new(Arc::clone(&self.engine), raw),
            Some(path.to_path_buf()),
        ))
    }

    pub fn create(&self, compression_type: CompressionType) -> Result<WimFile> {
        self.ensure_ready()?;
        let raw = self
            .engine
            .create_new(compression_type.as_raw())
            .map_err(|code| self.errors().error(ErrorKind::Archive, code))?;
        debug!(ctype = ?compression_type, wim = raw.0, "created archive");
        Ok(WimFile::from_session(
            Session::new(Arc::clone(&self.engine), raw),
            None,
        ))
    }

    // ---- codecs ----

    pub fn compressor(
        &self,
        compression_type: CompressionType,
        block_size: usize,
        level: u32,
    ) -> Result<Compressor> {
        let mut compressor = self.deferred_compressor(compression_type, block_size, level)?;
        compressor.create()?;
        Ok(compressor)
    }

    pub fn deferred_compressor(
        &self,
        compression_type: CompressionType,
        block_size: usize,
        level: u32,
    ) -> Result<Compressor> {
        self.ensure_ready()?;
        Ok(Compressor::with_engine(
            Arc::clone(&self.engine),
            compression_type,
            block_size,
            level,
        ))
    }

    pub fn decompressor(
        &self,
        compression_type: CompressionType,
        block_size: usize,
    ) -> Result<Decompressor> {
        let mut decompressor = self.deferred_decompressor(compression_type, block_size)?;
        decompressor.create()?;
        Ok(decompressor)
    }

    pub fn deferred_decompressor(
        &self,
        compression_type: CompressionType,
        block_size: usize,
    ) -> Result<Decompressor> {
        self.ensure_ready()?;
        Ok(Decompressor::with_engine(
            Arc::clone(&self.engine),
            compression_type,
            block_size,
        ))
    }

    pub fn needed_memory(
        &self,
        compression_type: CompressionType,
        block_size: usize,
        level: u32,
    ) -> Result<u64> {
        compression::needed_memory_with(self.engine.as_ref(), compression_type, block_size, level)
    }

    /// Level used by compressors created with level 0; `None` sets it for
    /// every type.
    pub fn set_default_compression_level(
        &self,
        compression_type: Option<CompressionType>,
        level: u32,
    ) -> Result<()> {
        let raw = compression_type.map_or(-1, CompressionType::as_raw);
        let code = self.engine.set_default_compression_level(raw, level);
        self.errors().check(ErrorKind::Configuration, code)
    }

    pub fn compression_type_name(&self, compression_type: CompressionType) -> &'static str {
        self.engine.compression_type_string(compression_type.as_raw())
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("engine", &self.engine.name())
            .field("lifecycle", &*self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

/// Initializes the global library. Safe to call repeatedly.
pub fn initialize(flags: InitFlags) -> Result<()> {
    library().init(flags)
}

/// Cleans up the global library. Only the first call has an effect.
pub fn shutdown() {
    library().cleanup();
}

pub fn version() -> Version {
    library().version()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_fields_unpack() {
        let v = Version::from_packed((1 << 20) | (14 << 10) | 4);
        assert_eq!(
            v,
            Version {
                major: 1,
                minor: 14,
                patch: 4
            }
        );
        assert_eq!(v.to_string(), "1.14.4");
        assert_eq!(Version::from_packed(v.packed()), v);
    }

    #[test]
    fn unknown_status_still_has_a_message() {
        let lib = Library::portable();
        let err = lib.errors().error(ErrorKind::Archive, 9999);
        assert_eq!(err.code(), Some(9999));
        assert!(err.to_string().contains(status::describe(9999)));
    }
}
