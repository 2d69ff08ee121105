use thiserror::Error;

use crate::engine::Engine;

/// Native status codes shared by every engine. Zero is success.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const ALREADY_LOCKED: i32 = 1;
    pub const DECOMPRESSION: i32 = 2;
    pub const GLOB_HAD_NO_MATCHES: i32 = 8;
    pub const IMAGE_COUNT: i32 = 10;
    pub const IMAGE_NAME_COLLISION: i32 = 11;
    pub const INTEGRITY: i32 = 13;
    pub const INVALID_CHUNK_SIZE: i32 = 15;
    pub const INVALID_COMPRESSION_TYPE: i32 = 16;
    pub const INVALID_HEADER: i32 = 17;
    pub const INVALID_IMAGE: i32 = 18;
    pub const INVALID_INTEGRITY_TABLE: i32 = 19;
    pub const INVALID_LOOKUP_TABLE_ENTRY: i32 = 20;
    pub const INVALID_METADATA_RESOURCE: i32 = 21;
    pub const INVALID_PARAM: i32 = 24;
    pub const INVALID_PART_NUMBER: i32 = 25;
    pub const INVALID_RESOURCE_HASH: i32 = 28;
    pub const IS_SPLIT_WIM: i32 = 33;
    pub const METADATA_NOT_FOUND: i32 = 36;
    pub const MKDIR: i32 = 37;
    pub const NOMEM: i32 = 39;
    pub const NOTDIR: i32 = 40;
    pub const NOT_A_WIM_FILE: i32 = 43;
    pub const NO_FILENAME: i32 = 45;
    pub const OPEN: i32 = 47;
    pub const OPENDIR: i32 = 48;
    pub const PATH_DOES_NOT_EXIST: i32 = 49;
    pub const READ: i32 = 50;
    pub const RENAME: i32 = 52;
    pub const RESOURCE_NOT_FOUND: i32 = 55;
    pub const SPLIT_INVALID: i32 = 62;
    pub const STAT: i32 = 63;
    pub const UNEXPECTED_END_OF_FILE: i32 = 65;
    pub const UNKNOWN_VERSION: i32 = 67;
    pub const UNSUPPORTED: i32 = 68;
    pub const WIM_IS_READONLY: i32 = 71;
    pub const WRITE: i32 = 72;
    pub const XML: i32 = 73;
    pub const ABORTED_BY_PROGRESS: i32 = 76;
    pub const UNKNOWN_PROGRESS_STATUS: i32 = 77;
    pub const DUPLICATE_EXPORTED_IMAGE: i32 = 87;

    /// Built-in description of a status code, used when an engine has no
    /// message table of its own.
    pub fn describe(code: i32) -> &'static str {
        match code {
            SUCCESS => "Success",
            ALREADY_LOCKED => "The WIM is already locked for writing",
            DECOMPRESSION => "The WIM contains invalid compressed data",
            GLOB_HAD_NO_MATCHES => "The provided file glob did not match any files",
            IMAGE_COUNT => "Inconsistent image count among the metadata resources, the WIM header, and/or the XML data",
            IMAGE_NAME_COLLISION => "Tried to add an image with a name that is already in use",
            INTEGRITY => "The WIM failed an integrity check",
            INVALID_CHUNK_SIZE => "The WIM is compressed but does not have a chunk size supported by this engine",
            INVALID_COMPRESSION_TYPE => "The WIM is compressed, but is not marked as having LZX, XPRESS, or LZMS compression",
            INVALID_HEADER => "The WIM header was invalid",
            INVALID_IMAGE => "Tried to select an image that does not exist in the WIM",
            INVALID_INTEGRITY_TABLE => "The WIM's integrity table is invalid",
            INVALID_LOOKUP_TABLE_ENTRY => "An entry in the WIM's lookup table is invalid",
            INVALID_METADATA_RESOURCE => "The metadata resource is invalid",
            INVALID_PARAM => "An invalid parameter was given",
            INVALID_PART_NUMBER => "The part number or total parts of the WIM is invalid",
            INVALID_RESOURCE_HASH => "A resource in the WIM did not match its expected hash",
            IS_SPLIT_WIM => "The WIM is part of a split WIM, which is not supported for this operation",
            METADATA_NOT_FOUND => "The WIM does not contain image metadata; it only contains file data",
            MKDIR => "Failed to create a directory",
            NOMEM => "Ran out of memory",
            NOTDIR => "Expected a directory",
            NOT_A_WIM_FILE => "The file did not begin with the magic characters that identify a WIM file",
            NO_FILENAME => "The WIM is not identified with a filename",
            OPEN => "Failed to open a file",
            OPENDIR => "Failed to open a directory",
            PATH_DOES_NOT_EXIST => "The path does not exist in the WIM image",
            READ => "Could not read data from a file",
            RENAME => "Could not rename a file",
            RESOURCE_NOT_FOUND => "A file resource needed to complete the operation was missing from the WIM",
            SPLIT_INVALID => "The WIM is part of an invalid split WIM",
            STAT => "Could not read the metadata for a file or directory",
            UNEXPECTED_END_OF_FILE => "Unexpectedly reached the end of the file",
            UNKNOWN_VERSION => "The WIM file is marked with an unknown version number",
            UNSUPPORTED => "The requested operation is unsupported",
            WIM_IS_READONLY => "The WIM is read-only (file permissions, header flag, or split WIM)",
            WRITE => "Failed to write data to a file",
            XML => "The XML data of the WIM is invalid",
            ABORTED_BY_PROGRESS => "The operation was aborted by the library user",
            UNKNOWN_PROGRESS_STATUS => "The user-provided progress function returned an unrecognized value",
            DUPLICATE_EXPORTED_IMAGE => "The destination WIM already contains one of the source images",
            _ => "Unknown error",
        }
    }
}

#[derive(Error, Debug)]
pub enum WimError {
    #[error("archive operation failed ({code}): {message}")]
    Archive { code: i32, message: String },

    #[error("compression failed ({code}): {message}")]
    Compression { code: i32, message: String },

    #[error("decompression failed ({code}): {message}")]
    Decompression { code: i32, message: String },

    #[error("invalid configuration ({code}): {message}")]
    Configuration { code: i32, message: String },

    #[error("cannot resolve resource reference ({code}): {message}")]
    ResourceResolution { code: i32, message: String },

    #[error("integrity check failed ({code}): {message}")]
    Integrity { code: i32, message: String },

    #[error("image index {index} out of range (archive holds {count} images)")]
    IndexOutOfRange { index: i64, count: u32 },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WimError {
    /// Native status carried by this error, if it came from an engine call.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Archive { code, .. }
            | Self::Compression { code, .. }
            | Self::Decompression { code, .. }
            | Self::Configuration { code, .. }
            | Self::ResourceResolution { code, .. }
            | Self::Integrity { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            code: status::INVALID_PARAM,
            message: message.into(),
        }
    }
}

/// Which typed error a failing status becomes at a given call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Archive,
    Compression,
    Decompression,
    Configuration,
    ResourceResolution,
    Integrity,
}

/// Resolves the human-readable message for a native status.
///
/// The engine's own table wins; the built-in table covers engines that
/// return nothing for a code.
pub fn status_to_message(engine: &dyn Engine, code: i32) -> String {
    let message = engine.error_string(code);
    if message.trim().is_empty() {
        status::describe(code).to_string()
    } else {
        message
    }
}

/// Turns native statuses into typed errors at the call site.
#[derive(Clone, Copy)]
pub(crate) struct ErrorChannel<'e> {
    engine: &'e dyn Engine,
}

impl<'e> ErrorChannel<'e> {
    pub(crate) fn new(engine: &'e dyn Engine) -> Self {
        Self { engine }
    }

    pub(crate) fn error(&self, kind: ErrorKind, code: i32) -> WimError {
        // resolved now; the engine's error state may change before the caller looks
        let message = status_to_message(self.engine, code);
        match kind {
            ErrorKind::Archive => WimError::Archive { code, message },
            ErrorKind::Compression => WimError::Compression { code, message },
            ErrorKind::Decompression => WimError::Decompression { code, message },
            ErrorKind::Configuration => WimError::Configuration { code, message },
            ErrorKind::ResourceResolution => WimError::ResourceResolution { code, message },
            ErrorKind::Integrity => WimError::Integrity { code, message },
        }
    }

    pub(crate) fn check(&self, kind: ErrorKind, code: i32) -> Result<()> {
        if code == status::SUCCESS {
            Ok(())
        } else {
            Err(self.error(kind, code))
        }
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, WimError>;
