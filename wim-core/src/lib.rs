#![deny(unsafe_code)]

pub mod compression;
pub mod engine;
pub mod error;
pub mod flags;
pub mod global;
pub mod image;
pub mod info;
pub mod progress;
pub mod resource;
pub mod wim;

// Re-exports: stable API surface
pub use compression::{CompressedBlock, CompressionType, Compressor, Decompressor};
pub use engine::{Engine, PortableEngine};
pub use error::{Result, WimError, status_to_message};
pub use flags::{
    AddFlags, ExportFlags, ExtractFlags, InfoChanges, InitFlags, IterateFlags, OpenFlags, RefFlags,
    VerifyFlags, WriteFlags,
};
pub use global::{Library, Version, initialize, library, shutdown, version};
pub use image::{ALL_IMAGES, Image, ImageSelector, Images, NO_IMAGE, TemplateImage};
pub use info::WimInfo;
pub use progress::{ProgressContext, ProgressHandler, ProgressInfo, ProgressMsg, ProgressStatus};
pub use resource::{ResourceEntry, ResourceHash, ResourceRef};
pub use wim::{Destination, WimFile, WriteOptions};
