//! Views over the images stored in an archive.
//!
//! Nothing here is cached: every call asks the owning [`WimFile`] again, so
//! a view kept across `add_image`/`delete_image` sees the current image set.

use std::path::Path;

use crate::error::{Result, WimError};
use crate::flags::ExtractFlags;
use crate::progress::ProgressContext;
use crate::wim::WimFile;

/// Selects every image; accepted only by operations that take an
/// [`ImageSelector`].
pub const ALL_IMAGES: i32 = -1;
/// Selects no image.
pub const NO_IMAGE: i32 = 0;

const NAME: &str = "NAME";
const DESCRIPTION: &str = "DESCRIPTION";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageSelector {
    #[default]
    All,
    /// A 1-based image index.
    Index(u32),
}

impl ImageSelector {
    /// Raw engine id. A concrete index must name an image that exists in
    /// `wim`, so it can never turn into [`ALL_IMAGES`] or [`NO_IMAGE`].
    pub(crate) fn resolve(self, wim: &WimFile) -> Result<i32> {
        let Self::Index(index) = self else {
            return Ok(ALL_IMAGES);
        };
        let count = wim.image_count()?;
        match i32::try_from(index) {
            Ok(raw) if raw > 0 && index <= count => Ok(raw),
            _ => Err(WimError::IndexOutOfRange {
                index: index.into(),
                count,
            }),
        }
    }
}

impl From<u32> for ImageSelector {
    fn from(index: u32) -> Self {
        Self::Index(index)
    }
}

impl From<Image<'_>> for ImageSelector {
    fn from(image: Image<'_>) -> Self {
        Self::Index(image.index())
    }
}

/// Lazily evaluated collection of the images in one archive.
#[derive(Clone, Copy)]
pub struct Images<'w> {
    wim: &'w WimFile,
}

impl<'w> Images<'w> {
    pub(crate) fn new(wim: &'w WimFile) -> Self {
        Self { wim }
    }

    pub fn count(&self) -> Result<u32> {
        self.wim.image_count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Image at a 1-based `index`. The sentinels [`ALL_IMAGES`] and
    /// [`NO_IMAGE`] are never valid here.
    pub fn get(&self, index: i32) -> Result<Image<'w>> {
        let count = self.count()?;
        if index <= 0 || index as u32 > count {
            return Err(WimError::IndexOutOfRange {
                index: index.into(),
                count,
            });
        }
        Ok(Image {
            wim: self.wim,
            index: index as u32,
        })
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Image<'w>> + use<'w>> {
        let wim = self.wim;
        let count = self.count()?;
        Ok((1..=count).map(move |index| Image { wim, index }))
    }
}

/// One image, addressed by its 1-based index in the owning archive.
#[derive(Clone, Copy)]
pub struct Image<'w> {
    wim: &'w WimFile,
    index: u32,
}

impl<'w> Image<'w> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn wim(&self) -> &'w WimFile {
        self.wim
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.property(NAME)
    }

    pub fn description(&self) -> Result<Option<String>> {
        self.property(DESCRIPTION)
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.set_property(NAME, name)
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        self.set_property(DESCRIPTION, description)
    }

    pub fn property(&self, name: &str) -> Result<Option<String>> {
        self.wim.image_property(self.index, name)
    }

    pub fn set_property(&self, name: &str, value: &str) -> Result<()> {
        self.wim.set_image_property(self.index, name, value)
    }

    pub fn extract(&self, target: &Path, flags: ExtractFlags) -> Result<()> {
        self.wim
            .extract_image(ImageSelector::Index(self.index), target, flags)
    }

    pub fn extract_with_progress<C: ?Sized>(
        &self,
        target: &Path,
        flags: ExtractFlags,
        progress: &mut ProgressContext<'_, C>,
    ) -> Result<()> {
        self.wim.extract_image_with_progress(
            ImageSelector::Index(self.index),
            target,
            flags,
            progress,
        )
    }
}

/// The image a new image is declared similar to.
#[derive(Clone, Copy)]
pub enum TemplateImage<'a> {
    /// An image of any open archive.
    Image(Image<'a>),
    /// An index into `wim`, or into the archive receiving the new image when
    /// `wim` is `None`.
    Index { index: i32, wim: Option<&'a WimFile> },
}

impl<'a> From<Image<'a>> for TemplateImage<'a> {
    fn from(image: Image<'a>) -> Self {
        Self::Image(image)
    }
}

impl From<i32> for TemplateImage<'_> {
    fn from(index: i32) -> Self {
        Self::Index { index, wim: None }
    }
}

impl<'a> From<(i32, &'a WimFile)> for TemplateImage<'a> {
    fn from((index, wim): (i32, &'a WimFile)) -> Self {
        Self::Index {
            index,
            wim: Some(wim),
        }
    }
}
