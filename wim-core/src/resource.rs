use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::wim::WimFile;

/// Content hash identifying one deduplicated resource.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHash(pub [u8; 20]);

impl ResourceHash {
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.as_bytes()[..20]);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ResourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ResourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHash({})", self.to_hex())
    }
}

/// One row of an archive's resource table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceEntry {
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub offset: u64,
    pub hash: ResourceHash,
    pub part_number: u32,
    pub reference_count: u32,
    pub is_compressed: bool,
    pub is_metadata: bool,
    pub is_free: bool,
    pub is_spanned: bool,
    /// Referenced by an image but not available in this archive or any
    /// archive it references.
    pub is_missing: bool,
    pub packed: bool,
    pub raw_resource_offset: u64,
    pub raw_resource_compressed_size: u64,
    pub raw_resource_uncompressed_size: u64,
}

/// An external source of resources for a write or export.
pub enum ResourceRef<'a> {
    /// An archive file on disk (a glob pattern when `RefFlags::GLOB_ENABLE`
    /// is set).
    File(Cow<'a, Path>),
    /// An archive that is already open.
    Archive(&'a WimFile),
}

impl<'a> From<&'a WimFile> for ResourceRef<'a> {
    fn from(wim: &'a WimFile) -> Self {
        Self::Archive(wim)
    }
}

impl<'a> From<&'a Path> for ResourceRef<'a> {
    fn from(path: &'a Path) -> Self {
        Self::File(Cow::Borrowed(path))
    }
}

impl From<PathBuf> for ResourceRef<'_> {
    fn from(path: PathBuf) -> Self {
        Self::File(Cow::Owned(path))
    }
}

impl<'a> From<&'a str> for ResourceRef<'a> {
    fn from(path: &'a str) -> Self {
        Self::File(Cow::Borrowed(Path::new(path)))
    }
}

/// References split by kind, in the order given.
pub(crate) struct PartitionedRefs<'r> {
    pub files: Vec<&'r Path>,
    pub archives: Vec<&'r WimFile>,
}

pub(crate) fn partition<'r>(resources: &'r [ResourceRef<'_>]) -> PartitionedRefs<'r> {
    let mut files = Vec::new();
    let mut archives = Vec::new();
    for resource in resources {
        match resource {
            ResourceRef::File(path) => files.push(path.as_ref()),
            ResourceRef::Archive(wim) => archives.push(*wim),
        }
    }
    PartitionedRefs { files, archives }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex_rendered() {
        let a = ResourceHash::of(b"payload");
        let b = ResourceHash::of(b"payload");
        assert_eq!(a, b);
        assert_ne!(a, ResourceHash::of(b"other"));
        assert_eq!(a.to_hex().len(), 40);
        assert_eq!(a.to_string(), a.to_hex());
    }

    #[test]
    fn partition_keeps_file_order() {
        let refs = vec![
            ResourceRef::from("base.wim"),
            ResourceRef::from(PathBuf::from("part2.swm")),
        ];
        let parts = partition(&refs);
        assert!(parts.archives.is_empty());
        assert_eq!(
            parts.files,
            vec![Path::new("base.wim"), Path::new("part2.swm")]
        );
    }
}
