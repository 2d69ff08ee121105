use crate::compression::CompressionType;
use crate::engine::RawWimInfo;
use crate::flags::InfoChanges;

/// Detached snapshot of archive-level metadata.
///
/// Edits made through the setters stay local until the snapshot is handed to
/// [`WimFile::set_info`](crate::WimFile::set_info), which commits only the
/// fields that changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WimInfo {
    raw: RawWimInfo,
    baseline: RawWimInfo,
    origin: usize,
}

impl WimInfo {
    pub(crate) fn from_raw(raw: RawWimInfo, origin: usize) -> Self {
        Self {
            baseline: raw.clone(),
            raw,
            origin,
        }
    }

    pub(crate) fn origin(&self) -> usize {
        self.origin
    }

    pub(crate) fn raw(&self) -> &RawWimInfo {
        &self.raw
    }

    pub fn guid(&self) -> [u8; 16] {
        self.raw.guid
    }

    pub fn guid_hex(&self) -> String {
        hex::encode(self.raw.guid)
    }

    pub fn image_count(&self) -> u32 {
        self.raw.image_count
    }

    /// 1-based index of the bootable image, or 0 when none is marked.
    pub fn boot_index(&self) -> u32 {
        self.raw.boot_index
    }

    pub fn wim_version(&self) -> u32 {
        self.raw.wim_version
    }

    pub fn chunk_size(&self) -> u32 {
        self.raw.chunk_size
    }

    pub fn part_number(&self) -> u16 {
        self.raw.part_number
    }

    pub fn total_parts(&self) -> u16 {
        self.raw.total_parts
    }

    /// `None` when the engine reports a type this crate does not know.
    pub fn compression_type(&self) -> Option<CompressionType> {
        CompressionType::from_raw(self.raw.compression_type)
    }

    pub fn total_bytes(&self) -> u64 {
        self.raw.total_bytes
    }

    pub fn has_integrity_table(&self) -> bool {
        self.raw.has_integrity_table
    }

    pub fn opened_from_file(&self) -> bool {
        self.raw.opened_from_file
    }

    pub fn is_readonly(&self) -> bool {
        self.raw.is_readonly
    }

    pub fn has_rpfix(&self) -> bool {
        self.raw.has_rpfix
    }

    pub fn is_marked_readonly(&self) -> bool {
        self.raw.is_marked_readonly
    }

    pub fn is_spanned(&self) -> bool {
        self.raw.spanned
    }

    pub fn is_pipable(&self) -> bool {
        self.raw.pipable
    }

    pub fn is_metadata_only(&self) -> bool {
        self.raw.metadata_only
    }

    pub fn is_resource_only(&self) -> bool {
        self.raw.resource_only
    }

    pub fn set_guid(&mut self, guid: [u8; 16]) {
        self.raw.guid = guid;
    }

    pub fn set_boot_index(&mut self, index: u32) {
        self.raw.boot_index = index;
    }

    pub fn set_marked_readonly(&mut self, readonly: bool) {
        self.raw.is_marked_readonly = readonly;
    }

    pub fn set_rpfix(&mut self, rpfix: bool) {
        self.raw.has_rpfix = rpfix;
    }

    /// Header fields edited since the snapshot was taken.
    pub fn changes(&self) -> InfoChanges {
        let mut which = InfoChanges::NONE;
        if self.raw.guid != self.baseline.guid {
            which |= InfoChanges::GUID;
        }
        if self.raw.boot_index != self.baseline.boot_index {
            which |= InfoChanges::BOOT_INDEX;
        }
        if self.raw.is_marked_readonly != self.baseline.is_marked_readonly {
            which |= InfoChanges::READONLY_FLAG;
        }
        if self.raw.has_rpfix != self.baseline.has_rpfix {
            which |= InfoChanges::RPFIX_FLAG;
        }
        which
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_edited_fields_are_reported() {
        let mut info = WimInfo::from_raw(
            RawWimInfo {
                image_count: 2,
                boot_index: 1,
                ..RawWimInfo::default()
            },
            7,
        );
        assert_eq!(info.changes(), InfoChanges::NONE);
        info.set_boot_index(2);
        info.set_rpfix(true);
        assert_eq!(info.changes(), InfoChanges::BOOT_INDEX | InfoChanges::RPFIX_FLAG);
        info.set_boot_index(1);
        assert_eq!(info.changes(), InfoChanges::RPFIX_FLAG);
    }
}
