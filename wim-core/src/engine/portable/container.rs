//! On-disk layout of portable archives.
//!
//! ```text
//! [superblock 48B][manifest CBOR][resource table N*64B][resource data][tail 120B]
//! ```
//!
//! Every part of a split set uses the same layout; only the first part
//! carries images in its manifest.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::codec;
use crate::error::status;
use crate::resource::ResourceHash;

pub(crate) const MAGIC: &[u8; 8] = b"PWIM\0\0\x01\0";
pub(crate) const VERSION: u16 = 1;
pub(crate) const HEADER_LEN: u64 = 48;

pub(crate) const FLAG_INTEGRITY: u16 = 0x0001;
pub(crate) const FLAG_READONLY: u16 = 0x0002;
pub(crate) const FLAG_RPFIX: u16 = 0x0004;
pub(crate) const FLAG_SOLID: u16 = 0x0008;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Superblock {
    pub version: u16,
    pub flags: u16,
    pub part_number: u16,
    pub total_parts: u16,
    pub compression_type: i32,
    pub chunk_size: u32,
    /// Byte length of the manifest (CBOR)
    pub manifest_len: u64,
    pub table_count: u64,
    /// Absolute file offset where the resource data starts
    pub data_off: u64,
}

impl Superblock {
    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.part_number.to_le_bytes())?;
        w.write_all(&self.total_parts.to_le_bytes())?;
        w.write_all(&self.compression_type.to_le_bytes())?;
        w.write_all(&self.chunk_size.to_le_bytes())?;
        w.write_all(&self.manifest_len.to_le_bytes())?;
        w.write_all(&self.table_count.to_le_bytes())?;
        w.write_all(&self.data_off.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::ErrorKind::InvalidData.into());
        }
        let mut b2 = [0u8; 2];
        let mut b4 = [0u8; 4];
        let mut b8 = [0u8; 8];
        let mut sb = Superblock::default();
        r.read_exact(&mut b2)?;
        sb.version = u16::from_le_bytes(b2);
        r.read_exact(&mut b2)?;
        sb.flags = u16::from_le_bytes(b2);
        r.read_exact(&mut b2)?;
        sb.part_number = u16::from_le_bytes(b2);
        r.read_exact(&mut b2)?;
        sb.total_parts = u16::from_le_bytes(b2);
        r.read_exact(&mut b4)?;
        sb.compression_type = i32::from_le_bytes(b4);
        r.read_exact(&mut b4)?;
        sb.chunk_size = u32::from_le_bytes(b4);
        r.read_exact(&mut b8)?;
        sb.manifest_len = u64::from_le_bytes(b8);
        r.read_exact(&mut b8)?;
        sb.table_count = u64::from_le_bytes(b8);
        r.read_exact(&mut b8)?;
        sb.data_off = u64::from_le_bytes(b8);
        Ok(sb)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ArchiveHeader {
    pub guid: [u8; 16],
    pub boot_index: u32,
    pub created: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DirRecord {
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    /// Unset until the contents have been read.
    pub hash: Option<ResourceHash>,
    /// Source file still to be read at write time.
    #[serde(skip)]
    pub pending: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ImageRecord {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub created: i64,
    pub dirs: Vec<DirRecord>,
    pub files: Vec<FileRecord>,
}

impl ImageRecord {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub(crate) struct Manifest {
    pub header: ArchiveHeader,
    pub images: Vec<ImageRecord>,
}

pub(crate) const ENTRY_SIZE: usize = 64;
pub(crate) const ENTRY_COMPRESSED: u8 = 0x01;
pub(crate) const ENTRY_PACKED: u8 = 0x02;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TableEntry {
    pub hash: ResourceHash,
    pub flags: u8,
    pub part_number: u16,
    pub chunk_size: u32,
    pub compression_type: i32,
    pub reference_count: u32,
    pub u_size: u64,
    pub c_size: u64,
    pub data_off: u64,
}

impl TableEntry {
    pub fn is_compressed(&self) -> bool {
        self.flags & ENTRY_COMPRESSED != 0
    }

    pub fn is_packed(&self) -> bool {
        self.flags & ENTRY_PACKED != 0
    }
}

pub(crate) fn write_table(mut w: impl Write, entries: &[TableEntry]) -> io::Result<()> {
    let mut buf = [0u8; ENTRY_SIZE];
    for e in entries {
        // [0..20]=hash [20]=flags [21]=pad [22..24]=part [24..28]=chunk
        // [28..32]=ctype [32..36]=refs [36..44]=u [44..52]=c [52..60]=off [60..64]=pad
        buf.fill(0);
        buf[..20].copy_from_slice(&e.hash.0);
        buf[20] = e.flags;
        buf[22..24].copy_from_slice(&e.part_number.to_le_bytes());
        buf[24..28].copy_from_slice(&e.chunk_size.to_le_bytes());
        buf[28..32].copy_from_slice(&e.compression_type.to_le_bytes());
        buf[32..36].copy_from_slice(&e.reference_count.to_le_bytes());
        buf[36..44].copy_from_slice(&e.u_size.to_le_bytes());
        buf[44..52].copy_from_slice(&e.c_size.to_le_bytes());
        buf[52..60].copy_from_slice(&e.data_off.to_le_bytes());
        w.write_all(&buf)?;
    }
    Ok(())
}

fn le<const N: usize>(x: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&x[..N]);
    out
}

pub(crate) fn read_table(buf: &[u8], count: u64) -> Result<Vec<TableEntry>, i32> {
    let need = (count as usize)
        .checked_mul(ENTRY_SIZE)
        .ok_or(status::INVALID_LOOKUP_TABLE_ENTRY)?;
    if buf.len() != need {
        return Err(status::UNEXPECTED_END_OF_FILE);
    }
    Ok(buf
        .chunks_exact(ENTRY_SIZE)
        .map(|e| TableEntry {
            hash: ResourceHash(le::<20>(&e[..20])),
            flags: e[20],
            part_number: u16::from_le_bytes(le(&e[22..24])),
            chunk_size: u32::from_le_bytes(le(&e[24..28])),
            compression_type: i32::from_le_bytes(le(&e[28..32])),
            reference_count: u32::from_le_bytes(le(&e[32..36])),
            u_size: u64::from_le_bytes(le(&e[36..44])),
            c_size: u64::from_le_bytes(le(&e[44..52])),
            data_off: u64::from_le_bytes(le(&e[52..60])),
        })
        .collect())
}

pub(crate) const TAIL_MAGIC: [u8; 8] = *b"PWIMTAIL";
pub(crate) const TAIL_LEN: u64 = 120;

/// Trailer closing every container: digests of the three regions plus the
/// counts they were taken over.
///
/// ```text
/// [magic 8][manifest 32][table 32][data 32][resources u32][images u32][data_len u64]
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TailSummary {
    pub manifest_blake3: [u8; 32],
    pub table_blake3: [u8; 32],
    pub data_blake3: [u8; 32],
    pub resource_count: u32,
    pub image_count: u32,
    pub data_len: u64,
}

impl TailSummary {
    fn to_bytes(self) -> [u8; TAIL_LEN as usize] {
        let mut buf = [0u8; TAIL_LEN as usize];
        buf[..8].copy_from_slice(&TAIL_MAGIC);
        buf[8..40].copy_from_slice(&self.manifest_blake3);
        buf[40..72].copy_from_slice(&self.table_blake3);
        buf[72..104].copy_from_slice(&self.data_blake3);
        buf[104..108].copy_from_slice(&self.resource_count.to_le_bytes());
        buf[108..112].copy_from_slice(&self.image_count.to_le_bytes());
        buf[112..120].copy_from_slice(&self.data_len.to_le_bytes());
        buf
    }

    /// `None` unless `buf` is exactly one tail with the right magic.
    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() as u64 != TAIL_LEN || buf[..8] != TAIL_MAGIC {
            return None;
        }
        Some(Self {
            manifest_blake3: le(&buf[8..40]),
            table_blake3: le(&buf[40..72]),
            data_blake3: le(&buf[72..104]),
            resource_count: u32::from_le_bytes(le(&buf[104..108])),
            image_count: u32::from_le_bytes(le(&buf[108..112])),
            data_len: u64::from_le_bytes(le(&buf[112..120])),
        })
    }

    fn agrees_with(&self, table_count: u64, image_count: usize, data_len: u64) -> bool {
        u64::from(self.resource_count) == table_count
            && self.image_count as usize == image_count
            && self.data_len == data_len
    }
}

pub(crate) fn encode_manifest(manifest: &Manifest) -> Result<Vec<u8>, i32> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(manifest, &mut out).map_err(|_| status::INVALID_METADATA_RESOURCE)?;
    Ok(out)
}

/// Writes a complete container. `entries` carry offsets relative to the start
/// of `data`; they are rebased here. Returns the bytes written.
pub(crate) fn write_container(
    mut w: impl Write,
    mut sb: Superblock,
    manifest: &[u8],
    image_count: u32,
    entries: &[TableEntry],
    data: &[u8],
) -> io::Result<u64> {
    let table_len = (entries.len() * ENTRY_SIZE) as u64;
    sb.version = VERSION;
    sb.manifest_len = manifest.len() as u64;
    sb.table_count = entries.len() as u64;
    sb.data_off = HEADER_LEN + sb.manifest_len + table_len;

    let rebased: Vec<TableEntry> = entries
        .iter()
        .map(|e| TableEntry {
            data_off: e.data_off + sb.data_off,
            ..*e
        })
        .collect();
    let mut table = Vec::with_capacity(table_len as usize);
    write_table(&mut table, &rebased)?;

    let tail = TailSummary {
        manifest_blake3: *blake3::hash(manifest).as_bytes(),
        table_blake3: *blake3::hash(&table).as_bytes(),
        data_blake3: *blake3::hash(data).as_bytes(),
        resource_count: u32::try_from(entries.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many resources"))?,
        image_count,
        data_len: data.len() as u64,
    };

    sb.write_to(&mut w)?;
    w.write_all(manifest)?;
    w.write_all(&table)?;
    w.write_all(data)?;
    w.write_all(&tail.to_bytes())?;
    w.flush()?;
    Ok(sb.data_off + data.len() as u64 + TAIL_LEN)
}

/// A container parsed from memory.
#[derive(Debug, Clone)]
pub(crate) struct Decoded {
    pub superblock: Superblock,
    pub manifest: Manifest,
    pub entries: Vec<TableEntry>,
    pub tail: Option<TailSummary>,
    /// End of the resource data (start of the tail, or end of file).
    pub data_end: u64,
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Decoded, i32> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(status::NOT_A_WIM_FILE);
    }
    if (bytes.len() as u64) < HEADER_LEN {
        return Err(status::UNEXPECTED_END_OF_FILE);
    }
    let sb = Superblock::read_from(&bytes[..HEADER_LEN as usize])
        .map_err(|_| status::INVALID_HEADER)?;
    if sb.version != VERSION {
        return Err(status::UNKNOWN_VERSION);
    }
    if sb.part_number == 0 || sb.part_number > sb.total_parts {
        return Err(status::INVALID_PART_NUMBER);
    }

    let file_len = bytes.len() as u64;
    let mut data_end = file_len;
    let mut tail = None;
    if file_len >= HEADER_LEN + TAIL_LEN {
        let at = (file_len - TAIL_LEN) as usize;
        if let Some(t) = TailSummary::parse(&bytes[at..]) {
            tail = Some(t);
            data_end = file_len - TAIL_LEN;
        }
    }

    let manifest_end = HEADER_LEN
        .checked_add(sb.manifest_len)
        .ok_or(status::INVALID_HEADER)?;
    let table_end = manifest_end
        .checked_add(sb.table_count.saturating_mul(ENTRY_SIZE as u64))
        .ok_or(status::INVALID_HEADER)?;
    if table_end > data_end || sb.data_off != table_end {
        return Err(status::UNEXPECTED_END_OF_FILE);
    }

    let manifest: Manifest =
        ciborium::de::from_reader(&bytes[HEADER_LEN as usize..manifest_end as usize])
            .map_err(|_| status::INVALID_METADATA_RESOURCE)?;
    let entries = read_table(&bytes[manifest_end as usize..table_end as usize], sb.table_count)?;

    if let Some(t) = &tail {
        if !t.agrees_with(sb.table_count, manifest.images.len(), data_end - sb.data_off) {
            return Err(status::INVALID_INTEGRITY_TABLE);
        }
    }

    for e in &entries {
        let in_bounds = e.data_off >= sb.data_off
            && e.data_off.checked_add(e.c_size).is_some_and(|end| end <= data_end);
        let valid_codec = codec::is_valid_type(e.compression_type)
            && (e.chunk_size as u64) > 0;
        if !in_bounds || !valid_codec || !sizes_agree(e.u_size, e.c_size, e.chunk_size) {
            return Err(status::INVALID_LOOKUP_TABLE_ENTRY);
        }
    }

    Ok(Decoded {
        superblock: sb,
        manifest,
        entries,
        tail,
        data_end,
    })
}

/// Recomputes the tail digests of a decoded container, reporting progress
/// after each step of `step` bytes of resource data.
pub(crate) fn check_integrity(
    bytes: &[u8],
    decoded: &Decoded,
    step: usize,
    mut on_step: impl FnMut(u64, u64) -> Result<(), i32>,
) -> Result<(), i32> {
    let tail = decoded.tail.ok_or(status::INVALID_INTEGRITY_TABLE)?;
    let sb = &decoded.superblock;
    let manifest_end = (HEADER_LEN + sb.manifest_len) as usize;
    let manifest = &bytes[HEADER_LEN as usize..manifest_end];
    let table = &bytes[manifest_end..sb.data_off as usize];
    let data = &bytes[sb.data_off as usize..decoded.data_end as usize];

    if *blake3::hash(manifest).as_bytes() != tail.manifest_blake3
        || *blake3::hash(table).as_bytes() != tail.table_blake3
    {
        return Err(status::INTEGRITY);
    }
    let total = data.len() as u64;
    let mut hasher = blake3::Hasher::new();
    let mut done = 0u64;
    on_step(0, total)?;
    for piece in data.chunks(step.max(1)) {
        hasher.update(piece);
        done += piece.len() as u64;
        on_step(done, total)?;
    }
    if *hasher.finalize().as_bytes() != tail.data_blake3 {
        return Err(status::INTEGRITY);
    }
    Ok(())
}

/// Encodes one resource as a run of chunks, each prefixed by its stored
/// length. A chunk whose stored length equals its uncompressed length is
/// kept verbatim.
pub(crate) fn encode_resource(data: &[u8], ctype: i32, chunk_size: u32, level: u32) -> Vec<u8> {
    let chunk_size = chunk_size.max(1) as usize;
    let mut out = Vec::with_capacity(data.len() + 4 * (data.len() / chunk_size + 1));
    let mut scratch = vec![0u8; chunk_size];
    for chunk in data.chunks(chunk_size) {
        let limit = chunk.len().saturating_sub(1);
        let n = codec::compress_block(ctype, level, chunk, &mut scratch[..limit]);
        let payload = if n == 0 { chunk } else { &scratch[..n] };
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }
    out
}

/// Whether an encoded resource of `c_size` bytes can hold `u_size` bytes in
/// chunks of `chunk_size`: every chunk costs a 4-byte length and stores at
/// most its own uncompressed length.
fn sizes_agree(u_size: u64, c_size: u64, chunk_size: u32) -> bool {
    let chunks = u_size.div_ceil(u64::from(chunk_size.max(1)));
    let Some(framing) = chunks.checked_mul(4) else {
        return false;
    };
    c_size >= framing && u_size.checked_add(framing).is_some_and(|max| c_size <= max)
}

pub(crate) fn decode_resource(
    bytes: &[u8],
    ctype: i32,
    chunk_size: u32,
    u_size: u64,
) -> Result<Vec<u8>, i32> {
    if !sizes_agree(u_size, bytes.len() as u64, chunk_size) {
        return Err(status::INVALID_LOOKUP_TABLE_ENTRY);
    }
    let len = usize::try_from(u_size).map_err(|_| status::NOMEM)?;
    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| status::NOMEM)?;
    out.resize(len, 0);
    let chunk_size = chunk_size.max(1) as u64;
    let mut cursor = 0usize;
    let mut produced = 0u64;
    while produced < u_size {
        let u_len = chunk_size.min(u_size - produced) as usize;
        let header = bytes
            .get(cursor..cursor + 4)
            .ok_or(status::UNEXPECTED_END_OF_FILE)?;
        let c_len = u32::from_le_bytes(le(header)) as usize;
        if c_len > u_len {
            return Err(status::DECOMPRESSION);
        }
        cursor += 4;
        let payload = bytes
            .get(cursor..cursor + c_len)
            .ok_or(status::UNEXPECTED_END_OF_FILE)?;
        cursor += c_len;
        let dst = &mut out[produced as usize..produced as usize + u_len];
        if c_len == u_len {
            dst.copy_from_slice(payload);
        } else {
            codec::decompress_block(ctype, payload, dst)?;
        }
        produced += u_len as u64;
    }
    if cursor != bytes.len() {
        return Err(status::DECOMPRESSION);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            header: ArchiveHeader {
                guid: [7; 16],
                boot_index: 1,
                created: 1_700_000_000,
            },
            images: vec![ImageRecord {
                name: "base".into(),
                files: vec![FileRecord {
                    path: "a.txt".into(),
                    size: 5,
                    hash: Some(ResourceHash::of(b"hello")),
                    ..FileRecord::default()
                }],
                ..ImageRecord::default()
            }],
        }
    }

    #[test]
    fn container_decodes_what_it_wrote() {
        let data = encode_resource(b"hello", codec::LZX, 32768, 50);
        let entry = TableEntry {
            hash: ResourceHash::of(b"hello"),
            part_number: 1,
            chunk_size: 32768,
            compression_type: codec::LZX,
            reference_count: 1,
            u_size: 5,
            c_size: data.len() as u64,
            data_off: 0,
            ..TableEntry::default()
        };
        let manifest = encode_manifest(&sample_manifest()).unwrap();
        let sb = Superblock {
            part_number: 1,
            total_parts: 1,
            compression_type: codec::LZX,
            chunk_size: 32768,
            ..Superblock::default()
        };
        let mut file = Vec::new();
        let written = write_container(&mut file, sb, &manifest, 1, &[entry], &data).unwrap();
        assert_eq!(written, file.len() as u64);

        let decoded = decode(&file).unwrap();
        assert_eq!(decoded.manifest.images[0].name, "base");
        assert_eq!(decoded.entries.len(), 1);
        let e = decoded.entries[0];
        let raw = &file[e.data_off as usize..(e.data_off + e.c_size) as usize];
        assert_eq!(decode_resource(raw, e.compression_type, e.chunk_size, e.u_size).unwrap(), b"hello");
        check_integrity(&file, &decoded, 16, |_, _| Ok(())).unwrap();
    }

    fn single_resource_container(payload: &[u8]) -> Vec<u8> {
        let data = encode_resource(payload, codec::LZX, 32768, 50);
        let entry = TableEntry {
            hash: ResourceHash::of(payload),
            part_number: 1,
            chunk_size: 32768,
            compression_type: codec::LZX,
            reference_count: 1,
            u_size: payload.len() as u64,
            c_size: data.len() as u64,
            ..TableEntry::default()
        };
        let manifest = encode_manifest(&sample_manifest()).unwrap();
        let sb = Superblock {
            part_number: 1,
            total_parts: 1,
            ..Superblock::default()
        };
        let mut file = Vec::new();
        write_container(&mut file, sb, &manifest, 1, &[entry], &data).unwrap();
        file
    }

    #[test]
    fn oversized_table_entry_is_rejected_on_open() {
        let mut file = single_resource_container(b"hello");
        let decoded = decode(&file).unwrap();
        let table_at = (HEADER_LEN + decoded.superblock.manifest_len) as usize;
        file[table_at + 36..table_at + 44].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(decode(&file).unwrap_err(), status::INVALID_LOOKUP_TABLE_ENTRY);
    }

    #[test]
    fn decode_resource_refuses_sizes_the_payload_cannot_hold() {
        let raw = encode_resource(b"hello", codec::LZX, 32768, 50);
        assert_eq!(
            decode_resource(&raw, codec::LZX, 32768, u64::MAX).unwrap_err(),
            status::INVALID_LOOKUP_TABLE_ENTRY
        );
        assert_eq!(
            decode_resource(&raw, codec::LZX, 1, 5).unwrap_err(),
            status::INVALID_LOOKUP_TABLE_ENTRY
        );
        assert_eq!(decode_resource(&raw, codec::LZX, 32768, 5).unwrap(), b"hello");
    }

    #[test]
    fn tail_counts_must_match_the_container() {
        let mut file = single_resource_container(b"hello");
        let at = file.len() - TAIL_LEN as usize;
        let tail = TailSummary::parse(&file[at..]).unwrap();
        assert_eq!((tail.resource_count, tail.image_count), (1, 1));

        let bumped = TailSummary { image_count: 2, ..tail };
        file[at..].copy_from_slice(&bumped.to_bytes());
        assert_eq!(decode(&file).unwrap_err(), status::INVALID_INTEGRITY_TABLE);
    }

    #[test]
    fn foreign_bytes_are_not_an_archive() {
        assert_eq!(decode(b"definitely not").unwrap_err(), status::NOT_A_WIM_FILE);
        assert_eq!(decode(&MAGIC[..]).unwrap_err(), status::UNEXPECTED_END_OF_FILE);
    }

    #[test]
    fn flipped_data_byte_fails_integrity() {
        let data = encode_resource(&[9u8; 300], codec::XPRESS, 4096, 50);
        let manifest = encode_manifest(&Manifest::default()).unwrap();
        let sb = Superblock {
            part_number: 1,
            total_parts: 1,
            ..Superblock::default()
        };
        let mut file = Vec::new();
        write_container(&mut file, sb, &manifest, 0, &[], &data).unwrap();
        let decoded = decode(&file).unwrap();
        let at = decoded.superblock.data_off as usize + 2;
        file[at] ^= 0xff;
        let decoded = decode(&file).unwrap();
        assert_eq!(
            check_integrity(&file, &decoded, 64, |_, _| Ok(())).unwrap_err(),
            status::INTEGRITY
        );
    }
}
