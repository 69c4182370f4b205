//! Files over zones: a file is an ordered list of extents plus the append
//! state of its currently active zone.
//!
//! # Metadata record format
//!
//! A file is persisted as a tag-length-value record; all integers are
//! little-endian fixed-width and strings carry a `u32` length prefix:
//!
//! ```text
//! +-----------+---------+-----------+-------------+-----+
//! | tag: u32  | FileID  | tag       | FileName    | ... |
//! +-----------+---------+-----------+-------------+-----+
//! ```
//!
//! `FileID` must come first; every other tag may follow in any order and
//! `Extent` may repeat. An encoded extent is 12 bytes: 8-byte start, 4-byte
//! length. Unknown tags are a corruption error.

use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::zbd::zone::{WriteLifeHint, Zone};
use crate::zbd::ZonedBlockDevice;

const TAG_FILE_ID: u32 = 1;
const TAG_FILE_NAME: u32 = 2;
const TAG_FILE_SIZE: u32 = 3;
const TAG_WRITE_LIFE_TIME_HINT: u32 = 4;
const TAG_EXTENT: u32 = 5;
const TAG_MODIFICATION_TIME: u32 = 6;

/// Encoded size of an extent record.
pub const EXTENT_ENCODED_LEN: usize = 12;

/// A contiguous byte range of one file inside one zone. The zone reference
/// is a back-pointer; zones are owned by the device and outlive any extent.
#[derive(Clone, Debug)]
pub struct ZoneExtent {
    pub start: u64,
    pub length: u32,
    pub zone: Arc<Zone>,
}

impl ZoneExtent {
    pub fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u64::<LittleEndian>(self.start)?;
        out.write_u32::<LittleEndian>(self.length)?;
        Ok(())
    }

    /// Decode the `(start, length)` pair; the owning zone is resolved by the
    /// caller from `start`.
    pub fn decode_from(input: &[u8]) -> Result<(u64, u32)> {
        if input.len() != EXTENT_ENCODED_LEN {
            return Err(Error::Corruption("extent length mismatch".to_string()));
        }
        let mut cursor = Cursor::new(input);
        let start = cursor.read_u64::<LittleEndian>()?;
        let length = cursor.read_u32::<LittleEndian>()?;
        Ok((start, length))
    }
}

/// Extent view for the diagnostic dump.
#[derive(Debug, Clone, Serialize)]
pub struct ExtentSnapshot {
    pub start: u64,
    pub length: u32,
    pub zone_start: u64,
}

/// File view for the diagnostic dump.
#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub file_id: u64,
    pub filename: String,
    pub size: u64,
    pub lifetime: WriteLifeHint,
    pub m_time: u64,
    pub extents: Vec<ExtentSnapshot>,
}

/// A logical file striped across zones.
///
/// The byte range `[0, file_size)` is covered by the recorded extents
/// followed, while a zone is active, by the in-flight bytes
/// `[extent_start, active_zone.wp)`. Only one writer may hold the file open.
#[derive(Debug)]
pub struct ZoneFile {
    zbd: Arc<ZonedBlockDevice>,
    file_id: u64,
    filename: String,
    file_size: u64,
    lifetime: WriteLifeHint,
    m_time: u64,
    extents: Vec<ZoneExtent>,
    active_zone: Option<Arc<Zone>>,
    extent_start: u64,
    extent_filepos: u64,
    nr_synced_extents: usize,
    open_for_wr: bool,
    is_wal: bool,
}

impl ZoneFile {
    pub fn new(zbd: Arc<ZonedBlockDevice>, filename: impl Into<String>, file_id: u64) -> Self {
        let filename = filename.into();
        let is_wal = filename.ends_with(".log");
        Self {
            zbd,
            file_id,
            filename,
            file_size: 0,
            lifetime: WriteLifeHint::NotSet,
            m_time: 0,
            extents: Vec::new(),
            active_zone: None,
            extent_start: 0,
            extent_filepos: 0,
            nr_synced_extents: 0,
            open_for_wr: false,
            is_wal,
        }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.filename = name.into();
        self.is_wal = self.filename.ends_with(".log");
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: u64) {
        self.file_size = size;
    }

    pub fn lifetime(&self) -> WriteLifeHint {
        self.lifetime
    }

    pub fn set_lifetime(&mut self, hint: WriteLifeHint) {
        self.lifetime = hint;
    }

    pub fn m_time(&self) -> u64 {
        self.m_time
    }

    pub fn set_m_time(&mut self, m_time: u64) {
        self.m_time = m_time;
    }

    pub fn extents(&self) -> &[ZoneExtent] {
        &self.extents
    }

    pub(crate) fn extents_mut(&mut self) -> &mut [ZoneExtent] {
        &mut self.extents
    }

    pub fn nr_synced_extents(&self) -> usize {
        self.nr_synced_extents
    }

    pub fn is_open_for_wr(&self) -> bool {
        self.open_for_wr
    }

    pub fn open_wr(&mut self) {
        self.open_for_wr = true;
    }

    pub fn close_wr(&mut self) -> Result<()> {
        if let Some(zone) = self.active_zone.take() {
            zone.close_wr()?;
        }
        self.open_for_wr = false;
        Ok(())
    }

    /// All extents up to here are durably described in metadata.
    pub fn metadata_synced(&mut self) {
        self.nr_synced_extents = self.extents.len();
    }

    /// Record the synced prefix captured at encode time. Using the captured
    /// count keeps extents appended while the record was being written out
    /// of the synced range.
    pub(crate) fn set_nr_synced_extents(&mut self, count: usize) {
        self.nr_synced_extents = count;
    }

    /// Encode this file's record, including only extents from index
    /// `extent_start` on. Update records pass the synced prefix length so
    /// replay can merge by concatenation; snapshot records pass 0.
    /// The active zone and extent anchors are not persisted; files are
    /// read-only after mount until reopened.
    pub fn encode_to(&self, out: &mut Vec<u8>, extent_start: usize) -> Result<()> {
        out.write_u32::<LittleEndian>(TAG_FILE_ID)?;
        out.write_u64::<LittleEndian>(self.file_id)?;

        out.write_u32::<LittleEndian>(TAG_FILE_NAME)?;
        out.write_u32::<LittleEndian>(self.filename.len() as u32)?;
        out.extend_from_slice(self.filename.as_bytes());

        out.write_u32::<LittleEndian>(TAG_FILE_SIZE)?;
        out.write_u64::<LittleEndian>(self.file_size)?;

        out.write_u32::<LittleEndian>(TAG_WRITE_LIFE_TIME_HINT)?;
        out.write_u32::<LittleEndian>(self.lifetime as u32)?;

        for extent in self.extents.iter().skip(extent_start) {
            let mut encoded = Vec::with_capacity(EXTENT_ENCODED_LEN);
            extent.encode_to(&mut encoded)?;
            out.write_u32::<LittleEndian>(TAG_EXTENT)?;
            out.write_u32::<LittleEndian>(encoded.len() as u32)?;
            out.extend_from_slice(&encoded);
        }

        out.write_u32::<LittleEndian>(TAG_MODIFICATION_TIME)?;
        out.write_u64::<LittleEndian>(self.m_time)?;

        Ok(())
    }

    /// Decode a file record. `FileID` must be the leading tag; extents are
    /// resolved to their owning zones through the device and credit the
    /// zone's `used_capacity`.
    pub fn decode_from(zbd: &Arc<ZonedBlockDevice>, input: &[u8]) -> Result<ZoneFile> {
        let mut cursor = Cursor::new(input);

        let lead = get_fixed32(&mut cursor);
        let file_id = match lead {
            Some(TAG_FILE_ID) => get_fixed64(&mut cursor)
                .ok_or_else(|| Error::Corruption("file id missing".to_string()))?,
            _ => return Err(Error::Corruption("file id missing".to_string())),
        };

        let mut file = ZoneFile::new(Arc::clone(zbd), String::new(), file_id);

        while let Some(tag) = get_fixed32(&mut cursor) {
            match tag {
                TAG_FILE_NAME => {
                    let raw = get_length_prefixed(&mut cursor)
                        .ok_or_else(|| Error::Corruption("filename missing".to_string()))?;
                    if raw.is_empty() {
                        return Err(Error::Corruption("zero length filename".to_string()));
                    }
                    let name = String::from_utf8(raw)
                        .map_err(|_| Error::Corruption("filename is not utf-8".to_string()))?;
                    file.rename(name);
                }
                TAG_FILE_SIZE => {
                    file.file_size = get_fixed64(&mut cursor)
                        .ok_or_else(|| Error::Corruption("missing file size".to_string()))?;
                }
                TAG_WRITE_LIFE_TIME_HINT => {
                    let raw = get_fixed32(&mut cursor)
                        .ok_or_else(|| Error::Corruption("missing life time hint".to_string()))?;
                    file.lifetime = WriteLifeHint::from_u32(raw)
                        .ok_or_else(|| Error::Corruption("invalid life time hint".to_string()))?;
                }
                TAG_EXTENT => {
                    let raw = get_length_prefixed(&mut cursor)
                        .ok_or_else(|| Error::Corruption("extent missing".to_string()))?;
                    let (start, length) = ZoneExtent::decode_from(&raw)?;
                    let zone = zbd
                        .get_io_zone(start)
                        .ok_or_else(|| Error::Corruption("invalid zone extent".to_string()))?;
                    zone.add_used(u64::from(length));
                    file.extents.push(ZoneExtent {
                        start,
                        length,
                        zone,
                    });
                }
                TAG_MODIFICATION_TIME => {
                    file.m_time = get_fixed64(&mut cursor)
                        .ok_or_else(|| Error::Corruption("missing modification time".to_string()))?;
                }
                _ => return Err(Error::Corruption("unexpected tag".to_string())),
            }
        }

        file.metadata_synced();
        Ok(file)
    }

    /// Merge an update record for the same file: scalars are replaced and
    /// the update's extents are appended. The extents are moved out of the
    /// update, so their `used_capacity` credit (taken at decode) carries
    /// over exactly once.
    pub fn merge_update(&mut self, update: &mut ZoneFile) -> Result<()> {
        if self.file_id != update.file_id {
            return Err(Error::Corruption("file id mismatch".to_string()));
        }

        let name = update.filename.clone();
        self.rename(name);
        self.file_size = update.file_size;
        self.lifetime = update.lifetime;
        self.m_time = update.m_time;

        self.extents.append(&mut update.extents);
        self.metadata_synced();
        Ok(())
    }

    /// The extent covering `file_offset`, with the matching device offset.
    fn get_extent(&self, mut file_offset: u64) -> Option<(usize, u64)> {
        for (i, extent) in self.extents.iter().enumerate() {
            if file_offset < u64::from(extent.length) {
                return Some((i, extent.start + file_offset));
            }
            file_offset -= u64::from(extent.length);
        }
        None
    }

    /// Record the in-flight bytes of the active zone as a completed extent
    /// and advance the extent anchors. No-op without an active zone or new
    /// bytes.
    pub fn push_extent(&mut self) {
        let Some(zone) = &self.active_zone else {
            return;
        };

        let length = self.file_size - self.extent_filepos;
        if length == 0 {
            return;
        }

        zone.add_used(length);
        self.extents.push(ZoneExtent {
            start: self.extent_start,
            length: length as u32,
            zone: Arc::clone(zone),
        });
        self.extent_start = zone.wp();
        self.extent_filepos = self.file_size;
    }

    /// Append block-aligned data, rotating to a fresh zone whenever the
    /// active one runs out of capacity. `valid_size` excludes the zero
    /// padding of the final block so it never becomes visible file content.
    pub fn append(&mut self, data: &[u8], valid_size: usize) -> Result<()> {
        let mut left = data.len();
        let mut offset = 0;

        if self.active_zone.is_none() {
            let zone = self.zbd.allocate_zone(self.lifetime, self.is_wal, None)?;
            self.extent_start = zone.wp();
            self.extent_filepos = self.file_size;
            self.active_zone = Some(zone);
        }

        while left > 0 {
            let zone = match &self.active_zone {
                Some(z) => Arc::clone(z),
                None => return Err(Error::IO("append without an active zone".to_string())),
            };

            if zone.capacity_left() == 0 {
                self.push_extent();
                zone.close_wr()?;
                let next = self.zbd.allocate_zone(self.lifetime, self.is_wal, Some(&zone))?;
                self.extent_start = next.wp();
                self.extent_filepos = self.file_size;
                self.active_zone = Some(next);
                continue;
            }

            let wr = left.min(zone.capacity_left() as usize);
            zone.append(&data[offset..offset + wr])?;
            self.file_size += wr as u64;
            left -= wr;
            offset += wr;
        }

        self.file_size -= (data.len() - valid_size) as u64;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`, hopping extents as needed.
    /// Stops early where the data is not yet covered by synced extents.
    /// Direct reads are used per chunk when the size is block-aligned.
    pub fn positioned_read(&self, offset: u64, buf: &mut [u8], direct: bool) -> Result<usize> {
        if offset >= self.file_size {
            return Ok(0);
        }

        let r_sz = (buf.len() as u64).min(self.file_size - offset) as usize;
        let Some((mut idx, mut r_off)) = self.get_extent(offset) else {
            // Read starts beyond the end of synced file data.
            return Ok(0);
        };
        let mut extent_end = self.extents[idx].start + u64::from(self.extents[idx].length);

        let block_size = self.zbd.block_size();
        let mut read = 0;
        while read != r_sz {
            let mut pread_sz = r_sz - read;
            if r_off + pread_sz as u64 > extent_end {
                pread_sz = (extent_end - r_off) as usize;
            }

            // Unaligned tails fall back to the buffered descriptor.
            let aligned = pread_sz as u64 % block_size == 0;
            let n = self
                .zbd
                .pread(&mut buf[read..read + pread_sz], r_off, direct && aligned)?;
            if n == 0 {
                break;
            }

            read += n;
            r_off += n as u64;

            if read != r_sz && r_off == extent_end {
                match self.get_extent(offset + read as u64) {
                    Some((next_idx, _)) => {
                        idx = next_idx;
                        r_off = self.extents[idx].start;
                        extent_end = r_off + u64::from(self.extents[idx].length);
                    }
                    None => break,
                }
            }
        }

        Ok(read)
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            file_id: self.file_id,
            filename: self.filename.clone(),
            size: self.file_size,
            lifetime: self.lifetime,
            m_time: self.m_time,
            extents: self
                .extents
                .iter()
                .map(|e| ExtentSnapshot {
                    start: e.start,
                    length: e.length,
                    zone_start: e.zone.start(),
                })
                .collect(),
        }
    }
}

impl Drop for ZoneFile {
    fn drop(&mut self) {
        for extent in &self.extents {
            extent.zone.sub_used(u64::from(extent.length));
        }
        self.extents.clear();
        if self.active_zone.is_some() {
            if let Err(e) = self.close_wr() {
                tracing::warn!(file = %self.filename, error = %e, "failed to close file writer");
            }
        }
    }
}

fn get_fixed32(cursor: &mut Cursor<&[u8]>) -> Option<u32> {
    cursor.read_u32::<LittleEndian>().ok()
}

fn get_fixed64(cursor: &mut Cursor<&[u8]>) -> Option<u64> {
    cursor.read_u64::<LittleEndian>().ok()
}

fn get_length_prefixed(cursor: &mut Cursor<&[u8]>) -> Option<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).ok()?;
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmulatedOptions, MountOptions};
    use crate::zbd::backend::ZoneBackend;
    use crate::zbd::emulated::EmulatedBackend;

    fn open_device(dir: &tempfile::TempDir) -> Arc<ZonedBlockDevice> {
        let opts = EmulatedOptions::new(dir.path().join("zbd.img"));
        let backend: Arc<dyn ZoneBackend> =
            Arc::new(EmulatedBackend::open(&opts).expect("open emulated device"));
        ZonedBlockDevice::open(backend, &MountOptions::default()).expect("open device")
    }

    fn encode(file: &ZoneFile, extent_start: usize) -> Vec<u8> {
        let mut out = Vec::new();
        file.encode_to(&mut out, extent_start).expect("encode failed");
        out
    }

    #[test]
    fn test_extent_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);
        let zone = Arc::clone(&zbd.io_zones()[0]);

        let extent = ZoneExtent {
            start: zone.start() + 4096,
            length: 8192,
            zone,
        };
        let mut encoded = Vec::new();
        extent.encode_to(&mut encoded).expect("encode failed");
        assert_eq!(encoded.len(), EXTENT_ENCODED_LEN);

        let (start, length) = ZoneExtent::decode_from(&encoded).expect("decode failed");
        assert_eq!(start, extent.start);
        assert_eq!(length, extent.length);
    }

    #[test]
    fn test_extent_decode_rejects_bad_length() {
        assert!(matches!(
            ZoneExtent::decode_from(&[0u8; 11]),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_file_record_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);
        let zone = Arc::clone(&zbd.io_zones()[0]);

        let mut file = ZoneFile::new(Arc::clone(&zbd), "000042.sst", 42);
        file.set_lifetime(WriteLifeHint::Long);
        file.set_m_time(1_700_000_000);
        file.file_size = 12288;
        file.extents.push(ZoneExtent {
            start: zone.start(),
            length: 8192,
            zone: Arc::clone(&zone),
        });
        file.extents.push(ZoneExtent {
            start: zone.start() + 8192,
            length: 4096,
            zone: Arc::clone(&zone),
        });
        zone.add_used(12288);

        let decoded =
            ZoneFile::decode_from(&zbd, &encode(&file, 0)).expect("decode failed");
        assert_eq!(decoded.file_id(), 42);
        assert_eq!(decoded.filename(), "000042.sst");
        assert_eq!(decoded.file_size(), 12288);
        assert_eq!(decoded.lifetime(), WriteLifeHint::Long);
        assert_eq!(decoded.m_time(), 1_700_000_000);
        assert_eq!(decoded.extents().len(), 2);
        assert_eq!(decoded.extents()[0].start, zone.start());
        assert_eq!(decoded.extents()[1].length, 4096);
        assert_eq!(decoded.nr_synced_extents(), 2);
        // The original credit plus the decode credit.
        assert_eq!(zone.used_capacity(), 2 * 12288);
    }

    #[test]
    fn test_decode_rejects_missing_file_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut raw = Vec::new();
        raw.extend_from_slice(&TAG_FILE_NAME.to_le_bytes());
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(b"abc");

        let err = ZoneFile::decode_from(&zbd, &raw).unwrap_err();
        assert_eq!(err, Error::Corruption("file id missing".to_string()));
    }

    #[test]
    fn test_decode_rejects_zero_length_filename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut raw = Vec::new();
        raw.extend_from_slice(&TAG_FILE_ID.to_le_bytes());
        raw.extend_from_slice(&7u64.to_le_bytes());
        raw.extend_from_slice(&TAG_FILE_NAME.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());

        let err = ZoneFile::decode_from(&zbd, &raw).unwrap_err();
        assert_eq!(err, Error::Corruption("zero length filename".to_string()));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut raw = Vec::new();
        raw.extend_from_slice(&TAG_FILE_ID.to_le_bytes());
        raw.extend_from_slice(&7u64.to_le_bytes());
        raw.extend_from_slice(&99u32.to_le_bytes());

        let err = ZoneFile::decode_from(&zbd, &raw).unwrap_err();
        assert_eq!(err, Error::Corruption("unexpected tag".to_string()));
    }

    #[test]
    fn test_decode_rejects_extent_outside_io_zones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut raw = Vec::new();
        raw.extend_from_slice(&TAG_FILE_ID.to_le_bytes());
        raw.extend_from_slice(&7u64.to_le_bytes());
        raw.extend_from_slice(&TAG_EXTENT.to_le_bytes());
        raw.extend_from_slice(&12u32.to_le_bytes());
        // Start offset inside the op-log pool, which no extent may reference.
        raw.extend_from_slice(&0u64.to_le_bytes());
        raw.extend_from_slice(&4096u32.to_le_bytes());

        let err = ZoneFile::decode_from(&zbd, &raw).unwrap_err();
        assert_eq!(err, Error::Corruption("invalid zone extent".to_string()));
    }

    #[test]
    fn test_merge_update_moves_extents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);
        let zone = Arc::clone(&zbd.io_zones()[0]);

        let mut base = ZoneFile::new(Arc::clone(&zbd), "000001.sst", 1);
        base.file_size = 4096;
        base.extents.push(ZoneExtent {
            start: zone.start(),
            length: 4096,
            zone: Arc::clone(&zone),
        });
        zone.add_used(4096);

        let mut update = ZoneFile::new(Arc::clone(&zbd), "000001.sst", 1);
        update.file_size = 8192;
        update.extents.push(ZoneExtent {
            start: zone.start() + 4096,
            length: 4096,
            zone: Arc::clone(&zone),
        });
        zone.add_used(4096);

        base.merge_update(&mut update).expect("merge failed");
        assert_eq!(base.file_size(), 8192);
        assert_eq!(base.extents().len(), 2);
        assert_eq!(base.nr_synced_extents(), 2);
        assert_eq!(zone.used_capacity(), 8192);

        drop(update);
        // The update lost its extents to the merge; dropping it releases
        // nothing.
        assert_eq!(zone.used_capacity(), 8192);

        drop(base);
        assert_eq!(zone.used_capacity(), 0);
    }

    #[test]
    fn test_merge_update_rejects_id_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut base = ZoneFile::new(Arc::clone(&zbd), "a.sst", 1);
        let mut update = ZoneFile::new(Arc::clone(&zbd), "a.sst", 2);
        assert!(matches!(
            base.merge_update(&mut update),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_append_fills_zone_then_rotates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);
        let zone_cap = 192 * 1024usize;

        let mut file = ZoneFile::new(Arc::clone(&zbd), "000007.sst", 7);
        file.set_lifetime(WriteLifeHint::Medium);
        file.open_wr();

        // Exactly one zone's worth: no rotation.
        file.append(&vec![0x42u8; zone_cap], zone_cap)
            .expect("append failed");
        assert_eq!(file.file_size(), zone_cap as u64);

        let z0 = Arc::clone(file.active_zone.as_ref().expect("no active zone"));
        assert!(z0.is_full());

        file.push_extent();
        assert_eq!(file.extents().len(), 1);
        assert_eq!(file.extents()[0].length as usize, zone_cap);
        assert_eq!(z0.used_capacity(), zone_cap as u64);

        // One more block forces allocation of a second zone.
        file.append(&[0x43u8; 4096], 4096).expect("append failed");
        let z1 = Arc::clone(file.active_zone.as_ref().expect("no active zone"));
        assert!(!Arc::ptr_eq(&z0, &z1));
        file.push_extent();
        assert_eq!(file.extents().len(), 2);
        assert_eq!(z0.used_capacity(), zone_cap as u64);
        assert_eq!(z1.used_capacity(), 4096);

        // Extent lengths plus in-flight bytes cover the file exactly.
        let covered: u64 = file.extents().iter().map(|e| u64::from(e.length)).sum();
        assert_eq!(covered, file.file_size());
    }

    #[test]
    fn test_append_trims_padding_from_file_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut file = ZoneFile::new(Arc::clone(&zbd), "000001.log", 1);
        file.open_wr();
        file.append(&[0u8; 4096], 100).expect("append failed");
        assert_eq!(file.file_size(), 100);

        file.push_extent();
        assert_eq!(file.extents()[0].length, 100);
    }

    #[test]
    fn test_positioned_read_across_extents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);
        let zone_cap = 192 * 1024usize;

        let mut file = ZoneFile::new(Arc::clone(&zbd), "000009.sst", 9);
        file.open_wr();

        let mut data = vec![0u8; zone_cap + 8192];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        file.append(&data, data.len()).expect("append failed");
        file.push_extent();
        assert_eq!(file.extents().len(), 2);

        // A read spanning the zone boundary.
        let mut out = vec![0u8; 16 * 1024];
        let n = file
            .positioned_read(zone_cap as u64 - 8192, &mut out, false)
            .expect("read failed");
        assert_eq!(n, out.len());
        assert_eq!(&out[..], &data[zone_cap - 8192..zone_cap + 8192]);
    }

    #[test]
    fn test_positioned_read_at_eof_returns_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut file = ZoneFile::new(Arc::clone(&zbd), "000010.sst", 10);
        file.open_wr();
        file.append(&[1u8; 4096], 4096).expect("append failed");
        file.push_extent();

        let mut out = [0u8; 512];
        let n = file
            .positioned_read(file.file_size(), &mut out, false)
            .expect("read failed");
        assert_eq!(n, 0);
    }

    #[test]
    fn test_drop_releases_used_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let mut file = ZoneFile::new(Arc::clone(&zbd), "000011.sst", 11);
        file.open_wr();
        file.append(&[1u8; 8192], 8192).expect("append failed");
        file.push_extent();

        let zone = Arc::clone(&file.extents()[0].zone);
        assert_eq!(zone.used_capacity(), 8192);
        drop(file);
        assert_eq!(zone.used_capacity(), 0);
        assert!(!zone.open_for_write());
    }
}
