//! The filesystem on top of the zoned block device: namespace and file map,
//! the op log carrying file metadata records, mount/replay, and the admin
//! surface for tooling.
//!
//! # Op log format
//!
//! Metadata records are framed and appended to the current op-log zone, one
//! frame per record, each zero-padded to the next block boundary:
//!
//! ```text
//! +----------+------------------+-----------+----------------+
//! | len: u32 | payload          | crc32: u32| zero padding   |
//! +----------+------------------+-----------+----------------+
//! ```
//!
//! The payload starts with a `u32` record kind: `1` file update (scalars
//! replaced, extents appended on replay), `2` file deletion, `3` log open
//! (sequence number; first record of every log zone), `4` file replace
//! (complete state; emitted by GC and by the roll snapshot). Replay stops at
//! the first zeroed or corrupt frame. Mounting picks the op-log zone with
//! the highest log-open sequence; the log rolls to the other zone when the
//! active one runs low.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use itertools::Itertools;
use serde::Serialize;

use crate::config::MountOptions;
use crate::error::{Error, Result};
use crate::file::{FileSnapshot, ZoneFile};
use crate::gc::{FileMap, GcStats, GcWorker};
use crate::io::{MetadataWriter, ZonedRandomAccessFile, ZonedSequentialFile, ZonedWritableFile};
use crate::zbd::zone::Zone;
use crate::zbd::{DeviceSnapshot, ZoneFileStat, ZoneStat, ZonedBlockDevice};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const REC_FILE_UPDATE: u32 = 1;
const REC_FILE_DELETION: u32 = 2;
const REC_LOG_OPEN: u32 = 3;
const REC_FILE_REPLACE: u32 = 4;

#[derive(Debug)]
struct MetaLog {
    zone: Arc<Zone>,
    sequence: u64,
}

/// The filesystem. Obtain one via [`ZoneFs::mount`] after [`ZoneFs::mkfs`]
/// has initialised the device once.
#[derive(Debug)]
pub struct ZoneFs {
    self_ref: Weak<ZoneFs>,
    zbd: Arc<ZonedBlockDevice>,
    files: Arc<Mutex<FileMap>>,
    dirs: Mutex<HashSet<String>>,
    next_file_id: AtomicU64,
    log: Mutex<MetaLog>,
    roll_threshold: u64,
    roll_pending: AtomicBool,
    readonly: bool,
}

impl ZoneFs {
    /// Initialise an empty filesystem: reset the metadata pools, open the
    /// first log zone, and reclaim any leftover IO zones.
    pub fn mkfs(zbd: &Arc<ZonedBlockDevice>) -> Result<()> {
        for zone in zbd.op_zones() {
            if !zone.is_empty() {
                zone.reset()?;
            }
        }
        for zone in zbd.snapshot_zones() {
            if !zone.is_empty() {
                zone.reset()?;
            }
        }

        let zone = zbd
            .allocate_meta_zone()
            .ok_or_else(|| Error::NoSpace("no op log zone available".to_string()))?;
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(REC_LOG_OPEN)?;
        payload.write_u64::<LittleEndian>(1)?;
        zone.append(&build_frame(&payload, zbd.block_size())?)?;

        zbd.reset_unused_io_zones()?;
        tracing::info!("filesystem created");
        Ok(())
    }

    /// Mount the filesystem by replaying the op-log zone with the highest
    /// log-open sequence. A device with no valid log-open record holds no
    /// filesystem, which `mkfs` uses as its probe.
    pub fn mount(zbd: Arc<ZonedBlockDevice>, opts: &MountOptions) -> Result<Arc<ZoneFs>> {
        let mut current: Option<(Arc<Zone>, u64)> = None;
        for zone in zbd.op_zones() {
            let Some((payload, _)) = read_frame(&zbd, zone, zone.start())? else {
                continue;
            };
            let mut cursor = Cursor::new(payload.as_slice());
            if cursor.read_u32::<LittleEndian>().ok() != Some(REC_LOG_OPEN) {
                continue;
            }
            let sequence = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| Error::Corruption("bad log open record".to_string()))?;
            if current.as_ref().map_or(true, |(_, s)| sequence > *s) {
                current = Some((Arc::clone(zone), sequence));
            }
        }
        let Some((zone, sequence)) = current else {
            return Err(Error::NotFound("no filesystem found on device".to_string()));
        };

        let (files, max_id) = replay(&zbd, &zone)?;
        tracing::info!(files = files.len(), sequence, "mounted filesystem");

        Ok(Arc::new_cyclic(|me| ZoneFs {
            self_ref: me.clone(),
            zbd,
            files: Arc::new(Mutex::new(files)),
            dirs: Mutex::new(HashSet::new()),
            next_file_id: AtomicU64::new(max_id + 1),
            log: Mutex::new(MetaLog { zone, sequence }),
            roll_threshold: opts.roll_threshold,
            roll_pending: AtomicBool::new(false),
            readonly: opts.readonly,
        }))
    }

    pub fn zbd(&self) -> &Arc<ZonedBlockDevice> {
        &self.zbd
    }

    fn metadata_writer(&self) -> Result<Arc<dyn MetadataWriter>> {
        self.self_ref
            .upgrade()
            .map(|fs| fs as Arc<dyn MetadataWriter>)
            .ok_or_else(|| Error::IO("filesystem is shutting down".to_string()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::IO("filesystem mounted read-only".to_string()));
        }
        Ok(())
    }

    fn lookup(&self, path: &str) -> Result<Arc<RwLock<ZoneFile>>> {
        let name = normalize(path);
        self.files
            .lock()?
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such file: {name}")))
    }

    /// Create a file for writing, replacing any previous file of the same
    /// name.
    pub fn new_writable_file(&self, path: &str, buffered: bool) -> Result<ZonedWritableFile> {
        self.check_writable()?;
        let name = normalize(path);
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty file name".to_string()));
        }

        let previous = self.files.lock()?.remove(&name);
        if let Some(prev) = previous {
            let (id, fname) = {
                let fr = prev.read()?;
                (fr.file_id(), fr.filename().to_string())
            };
            drop(prev);
            let mut log = self.log.lock()?;
            self.append_record(&mut log, &deletion_payload(id, &fname)?)?;
        }

        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(RwLock::new(ZoneFile::new(
            Arc::clone(&self.zbd),
            name.clone(),
            id,
        )));
        file.write()?.set_m_time(now_secs());
        self.files.lock()?.insert(name, Arc::clone(&file));

        ZonedWritableFile::new(
            file,
            buffered,
            self.zbd.block_size() as usize,
            self.metadata_writer()?,
        )
    }

    pub fn new_sequential_file(&self, path: &str, direct: bool) -> Result<ZonedSequentialFile> {
        Ok(ZonedSequentialFile::new(self.lookup(path)?, direct))
    }

    pub fn new_random_access_file(
        &self,
        path: &str,
        direct: bool,
    ) -> Result<ZonedRandomAccessFile> {
        Ok(ZonedRandomAccessFile::new(self.lookup(path)?, direct))
    }

    pub fn get_file_size(&self, path: &str) -> Result<u64> {
        Ok(self.lookup(path)?.read()?.file_size())
    }

    pub fn get_file_modification_time(&self, path: &str) -> Result<u64> {
        Ok(self.lookup(path)?.read()?.m_time())
    }

    /// Remove the file and record the deletion in the op log. Extent
    /// capacity is released once the last reader drops its handle.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let name = normalize(path);
        let removed = self.files.lock()?.remove(&name);
        let Some(file) = removed else {
            return Err(Error::NotFound(format!("no such file: {name}")));
        };
        let (id, fname) = {
            let fr = file.read()?;
            (fr.file_id(), fr.filename().to_string())
        };
        drop(file);

        let mut log = self.log.lock()?;
        self.append_record(&mut log, &deletion_payload(id, &fname)?)
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        self.dirs.lock()?.insert(normalize(path));
        Ok(())
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        let name = normalize(path);
        if self.files.lock()?.contains_key(&name) {
            return Ok(false);
        }
        if name.is_empty() || self.dirs.lock()?.contains(&name) {
            return Ok(true);
        }
        let prefix = format!("{name}/");
        if self.files.lock()?.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(true);
        }
        Err(Error::NotFound(format!("no such directory: {name}")))
    }

    /// Direct children of a directory, from both files and directory
    /// markers.
    pub fn get_children(&self, dir: &str) -> Result<Vec<String>> {
        let name = normalize(dir);
        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{name}/")
        };

        let mut children = Vec::new();
        for key in self.files.lock()?.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some(child) = rest.split('/').next() {
                    if !child.is_empty() {
                        children.push(child.to_string());
                    }
                }
            }
        }
        for key in self.dirs.lock()?.iter() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Some(child) = rest.split('/').next() {
                    if !child.is_empty() {
                        children.push(child.to_string());
                    }
                }
            }
        }

        Ok(children.into_iter().sorted().dedup().collect())
    }

    pub fn free_space(&self) -> u64 {
        self.zbd.free_space()
    }

    pub fn used_space(&self) -> u64 {
        self.zbd.used_space()
    }

    pub fn reclaimable_space(&self) -> u64 {
        self.zbd.reclaimable_space()
    }

    /// Per-zone statistics with `(file_id, filename, size_in_zone)` triples.
    pub fn get_stat(&self) -> Result<Vec<ZoneStat>> {
        let mut stats = self.zbd.get_stat();
        let index: HashMap<u64, usize> = stats
            .iter()
            .enumerate()
            .map(|(i, s)| (s.start_position, i))
            .collect();

        let files = self.files.lock()?;
        for file in files.values() {
            let fr = file.read()?;
            let mut per_zone: HashMap<u64, u64> = HashMap::new();
            for extent in fr.extents() {
                *per_zone.entry(extent.zone.start()).or_default() += u64::from(extent.length);
            }
            for (zone_start, bytes) in per_zone {
                if let Some(&i) = index.get(&zone_start) {
                    stats[i].files.push(ZoneFileStat {
                        file_id: fr.file_id(),
                        filename: fr.filename().to_string(),
                        size_in_zone: bytes,
                    });
                }
            }
        }
        Ok(stats)
    }

    /// Structured dump of all zone pools and files for diagnostics.
    pub fn dump(&self) -> Result<serde_json::Value> {
        #[derive(Serialize)]
        struct Dump {
            zones: DeviceSnapshot,
            files: Vec<FileSnapshot>,
        }

        let mut file_snapshots = Vec::new();
        {
            let files = self.files.lock()?;
            for file in files.values() {
                file_snapshots.push(file.read()?.snapshot());
            }
        }

        serde_json::to_value(Dump {
            zones: self.zbd.snapshot(),
            files: file_snapshots,
        })
        .map_err(|e| Error::IO(format!("failed to encode dump: {e}")))
    }

    /// Run garbage collection over the given source and destination zones.
    pub fn run_gc(&self, src_zones: &[Arc<Zone>], dst_zones: &[Arc<Zone>]) -> Result<GcStats> {
        self.check_writable()?;
        GcWorker::new(
            Arc::clone(&self.zbd),
            Arc::clone(&self.files),
            self.metadata_writer()?,
        )
        .run(src_zones, dst_zones)
    }

    fn persist_with(&self, file: &Arc<RwLock<ZoneFile>>, kind: u32, full: bool) -> Result<()> {
        self.check_writable()?;
        let mut log = self.log.lock()?;

        let (payload, count) = {
            let fr = file.read()?;
            let mut payload = Vec::new();
            payload.write_u32::<LittleEndian>(kind)?;
            let from = if full { 0 } else { fr.nr_synced_extents() };
            fr.encode_to(&mut payload, from)?;
            (payload, fr.extents().len())
        };

        self.append_record(&mut log, &payload)?;
        drop(log);

        file.write()?.set_nr_synced_extents(count);
        Ok(())
    }

    /// Append one framed record, rolling the log inline if the zone is out
    /// of space, and schedule a background roll once the zone runs low.
    fn append_record(&self, log: &mut MetaLog, payload: &[u8]) -> Result<()> {
        let frame = build_frame(payload, self.zbd.block_size())?;
        match log.zone.append(&frame) {
            Ok(()) => {}
            Err(Error::NoSpace(_)) => {
                self.roll_locked(log)?;
                log.zone.append(&frame)?;
            }
            Err(e) => return Err(e),
        }

        if log.zone.capacity_left() < self.roll_threshold
            && self
                .roll_pending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let me = self.self_ref.clone();
            self.zbd.meta_worker().submit_job(move || {
                let Some(fs) = me.upgrade() else { return };
                if let Err(e) = fs.roll_meta_zone() {
                    tracing::error!(error = %e, "op log roll failed");
                }
                fs.roll_pending.store(false, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    fn roll_meta_zone(&self) -> Result<()> {
        let mut log = self.log.lock()?;
        if log.zone.capacity_left() >= self.roll_threshold {
            return Ok(());
        }
        self.roll_locked(&mut log)
    }

    /// Move the log to a fresh op zone: log-open record with the next
    /// sequence, a complete snapshot of every live file, then reset the old
    /// zone.
    fn roll_locked(&self, log: &mut MetaLog) -> Result<()> {
        let next = match self.zbd.allocate_meta_zone() {
            Some(z) if !Arc::ptr_eq(&z, &log.zone) => z,
            _ => {
                let stale = self
                    .zbd
                    .op_zones()
                    .iter()
                    .find(|z| !Arc::ptr_eq(z, &log.zone))
                    .cloned()
                    .ok_or_else(|| Error::NoSpace("no op log zone available".to_string()))?;
                stale.reset()?;
                stale
            }
        };

        let sequence = log.sequence + 1;
        let block = self.zbd.block_size();

        let mut open = Vec::new();
        open.write_u32::<LittleEndian>(REC_LOG_OPEN)?;
        open.write_u64::<LittleEndian>(sequence)?;
        next.append(&build_frame(&open, block)?)?;

        {
            let files = self.files.lock()?;
            for file in files.values() {
                let mut payload = Vec::new();
                payload.write_u32::<LittleEndian>(REC_FILE_REPLACE)?;
                file.read()?.encode_to(&mut payload, 0)?;
                next.append(&build_frame(&payload, block)?)?;
            }
        }

        let old = std::mem::replace(&mut log.zone, next);
        log.sequence = sequence;
        old.reset()?;
        tracing::info!(sequence, "rolled op log to a fresh zone");
        Ok(())
    }
}

impl MetadataWriter for ZoneFs {
    fn persist(&self, file: &Arc<RwLock<ZoneFile>>) -> Result<()> {
        self.persist_with(file, REC_FILE_UPDATE, false)
    }

    fn persist_replace(&self, file: &Arc<RwLock<ZoneFile>>) -> Result<()> {
        self.persist_with(file, REC_FILE_REPLACE, true)
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn deletion_payload(file_id: u64, filename: &str) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    payload.write_u32::<LittleEndian>(REC_FILE_DELETION)?;
    payload.write_u64::<LittleEndian>(file_id)?;
    payload.write_u32::<LittleEndian>(filename.len() as u32)?;
    payload.extend_from_slice(filename.as_bytes());
    Ok(payload)
}

fn build_frame(payload: &[u8], block_size: u64) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.write_u32::<LittleEndian>(payload.len() as u32)?;
    frame.extend_from_slice(payload);
    frame.write_u32::<LittleEndian>(CRC32.checksum(payload))?;

    let aligned = (frame.len() as u64).div_ceil(block_size) * block_size;
    frame.resize(aligned as usize, 0);
    Ok(frame)
}

/// Read the frame at `pos`, or `None` at the end of the log (no more data,
/// a zeroed length, a torn frame, or a checksum mismatch).
fn read_frame(
    zbd: &ZonedBlockDevice,
    zone: &Zone,
    pos: u64,
) -> Result<Option<(Vec<u8>, u64)>> {
    let wp = zone.wp();
    if pos + 8 > wp {
        return Ok(None);
    }

    let mut len_buf = [0u8; 4];
    read_exact_at(zbd, &mut len_buf, pos)?;
    let len = u64::from(u32::from_le_bytes(len_buf));
    if len == 0 {
        return Ok(None);
    }
    if pos + 4 + len + 4 > wp {
        tracing::warn!(zone = zone.start(), pos, "torn op log record, stopping replay");
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    read_exact_at(zbd, &mut payload, pos + 4)?;
    let mut crc_buf = [0u8; 4];
    read_exact_at(zbd, &mut crc_buf, pos + 4 + len)?;
    if u32::from_le_bytes(crc_buf) != CRC32.checksum(&payload) {
        tracing::warn!(zone = zone.start(), pos, "op log checksum mismatch, stopping replay");
        return Ok(None);
    }

    let next = pos + (4 + len + 4).div_ceil(zbd.block_size()) * zbd.block_size();
    Ok(Some((payload, next)))
}

fn read_exact_at(zbd: &ZonedBlockDevice, buf: &mut [u8], mut pos: u64) -> Result<()> {
    let mut read = 0;
    while read < buf.len() {
        let n = zbd.pread(&mut buf[read..], pos, false)?;
        if n == 0 {
            return Err(Error::IO("unexpected end of metadata".to_string()));
        }
        read += n;
        pos += n as u64;
    }
    Ok(())
}

/// Rebuild the file map from the records of one log zone.
fn replay(zbd: &Arc<ZonedBlockDevice>, zone: &Arc<Zone>) -> Result<(FileMap, u64)> {
    let mut files = FileMap::new();
    let mut max_id = 0u64;
    let mut pos = zone.start();
    let mut first = true;

    while let Some((payload, next)) = read_frame(zbd, zone, pos)? {
        pos = next;
        let mut cursor = Cursor::new(payload.as_slice());
        let kind = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::Corruption("empty op log record".to_string()))?;

        if first {
            if kind != REC_LOG_OPEN {
                return Err(Error::Corruption(
                    "op log does not start with a log-open record".to_string(),
                ));
            }
            first = false;
            continue;
        }

        match kind {
            REC_LOG_OPEN => continue,
            REC_FILE_UPDATE => {
                let mut update = ZoneFile::decode_from(zbd, &payload[4..])?;
                max_id = max_id.max(update.file_id());

                let mut existing_key = None;
                for (key, file) in files.iter() {
                    if file.read()?.file_id() == update.file_id() {
                        existing_key = Some(key.clone());
                        break;
                    }
                }
                match existing_key {
                    Some(key) => {
                        let file = files
                            .get(&key)
                            .cloned()
                            .ok_or_else(|| Error::IO("file map inconsistent".to_string()))?;
                        file.write()?.merge_update(&mut update)?;
                        let new_name = file.read()?.filename().to_string();
                        if new_name != key {
                            files.remove(&key);
                            files.insert(new_name, file);
                        }
                    }
                    None => {
                        files.insert(
                            update.filename().to_string(),
                            Arc::new(RwLock::new(update)),
                        );
                    }
                }
            }
            REC_FILE_REPLACE => {
                let file = ZoneFile::decode_from(zbd, &payload[4..])?;
                max_id = max_id.max(file.file_id());

                let stale: Vec<String> = {
                    let mut found = Vec::new();
                    for (key, existing) in files.iter() {
                        if existing.read()?.file_id() == file.file_id() {
                            found.push(key.clone());
                        }
                    }
                    found
                };
                for key in stale {
                    files.remove(&key);
                }
                files.insert(file.filename().to_string(), Arc::new(RwLock::new(file)));
            }
            REC_FILE_DELETION => {
                let file_id = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| Error::Corruption("bad deletion record".to_string()))?;
                let name_len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| Error::Corruption("bad deletion record".to_string()))?
                    as usize;
                let at = cursor.position() as usize;
                let name = payload
                    .get(at..at + name_len)
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .ok_or_else(|| Error::Corruption("bad deletion record".to_string()))?
                    .to_string();

                let matches = match files.get(&name) {
                    Some(file) => file.read()?.file_id() == file_id,
                    None => false,
                };
                if matches {
                    files.remove(&name);
                }
            }
            _ => return Err(Error::Corruption("unknown op log record".to_string())),
        }
    }

    Ok((files, max_id))
}
