use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

use super::backend::{DeviceInfo, ZoneBackend, ZoneInfo};

/// Expected longevity of the data written to a zone or file. Used by the
/// allocator to co-locate similarly-lived data so whole zones die together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum WriteLifeHint {
    NotSet = 0,
    None = 1,
    Short = 2,
    Medium = 3,
    Long = 4,
    Extreme = 5,
}

impl WriteLifeHint {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(WriteLifeHint::NotSet),
            1 => Some(WriteLifeHint::None),
            2 => Some(WriteLifeHint::Short),
            3 => Some(WriteLifeHint::Medium),
            4 => Some(WriteLifeHint::Long),
            5 => Some(WriteLifeHint::Extreme),
            _ => None,
        }
    }
}

pub(crate) const LIFETIME_DIFF_NOT_GOOD: u32 = 100;
pub(crate) const LIFETIME_DIFF_MEH: u32 = 2;

/// Placement score for putting data with hint `file` into a zone stamped
/// `zone`; lower is better. Files with no usable hint only match zones in
/// the same state so they do not pollute zones with a known lifetime. An
/// exact match costs a little (`MEH`) so the allocator mildly prefers
/// opening a fresh empty zone, which keeps same-lifetime data clustered; a
/// zone that lives at least as long as the file is acceptable at a cost of
/// the distance.
pub(crate) fn life_time_diff(zone: WriteLifeHint, file: WriteLifeHint) -> u32 {
    if matches!(file, WriteLifeHint::NotSet | WriteLifeHint::None) {
        if zone == file {
            return 0;
        }
        return LIFETIME_DIFF_NOT_GOOD;
    }

    if zone == file {
        return LIFETIME_DIFF_MEH;
    }
    if zone > file {
        return zone as u32 - file as u32;
    }
    LIFETIME_DIFF_NOT_GOOD
}

struct Inflight {
    rx: mpsc::Receiver<Result<usize>>,
    nbytes: u64,
}

/// One hardware zone.
///
/// Counters are atomics so the admin paths can read them without taking any
/// lock. The write-side fields (`wp`, `capacity`, the in-flight context) are
/// only mutated by the thread that holds `open_for_write`; `used_capacity`
/// moves under the file-map lock when extents are created, released or
/// migrated.
pub struct Zone {
    backend: Arc<dyn ZoneBackend>,
    block_size: u64,
    zone_size: u64,
    start: u64,
    max_capacity: AtomicU64,
    wp: AtomicU64,
    capacity: AtomicU64,
    used_capacity: AtomicU64,
    lifetime: AtomicU8,
    open_for_write: AtomicBool,
    bg_processing: AtomicBool,
    inflight: Mutex<Option<Inflight>>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("start", &self.start)
            .field("zone_size", &self.zone_size)
            .finish()
    }
}

/// Point-in-time view of a zone for the diagnostic dump.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub start: u64,
    pub capacity: u64,
    pub max_capacity: u64,
    pub wp: u64,
    pub lifetime: WriteLifeHint,
    pub used_capacity: u64,
}

impl Zone {
    pub(crate) fn new(backend: Arc<dyn ZoneBackend>, info: &DeviceInfo, z: &ZoneInfo) -> Self {
        let capacity = if z.is_full() || z.is_offline() || z.is_readonly() {
            0
        } else {
            z.capacity - (z.wp - z.start)
        };
        Self {
            backend,
            block_size: info.block_size,
            zone_size: info.zone_size,
            start: z.start,
            max_capacity: AtomicU64::new(z.capacity),
            wp: AtomicU64::new(z.wp),
            capacity: AtomicU64::new(capacity),
            used_capacity: AtomicU64::new(0),
            lifetime: AtomicU8::new(WriteLifeHint::NotSet as u8),
            open_for_write: AtomicBool::new(false),
            bg_processing: AtomicBool::new(false),
            inflight: Mutex::new(None),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::SeqCst)
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::SeqCst)
    }

    pub fn capacity_left(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::SeqCst)
    }

    pub(crate) fn add_used(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn sub_used(&self, bytes: u64) {
        self.used_capacity.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn lifetime(&self) -> WriteLifeHint {
        WriteLifeHint::from_u32(u32::from(self.lifetime.load(Ordering::SeqCst)))
            .unwrap_or(WriteLifeHint::NotSet)
    }

    pub(crate) fn set_lifetime(&self, hint: WriteLifeHint) {
        self.lifetime.store(hint as u8, Ordering::SeqCst);
    }

    pub fn open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open_for_write(&self, open: bool) {
        self.open_for_write.store(open, Ordering::SeqCst);
    }

    pub fn bg_processing(&self) -> bool {
        self.bg_processing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_bg_processing(&self, bg: bool) {
        self.bg_processing.store(bg, Ordering::SeqCst);
    }

    /// A zone is used while live extents reference it or a writer holds it.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0 || self.open_for_write()
    }

    pub fn is_full(&self) -> bool {
        self.capacity_left() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    pub fn zone_nr(&self) -> u64 {
        self.start / self.zone_size
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            capacity: self.capacity_left(),
            max_capacity: self.max_capacity(),
            wp: self.wp(),
            lifetime: self.lifetime(),
            used_capacity: self.used_capacity(),
        }
    }

    /// Reset the zone. Legal only when no live extents reference it and no
    /// writer holds it. Re-reads the zone report afterwards since the
    /// capacity may change (a zone gone offline pins it to zero).
    pub fn reset(&self) -> Result<()> {
        assert!(!self.is_used());

        self.backend.reset_zone(self.start)?;

        let report = self.backend.report_zones(self.start, self.zone_size)?;
        let z = report
            .first()
            .ok_or_else(|| Error::IO("zone report failed after reset".to_string()))?;

        if z.is_offline() {
            self.capacity.store(0, Ordering::SeqCst);
        } else {
            self.max_capacity.store(z.capacity, Ordering::SeqCst);
            self.capacity.store(z.capacity, Ordering::SeqCst);
        }
        self.wp.store(self.start, Ordering::SeqCst);
        self.set_lifetime(WriteLifeHint::NotSet);

        Ok(())
    }

    /// Transition the zone to full, releasing its active-zone resource.
    pub fn finish(&self) -> Result<()> {
        assert!(!self.open_for_write());

        self.backend.finish_zone(self.start)?;

        self.capacity.store(0, Ordering::SeqCst);
        self.wp.store(self.start + self.zone_size, Ordering::SeqCst);

        Ok(())
    }

    /// Release write ownership. Issues the device close only when the zone
    /// is neither empty nor full; the write pointer and capacity stay put.
    pub fn close(&self) -> Result<()> {
        self.set_open_for_write(false);

        if !(self.is_empty() || self.is_full()) {
            self.backend.close_zone(self.start)?;
        }

        Ok(())
    }

    /// Synchronous append at the write pointer. `data` must be a multiple of
    /// the block size.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 % self.block_size != 0 {
            return Err(Error::InvalidArgument(
                "append size is not a multiple of the block size".to_string(),
            ));
        }

        if self.capacity_left() < data.len() as u64 {
            return Err(Error::NoSpace("not enough capacity for append".to_string()));
        }

        // Make sure we don't have any outstanding writes.
        self.sync()?;

        let mut off = 0;
        while off < data.len() {
            let wp = self.wp.load(Ordering::SeqCst);
            let n = self.backend.pwrite(&data[off..], wp)?;
            if n == 0 {
                return Err(Error::IO("write made no progress".to_string()));
            }
            self.wp.fetch_add(n as u64, Ordering::SeqCst);
            self.capacity.fetch_sub(n as u64, Ordering::SeqCst);
            off += n;
        }

        Ok(())
    }

    /// Submit a single asynchronous append and return immediately. At most
    /// one write is in flight per zone; the write pointer and capacity are
    /// advanced optimistically and reconciled by [`Zone::sync`].
    pub fn append_async(&self, data: Vec<u8>) -> Result<()> {
        if data.len() as u64 % self.block_size != 0 {
            return Err(Error::InvalidArgument(
                "append size is not a multiple of the block size".to_string(),
            ));
        }

        self.sync()?;

        let nbytes = data.len() as u64;
        if self.capacity_left() < nbytes {
            return Err(Error::NoSpace("not enough capacity for append".to_string()));
        }

        let wp = self.wp.load(Ordering::SeqCst);
        let backend = Arc::clone(&self.backend);
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(write_fully(backend.as_ref(), &data, wp));
        });

        let mut inflight = self.inflight.lock()?;
        *inflight = Some(Inflight { rx, nbytes });

        self.wp.fetch_add(nbytes, Ordering::SeqCst);
        self.capacity.fetch_sub(nbytes, Ordering::SeqCst);

        Ok(())
    }

    /// Wait up to one second for the outstanding async write. A short
    /// completion or an error leaves the in-memory state inconsistent with
    /// the device and is fatal for the writer.
    pub fn sync(&self) -> Result<()> {
        let mut inflight = self.inflight.lock()?;
        let Some(pending) = inflight.take() else {
            return Ok(());
        };

        match pending.rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Ok(n)) if n as u64 == pending.nbytes => Ok(()),
            Ok(Ok(_)) => Err(Error::IO(
                "failed to complete io: short write".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(Error::IO("failed to complete io: timeout".to_string()))
            }
        }
    }

    /// Drain pending writes and release write ownership.
    pub fn close_wr(&self) -> Result<()> {
        assert!(self.open_for_write());
        self.sync()?;
        self.close()
    }
}

fn write_fully(backend: &dyn ZoneBackend, data: &[u8], mut wp: u64) -> Result<usize> {
    let mut off = 0;
    while off < data.len() {
        let n = backend.pwrite(&data[off..], wp)?;
        if n == 0 {
            return Err(Error::IO("write made no progress".to_string()));
        }
        wp += n as u64;
        off += n;
    }
    Ok(off)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatedOptions;
    use crate::zbd::emulated::EmulatedBackend;

    fn open_zone(dir: &tempfile::TempDir, idx: u64) -> (Arc<dyn ZoneBackend>, Zone) {
        let opts = EmulatedOptions::new(dir.path().join("zbd.img"));
        let backend: Arc<dyn ZoneBackend> =
            Arc::new(EmulatedBackend::open(&opts).expect("open emulated device"));
        let info = backend.info().clone();
        let report = backend
            .report_zones(idx * info.zone_size, info.zone_size)
            .expect("report");
        let zone = Zone::new(Arc::clone(&backend), &info, &report[0]);
        (backend, zone)
    }

    #[test]
    fn test_lifetime_diff() {
        use WriteLifeHint::*;
        assert_eq!(life_time_diff(NotSet, NotSet), 0);
        assert_eq!(life_time_diff(Medium, NotSet), LIFETIME_DIFF_NOT_GOOD);
        assert_eq!(life_time_diff(Medium, Medium), LIFETIME_DIFF_MEH);
        assert_eq!(life_time_diff(Extreme, Short), 3);
        assert_eq!(life_time_diff(Short, Long), LIFETIME_DIFF_NOT_GOOD);
    }

    #[test]
    fn test_append_advances_write_pointer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_backend, zone) = open_zone(&dir, 0);
        let cap = zone.capacity_left();

        zone.append(&[0x11u8; 8192]).expect("append failed");
        assert_eq!(zone.wp(), zone.start() + 8192);
        assert_eq!(zone.capacity_left(), cap - 8192);
        assert!(!zone.is_empty());
        assert!(!zone.is_full());
    }

    #[test]
    fn test_append_unaligned_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_backend, zone) = open_zone(&dir, 0);
        assert!(matches!(
            zone.append(&[0u8; 100]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_append_exact_capacity_then_no_space() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_backend, zone) = open_zone(&dir, 0);
        let cap = zone.capacity_left() as usize;

        zone.append(&vec![0xaau8; cap]).expect("fill failed");
        assert!(zone.is_full());
        assert!(matches!(
            zone.append(&[0u8; 4096]),
            Err(Error::NoSpace(_))
        ));
    }

    #[test]
    fn test_reset_restores_empty_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_backend, zone) = open_zone(&dir, 0);
        zone.append(&[1u8; 4096]).expect("append failed");
        zone.set_lifetime(WriteLifeHint::Short);

        zone.reset().expect("reset failed");
        assert!(zone.is_empty());
        assert_eq!(zone.capacity_left(), zone.max_capacity());
        assert_eq!(zone.lifetime(), WriteLifeHint::NotSet);
    }

    #[test]
    fn test_finish_pins_capacity_to_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_backend, zone) = open_zone(&dir, 1);
        zone.append(&[1u8; 4096]).expect("append failed");

        zone.finish().expect("finish failed");
        assert!(zone.is_full());
        assert_eq!(zone.capacity_left(), 0);
        assert_eq!(zone.wp(), zone.start() + 256 * 1024);
    }

    #[test]
    fn test_async_append_then_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (backend, zone) = open_zone(&dir, 0);

        zone.append_async(vec![0x5au8; 8192]).expect("submit failed");
        assert_eq!(zone.wp(), zone.start() + 8192);
        zone.sync().expect("sync failed");

        let mut out = vec![0u8; 8192];
        backend.pread(&mut out, zone.start(), false).expect("read");
        assert!(out.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn test_sync_without_inflight_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_backend, zone) = open_zone(&dir, 0);
        zone.sync().expect("sync failed");
        zone.sync().expect("sync failed");
    }
}
