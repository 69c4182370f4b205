//! The zoned block device: zone pools, capacity accounting, and the
//! lifetime-hint-aware active-zone allocator.

pub mod backend;
pub mod block;
pub mod emulated;
pub mod zone;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::MountOptions;
use crate::error::{Error, Result};
use crate::worker::BackgroundWorker;

use self::backend::{DeviceModel, ZoneBackend};
use self::zone::{life_time_diff, WriteLifeHint, Zone, ZoneSnapshot, LIFETIME_DIFF_NOT_GOOD};

/// Zones reserved for the op log. Two are needed to roll the log safely.
pub const OP_LOG_ZONES: usize = 2;
/// Zones reserved for metadata snapshots.
pub const SNAPSHOT_ZONES: usize = 2;
/// Minimum number of zones that makes sense.
pub const MIN_ZONES: u32 = 32;

/// Active zones reserved for the metadata writers, on top of the IO slots.
const RESERVED_META_ZONES: u32 = 3;

/// The active-zone slot array plus its counter, shared with the background
/// jobs that clear slots after a finish or reset.
struct ActiveSlots {
    slots: Mutex<Vec<Option<Arc<Zone>>>>,
    active_io_zones: AtomicU32,
}

/// Per-zone statistics for the admin interface. The file triples are filled
/// in by the filesystem layer, which owns the file map.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStat {
    pub start_position: u64,
    pub write_position: u64,
    pub total_capacity: u64,
    pub files: Vec<ZoneFileStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneFileStat {
    pub file_id: u64,
    pub filename: String,
    pub size_in_zone: u64,
}

/// All zone pools, for the diagnostic dump.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub op: Vec<ZoneSnapshot>,
    pub snapshot: Vec<ZoneSnapshot>,
    pub io: Vec<ZoneSnapshot>,
}

pub struct ZonedBlockDevice {
    backend: Arc<dyn ZoneBackend>,
    block_size: u64,
    zone_size: u64,
    nr_zones: u32,
    max_nr_active_io_zones: u32,
    finish_threshold: u32,
    op_zones: Vec<Arc<Zone>>,
    snapshot_zones: Vec<Arc<Zone>>,
    io_zones: Vec<Arc<Zone>>,
    /// Serialises IO-pool scans for lifetime matching. Lock order:
    /// `active.slots` first, then this. No other order is legal.
    io_zones_mtx: Mutex<()>,
    active: Arc<ActiveSlots>,
    wal_zone_allocating: AtomicU32,
    bg_recycling: AtomicU32,
    meta_worker: BackgroundWorker,
    data_worker: BackgroundWorker,
}

impl std::fmt::Debug for ZonedBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedBlockDevice")
            .field("block_size", &self.block_size)
            .field("zone_size", &self.zone_size)
            .field("nr_zones", &self.nr_zones)
            .finish()
    }
}

impl ZonedBlockDevice {
    /// Open the device: verify it is usable, read the zone report, and
    /// partition the sequential-write-required, non-offline zones in report
    /// order into the op-log, snapshot and IO pools. IO zones the report
    /// shows open or closed are adopted into the active-zone slots; open
    /// ones are closed first.
    pub fn open(backend: Arc<dyn ZoneBackend>, opts: &MountOptions) -> Result<Arc<Self>> {
        let info = backend.info().clone();

        if info.model != DeviceModel::HostManaged {
            return Err(Error::NotSupported(
                "not a host managed block device".to_string(),
            ));
        }
        if info.nr_zones < MIN_ZONES {
            return Err(Error::InvalidArgument(format!(
                "too few zones on zoned block device ({MIN_ZONES} required)"
            )));
        }
        if info.max_active_zones <= RESERVED_META_ZONES {
            return Err(Error::InvalidArgument(format!(
                "device must allow more than {RESERVED_META_ZONES} active zones"
            )));
        }
        let max_nr_active_io_zones = info.max_active_zones - RESERVED_META_ZONES;

        let report = backend.report_zones(0, u64::from(info.nr_zones) * info.zone_size)?;
        if report.len() != info.nr_zones as usize {
            return Err(Error::IO("failed to list zones".to_string()));
        }

        let mut op_zones = Vec::new();
        let mut snapshot_zones = Vec::new();
        let mut io_zones: Vec<Arc<Zone>> = Vec::new();
        let mut slots: Vec<Option<Arc<Zone>>> = vec![None; max_nr_active_io_zones as usize];
        let mut active_count: u32 = 0;

        let mut i = 0;
        let mut m = 0;
        // Only sequential-write-required zones are usable; offline ones
        // still consume a pool position so the layout is stable.
        while m < OP_LOG_ZONES && i < report.len() {
            let z = &report[i];
            i += 1;
            if z.is_sequential() {
                if !z.is_offline() {
                    op_zones.push(Arc::new(Zone::new(Arc::clone(&backend), &info, z)));
                }
                m += 1;
            }
        }

        m = 0;
        while m < SNAPSHOT_ZONES && i < report.len() {
            let z = &report[i];
            i += 1;
            if z.is_sequential() {
                if !z.is_offline() {
                    snapshot_zones.push(Arc::new(Zone::new(Arc::clone(&backend), &info, z)));
                }
                m += 1;
            }
        }

        for z in &report[i..] {
            if !z.is_sequential() || z.is_offline() {
                continue;
            }
            let zone = Arc::new(Zone::new(Arc::clone(&backend), &info, z));
            io_zones.push(Arc::clone(&zone));
            if z.is_open() || z.is_closed() {
                if (active_count as usize) < slots.len() {
                    slots[active_count as usize] = Some(Arc::clone(&zone));
                    active_count += 1;
                }
                if z.is_open() && !opts.readonly {
                    if let Err(e) = zone.close() {
                        tracing::warn!(zone = zone.start(), error = %e, "failed to close zone at open");
                    }
                }
            }
        }

        tracing::info!(
            nr_zones = info.nr_zones,
            max_active = info.max_active_zones,
            max_open = info.max_open_zones,
            io_zones = io_zones.len(),
            "opened zoned block device"
        );

        Ok(Arc::new(Self {
            backend,
            block_size: info.block_size,
            zone_size: info.zone_size,
            nr_zones: info.nr_zones,
            max_nr_active_io_zones,
            finish_threshold: opts.finish_threshold,
            op_zones,
            snapshot_zones,
            io_zones,
            io_zones_mtx: Mutex::new(()),
            active: Arc::new(ActiveSlots {
                slots: Mutex::new(slots),
                active_io_zones: AtomicU32::new(active_count),
            }),
            wal_zone_allocating: AtomicU32::new(0),
            bg_recycling: AtomicU32::new(0),
            meta_worker: BackgroundWorker::new(true),
            data_worker: BackgroundWorker::new(true),
        }))
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    pub fn nr_zones(&self) -> u32 {
        self.nr_zones
    }

    pub fn max_nr_active_io_zones(&self) -> u32 {
        self.max_nr_active_io_zones
    }

    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    pub fn op_zones(&self) -> &[Arc<Zone>] {
        &self.op_zones
    }

    pub fn snapshot_zones(&self) -> &[Arc<Zone>] {
        &self.snapshot_zones
    }

    pub fn active_io_zones(&self) -> u32 {
        self.active.active_io_zones.load(Ordering::SeqCst)
    }

    pub(crate) fn meta_worker(&self) -> &BackgroundWorker {
        &self.meta_worker
    }

    pub(crate) fn pread(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize> {
        self.backend.pread(buf, offset, direct)
    }

    /// The IO zone containing the given device offset.
    pub fn get_io_zone(&self, offset: u64) -> Option<Arc<Zone>> {
        self.io_zones
            .iter()
            .find(|z| z.start() <= offset && offset < z.start() + self.zone_size)
            .cloned()
    }

    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity_left()).sum()
    }

    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity() - z.used_capacity())
            .sum()
    }

    /// First empty op-log zone. Callers serialise through the metadata lock.
    pub fn allocate_meta_zone(&self) -> Option<Arc<Zone>> {
        self.op_zones.iter().find(|z| z.is_empty()).cloned()
    }

    /// First empty snapshot zone. Callers serialise through the metadata lock.
    pub fn allocate_snapshot_zone(&self) -> Option<Arc<Zone>> {
        self.snapshot_zones.iter().find(|z| z.is_empty()).cloned()
    }

    /// Reset every IO zone that holds no live data. Running this twice in a
    /// row resets nothing on the second pass.
    pub fn reset_unused_io_zones(&self) -> Result<()> {
        let mut slots = self.active.slots.lock()?;
        for z in &self.io_zones {
            if z.is_used() || z.is_empty() || z.bg_processing() {
                continue;
            }
            if let Err(e) = z.reset() {
                tracing::warn!(zone = z.start(), error = %e, "failed resetting zone");
                continue;
            }
            if let Some(idx) = slot_index(&slots, z) {
                slots[idx] = None;
                self.active.active_io_zones.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Hand out a zone open for writing, blocking until one is available.
    ///
    /// WAL requests scan the slot array from index 0 and take strict
    /// priority; non-WAL requests yield while any WAL allocation is in
    /// flight and scan from index 2. `full_zone` is the caller's previous
    /// active zone that just ran out of capacity; it is handed to the data
    /// worker for a background finish.
    ///
    /// Returns `NoSpace` only when a failed pass proves no slot can make
    /// progress.
    pub fn allocate_zone(
        &self,
        file_lifetime: WriteLifeHint,
        is_wal: bool,
        full_zone: Option<&Arc<Zone>>,
    ) -> Result<Arc<Zone>> {
        let start = if is_wal { 0 } else { 2 };
        loop {
            let got = if is_wal {
                self.wal_zone_allocating.fetch_add(1, Ordering::SeqCst);
                let r = self.get_active_zone(start, file_lifetime, full_zone);
                self.wal_zone_allocating.fetch_sub(1, Ordering::SeqCst);
                r?
            } else {
                while self.wal_zone_allocating.load(Ordering::SeqCst) != 0 {
                    std::thread::yield_now();
                }
                self.get_active_zone(start, file_lifetime, full_zone)?
            };

            if let Some(zone) = got {
                return Ok(zone);
            }
            if !self.can_progress(start)? {
                return Err(Error::NoSpace("out of io zones".to_string()));
            }
            std::thread::yield_now();
        }
    }

    /// One scan pass over the slot array starting at `start`.
    fn get_active_zone(
        &self,
        start: usize,
        file_lifetime: WriteLifeHint,
        full_zone: Option<&Arc<Zone>>,
    ) -> Result<Option<Arc<Zone>>> {
        let mut slots = self.active.slots.lock()?;

        if let Some(fz) = full_zone {
            if !fz.bg_processing() {
                if let Some(idx) = slot_index(&slots, fz) {
                    fz.set_open_for_write(false);
                    fz.set_bg_processing(true);
                    self.bg_finish_data_zone(Arc::clone(fz), idx);
                }
            }
        }

        for i in start..slots.len() {
            if let Some(z) = slots[i].clone() {
                if z.bg_processing() {
                    continue;
                }
                if !z.open_for_write() {
                    z.set_open_for_write(true);
                    return Ok(Some(z));
                }
            } else {
                let _pool = self.io_zones_mtx.lock()?;

                // Prefer the best lifetime match among partially-used
                // zones; fall back to an empty zone, stamping it with the
                // requester's hint.
                let mut allocated: Option<Arc<Zone>> = None;
                let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
                for z in &self.io_zones {
                    if z.open_for_write() || z.bg_processing() || in_slots(&slots, z) {
                        continue;
                    }
                    if z.used_capacity() > 0 && !z.is_full() {
                        let diff = life_time_diff(z.lifetime(), file_lifetime);
                        if diff <= best_diff {
                            allocated = Some(Arc::clone(z));
                            best_diff = diff;
                        }
                    }
                }
                if best_diff >= LIFETIME_DIFF_NOT_GOOD {
                    for z in &self.io_zones {
                        if z.open_for_write() || z.bg_processing() || in_slots(&slots, z) {
                            continue;
                        }
                        if z.is_empty() {
                            allocated = Some(Arc::clone(z));
                        }
                    }
                }

                if let Some(z) = allocated {
                    z.set_open_for_write(true);
                    z.set_lifetime(file_lifetime);
                    slots[i] = Some(Arc::clone(&z));
                    self.active.active_io_zones.fetch_add(1, Ordering::SeqCst);
                    if start != 0 {
                        self.trigger_bg_finish_and_reset(&slots);
                    }
                    return Ok(Some(z));
                }
                if start != 0 {
                    self.trigger_bg_finish_and_reset(&slots);
                }
            }
        }

        Ok(None)
    }

    /// True when a failed allocation pass could still succeed later: a slot
    /// in range is occupied (its zone will be released, finished or reset),
    /// or a null slot could be filled from the pool.
    fn can_progress(&self, start: usize) -> Result<bool> {
        let slots = self.active.slots.lock()?;
        let mut has_null = false;
        for slot in slots[start.min(slots.len())..].iter() {
            match slot {
                Some(_) => return Ok(true),
                None => has_null = true,
            }
        }
        if !has_null {
            return Ok(false);
        }

        let _pool = self.io_zones_mtx.lock()?;
        for z in &self.io_zones {
            if z.open_for_write() || z.bg_processing() || in_slots(&slots, z) {
                continue;
            }
            if z.is_empty() || (z.used_capacity() > 0 && !z.is_full()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Walk the slot array and queue a reset for every dead zone and a
    /// finish for every nearly-full one. A compare-and-swap gate keeps at
    /// most one sweep in flight.
    fn trigger_bg_finish_and_reset(&self, slots: &[Option<Arc<Zone>>]) {
        if self
            .bg_recycling
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        for (i, slot) in slots.iter().enumerate() {
            let Some(z) = slot else { continue };
            if z.bg_processing() {
                continue;
            }
            if z.open_for_write() || z.is_empty() || (z.is_full() && z.is_used()) {
                continue;
            }
            if !z.is_used() {
                z.set_bg_processing(true);
                self.bg_reset_data_zone(Arc::clone(z), i);
                continue;
            }
            if z.capacity_left() < z.max_capacity() * u64::from(self.finish_threshold) / 100 {
                z.set_bg_processing(true);
                self.bg_finish_data_zone(Arc::clone(z), i);
            }
        }

        self.bg_recycling.store(0, Ordering::SeqCst);
    }

    fn bg_reset_data_zone(&self, z: Arc<Zone>, idx: usize) {
        let active = Arc::clone(&self.active);
        self.data_worker.submit_job(move || {
            if let Err(e) = z.reset() {
                tracing::error!(zone = z.start(), error = %e, "failed to reset zone");
            }
            // Slot and counter move together under the lock so observers
            // never see them disagree.
            if let Ok(mut slots) = active.slots.lock() {
                slots[idx] = None;
                active.active_io_zones.fetch_sub(1, Ordering::SeqCst);
            }
            z.set_bg_processing(false);
        });
    }

    fn bg_finish_data_zone(&self, z: Arc<Zone>, idx: usize) {
        let active = Arc::clone(&self.active);
        self.data_worker.submit_job(move || {
            if let Err(e) = z.finish() {
                tracing::error!(zone = z.start(), error = %e, "failed to finish zone");
            }
            if let Ok(mut slots) = active.slots.lock() {
                slots[idx] = None;
                active.active_io_zones.fetch_sub(1, Ordering::SeqCst);
            }
            z.set_bg_processing(false);
        });
    }

    /// Per-zone statistics with the file triples left empty; the filesystem
    /// layer fills them from the file map.
    pub fn get_stat(&self) -> Vec<ZoneStat> {
        self.io_zones
            .iter()
            .map(|z| ZoneStat {
                start_position: z.start(),
                write_position: z.wp(),
                total_capacity: z.max_capacity(),
                files: Vec::new(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            op: self.op_zones.iter().map(|z| z.snapshot()).collect(),
            snapshot: self.snapshot_zones.iter().map(|z| z.snapshot()).collect(),
            io: self.io_zones.iter().map(|z| z.snapshot()).collect(),
        }
    }
}

fn slot_index(slots: &[Option<Arc<Zone>>], zone: &Arc<Zone>) -> Option<usize> {
    slots
        .iter()
        .position(|s| s.as_ref().is_some_and(|z| Arc::ptr_eq(z, zone)))
}

fn in_slots(slots: &[Option<Arc<Zone>>], zone: &Arc<Zone>) -> bool {
    slot_index(slots, zone).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatedOptions;
    use super::emulated::EmulatedBackend;
    use std::time::{Duration, Instant};

    fn open_device(dir: &tempfile::TempDir, opts: EmulatedOptions) -> Arc<ZonedBlockDevice> {
        open_device_with(dir, opts, MountOptions::default())
    }

    fn open_device_with(
        _dir: &tempfile::TempDir,
        opts: EmulatedOptions,
        mount: MountOptions,
    ) -> Arc<ZonedBlockDevice> {
        let backend: Arc<dyn ZoneBackend> =
            Arc::new(EmulatedBackend::open(&opts).expect("open emulated device"));
        ZonedBlockDevice::open(backend, &mount).expect("open device")
    }

    fn default_opts(dir: &tempfile::TempDir) -> EmulatedOptions {
        EmulatedOptions::new(dir.path().join("zbd.img"))
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_open_partitions_pools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        assert_eq!(zbd.op_zones().len(), OP_LOG_ZONES);
        assert_eq!(zbd.snapshot_zones().len(), SNAPSHOT_ZONES);
        assert_eq!(zbd.io_zones().len(), 40 - OP_LOG_ZONES - SNAPSHOT_ZONES);
        // IO zones start after the reserved pools.
        assert_eq!(zbd.io_zones()[0].start(), 4 * 256 * 1024);
        assert_eq!(zbd.active_io_zones(), 0);
    }

    #[test]
    fn test_open_skips_offline_pool_zones() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Zone 1 is an op-log position gone offline; zone 10 is a dead IO zone.
        let opts = default_opts(&dir).offline_zones(vec![1, 10]);
        let zbd = open_device(&dir, opts);

        assert_eq!(zbd.op_zones().len(), 1);
        assert_eq!(zbd.snapshot_zones().len(), SNAPSHOT_ZONES);
        assert_eq!(zbd.io_zones().len(), 40 - 4 - 1);
    }

    #[test]
    fn test_open_rejects_too_few_zones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = default_opts(&dir).nr_zones(8);
        let backend: Arc<dyn ZoneBackend> =
            Arc::new(EmulatedBackend::open(&opts).expect("open emulated device"));
        let err = ZonedBlockDevice::open(backend, &MountOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_meta_and_snapshot_zone_allocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        // First-empty selection; callers serialise through the metadata
        // lock.
        let meta = zbd.allocate_meta_zone().expect("no meta zone");
        assert!(Arc::ptr_eq(&meta, &zbd.op_zones()[0]));
        meta.append(&[0u8; 4096]).expect("append failed");
        let next = zbd.allocate_meta_zone().expect("no meta zone");
        assert!(Arc::ptr_eq(&next, &zbd.op_zones()[1]));

        let snap = zbd.allocate_snapshot_zone().expect("no snapshot zone");
        assert!(Arc::ptr_eq(&snap, &zbd.snapshot_zones()[0]));
    }

    #[test]
    fn test_capacity_accounting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));
        let cap = 192 * 1024u64;
        let io = zbd.io_zones().len() as u64;

        assert_eq!(zbd.free_space(), io * cap);
        assert_eq!(zbd.used_space(), 0);
        assert_eq!(zbd.reclaimable_space(), 0);

        // Fill one zone; half of it is live data.
        let z = &zbd.io_zones()[0];
        z.append(&vec![0u8; cap as usize]).expect("fill failed");
        z.add_used(cap / 2);

        assert_eq!(zbd.free_space(), (io - 1) * cap);
        assert_eq!(zbd.used_space(), cap / 2);
        assert_eq!(zbd.reclaimable_space(), cap / 2);
    }

    #[test]
    fn test_allocate_zone_prefers_lifetime_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        // A short-lived full zone and a medium-lived partial zone.
        let z0 = Arc::clone(&zbd.io_zones()[0]);
        z0.set_lifetime(WriteLifeHint::Short);
        z0.append(&vec![0u8; 192 * 1024]).expect("fill failed");
        z0.add_used(64 * 1024);

        let z1 = Arc::clone(&zbd.io_zones()[1]);
        z1.set_lifetime(WriteLifeHint::Medium);
        z1.append(&vec![0u8; 64 * 1024]).expect("append failed");
        z1.add_used(64 * 1024);

        let got = zbd
            .allocate_zone(WriteLifeHint::Medium, false, None)
            .expect("allocation failed");
        assert!(Arc::ptr_eq(&got, &z1));
        assert!(got.open_for_write());
        assert_eq!(zbd.active_io_zones(), 1);
    }

    #[test]
    fn test_allocate_zone_falls_back_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        let got = zbd
            .allocate_zone(WriteLifeHint::Long, false, None)
            .expect("allocation failed");
        assert!(got.is_empty());
        assert_eq!(got.lifetime(), WriteLifeHint::Long);
        assert_eq!(zbd.active_io_zones(), 1);
    }

    #[test]
    fn test_wal_and_non_wal_use_disjoint_slot_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        let wal = zbd
            .allocate_zone(WriteLifeHint::Short, true, None)
            .expect("wal allocation failed");
        let data = zbd
            .allocate_zone(WriteLifeHint::Medium, false, None)
            .expect("data allocation failed");

        let slots = zbd.active.slots.lock().unwrap();
        assert!(Arc::ptr_eq(slots[0].as_ref().unwrap(), &wal));
        assert!(Arc::ptr_eq(slots[2].as_ref().unwrap(), &data));
        assert!(slots[1].is_none());
    }

    #[test]
    fn test_allocate_zone_no_space_when_pool_exhausted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        for z in zbd.io_zones() {
            z.append(&vec![0u8; 192 * 1024]).expect("fill failed");
            z.add_used(4096);
        }

        let err = zbd
            .allocate_zone(WriteLifeHint::Medium, false, None)
            .unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
    }

    #[test]
    fn test_full_zone_is_finished_in_background() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        let z = zbd
            .allocate_zone(WriteLifeHint::Medium, false, None)
            .expect("allocation failed");
        z.append(&vec![0u8; 192 * 1024]).expect("fill failed");
        z.add_used(192 * 1024);
        assert!(z.is_full());

        let replacement = zbd
            .allocate_zone(WriteLifeHint::Medium, false, Some(&z))
            .expect("replacement allocation failed");
        assert!(!Arc::ptr_eq(&replacement, &z));

        wait_for(|| !z.bg_processing());
        assert!(!z.open_for_write());
        assert_eq!(z.capacity_left(), 0);
        wait_for(|| {
            let slots = zbd.active.slots.lock().unwrap();
            !in_slots(&slots, &z)
        });
        assert_eq!(zbd.active_io_zones(), 1);
    }

    #[test]
    fn test_reset_unused_io_zones_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        // One dead zone (data written, nothing live) and one live zone.
        // Both are allocated up front so the second request cannot reuse
        // the first zone's slot.
        let dead = zbd
            .allocate_zone(WriteLifeHint::Medium, false, None)
            .expect("allocation failed");
        let live = zbd
            .allocate_zone(WriteLifeHint::Medium, false, None)
            .expect("allocation failed");
        assert!(!Arc::ptr_eq(&dead, &live));

        dead.append(&[1u8; 8192]).expect("append failed");
        dead.close_wr().expect("close failed");

        live.append(&[1u8; 8192]).expect("append failed");
        live.add_used(8192);
        live.close_wr().expect("close failed");

        zbd.reset_unused_io_zones().expect("reset sweep failed");
        assert!(dead.is_empty());
        assert!(!live.is_empty());
        assert_eq!(zbd.active_io_zones(), 1);

        // Second run finds nothing else to reset.
        zbd.reset_unused_io_zones().expect("reset sweep failed");
        assert_eq!(zbd.active_io_zones(), 1);
        assert!(!live.is_empty());
    }

    #[test]
    fn test_concurrent_wal_and_data_allocations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir, default_opts(&dir));

        let mut handles = Vec::new();
        for i in 0..6 {
            let zbd = Arc::clone(&zbd);
            handles.push(std::thread::spawn(move || {
                let is_wal = i % 3 == 0;
                let z = zbd
                    .allocate_zone(WriteLifeHint::Medium, is_wal, None)
                    .expect("allocation failed");
                z.append(&[0u8; 4096]).expect("append failed");
                z.close_wr().expect("close failed");
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }

        let slots = zbd.active.slots.lock().unwrap();
        let non_null = slots.iter().flatten().count() as u32;
        assert_eq!(non_null, zbd.active_io_zones());
    }
}
