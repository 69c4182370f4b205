//! Zone emulation over a plain backing file.
//!
//! Keeps a zone table (write pointer + condition per zone) next to the data
//! file, enforces sequential writes at the write pointer, and persists the
//! table as JSON after every state change so a reopened device sees the same
//! zones. Intended for tests and development on machines without a
//! host-managed device.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::EmulatedOptions;
use crate::error::{Error, Result};
use crate::flock::FileLock;

use super::backend::{DeviceInfo, DeviceModel, ZoneBackend, ZoneCond, ZoneInfo, ZoneType};

#[derive(Debug, Clone, Copy)]
struct EmuZone {
    start: u64,
    capacity: u64,
    wp: u64,
    cond: ZoneCond,
}

/// The zone table as written to the sidecar file. Conditions are derived
/// from the relative write pointer on load: 0 is empty, capacity is full,
/// anything in between is closed.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    zone_size: u64,
    zone_capacity: u64,
    wptrs: Vec<u64>,
    offline: Vec<u32>,
}

pub struct EmulatedBackend {
    file: File,
    info: DeviceInfo,
    zone_capacity: u64,
    zones: Mutex<Vec<EmuZone>>,
    state_path: PathBuf,
    _lock: FileLock,
}

impl EmulatedBackend {
    pub fn open(opts: &EmulatedOptions) -> Result<Self> {
        if opts.zone_capacity > opts.zone_size {
            return Err(Error::InvalidArgument(
                "zone capacity exceeds zone size".to_string(),
            ));
        }
        if opts.zone_capacity % opts.block_size != 0 || opts.zone_size % opts.block_size != 0 {
            return Err(Error::InvalidArgument(
                "zone geometry not block aligned".to_string(),
            ));
        }

        let mut lock_path = opts.path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock = FileLock::lock(PathBuf::from(lock_path))?;

        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&opts.path)?;
        file.set_len(u64::from(opts.nr_zones) * opts.zone_size)?;

        let mut state_path = opts.path.as_os_str().to_owned();
        state_path.push(".zones");
        let state_path = PathBuf::from(state_path);

        let zones = if state_path.exists() {
            Self::load_state(&state_path, opts)?
        } else {
            (0..opts.nr_zones)
                .map(|i| {
                    let start = u64::from(i) * opts.zone_size;
                    let offline = opts.offline_zones.contains(&i);
                    EmuZone {
                        start,
                        capacity: if offline { 0 } else { opts.zone_capacity },
                        wp: start,
                        cond: if offline {
                            ZoneCond::Offline
                        } else {
                            ZoneCond::Empty
                        },
                    }
                })
                .collect()
        };

        let info = DeviceInfo {
            block_size: opts.block_size,
            zone_size: opts.zone_size,
            nr_zones: opts.nr_zones,
            max_active_zones: opts.max_active_zones,
            max_open_zones: opts.max_open_zones,
            model: DeviceModel::HostManaged,
        };

        let backend = Self {
            file,
            info,
            zone_capacity: opts.zone_capacity,
            zones: Mutex::new(zones),
            state_path,
            _lock: lock,
        };
        backend.persist_state()?;
        Ok(backend)
    }

    fn load_state(state_path: &PathBuf, opts: &EmulatedOptions) -> Result<Vec<EmuZone>> {
        let raw = std::fs::read_to_string(state_path)?;
        let state: PersistedState = serde_json::from_str(&raw)
            .map_err(|e| Error::Corruption(format!("bad zone table: {e}")))?;
        if state.zone_size != opts.zone_size
            || state.zone_capacity != opts.zone_capacity
            || state.wptrs.len() != opts.nr_zones as usize
        {
            return Err(Error::InvalidArgument(
                "zone table does not match device geometry".to_string(),
            ));
        }

        Ok(state
            .wptrs
            .iter()
            .enumerate()
            .map(|(i, &rel_wp)| {
                let start = i as u64 * opts.zone_size;
                if state.offline.contains(&(i as u32)) {
                    EmuZone {
                        start,
                        capacity: 0,
                        wp: start,
                        cond: ZoneCond::Offline,
                    }
                } else {
                    EmuZone {
                        start,
                        capacity: opts.zone_capacity,
                        wp: start + rel_wp,
                        cond: if rel_wp == 0 {
                            ZoneCond::Empty
                        } else if rel_wp >= opts.zone_capacity {
                            ZoneCond::Full
                        } else {
                            ZoneCond::Closed
                        },
                    }
                }
            })
            .collect())
    }

    fn persist_state(&self) -> Result<()> {
        let zones = self.zones.lock()?;
        let state = PersistedState {
            zone_size: self.info.zone_size,
            zone_capacity: self.zone_capacity,
            wptrs: zones.iter().map(|z| z.wp - z.start).collect(),
            offline: zones
                .iter()
                .enumerate()
                .filter(|(_, z)| z.cond == ZoneCond::Offline)
                .map(|(i, _)| i as u32)
                .collect(),
        };
        drop(zones);
        let raw = serde_json::to_string(&state)
            .map_err(|e| Error::IO(format!("failed to encode zone table: {e}")))?;
        std::fs::write(&self.state_path, raw)?;
        Ok(())
    }

    fn zone_index(&self, start: u64) -> Result<usize> {
        if start % self.info.zone_size != 0 || start >= u64::from(self.info.nr_zones) * self.info.zone_size {
            return Err(Error::InvalidArgument(format!(
                "offset {start} is not a zone start"
            )));
        }
        Ok((start / self.info.zone_size) as usize)
    }
}

impl ZoneBackend for EmulatedBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn report_zones(&self, start: u64, len: u64) -> Result<Vec<ZoneInfo>> {
        let zones = self.zones.lock()?;
        Ok(zones
            .iter()
            .filter(|z| z.start >= start && z.start < start.saturating_add(len))
            .map(|z| ZoneInfo {
                start: z.start,
                len: self.info.zone_size,
                capacity: z.capacity,
                wp: z.wp,
                zone_type: ZoneType::SequentialWriteRequired,
                cond: z.cond,
            })
            .collect())
    }

    fn reset_zone(&self, start: u64) -> Result<()> {
        let idx = self.zone_index(start)?;
        {
            let mut zones = self.zones.lock()?;
            let z = &mut zones[idx];
            if z.cond == ZoneCond::Offline {
                return Err(Error::IO("zone is offline".to_string()));
            }
            z.wp = z.start;
            z.cond = ZoneCond::Empty;
        }
        self.persist_state()
    }

    fn finish_zone(&self, start: u64) -> Result<()> {
        let idx = self.zone_index(start)?;
        {
            let mut zones = self.zones.lock()?;
            let z = &mut zones[idx];
            if z.cond == ZoneCond::Offline {
                return Err(Error::IO("zone is offline".to_string()));
            }
            z.wp = z.start + z.capacity;
            z.cond = ZoneCond::Full;
        }
        self.persist_state()
    }

    fn close_zone(&self, start: u64) -> Result<()> {
        let idx = self.zone_index(start)?;
        {
            let mut zones = self.zones.lock()?;
            let z = &mut zones[idx];
            if matches!(z.cond, ZoneCond::ImplicitOpen | ZoneCond::ExplicitOpen) {
                z.cond = ZoneCond::Closed;
            }
        }
        self.persist_state()
    }

    fn pread(&self, buf: &mut [u8], offset: u64, _direct: bool) -> Result<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let idx = (offset / self.info.zone_size) as usize;
        let written;
        {
            let mut zones = self.zones.lock()?;
            let z = zones
                .get_mut(idx)
                .ok_or_else(|| Error::InvalidArgument(format!("write beyond device: {offset}")))?;
            if matches!(z.cond, ZoneCond::Offline | ZoneCond::ReadOnly) {
                return Err(Error::IO("zone not writable".to_string()));
            }
            if offset != z.wp {
                return Err(Error::IO(format!(
                    "write at {offset} does not match write pointer {}",
                    z.wp
                )));
            }
            if offset + buf.len() as u64 > z.start + z.capacity {
                return Err(Error::IO("write beyond zone capacity".to_string()));
            }

            written = loop {
                match self.file.write_at(buf, offset) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            z.wp += written as u64;
            z.cond = if z.wp == z.start + z.capacity {
                ZoneCond::Full
            } else {
                ZoneCond::ImplicitOpen
            };
        }
        self.persist_state()?;
        Ok(written)
    }
}
