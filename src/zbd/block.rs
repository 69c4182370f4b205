//! Backend for a real host-managed block device.
//!
//! The device is opened three ways: buffered read, direct read, and (unless
//! read-only) direct exclusive write. Geometry and limits come from sysfs;
//! zone transitions go through the kernel's zoned block ioctls.

use std::fs::File;
use std::mem;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::backend::{DeviceInfo, DeviceModel, ZoneBackend, ZoneCond, ZoneInfo, ZoneType};

const SECTOR_SIZE: u64 = 512;

// Kernel ABI from include/uapi/linux/blkzoned.h.
#[repr(C)]
#[derive(Clone, Copy)]
struct BlkZone {
    start: u64,
    len: u64,
    wp: u64,
    zone_type: u8,
    cond: u8,
    non_seq: u8,
    reset: u8,
    resv: [u8; 4],
    capacity: u64,
    reserved: [u8; 24],
}

#[repr(C)]
struct BlkZoneReport {
    sector: u64,
    nr_zones: u32,
    flags: u32,
}

#[repr(C)]
struct BlkZoneRange {
    sector: u64,
    nr_sectors: u64,
}

const BLK_ZONE_TYPE_CONVENTIONAL: u8 = 0x1;
const BLK_ZONE_TYPE_SEQWRITE_REQ: u8 = 0x2;

const BLK_ZONE_COND_NOT_WP: u8 = 0x0;
const BLK_ZONE_COND_EMPTY: u8 = 0x1;
const BLK_ZONE_COND_IMP_OPEN: u8 = 0x2;
const BLK_ZONE_COND_EXP_OPEN: u8 = 0x3;
const BLK_ZONE_COND_CLOSED: u8 = 0x4;
const BLK_ZONE_COND_READONLY: u8 = 0xd;
const BLK_ZONE_COND_FULL: u8 = 0xe;

const BLK_ZONE_REP_CAPACITY: u32 = 1;

nix::ioctl_readwrite!(blk_report_zones, 0x12, 130, BlkZoneReport);
nix::ioctl_write_ptr!(blk_reset_zone, 0x12, 131, BlkZoneRange);
nix::ioctl_write_ptr!(blk_close_zone, 0x12, 135, BlkZoneRange);
nix::ioctl_write_ptr!(blk_finish_zone, 0x12, 136, BlkZoneRange);

pub struct BlockDeviceBackend {
    path: PathBuf,
    info: DeviceInfo,
    read_f: File,
    read_direct_f: File,
    write_f: Option<File>,
}

impl BlockDeviceBackend {
    /// Open `/dev/<name>` and probe its zoned geometry.
    ///
    /// Fails with `InvalidArgument` when the device's I/O scheduler is not
    /// `mq-deadline`, which the zoned write path depends on.
    pub fn open(path: impl AsRef<Path>, readonly: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArgument(format!("bad device path: {path:?}")))?
            .to_string();

        let read_f = File::options().read(true).open(&path)?;
        let read_direct_f = File::options()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(&path)?;
        let write_f = if readonly {
            None
        } else {
            Some(
                File::options()
                    .write(true)
                    .custom_flags(libc::O_DIRECT | libc::O_EXCL)
                    .open(&path)?,
            )
        };

        let model = match read_queue_attr(&name, "zoned")?.as_str() {
            "host-managed" => DeviceModel::HostManaged,
            "host-aware" => DeviceModel::HostAware,
            _ => DeviceModel::Conventional,
        };

        let scheduler = read_queue_attr(&name, "scheduler")?;
        if !scheduler_is_mq_deadline(&scheduler) {
            return Err(Error::InvalidArgument(
                "I/O scheduler is not mq-deadline, set it to mq-deadline".to_string(),
            ));
        }

        let block_size: u64 = parse_queue_attr(&name, "physical_block_size")?;
        let zone_size = parse_queue_attr::<u64>(&name, "chunk_sectors")? * SECTOR_SIZE;
        let nr_zones: u32 = parse_queue_attr(&name, "nr_zones")?;
        let max_active_zones = parse_queue_attr(&name, "max_active_zones").unwrap_or(0);
        let max_open_zones = parse_queue_attr(&name, "max_open_zones").unwrap_or(0);

        let info = DeviceInfo {
            block_size,
            zone_size,
            nr_zones,
            max_active_zones,
            max_open_zones,
            model,
        };

        Ok(Self {
            path,
            info,
            read_f,
            read_direct_f,
            write_f,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_fd(&self) -> Result<&File> {
        self.write_f
            .as_ref()
            .ok_or_else(|| Error::IO("device opened read-only".to_string()))
    }

    fn zone_range(&self, start: u64) -> BlkZoneRange {
        BlkZoneRange {
            sector: start / SECTOR_SIZE,
            nr_sectors: self.info.zone_size / SECTOR_SIZE,
        }
    }
}

impl ZoneBackend for BlockDeviceBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn report_zones(&self, start: u64, len: u64) -> Result<Vec<ZoneInfo>> {
        let nr = (len / self.info.zone_size).max(1) as usize;
        let bytes = mem::size_of::<BlkZoneReport>() + nr * mem::size_of::<BlkZone>();
        // u64 storage keeps the report header and zone array 8-byte aligned.
        let mut buf: Vec<u64> = vec![0; bytes.div_ceil(8)];
        let hdr = buf.as_mut_ptr() as *mut BlkZoneReport;

        let (reported, flags) = unsafe {
            (*hdr).sector = start / SECTOR_SIZE;
            (*hdr).nr_zones = nr as u32;
            (*hdr).flags = 0;
            blk_report_zones(self.read_f.as_raw_fd(), hdr)
                .map_err(|e| Error::IO(format!("zone report failed: {e}")))?;
            ((*hdr).nr_zones as usize, (*hdr).flags)
        };

        let mut zones = Vec::with_capacity(reported);
        let first = unsafe { (hdr as *const u8).add(mem::size_of::<BlkZoneReport>()) }
            as *const BlkZone;
        for i in 0..reported.min(nr) {
            let z = unsafe { *first.add(i) };
            let len_bytes = z.len * SECTOR_SIZE;
            let capacity = if flags & BLK_ZONE_REP_CAPACITY != 0 {
                z.capacity * SECTOR_SIZE
            } else {
                len_bytes
            };
            zones.push(ZoneInfo {
                start: z.start * SECTOR_SIZE,
                len: len_bytes,
                capacity,
                wp: z.wp * SECTOR_SIZE,
                zone_type: match z.zone_type {
                    BLK_ZONE_TYPE_CONVENTIONAL => ZoneType::Conventional,
                    BLK_ZONE_TYPE_SEQWRITE_REQ => ZoneType::SequentialWriteRequired,
                    _ => ZoneType::SequentialWritePreferred,
                },
                cond: match z.cond {
                    BLK_ZONE_COND_NOT_WP => ZoneCond::NotWp,
                    BLK_ZONE_COND_EMPTY => ZoneCond::Empty,
                    BLK_ZONE_COND_IMP_OPEN => ZoneCond::ImplicitOpen,
                    BLK_ZONE_COND_EXP_OPEN => ZoneCond::ExplicitOpen,
                    BLK_ZONE_COND_CLOSED => ZoneCond::Closed,
                    BLK_ZONE_COND_READONLY => ZoneCond::ReadOnly,
                    BLK_ZONE_COND_FULL => ZoneCond::Full,
                    _ => ZoneCond::Offline,
                },
            });
        }
        Ok(zones)
    }

    fn reset_zone(&self, start: u64) -> Result<()> {
        let range = self.zone_range(start);
        unsafe { blk_reset_zone(self.write_fd()?.as_raw_fd(), &range) }
            .map_err(|e| Error::IO(format!("zone reset failed: {e}")))?;
        Ok(())
    }

    fn finish_zone(&self, start: u64) -> Result<()> {
        let range = self.zone_range(start);
        unsafe { blk_finish_zone(self.write_fd()?.as_raw_fd(), &range) }
            .map_err(|e| Error::IO(format!("zone finish failed: {e}")))?;
        Ok(())
    }

    fn close_zone(&self, start: u64) -> Result<()> {
        let range = self.zone_range(start);
        unsafe { blk_close_zone(self.write_fd()?.as_raw_fd(), &range) }
            .map_err(|e| Error::IO(format!("zone close failed: {e}")))?;
        Ok(())
    }

    fn pread(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize> {
        let f = if direct { &self.read_direct_f } else { &self.read_f };
        loop {
            match f.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let f = self.write_fd()?;
        loop {
            match f.write_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn sysfs_queue_path(name: &str, attr: &str) -> PathBuf {
    PathBuf::from(format!("/sys/block/{name}/queue/{attr}"))
}

fn read_queue_attr(name: &str, attr: &str) -> Result<String> {
    let path = sysfs_queue_path(name, attr);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::InvalidArgument(format!("failed to read {path:?}: {e}")))?;
    Ok(raw.trim().to_string())
}

fn parse_queue_attr<T: std::str::FromStr>(name: &str, attr: &str) -> Result<T> {
    let raw = read_queue_attr(name, attr)?;
    raw.parse()
        .map_err(|_| Error::InvalidArgument(format!("bad value in queue/{attr}: {raw}")))
}

/// The active scheduler is the bracketed entry of the sysfs scheduler list.
fn scheduler_is_mq_deadline(contents: &str) -> bool {
    contents.contains("[mq-deadline]")
}
