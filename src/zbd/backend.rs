//! Access to a zoned block device: zone report, zone state transitions, and
//! positioned reads/writes.
//!
//! Two implementations exist: [`super::block::BlockDeviceBackend`] drives a
//! real host-managed device through the kernel's zoned ioctls, and
//! [`super::emulated::EmulatedBackend`] emulates zones over a plain file for
//! tests and development.

use serde::Serialize;

use crate::error::Result;

/// Zoned model reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceModel {
    HostManaged,
    HostAware,
    Conventional,
}

/// Per-zone condition, as in the kernel zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZoneCond {
    /// Conventional zone without a write pointer
    NotWp,
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    ReadOnly,
    Full,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZoneType {
    Conventional,
    SequentialWriteRequired,
    SequentialWritePreferred,
}

/// One entry of a zone report. All offsets and sizes are in bytes.
#[derive(Debug, Clone, Copy)]
pub struct ZoneInfo {
    /// Device byte offset of the zone
    pub start: u64,
    /// Zone size
    pub len: u64,
    /// Usable capacity when empty; at most `len`
    pub capacity: u64,
    /// Write pointer position
    pub wp: u64,
    pub zone_type: ZoneType,
    pub cond: ZoneCond,
}

impl ZoneInfo {
    pub fn is_sequential(&self) -> bool {
        self.zone_type == ZoneType::SequentialWriteRequired
    }

    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCond::Offline
    }

    pub fn is_readonly(&self) -> bool {
        self.cond == ZoneCond::ReadOnly
    }

    pub fn is_full(&self) -> bool {
        self.cond == ZoneCond::Full
    }

    pub fn is_open(&self) -> bool {
        matches!(self.cond, ZoneCond::ImplicitOpen | ZoneCond::ExplicitOpen)
    }

    pub fn is_closed(&self) -> bool {
        self.cond == ZoneCond::Closed
    }
}

/// Static device geometry and limits.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub block_size: u64,
    pub zone_size: u64,
    pub nr_zones: u32,
    pub max_active_zones: u32,
    pub max_open_zones: u32,
    pub model: DeviceModel,
}

/// Raw zone operations against some zoned storage.
///
/// Implementations retry reads and writes interrupted by `EINTR`; a short
/// return therefore only means the request went past readable data or was
/// split by the backend.
pub trait ZoneBackend: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Report all zones whose start offset falls in `[start, start + len)`.
    fn report_zones(&self, start: u64, len: u64) -> Result<Vec<ZoneInfo>>;

    /// Reset the write pointer of the zone starting at `start`.
    fn reset_zone(&self, start: u64) -> Result<()>;

    /// Transition the zone starting at `start` to full.
    fn finish_zone(&self, start: u64) -> Result<()>;

    /// Close an open zone.
    fn close_zone(&self, start: u64) -> Result<()>;

    /// Positioned read. `direct` selects the O_DIRECT descriptor where the
    /// backend has one; callers must pass block-aligned sizes with it.
    fn pread(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize>;

    /// Positioned write at `offset`, which must equal the write pointer of
    /// the containing zone.
    fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize>;
}
