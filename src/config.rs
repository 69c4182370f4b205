use std::path::PathBuf;

/// Configuration for mounting a filesystem on a zoned block device.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Open the device read-only (default: false)
    pub readonly: bool,

    /// Background-finish a slot zone once its remaining capacity drops below
    /// this percentage of its max capacity. 0 disables opportunistic
    /// finishing; dead zones are still background-reset. (default: 0)
    pub finish_threshold: u32,

    /// Roll the op log to a fresh zone once the active log zone has less
    /// than this many bytes left (default: 128 KiB)
    pub roll_threshold: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            finish_threshold: 0,
            roll_threshold: 128 * 1024,
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the device read-only
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Set the background-finish threshold percentage
    pub fn finish_threshold(mut self, percent: u32) -> Self {
        self.finish_threshold = percent;
        self
    }

    /// Set the op-log roll threshold in bytes
    pub fn roll_threshold(mut self, bytes: u64) -> Self {
        self.roll_threshold = bytes;
        self
    }
}

/// Geometry of an emulated zoned device backed by a plain file.
#[derive(Debug, Clone)]
pub struct EmulatedOptions {
    /// Path of the backing file
    pub path: PathBuf,

    /// Number of zones (default: 40)
    pub nr_zones: u32,

    /// Zone size in bytes (default: 256 KiB)
    pub zone_size: u64,

    /// Usable capacity per zone; must not exceed the zone size
    /// (default: 192 KiB)
    pub zone_capacity: u64,

    /// Block size in bytes (default: 4096)
    pub block_size: u64,

    /// Device max-active-zones limit (default: 13)
    pub max_active_zones: u32,

    /// Device max-open-zones limit (default: 13)
    pub max_open_zones: u32,

    /// Zone indexes reported as offline (default: none)
    pub offline_zones: Vec<u32>,
}

impl EmulatedOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nr_zones: 40,
            zone_size: 256 * 1024,
            zone_capacity: 192 * 1024,
            block_size: 4096,
            max_active_zones: 13,
            max_open_zones: 13,
            offline_zones: Vec::new(),
        }
    }

    /// Set the number of zones
    pub fn nr_zones(mut self, nr_zones: u32) -> Self {
        self.nr_zones = nr_zones;
        self
    }

    /// Set the zone size in bytes
    pub fn zone_size(mut self, bytes: u64) -> Self {
        self.zone_size = bytes;
        self
    }

    /// Set the usable capacity per zone in bytes
    pub fn zone_capacity(mut self, bytes: u64) -> Self {
        self.zone_capacity = bytes;
        self
    }

    /// Set the block size in bytes
    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set the max-active-zones limit
    pub fn max_active_zones(mut self, n: u32) -> Self {
        self.max_active_zones = n;
        self
    }

    /// Set the max-open-zones limit
    pub fn max_open_zones(mut self, n: u32) -> Self {
        self.max_open_zones = n;
        self
    }

    /// Mark zone indexes as offline
    pub fn offline_zones(mut self, zones: Vec<u32>) -> Self {
        self.offline_zones = zones;
        self
    }
}
