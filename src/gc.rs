//! Garbage collection: compact the live extents of full zones onto fresh
//! destination zones, rewrite the owning files' extent pointers, persist
//! their metadata, and only then reset the drained source zones.
//!
//! A crash before the persist step leaves every file pointing at its old
//! extents in the still-valid source zones; a crash after it loses only
//! destination bytes that no file references yet.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::file::ZoneFile;
use crate::io::{AlignedBuffer, MetadataWriter};
use crate::zbd::zone::Zone;
use crate::zbd::ZonedBlockDevice;

pub type FileMap = HashMap<String, Arc<RwLock<ZoneFile>>>;

/// Outcome of one collection run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub extents_moved: usize,
    pub bytes_moved: u64,
    pub zones_reset: usize,
}

struct GcExtent {
    file_id: u64,
    extent_idx: usize,
    start: u64,
    length: u32,
    src_zone: Arc<Zone>,
    /// Filled during pack: new device offset and destination zone.
    dst: Option<(u64, Arc<Zone>)>,
}

pub struct GcWorker {
    zbd: Arc<ZonedBlockDevice>,
    files: Arc<Mutex<FileMap>>,
    metadata_writer: Arc<dyn MetadataWriter>,
}

impl GcWorker {
    pub fn new(
        zbd: Arc<ZonedBlockDevice>,
        files: Arc<Mutex<FileMap>>,
        metadata_writer: Arc<dyn MetadataWriter>,
    ) -> Self {
        Self {
            zbd,
            files,
            metadata_writer,
        }
    }

    /// Collect the live extents out of `src_zones` (full) into `dst_zones`
    /// (chosen by the caller: active or empty, same lifetime class).
    pub fn run(&self, src_zones: &[Arc<Zone>], dst_zones: &[Arc<Zone>]) -> Result<GcStats> {
        let src_set: HashSet<u64> = src_zones.iter().map(|z| z.start()).collect();

        let (mut work, touched) = self.scan(&src_set)?;
        let mut stats = GcStats::default();

        if !work.is_empty() {
            // Largest extents first, so one buffer sized to the first
            // entry fits them all.
            work.sort_by(|a, b| b.length.cmp(&a.length));
            self.pack(&mut work, dst_zones)?;
            self.persist(&work, &touched)?;

            stats.extents_moved = work.len();
            stats.bytes_moved = work.iter().map(|w| u64::from(w.length)).sum();
        }

        for zone in src_zones {
            if zone.is_used() {
                tracing::warn!(zone = zone.start(), "source zone still referenced, skipping reset");
                continue;
            }
            if zone.is_empty() {
                continue;
            }
            match zone.reset() {
                Ok(()) => stats.zones_reset += 1,
                Err(e) => {
                    tracing::warn!(zone = zone.start(), error = %e, "failed resetting zone after gc")
                }
            }
        }

        tracing::debug!(
            extents = stats.extents_moved,
            bytes = stats.bytes_moved,
            zones_reset = stats.zones_reset,
            "gc run complete"
        );
        Ok(stats)
    }

    /// Walk every file under the map lock and collect the extents living in
    /// source zones, crediting each zone's residue.
    fn scan(&self, src_set: &HashSet<u64>) -> Result<(Vec<GcExtent>, Vec<(String, u64)>)> {
        let mut work = Vec::new();
        let mut touched = Vec::new();
        let mut residue: HashMap<u64, u64> = HashMap::new();

        let files = self.files.lock()?;
        for (name, file) in files.iter() {
            let fr = file.read()?;
            let mut hit = false;
            for (idx, extent) in fr.extents().iter().enumerate() {
                if !extent.zone.is_full() || !src_set.contains(&extent.zone.start()) {
                    continue;
                }
                *residue.entry(extent.zone.start()).or_default() += u64::from(extent.length);
                work.push(GcExtent {
                    file_id: fr.file_id(),
                    extent_idx: idx,
                    start: extent.start,
                    length: extent.length,
                    src_zone: Arc::clone(&extent.zone),
                    dst: None,
                });
                hit = true;
            }
            if hit {
                touched.push((name.clone(), fr.file_id()));
            }
        }
        drop(files);

        for (zone, bytes) in &residue {
            tracing::debug!(zone, residue = bytes, "zone residue");
        }
        Ok((work, touched))
    }

    /// Copy each extent into the destination zones in order. On `NoSpace`
    /// the cursor stays on the same extent and only the destination
    /// advances; the buffer already holds the data so the read is skipped.
    fn pack(&self, work: &mut [GcExtent], dst_zones: &[Arc<Zone>]) -> Result<()> {
        let block = self.zbd.block_size();
        let largest = round_up(u64::from(work[0].length), block) as usize;
        let mut buffer = AlignedBuffer::new(largest, block as usize);

        let mut dst_iter = dst_zones.iter();
        let mut dst = dst_iter
            .next()
            .ok_or_else(|| Error::NoSpace("no destination zones".to_string()))?;

        let mut i = 0;
        let mut dont_read = false;
        while i < work.len() {
            // Extent lengths are logical; the padding up to the block
            // boundary physically exists in the source zone.
            let wr_sz = round_up(u64::from(work[i].length), block) as usize;

            if !dont_read {
                self.read_extent(&mut buffer[..wr_sz], work[i].start, &work[i].src_zone)?;
            }

            let new_start = dst.wp();
            match dst.append(&buffer[..wr_sz]) {
                Ok(()) => {
                    work[i].dst = Some((new_start, Arc::clone(dst)));
                    i += 1;
                    dont_read = false;
                }
                Err(Error::NoSpace(_)) => {
                    dont_read = true;
                    dst = dst_iter.next().ok_or_else(|| {
                        Error::NoSpace("ran out of destination zones".to_string())
                    })?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn read_extent(&self, buf: &mut [u8], read_pos: u64, zone: &Arc<Zone>) -> Result<()> {
        if read_pos + buf.len() as u64 > zone.start() + zone.max_capacity() {
            return Err(Error::IO("read across zone boundary".to_string()));
        }

        let mut read = 0;
        while read < buf.len() {
            let n = self
                .zbd
                .pread(&mut buf[read..], read_pos + read as u64, false)?;
            if n == 0 {
                return Err(Error::IO("short read from source zone".to_string()));
            }
            read += n;
        }
        Ok(())
    }

    /// Rewrite the moved extents of every touched file and persist its
    /// complete record. Files deleted during the pack, or replaced under
    /// the same name, are skipped. The `used_capacity` credit moves with
    /// the extent so zone accounting stays exact.
    fn persist(&self, work: &[GcExtent], touched: &[(String, u64)]) -> Result<()> {
        for (name, file_id) in touched {
            let file = {
                let files = self.files.lock()?;
                files.get(name).cloned()
            };
            let Some(file) = file else { continue };

            {
                let mut fw = file.write()?;
                if fw.file_id() != *file_id {
                    continue;
                }
                for item in work.iter().filter(|w| w.file_id == *file_id) {
                    let Some((new_start, dst)) = &item.dst else {
                        continue;
                    };
                    let extent = &mut fw.extents_mut()[item.extent_idx];
                    extent.zone.sub_used(u64::from(extent.length));
                    dst.add_used(u64::from(extent.length));
                    extent.start = *new_start;
                    extent.zone = Arc::clone(dst);
                }
            }

            self.metadata_writer.persist_replace(&file)?;
        }
        Ok(())
    }
}

fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmulatedOptions, MountOptions};
    use crate::zbd::backend::ZoneBackend;
    use crate::zbd::emulated::EmulatedBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWriter {
        persisted: AtomicUsize,
    }

    impl MetadataWriter for CountingWriter {
        fn persist(&self, file: &Arc<RwLock<ZoneFile>>) -> Result<()> {
            self.persist_replace(file)
        }

        fn persist_replace(&self, file: &Arc<RwLock<ZoneFile>>) -> Result<()> {
            self.persisted.fetch_add(1, Ordering::SeqCst);
            file.write()?.metadata_synced();
            Ok(())
        }
    }

    fn open_device(dir: &tempfile::TempDir) -> Arc<ZonedBlockDevice> {
        let opts = EmulatedOptions::new(dir.path().join("zbd.img"));
        let backend: Arc<dyn ZoneBackend> =
            Arc::new(EmulatedBackend::open(&opts).expect("open emulated device"));
        ZonedBlockDevice::open(backend, &MountOptions::default()).expect("open device")
    }

    /// One file with `len` bytes of deterministic content, appended and
    /// pushed to extents, writer closed.
    fn make_file(
        zbd: &Arc<ZonedBlockDevice>,
        name: &str,
        id: u64,
        len: usize,
    ) -> Arc<RwLock<ZoneFile>> {
        let mut data = vec![0u8; round_up(len as u64, 4096) as usize];
        for (i, b) in data.iter_mut().enumerate().take(len) {
            *b = ((i as u64 * 31 + id) % 251) as u8;
        }
        let mut file = ZoneFile::new(Arc::clone(zbd), name, id);
        file.open_wr();
        file.append(&data, len).expect("append failed");
        file.push_extent();
        file.close_wr().expect("close failed");
        Arc::new(RwLock::new(file))
    }

    fn read_all(file: &Arc<RwLock<ZoneFile>>) -> Vec<u8> {
        let fr = file.read().unwrap();
        let mut out = vec![0u8; fr.file_size() as usize];
        let n = fr.positioned_read(0, &mut out, false).expect("read failed");
        assert_eq!(n, out.len());
        out
    }

    #[test]
    fn test_gc_moves_live_extents_and_resets_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let file_a = make_file(&zbd, "a.sst", 1, 8192);
        let file_b = make_file(&zbd, "b.sst", 2, 100);
        let before_a = read_all(&file_a);
        let before_b = read_all(&file_b);

        // Both files landed in the same allocator-chosen zone; fill it up
        // and declare it a GC source.
        let src = Arc::clone(&file_a.read().unwrap().extents()[0].zone);
        assert!(Arc::ptr_eq(
            &src,
            &file_b.read().unwrap().extents()[0].zone
        ));
        src.finish().expect("finish failed");
        assert!(src.is_full());

        let dst = zbd
            .io_zones()
            .iter()
            .find(|z| z.is_empty())
            .cloned()
            .expect("no empty destination");

        let files: Arc<Mutex<FileMap>> = Arc::new(Mutex::new(FileMap::new()));
        files.lock().unwrap().insert("a.sst".into(), Arc::clone(&file_a));
        files.lock().unwrap().insert("b.sst".into(), Arc::clone(&file_b));

        let writer = Arc::new(CountingWriter {
            persisted: AtomicUsize::new(0),
        });
        let gc = GcWorker::new(
            Arc::clone(&zbd),
            files,
            Arc::clone(&writer) as Arc<dyn MetadataWriter>,
        );
        let stats = gc
            .run(&[Arc::clone(&src)], &[Arc::clone(&dst)])
            .expect("gc run failed");

        assert_eq!(stats.extents_moved, 2);
        assert_eq!(stats.bytes_moved, 8192 + 100);
        assert_eq!(stats.zones_reset, 1);
        assert_eq!(writer.persisted.load(Ordering::SeqCst), 2);

        // Extents now point at the destination, with the credit moved.
        assert!(Arc::ptr_eq(
            &file_a.read().unwrap().extents()[0].zone,
            &dst
        ));
        assert_eq!(src.used_capacity(), 0);
        assert!(src.is_empty());
        assert_eq!(dst.used_capacity(), 8192 + 100);

        // Content is unchanged through the move.
        assert_eq!(read_all(&file_a), before_a);
        assert_eq!(read_all(&file_b), before_b);
    }

    #[test]
    fn test_gc_advances_to_next_destination_on_no_space() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        let file = make_file(&zbd, "big.sst", 1, 64 * 1024);
        let expected = read_all(&file);

        let src = Arc::clone(&file.read().unwrap().extents()[0].zone);
        src.finish().expect("finish failed");

        // First destination has too little room for the extent.
        let mut empties = zbd.io_zones().iter().filter(|z| z.is_empty()).cloned();
        let dst1 = empties.next().expect("no destination");
        let dst2 = empties.next().expect("no second destination");
        dst1.append(&vec![0u8; 160 * 1024]).expect("prefill failed");

        let files: Arc<Mutex<FileMap>> = Arc::new(Mutex::new(FileMap::new()));
        files.lock().unwrap().insert("big.sst".into(), Arc::clone(&file));

        let writer = Arc::new(CountingWriter {
            persisted: AtomicUsize::new(0),
        });
        let gc = GcWorker::new(Arc::clone(&zbd), files, writer);
        let stats = gc
            .run(&[Arc::clone(&src)], &[Arc::clone(&dst1), Arc::clone(&dst2)])
            .expect("gc run failed");

        assert_eq!(stats.extents_moved, 1);
        assert!(Arc::ptr_eq(&file.read().unwrap().extents()[0].zone, &dst2));
        assert_eq!(read_all(&file), expected);
    }

    #[test]
    fn test_gc_without_live_extents_still_resets_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zbd = open_device(&dir);

        // Dead data: written, finished, nothing referencing it.
        let z = Arc::clone(&zbd.io_zones()[0]);
        z.append(&[0u8; 8192]).expect("append failed");
        z.finish().expect("finish failed");

        let files: Arc<Mutex<FileMap>> = Arc::new(Mutex::new(FileMap::new()));
        let writer = Arc::new(CountingWriter {
            persisted: AtomicUsize::new(0),
        });
        let gc = GcWorker::new(Arc::clone(&zbd), files, writer);
        let stats = gc.run(&[Arc::clone(&z)], &[]).expect("gc run failed");

        assert_eq!(stats.extents_moved, 0);
        assert_eq!(stats.zones_reset, 1);
        assert!(z.is_empty());
    }
}
