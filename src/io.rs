//! File adapters over [`ZoneFile`]: block-aligned write buffering and the
//! sequential / random-access read paths.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::file::ZoneFile;
use crate::zbd::zone::WriteLifeHint;

/// Persists a file's metadata record when its extents change. Implemented
/// by the filesystem layer on top of the op log.
pub trait MetadataWriter: Send + Sync {
    /// Record the file's scalars and not-yet-synced extents.
    fn persist(&self, file: &Arc<RwLock<ZoneFile>>) -> Result<()>;

    /// Record the file's complete state, superseding earlier records. Used
    /// after garbage collection rewrites extents that were already synced.
    fn persist_replace(&self, file: &Arc<RwLock<ZoneFile>>) -> Result<()>;
}

/// Write staging buffer whose memory satisfies direct-I/O alignment.
pub(crate) struct AlignedBuffer {
    data: *mut u8,
    capacity: usize,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    pub(crate) fn new(capacity: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(capacity, align)
            .expect("invalid aligned buffer layout");
        let data = unsafe { alloc(layout) };
        if data.is_null() {
            handle_alloc_error(layout);
        }

        Self {
            data,
            capacity,
            layout,
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.capacity) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.capacity) }
    }
}

struct WriteBuffer {
    buf: AlignedBuffer,
    pos: usize,
}

/// Writable file handle.
///
/// In buffered mode writes are staged in an aligned buffer of 256 blocks
/// and flushed zero-padded; in direct mode the caller supplies block-aligned
/// data which passes straight through to the file.
pub struct ZonedWritableFile {
    file: Arc<RwLock<ZoneFile>>,
    metadata_writer: Arc<dyn MetadataWriter>,
    block_size: usize,
    buffer: Option<Mutex<WriteBuffer>>,
    wp: AtomicU64,
}

impl ZonedWritableFile {
    pub fn new(
        file: Arc<RwLock<ZoneFile>>,
        buffered: bool,
        block_size: usize,
        metadata_writer: Arc<dyn MetadataWriter>,
    ) -> Result<Self> {
        let wp = {
            let mut f = file.write()?;
            f.open_wr();
            f.file_size()
        };

        let buffer = buffered.then(|| {
            Mutex::new(WriteBuffer {
                buf: AlignedBuffer::new(block_size * 256, block_size),
                pos: 0,
            })
        });

        Ok(Self {
            file,
            metadata_writer,
            block_size,
            buffer,
            wp: AtomicU64::new(wp),
        })
    }

    pub fn set_lifetime(&self, hint: WriteLifeHint) -> Result<()> {
        self.file.write()?.set_lifetime(hint);
        Ok(())
    }

    pub fn append(&self, data: &[u8]) -> Result<()> {
        match &self.buffer {
            Some(buffer) => {
                let mut guard = buffer.lock()?;
                self.buffered_write(&mut guard, data)
            }
            None => {
                self.file.write()?.append(data, data.len())?;
                self.wp.fetch_add(data.len() as u64, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Append at an explicit offset, which must equal the current write
    /// pointer.
    pub fn positioned_append(&self, data: &[u8], offset: u64) -> Result<()> {
        if offset != self.wp.load(Ordering::SeqCst) {
            return Err(Error::IO(
                "positioned append not at write pointer".to_string(),
            ));
        }
        self.append(data)
    }

    fn buffered_write(&self, guard: &mut WriteBuffer, data: &[u8]) -> Result<()> {
        let mut data = data;
        let buffer_left = guard.buf.capacity - guard.pos;

        if guard.pos > 0 || data.len() <= buffer_left {
            let tobuffer = data.len().min(buffer_left);
            let pos = guard.pos;
            guard.buf[pos..pos + tobuffer].copy_from_slice(&data[..tobuffer]);
            guard.pos += tobuffer;
            data = &data[tobuffer..];

            if data.is_empty() {
                return Ok(());
            }
        }

        if guard.pos == guard.buf.capacity {
            self.flush_buffer(guard)?;
        }

        if data.len() >= guard.buf.capacity {
            // Carve off the block-aligned prefix and append it directly
            // through a page-aligned staging copy.
            let aligned_sz = (data.len() / self.block_size) * self.block_size;
            let mut staging = AlignedBuffer::new(aligned_sz, self.block_size);
            staging[..aligned_sz].copy_from_slice(&data[..aligned_sz]);

            self.file.write()?.append(&staging[..aligned_sz], aligned_sz)?;
            self.wp.fetch_add(aligned_sz as u64, Ordering::SeqCst);
            data = &data[aligned_sz..];
        }

        if !data.is_empty() {
            guard.buf[..data.len()].copy_from_slice(data);
            guard.pos = data.len();
        }

        Ok(())
    }

    fn flush_buffer(&self, guard: &mut WriteBuffer) -> Result<()> {
        if guard.pos == 0 {
            return Ok(());
        }

        let align = guard.pos % self.block_size;
        let pad = if align > 0 { self.block_size - align } else { 0 };
        let pos = guard.pos;
        if pad > 0 {
            guard.buf[pos..pos + pad].fill(0);
        }

        let wr = pos + pad;
        self.file.write()?.append(&guard.buf[..wr], pos)?;

        self.wp.fetch_add(pos as u64, Ordering::SeqCst);
        guard.pos = 0;

        Ok(())
    }

    /// Flush the buffer, finalise the in-flight extent, and persist the
    /// file's metadata through the writer callback.
    pub fn fsync(&self) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            let mut guard = buffer.lock()?;
            self.flush_buffer(&mut guard)?;
        }
        self.file.write()?.push_extent();

        self.metadata_writer.persist(&self.file)
    }

    pub fn sync(&self) -> Result<()> {
        self.fsync()
    }

    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Sync only when the range extends past what has already been written.
    pub fn range_sync(&self, offset: u64, nbytes: u64) -> Result<()> {
        if self.wp.load(Ordering::SeqCst) < offset + nbytes {
            return self.fsync();
        }
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file.write()?.set_file_size(size);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.fsync()?;
        self.file.write()?.close_wr()
    }
}

impl Drop for ZonedWritableFile {
    fn drop(&mut self) {
        if let Ok(mut file) = self.file.write() {
            if let Err(e) = file.close_wr() {
                tracing::warn!(error = %e, "failed to close writable file");
            }
        }
    }
}

/// Sequential reader with an internal read position.
pub struct ZonedSequentialFile {
    file: Arc<RwLock<ZoneFile>>,
    rp: u64,
    direct: bool,
}

impl ZonedSequentialFile {
    pub fn new(file: Arc<RwLock<ZoneFile>>, direct: bool) -> Self {
        Self {
            file,
            rp: 0,
            direct,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.read()?.positioned_read(self.rp, buf, self.direct)?;
        self.rp += n as u64;
        Ok(n)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        if self.rp + n >= self.file.read()?.file_size() {
            return Err(Error::InvalidArgument(
                "skip beyond end of file".to_string(),
            ));
        }
        self.rp += n;
        Ok(())
    }

    pub fn positioned_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.read()?.positioned_read(offset, buf, self.direct)
    }
}

/// Positioned reader without any internal state.
pub struct ZonedRandomAccessFile {
    file: Arc<RwLock<ZoneFile>>,
    direct: bool,
}

impl ZonedRandomAccessFile {
    pub fn new(file: Arc<RwLock<ZoneFile>>, direct: bool) -> Self {
        Self { file, direct }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.read()?.positioned_read(offset, buf, self.direct)
    }
}
