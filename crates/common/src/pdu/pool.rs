use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Backing, Pdu, PduError};

/// Default number of idle buffers a pool keeps around
pub const DEFAULT_POOL_SIZE: usize = 64;
/// Default in-memory capacity of a PDU before it spools to a temp file
pub const DEFAULT_MEM_CAPACITY: usize = 16 * 1024;

/// Bounded, non-blocking free-list backed by a channel.
///
/// `take` never waits for a returned item and `give` drops the item when
/// the list is full, so the pool can't stall a sender or a receiver.
#[derive(Debug)]
pub struct FreeList<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> FreeList<T> {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = flume::bounded(size);
        Self { tx, rx }
    }

    pub fn take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn give(&self, item: T) {
        let _ = self.tx.try_send(item);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[derive(Debug)]
struct PoolInner {
    buffers: FreeList<Vec<u8>>,
    mem_capacity: usize,
    spool_dir: Option<PathBuf>,
}

/// Factory and recycler for [`Pdu`] buffers.
///
/// A pool is cheap to clone and is handed to whatever needs to allocate PDUs
/// (sessions, the service, tests), so independent components never share
/// hidden global state.
#[derive(Debug, Clone)]
pub struct PduPool {
    inner: Arc<PoolInner>,
}

impl Default for PduPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, DEFAULT_MEM_CAPACITY)
    }
}

impl PduPool {
    pub fn new(pool_size: usize, mem_capacity: usize) -> Self {
        Self::build(pool_size, mem_capacity, None)
    }

    /// Pool whose spooled PDUs are created under `dir` instead of the
    /// system temp directory.
    pub fn with_spool_dir(pool_size: usize, mem_capacity: usize, dir: &Path) -> Self {
        Self::build(pool_size, mem_capacity, Some(dir.to_path_buf()))
    }

    fn build(pool_size: usize, mem_capacity: usize, spool_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: FreeList::new(pool_size),
                mem_capacity,
                spool_dir,
            }),
        }
    }

    pub fn mem_capacity(&self) -> usize {
        self.inner.mem_capacity
    }

    /// Number of idle buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.buffers.len()
    }

    /// Allocate an empty in-memory PDU.
    pub fn alloc(&self) -> Pdu {
        let buf = self
            .inner
            .buffers
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.mem_capacity));
        Pdu::new(self.clone(), Backing::Mem { buf, pos: 0 })
    }

    /// Allocate a PDU that writes straight to a temp file, for bodies
    /// known to be large (listings, cat output).
    pub fn alloc_spooled(&self) -> Result<Pdu, PduError> {
        let file = self.spool_file()?;
        Ok(Pdu::new(
            self.clone(),
            Backing::File {
                file,
                len: 0,
                pos: 0,
            },
        ))
    }

    pub fn from_bytes(&self, data: &[u8]) -> Result<Pdu, PduError> {
        let pdu = self.alloc();
        pdu.append(data)?;
        Ok(pdu)
    }

    pub(super) fn spool_file(&self) -> Result<std::fs::File, PduError> {
        let file = match &self.inner.spool_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(file)
    }

    pub(super) fn recycle(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.inner.mem_capacity * 2 {
            return;
        }
        buf.clear();
        self.inner.buffers.give(buf);
    }
}
