//! Reference-counted PDU buffers.
//!
//! A [`Pdu`] holds one logical protocol message. Small messages live in a
//! pooled `Vec<u8>`; once a write would push a buffer past the pool's memory
//! capacity, the contents move to an anonymous temp file and every later
//! write lands there. Readers never see the difference.
//!
//! Handles are shared: `clone` bumps the reference count and dropping the
//! last handle hands the memory buffer back to its [`PduPool`]. All clones
//! share the same read position, so code that fans one PDU out to several
//! writers should use [`Pdu::read_at`] instead of `Read`.

mod pool;

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

pub use pool::{FreeList, PduPool, DEFAULT_MEM_CAPACITY, DEFAULT_POOL_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum PduError {
    #[error("pdu i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub(crate) enum Backing {
    Mem { buf: Vec<u8>, pos: usize },
    File { file: File, len: u64, pos: u64 },
}

#[derive(Debug)]
struct PduInner {
    pool: PduPool,
    backing: Mutex<Backing>,
}

impl Drop for PduInner {
    fn drop(&mut self) {
        let empty = Backing::Mem {
            buf: Vec::new(),
            pos: 0,
        };
        if let Backing::Mem { buf, .. } = std::mem::replace(self.backing.get_mut(), empty) {
            self.pool.recycle(buf);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pdu {
    inner: Arc<PduInner>,
}

impl Pdu {
    fn new(pool: PduPool, backing: Backing) -> Self {
        Self {
            inner: Arc::new(PduInner {
                pool,
                backing: Mutex::new(backing),
            }),
        }
    }

    /// Total bytes written.
    pub fn len(&self) -> u64 {
        match &*self.inner.backing.lock() {
            Backing::Mem { buf, .. } => buf.len() as u64,
            Backing::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes left between the read position and the end.
    pub fn remaining(&self) -> u64 {
        match &*self.inner.backing.lock() {
            Backing::Mem { buf, pos } => (buf.len() - pos) as u64,
            Backing::File { len, pos, .. } => len.saturating_sub(*pos),
        }
    }

    pub fn is_spooled(&self) -> bool {
        matches!(&*self.inner.backing.lock(), Backing::File { .. })
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Append `data`, spooling to a temp file if the memory buffer would
    /// grow past the pool's capacity.
    pub fn append(&self, data: &[u8]) -> Result<(), PduError> {
        let mut backing = self.inner.backing.lock();
        if let Backing::Mem { buf, pos } = &mut *backing {
            if buf.len() + data.len() <= self.inner.pool.mem_capacity() {
                buf.extend_from_slice(data);
                return Ok(());
            }
            let mut file = self.inner.pool.spool_file()?;
            file.write_all(buf)?;
            let spilled = Backing::File {
                file,
                len: buf.len() as u64,
                pos: *pos as u64,
            };
            if let Backing::Mem { buf, .. } = std::mem::replace(&mut *backing, spilled) {
                self.inner.pool.recycle(buf);
            }
            tracing::trace!("pdu spooled to temp file");
        }
        if let Backing::File { file, len, .. } = &mut *backing {
            file.seek(SeekFrom::Start(*len))?;
            file.write_all(data)?;
            *len += data.len() as u64;
        }
        Ok(())
    }

    /// Read into `out` starting at `offset` without touching the shared
    /// read position. Returns the number of bytes copied.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<usize, PduError> {
        let mut backing = self.inner.backing.lock();
        match &mut *backing {
            Backing::Mem { buf, .. } => {
                let start = (offset as usize).min(buf.len());
                let n = out.len().min(buf.len() - start);
                out[..n].copy_from_slice(&buf[start..start + n]);
                Ok(n)
            }
            Backing::File { file, len, .. } => {
                if offset >= *len {
                    return Ok(0);
                }
                let want = out.len().min((*len - offset) as usize);
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut out[..want])?;
                Ok(want)
            }
        }
    }

    /// Whole contents as a byte vector, regardless of read position.
    pub fn to_vec(&self) -> Result<Vec<u8>, PduError> {
        let mut out = vec![0u8; self.len() as usize];
        let n = self.read_at(0, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Everything from the read position to the end, consuming it.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, PduError> {
        let mut out = Vec::with_capacity(self.remaining() as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Copy the bytes from the read position to the end into `writer`.
    pub fn copy_to<W: Write>(&mut self, writer: &mut W) -> Result<u64, PduError> {
        Ok(io::copy(self, writer)?)
    }
}

impl Read for Pdu {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut backing = self.inner.backing.lock();
        match &mut *backing {
            Backing::Mem { buf, pos } => {
                let n = out.len().min(buf.len() - *pos);
                out[..n].copy_from_slice(&buf[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Backing::File { file, len, pos } => {
                if *pos >= *len {
                    return Ok(0);
                }
                let want = out.len().min((*len - *pos) as usize);
                file.seek(SeekFrom::Start(*pos))?;
                let n = file.read(&mut out[..want])?;
                *pos += n as u64;
                Ok(n)
            }
        }
    }
}

impl Write for Pdu {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data).map_err(|PduError::Io(e)| e)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Seeking moves the read position; writes always append.
impl Seek for Pdu {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let mut backing = self.inner.backing.lock();
        let (len, pos) = match &*backing {
            Backing::Mem { buf, pos } => (buf.len() as u64, *pos as u64),
            Backing::File { len, pos, .. } => (*len, *pos),
        };
        let next = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => len.checked_add_signed(d),
            SeekFrom::Current(d) => pos.checked_add_signed(d),
        }
        .filter(|n| *n <= len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;

        match &mut *backing {
            Backing::Mem { pos, .. } => *pos = next as usize,
            Backing::File { pos, .. } => *pos = next,
        }
        Ok(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let pool = PduPool::new(4, 1024);
        let mut pdu = pool.alloc();
        pdu.write_all(b"hello ").unwrap();
        pdu.write_all(b"world").unwrap();
        assert_eq!(pdu.len(), 11);

        let mut head = [0u8; 6];
        pdu.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"hello ");
        assert_eq!(pdu.remaining(), 5);
        assert_eq!(pdu.read_remaining().unwrap(), b"world");
    }

    #[test]
    fn test_spools_past_capacity() {
        let pool = PduPool::new(4, 16);
        let mut pdu = pool.alloc();
        pdu.write_all(b"0123456789").unwrap();
        assert!(!pdu.is_spooled());

        let mut first = [0u8; 4];
        pdu.read_exact(&mut first).unwrap();

        pdu.write_all(b"abcdefghijklmnop").unwrap();
        assert!(pdu.is_spooled());
        assert_eq!(pdu.len(), 26);
        assert_eq!(pdu.read_remaining().unwrap(), b"456789abcdefghijklmnop");
        assert_eq!(pdu.to_vec().unwrap(), b"0123456789abcdefghijklmnop");
    }

    #[test]
    fn test_read_at_leaves_position() {
        let pool = PduPool::default();
        let mut pdu = pool.from_bytes(b"abcdef").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(pdu.read_at(2, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"cde");
        assert_eq!(pdu.read_at(5, &mut buf).unwrap(), 1);
        assert_eq!(pdu.read_at(9, &mut buf).unwrap(), 0);
        assert_eq!(pdu.read_remaining().unwrap(), b"abcdef");
    }

    #[test]
    fn test_seek_and_rewind() {
        let pool = PduPool::new(2, 8);
        let mut pdu = pool.alloc_spooled().unwrap();
        pdu.write_all(b"spooled body").unwrap();
        pdu.seek(SeekFrom::Start(8)).unwrap();
        assert_eq!(pdu.read_remaining().unwrap(), b"body");
        pdu.rewind().unwrap();
        assert_eq!(pdu.remaining(), 12);
        assert!(pdu.seek(SeekFrom::Current(100)).is_err());
    }

    #[test]
    fn test_spooled_pdu_is_not_recycled() {
        let pool = PduPool::new(4, 8);
        let pdu = pool.from_bytes(b"way more than eight bytes").unwrap();
        assert!(pdu.is_spooled());
        // the memory buffer went back when the pdu spooled
        assert_eq!(pool.idle(), 1);
        drop(pdu);
        assert_eq!(pool.idle(), 1);
    }
}
