//! Segmentation and sealing of PDUs on the socket.
//!
//! A PDU goes out as one or more segments:
//!
//! ```text
//! u16 (sealed_len | MORE_FLAG) BE, sealed bytes
//! ```
//!
//! Each segment's plaintext is at most `MAX_SEG_SZ - BOX_OVERHEAD` bytes and
//! is sealed under the next seal nonce. The last segment of a PDU has
//! `MORE_FLAG` clear.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{BoxError, CryptoBox, BOX_OVERHEAD};
use crate::pdu::{Pdu, PduError, PduPool};

/// Largest sealed segment on the wire
pub const MAX_SEG_SZ: usize = 4096;
/// Length-prefix bit marking that another segment of the same PDU follows
pub const MORE_FLAG: u16 = 0x8000;
/// Largest plaintext carried by one segment
pub const MAX_PLAIN_SZ: usize = MAX_SEG_SZ - BOX_OVERHEAD;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("segment of {0} bytes exceeds {MAX_SEG_SZ}")]
    TooLarge(usize),
    #[error("zero length segment")]
    Empty,
    #[error("timed out mid-segment")]
    Timeout,
    #[error("segment box error: {0}")]
    Box(#[from] BoxError),
    #[error("segment pdu error: {0}")]
    Pdu(#[from] PduError),
}

/// Per-operation I/O deadline. An expiry with nothing transferred is an idle
/// wait and is retried for as long as `live` says the session is up.
pub struct Deadline<L> {
    pub timeout: Duration,
    pub live: L,
}

impl<L: Fn() -> bool> Deadline<L> {
    pub fn new(timeout: Duration, live: L) -> Self {
        Self { timeout, live }
    }
}

/// Seal and write `pdu` as a run of segments. Reads through `read_at`, so
/// the same PDU may be written to several sessions at once.
pub async fn write_pdu<W, L>(
    w: &mut W,
    cbox: &Mutex<CryptoBox>,
    pdu: &Pdu,
    deadline: &Deadline<L>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    L: Fn() -> bool,
{
    let total = pdu.len();
    let mut offset = 0u64;
    let mut plain = vec![0u8; MAX_PLAIN_SZ];
    loop {
        let n = pdu.read_at(offset, &mut plain)?;
        offset += n as u64;
        let more = offset < total;
        if n == 0 && more {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let sealed = cbox.lock().seal(&plain[..n])?;
        let mut prefix = sealed.len() as u16;
        if more {
            prefix |= MORE_FLAG;
        }
        let mut segment = Vec::with_capacity(2 + sealed.len());
        segment.extend_from_slice(&prefix.to_be_bytes());
        segment.extend_from_slice(&sealed);
        write_full(w, &segment, deadline).await?;

        if !more {
            break;
        }
    }
    w.flush().await?;
    Ok(())
}

/// Read and open segments until one arrives without `MORE_FLAG`.
///
/// `current` is asked for the box before every segment, so a box swapped
/// in by an Ack callback applies to the very next segment. Returns
/// `Ok(None)` on a clean end of stream between PDUs.
pub async fn read_pdu<R, B, L>(
    r: &mut R,
    current: B,
    pool: &PduPool,
    deadline: &Deadline<L>,
) -> Result<Option<Pdu>, FrameError>
where
    R: AsyncRead + Unpin,
    B: Fn() -> Arc<Mutex<CryptoBox>>,
    L: Fn() -> bool,
{
    let pdu = pool.alloc();
    let mut sealed = vec![0u8; MAX_SEG_SZ];
    let mut first = true;
    loop {
        let mut prefix = [0u8; 2];
        if !read_full(r, &mut prefix, deadline, first).await? {
            return Ok(None);
        }
        first = false;

        let prefix = u16::from_be_bytes(prefix);
        let len = (prefix & !MORE_FLAG) as usize;
        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > MAX_SEG_SZ {
            return Err(FrameError::TooLarge(len));
        }
        read_full(r, &mut sealed[..len], deadline, false).await?;

        let plain = current().lock().open(&sealed[..len])?;
        pdu.append(&plain)?;

        if prefix & MORE_FLAG == 0 {
            return Ok(Some(pdu));
        }
    }
}

async fn write_full<W, L>(w: &mut W, buf: &[u8], deadline: &Deadline<L>) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    L: Fn() -> bool,
{
    let mut off = 0;
    while off < buf.len() {
        match tokio::time::timeout(deadline.timeout, w.write(&buf[off..])).await {
            Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(Ok(n)) => off += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if off == 0 && (deadline.live)() => continue,
            Err(_) => return Err(FrameError::Timeout),
        }
    }
    Ok(())
}

/// Fill `buf`. Returns `false` only when `eof_ok` and the stream ended
/// before the first byte.
async fn read_full<R, L>(
    r: &mut R,
    buf: &mut [u8],
    deadline: &Deadline<L>,
    eof_ok: bool,
) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
    L: Fn() -> bool,
{
    let mut off = 0;
    while off < buf.len() {
        match tokio::time::timeout(deadline.timeout, r.read(&mut buf[off..])).await {
            Ok(Ok(0)) if off == 0 && eof_ok => return Ok(false),
            Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(Ok(n)) => off += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if off == 0 && (deadline.live)() => continue,
            Err(_) => return Err(FrameError::Timeout),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{Nonce, SecretKey, SeqLen};

    fn boxes() -> (Mutex<CryptoBox>, Arc<Mutex<CryptoBox>>) {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let nonce = Nonce::generate();
        let seal = CryptoBox::new(SeqLen::Eight, &nonce, &b.public(), &a).unwrap();
        let open = CryptoBox::new(SeqLen::Eight, &nonce, &a.public(), &b).unwrap();
        (Mutex::new(seal), Arc::new(Mutex::new(open)))
    }

    fn deadline() -> Deadline<impl Fn() -> bool> {
        Deadline::new(Duration::from_secs(5), || true)
    }

    async fn pass_through(sizes: &[usize]) {
        let pool = PduPool::new(8, 1024);
        let (seal, open) = boxes();
        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);

        let payloads: Vec<Vec<u8>> = sizes
            .iter()
            .map(|n| (0..*n).map(|i| (i % 251) as u8).collect())
            .collect();

        for payload in &payloads {
            let pdu = pool.from_bytes(payload).unwrap();
            write_pdu(&mut tx, &seal, &pdu, &deadline()).await.unwrap();
        }
        drop(tx);

        for payload in &payloads {
            let pdu = read_pdu(&mut rx, || open.clone(), &pool, &deadline())
                .await
                .unwrap()
                .expect("pdu");
            assert_eq!(&pdu.to_vec().unwrap(), payload);
        }
        assert!(read_pdu(&mut rx, || open.clone(), &pool, &deadline())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_segmentation_sizes() {
        pass_through(&[
            0,
            1,
            MAX_PLAIN_SZ - 1,
            MAX_PLAIN_SZ,
            MAX_PLAIN_SZ + 1,
            3 * MAX_SEG_SZ + 17,
        ])
        .await;
    }

    #[tokio::test]
    async fn test_oversized_segment_is_fatal() {
        let pool = PduPool::default();
        let (_, open) = boxes();
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&((MAX_SEG_SZ as u16) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_pdu(&mut rx, || open.clone(), &pool, &deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn test_zero_segment_is_fatal() {
        let pool = PduPool::default();
        let (_, open) = boxes();
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&MORE_FLAG.to_be_bytes()).await.unwrap();
        let err = read_pdu(&mut rx, || open.clone(), &pool, &deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Empty));
    }

    #[tokio::test]
    async fn test_tampered_segment_fails_open() {
        let pool = PduPool::default();
        let (seal, open) = boxes();
        let mut wire = Vec::new();
        let pdu = pool.from_bytes(b"attack at dawn").unwrap();
        write_pdu(&mut wire, &seal, &pdu, &deadline()).await.unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let err = read_pdu(&mut wire.as_slice(), || open.clone(), &pool, &deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Box(BoxError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_read_retries_until_dead() {
        let pool = PduPool::default();
        let (_, open) = boxes();
        let (_tx, mut rx) = tokio::io::duplex(1024);
        let polls = std::sync::atomic::AtomicUsize::new(0);
        let deadline = Deadline::new(Duration::from_millis(10), || {
            polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 3
        });
        let err = read_pdu(&mut rx, || open.clone(), &pool, &deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout));
        assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
