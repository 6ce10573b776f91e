//! Cleartext session opening.
//!
//! The dialer generates a throwaway keypair and sends
//!
//! ```text
//! ephemeral public key(32) base nonce(24) seq_len(1)
//! ```
//!
//! Both ends then build the box from their own secret and the other side's
//! public key: the dialer pairs its ephemeral secret with the service key,
//! the listener pairs the service secret with the ephemeral key. Identity is
//! proven afterwards, inside the box, by a Login signed over the ephemeral
//! key.
//!
//! A session always carries a sequence counter: a static nonce would be
//! shared by both directions, so `seq_len` 0 is refused on both ends.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SessionError;
use crate::crypto::{BoxError, CryptoBox, Nonce, PublicKey, SecretKey, SeqLen, NONCE_SIZE, PUBLIC_KEY_SIZE};

pub const HELLO_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + 1;

/// Dialer's side of a finished handshake.
#[derive(Debug)]
pub struct Dialed {
    pub cbox: CryptoBox,
    /// Sign its public half to log in.
    pub ephemeral: SecretKey,
}

/// Listener's side of a finished handshake.
#[derive(Debug)]
pub struct Accepted {
    pub cbox: CryptoBox,
    /// Key the dialer's Login signature must cover.
    pub ephemeral: PublicKey,
}

pub async fn dial<S>(
    stream: &mut S,
    service: &PublicKey,
    seq_len: SeqLen,
    timeout: Duration,
) -> Result<Dialed, SessionError>
where
    S: AsyncWrite + Unpin,
{
    let seq_len = counted(seq_len)?;
    let ephemeral = SecretKey::generate();
    let nonce = Nonce::generate();
    let cbox = CryptoBox::new(seq_len, &nonce, service, &ephemeral)?;

    let mut hello = Vec::with_capacity(HELLO_SIZE);
    hello.extend_from_slice(ephemeral.public().as_bytes());
    hello.extend_from_slice(nonce.as_bytes());
    hello.push(seq_len as u8);

    tokio::time::timeout(timeout, async {
        stream.write_all(&hello).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| SessionError::Timeout)??;

    tracing::debug!(ephemeral = %ephemeral.public().short(), "sent session hello");
    Ok(Dialed { cbox, ephemeral })
}

pub async fn accept<S>(
    stream: &mut S,
    service: &SecretKey,
    timeout: Duration,
) -> Result<Accepted, SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut hello = [0u8; HELLO_SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut hello))
        .await
        .map_err(|_| SessionError::Timeout)??;

    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(&hello[..PUBLIC_KEY_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&hello[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE]);
    let seq_len = counted(SeqLen::try_from(hello[HELLO_SIZE - 1])?)?;

    let ephemeral = PublicKey::from(key);
    let cbox = CryptoBox::new(seq_len, &Nonce::from(nonce), &ephemeral, service)?;
    tracing::debug!(ephemeral = %ephemeral.short(), ?seq_len, "accepted session hello");
    Ok(Accepted { cbox, ephemeral })
}

fn counted(seq_len: SeqLen) -> Result<SeqLen, SessionError> {
    if seq_len.is_none() {
        return Err(BoxError::InvalidSeqLen(0).into());
    }
    Ok(seq_len)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_both_sides_agree() {
        let service = SecretKey::generate();
        let (mut client, mut server) = tokio::io::duplex(1024);
        let timeout = Duration::from_secs(5);
        let service_pub = service.public();

        let (dialed, accepted) = tokio::join!(
            dial(&mut client, &service_pub, SeqLen::Four, timeout),
            accept(&mut server, &service, timeout),
        );
        let mut dialed = dialed.unwrap();
        let mut accepted = accepted.unwrap();
        assert_eq!(accepted.ephemeral, dialed.ephemeral.public());

        let sealed = dialed.cbox.seal(b"hello").unwrap();
        assert_eq!(accepted.cbox.open(&sealed).unwrap(), b"hello");
        let sealed = accepted.cbox.seal(b"back").unwrap();
        assert_eq!(dialed.cbox.open(&sealed).unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_bad_seq_len_rejected() {
        let service = SecretKey::generate();
        let mut hello = vec![0u8; HELLO_SIZE];
        hello[..PUBLIC_KEY_SIZE].copy_from_slice(SecretKey::generate().public().as_bytes());
        hello[HELLO_SIZE - 1] = 3;
        let err = accept(&mut hello.as_slice(), &service, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Box(_)));
    }

    #[tokio::test]
    async fn test_static_nonce_refused() {
        let service = SecretKey::generate();
        let mut hello = vec![0u8; HELLO_SIZE];
        hello[..PUBLIC_KEY_SIZE].copy_from_slice(SecretKey::generate().public().as_bytes());
        hello[HELLO_SIZE - 1] = 0;
        let err = accept(&mut hello.as_slice(), &service, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Box(BoxError::InvalidSeqLen(0))));

        let mut sink = Vec::new();
        let err = dial(&mut sink, &service.public(), SeqLen::None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Box(BoxError::InvalidSeqLen(0))));
        assert!(sink.is_empty());
    }
}
