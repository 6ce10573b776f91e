//! Per-session authenticated encryption.
//!
//! A [`CryptoBox`] is built once per session from the local secret and the
//! peer's public key. Both ends run X25519 on the converted keys and derive a
//! 256-bit XChaCha20-Poly1305 key from the shared point, so the agreement is
//! done exactly once and every frame after that is a plain AEAD call.
//!
//! Frames are sealed with sequenced nonces instead of random ones. The last
//! `seq_len` bytes of the 24-byte nonce form a big-endian counter that steps by
//! two after every seal or open. The peer whose public key compares lower
//! seals on even counters and the higher peer on odd ones, so the two
//! directions never reuse a nonce under the shared key. A box refuses to
//! seal or open once its counter would come back around to a nonce it has
//! already used.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};

use super::keys::{KeyError, PublicKey, SecretKey};

/// Size of the XChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 24;
/// Bytes added to every sealed frame (Poly1305 tag)
pub const BOX_OVERHEAD: usize = 16;

const SHARED_KEY_CONTEXT: &str = "asn 2024-06-01 session box shared key";

#[derive(Debug, thiserror::Error)]
pub enum BoxError {
    #[error("box key error: {0}")]
    Key(#[from] KeyError),
    #[error("key agreement produced a non-contributory secret")]
    NonContributory,
    #[error("invalid sequence length {0}")]
    InvalidSeqLen(u8),
    #[error("seal failed")]
    Seal,
    #[error("open failed")]
    Open,
    #[error("nonce space exhausted after {0} frames")]
    Exhausted(u64),
}

/// Number of trailing nonce bytes used as a frame counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SeqLen {
    /// Static nonce; only fit for a box that seals a single frame.
    None = 0,
    One = 1,
    Two = 2,
    Four = 4,
    #[default]
    Eight = 8,
}

impl TryFrom<u8> for SeqLen {
    type Error = BoxError;
    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(SeqLen::None),
            1 => Ok(SeqLen::One),
            2 => Ok(SeqLen::Two),
            4 => Ok(SeqLen::Four),
            8 => Ok(SeqLen::Eight),
            n => Err(BoxError::InvalidSeqLen(n)),
        }
    }
}

impl SeqLen {
    pub fn len(self) -> usize {
        self as usize
    }

    pub fn is_none(self) -> bool {
        self == SeqLen::None
    }

    /// Counter increment applied after each frame.
    pub fn step(self) -> u64 {
        if self.is_none() {
            0
        } else {
            2
        }
    }

    /// Distinct nonces one direction can use before its counter wraps.
    pub fn frames(self) -> u64 {
        match self {
            SeqLen::None => 1,
            // one bit of the field is the direction parity
            n => 1u64 << (8 * n.len() - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Nonce(bytes)
    }
}

impl Nonce {
    pub fn generate() -> Self {
        let mut buff = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Nonce(buff)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Current value of the trailing counter field.
    pub fn counter(&self, seq_len: SeqLen) -> u64 {
        self.0[NONCE_SIZE - seq_len.len()..]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    /// Add the sequence step to the counter field, wrapping inside the field.
    pub fn inc(&mut self, seq_len: SeqLen) {
        let mut carry = seq_len.step();
        for b in self.0[NONCE_SIZE - seq_len.len()..].iter_mut().rev() {
            if carry == 0 {
                break;
            }
            let sum = u64::from(*b) + carry;
            *b = sum as u8;
            carry = sum >> 8;
        }
    }

    fn with_parity(mut self, seq_len: SeqLen, odd: bool) -> Self {
        if !seq_len.is_none() {
            let last = &mut self.0[NONCE_SIZE - 1];
            *last = (*last & !1) | u8::from(odd);
        }
        self
    }
}

/// Session encryption context: shared key plus independent open/seal nonces.
#[derive(Clone)]
pub struct CryptoBox {
    cipher: XChaCha20Poly1305,
    seq_len: SeqLen,
    lower: bool,
    open_nonce: Nonce,
    seal_nonce: Nonce,
    /// Frames sealed and opened under the current nonces
    sealed: u64,
    opened: u64,
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox")
            .field("seq_len", &self.seq_len)
            .field("lower", &self.lower)
            .field("open_nonce", &self.open_nonce)
            .field("seal_nonce", &self.seal_nonce)
            .field("sealed", &self.sealed)
            .field("opened", &self.opened)
            .finish()
    }
}

impl CryptoBox {
    /// Precompute the shared key between `secret` and `peer` and seed both
    /// nonces from `nonce`.
    pub fn new(
        seq_len: SeqLen,
        nonce: &Nonce,
        peer: &PublicKey,
        secret: &SecretKey,
    ) -> Result<Self, BoxError> {
        let shared = secret.to_x25519().diffie_hellman(&peer.to_x25519()?);
        if !shared.was_contributory() {
            return Err(BoxError::NonContributory);
        }
        let key = blake3::derive_key(SHARED_KEY_CONTEXT, shared.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let lower = secret.public() < *peer;

        let mut cbox = Self {
            cipher,
            seq_len,
            lower,
            open_nonce: *nonce,
            seal_nonce: *nonce,
            sealed: 0,
            opened: 0,
        };
        cbox.reset_nonces(nonce);
        Ok(cbox)
    }

    /// Same shared key, fresh nonces derived from `nonce`. Used when a
    /// suspended session resumes.
    pub fn rekeyed(&self, nonce: &Nonce) -> Self {
        let mut cbox = self.clone();
        cbox.reset_nonces(nonce);
        cbox
    }

    fn reset_nonces(&mut self, nonce: &Nonce) {
        self.seal_nonce = nonce.with_parity(self.seq_len, !self.lower);
        self.open_nonce = nonce.with_parity(self.seq_len, self.lower);
        self.sealed = 0;
        self.opened = 0;
    }

    pub fn seq_len(&self) -> SeqLen {
        self.seq_len
    }

    pub fn seal_nonce(&self) -> &Nonce {
        &self.seal_nonce
    }

    pub fn open_nonce(&self) -> &Nonce {
        &self.open_nonce
    }

    /// Seal one frame and advance the seal nonce.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, BoxError> {
        if self.sealed >= self.seq_len.frames() {
            return Err(BoxError::Exhausted(self.sealed));
        }
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(self.seal_nonce.as_bytes()), plaintext)
            .map_err(|_| BoxError::Seal)?;
        self.seal_nonce.inc(self.seq_len);
        self.sealed += 1;
        Ok(sealed)
    }

    /// Open one frame. The open nonce advances whether or not the frame
    /// authenticates; a failure is fatal to the session anyway.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, BoxError> {
        if self.opened >= self.seq_len.frames() {
            return Err(BoxError::Exhausted(self.opened));
        }
        let opened = self
            .cipher
            .decrypt(XNonce::from_slice(self.open_nonce.as_bytes()), sealed);
        self.open_nonce.inc(self.seq_len);
        self.opened += 1;
        opened.map_err(|_| BoxError::Open)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair(seq_len: SeqLen) -> (CryptoBox, CryptoBox) {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let nonce = Nonce::generate();
        (
            CryptoBox::new(seq_len, &nonce, &b.public(), &a).unwrap(),
            CryptoBox::new(seq_len, &nonce, &a.public(), &b).unwrap(),
        )
    }

    #[test]
    fn test_seal_open_both_directions() {
        let (mut a, mut b) = pair(SeqLen::Eight);
        for i in 0..10u8 {
            let msg = vec![i; i as usize * 7];
            let sealed = a.seal(&msg).unwrap();
            assert_eq!(sealed.len(), msg.len() + BOX_OVERHEAD);
            assert_eq!(b.open(&sealed).unwrap(), msg);

            let sealed = b.seal(&msg).unwrap();
            assert_eq!(a.open(&sealed).unwrap(), msg);
        }
    }

    #[test]
    fn test_seal_nonces_never_collide() {
        let (a, b) = pair(SeqLen::Four);
        assert_ne!(a.seal_nonce(), b.seal_nonce());
        assert_eq!(a.seal_nonce(), b.open_nonce());
        assert_eq!(b.seal_nonce(), a.open_nonce());

        let parity_a = a.seal_nonce().counter(SeqLen::Four) & 1;
        let parity_b = b.seal_nonce().counter(SeqLen::Four) & 1;
        assert_ne!(parity_a, parity_b);
    }

    #[test]
    fn test_seal_nonce_monotonic() {
        let (mut a, _) = pair(SeqLen::Eight);
        let start = a.seal_nonce().counter(SeqLen::Eight);
        let n = 37u64;
        for _ in 0..n {
            a.seal(b"x").unwrap();
        }
        assert_eq!(
            a.seal_nonce().counter(SeqLen::Eight),
            start.wrapping_add(n * SeqLen::Eight.step())
        );
    }

    #[test]
    fn test_counter_wraps_inside_field() {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[NONCE_SIZE - 2] = 0xaa;
        bytes[NONCE_SIZE - 1] = 0xff;
        let mut nonce = Nonce::from(bytes);
        nonce.inc(SeqLen::One);
        assert_eq!(nonce.as_bytes()[NONCE_SIZE - 1], 0x01);
        assert_eq!(nonce.as_bytes()[NONCE_SIZE - 2], 0xaa);

        let mut nonce = Nonce::from(bytes);
        nonce.inc(SeqLen::Two);
        assert_eq!(nonce.counter(SeqLen::Two), 0xab01);
    }

    #[test]
    fn test_static_nonce_does_not_move() {
        let (mut a, _) = pair(SeqLen::None);
        let before = *a.seal_nonce();
        a.seal(b"once").unwrap();
        assert_eq!(before, *a.seal_nonce());
    }

    #[test]
    fn test_static_nonce_seals_once() {
        let (mut a, mut b) = pair(SeqLen::None);
        let sealed = a.seal(b"only frame").unwrap();
        assert_eq!(b.open(&sealed).unwrap(), b"only frame");
        assert!(matches!(a.seal(b"again"), Err(BoxError::Exhausted(1))));
        assert!(matches!(b.open(&sealed), Err(BoxError::Exhausted(1))));
    }

    #[test]
    fn test_short_counter_stops_before_reuse() {
        let (mut a, mut b) = pair(SeqLen::One);
        assert_eq!(SeqLen::One.frames(), 128);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..SeqLen::One.frames() {
            assert!(seen.insert(*a.seal_nonce()));
            let sealed = a.seal(b"x").unwrap();
            b.open(&sealed).unwrap();
        }
        assert!(matches!(a.seal(b"x"), Err(BoxError::Exhausted(128))));

        // a fresh base nonce starts a new run
        let nonce = Nonce::generate();
        let mut a = a.rekeyed(&nonce);
        assert!(a.seal(b"x").is_ok());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let (mut a, mut b) = pair(SeqLen::Eight);
        let mut sealed = a.seal(b"payload").unwrap();
        sealed[3] ^= 0x40;
        assert!(matches!(b.open(&sealed), Err(BoxError::Open)));
    }

    #[test]
    fn test_rekeyed_boxes_agree() {
        let (a, b) = pair(SeqLen::Eight);
        let nonce = Nonce::generate();
        let mut a = a.rekeyed(&nonce);
        let mut b = b.rekeyed(&nonce);
        let sealed = a.seal(b"after resume").unwrap();
        assert_eq!(b.open(&sealed).unwrap(), b"after resume");
    }

    #[test]
    fn test_invalid_seq_len() {
        assert!(SeqLen::try_from(3).is_err());
        assert_eq!(SeqLen::try_from(8).unwrap(), SeqLen::Eight);
    }
}
