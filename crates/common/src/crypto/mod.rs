//! Cryptographic primitives for ASN
//!
//! - **Identity & Authentication**: Ed25519 keypairs identify users, services
//!   and blob authors; logins and vouchers are Ed25519 signatures
//! - **Session encryption**: a [`CryptoBox`] per session, keyed by X25519
//!   agreement over the converted identity keys, sealing frames with
//!   XChaCha20-Poly1305 under sequenced nonces
//!
//! # Key agreement
//! 1. The dialer generates an ephemeral keypair per connection
//! 2. Both sides convert their Ed25519 keys to X25519 (Montgomery curve)
//! 3. ECDH yields a shared point; BLAKE3 derives the AEAD key from it
//! 4. Nonce parity is assigned from the public key order so the two
//!    directions never share a nonce

mod cbox;
mod keys;

pub use cbox::{BoxError, CryptoBox, Nonce, SeqLen, BOX_OVERHEAD, NONCE_SIZE};
pub use ed25519_dalek::Signature;
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
