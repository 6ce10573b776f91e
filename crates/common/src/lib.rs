/**
 * Request/Ack correlation for a session.
 */
pub mod acker;
/**
 * Self-describing blob header stored in
 *  front of every object.
 */
pub mod blob;
/**
 * Cryptographic types and operations.
 *  - Public and Private key implementations
 *  - Per-session authenticated box
 */
pub mod crypto;
/**
 * Pooled, reference counted PDU buffers
 *  that spool to disk when they grow.
 */
pub mod pdu;
/**
 * Wire format: PDU header, message types,
 *  acks and error codes.
 */
pub mod proto;
/**
 * Content-addressed repository: storage,
 *  permissions, fan-out links and gc.
 */
pub mod repos;
/**
 * Encrypted session transport over any
 *  async byte stream.
 */
pub mod session;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::blob::{Blob, BlobKind};
    pub use crate::crypto::{CryptoBox, Nonce, PublicKey, SecretKey, SeqLen};
    pub use crate::pdu::{Pdu, PduPool};
    pub use crate::proto::{ErrCode, Id, Req};
    pub use crate::repos::{Repos, ReposError, Sum};
    pub use crate::session::{Session, SessionConfig, SessionError, SessionReceiver, State};
    pub use crate::version::build_info;
}
