use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of a request correlation token in bytes
pub const REQ_SIZE: usize = 8;

/// Opaque token tying a request to its Ack.
///
/// Either a big-endian counter or a short, NUL-padded literal such as
/// `login`. Only needs to be unique among the requests still pending on one
/// session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Req([u8; REQ_SIZE]);

impl From<[u8; REQ_SIZE]> for Req {
    fn from(bytes: [u8; REQ_SIZE]) -> Self {
        Req(bytes)
    }
}

impl Req {
    pub const LOGIN: Req = Req::literal("login");
    pub const QUIT: Req = Req::literal("quit");
    pub const PAUSE: Req = Req::literal("pause");
    pub const RESUME: Req = Req::literal("resume");

    pub fn counter(n: u64) -> Self {
        Req(n.to_be_bytes())
    }

    /// Literal token; anything past eight bytes is cut off.
    pub const fn literal(s: &str) -> Self {
        let src = s.as_bytes();
        let mut out = [0u8; REQ_SIZE];
        let mut i = 0;
        while i < REQ_SIZE && i < src.len() {
            out[i] = src[i];
            i += 1;
        }
        Req(out)
    }

    pub fn as_bytes(&self) -> &[u8; REQ_SIZE] {
        &self.0
    }

    fn is_literal(&self) -> bool {
        self.0[0].is_ascii_alphabetic()
            && self
                .0
                .iter()
                .all(|b| *b == 0 || b.is_ascii_graphic())
    }
}

impl fmt::Display for Req {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_literal() {
            let end = self.0.iter().position(|b| *b == 0).unwrap_or(REQ_SIZE);
            write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
        } else {
            write!(f, "#{}", u64::from_be_bytes(self.0))
        }
    }
}

impl fmt::Debug for Req {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Req({})", self)
    }
}

/// Monotonic counter handing out request tokens for one session.
#[derive(Debug, Default)]
pub struct Requester {
    next: AtomicU64,
}

impl Requester {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Req {
        Req::counter(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_literal_display() {
        assert_eq!(Req::LOGIN.to_string(), "login");
        assert_eq!(Req::literal("averyverylongname").to_string(), "averyver");
    }

    #[test]
    fn test_counter_is_monotonic() {
        let requester = Requester::new();
        let a = requester.next();
        let b = requester.next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "#1");
        assert_eq!(u64::from_be_bytes(*b.as_bytes()), 2);
    }
}
