use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use common::prelude::Id;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "<-"),
            Direction::Out => write!(f, "->"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time: DateTime<Utc>,
    pub session: String,
    pub direction: Direction,
    pub id: Id,
    pub len: u64,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.time.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.session,
            self.direction,
            self.id,
            self.len
        )
    }
}

/// Bounded ring of recent PDU events. The oldest event is dropped when full.
#[derive(Debug)]
pub struct TraceRing {
    capacity: usize,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl TraceRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, session: &str, direction: Direction, id: Id, len: u64) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(TraceEvent {
            time: Utc::now(),
            session: session.to_string(),
            direction,
            id,
            len,
        });
    }

    /// One line per event, oldest first.
    pub fn dump(&self) -> String {
        let events = self.events.lock();
        let mut out = String::new();
        for event in events.iter() {
            out.push_str(&event.to_string());
            out.push('\n');
        }
        out
    }

    /// Drop every event, returning how many there were.
    pub fn flush(&self) -> usize {
        let mut events = self.events.lock();
        let n = events.len();
        events.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let ring = TraceRing::new(2);
        ring.record("a", Direction::In, Id::Login, 1);
        ring.record("b", Direction::In, Id::Exec, 2);
        ring.record("c", Direction::Out, Id::Blob, 3);

        let dump = ring.dump();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" b <- "));
        assert!(lines[1].contains(" c -> "));
    }

    #[test]
    fn test_flush_empties() {
        let ring = TraceRing::new(8);
        ring.record("a", Direction::In, Id::Quit, 10);
        assert_eq!(ring.flush(), 1);
        assert!(ring.is_empty());
        assert_eq!(ring.dump(), "");
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let ring = TraceRing::new(0);
        ring.record("a", Direction::In, Id::Quit, 10);
        assert!(ring.is_empty());
    }
}
