use crate::event::SessionEvent;
use std::collections::VecDeque;

pub const DEFAULT_REPLAY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEntry {
    pub seq: u64,
    pub event: SessionEvent,
}

/// Why a cursor cannot be answered from the buffer alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayGap {
    /// Transient events newer than the cursor were evicted.
    Evicted { cursor: u64, evicted_through: u64 },
    /// The cursor was never issued by this buffer, e.g. it predates a session restart.
    UnknownCursor { cursor: u64, last_seq: u64 },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplaySlice {
    pub entries: Vec<ReplayEntry>,
    pub gap: Option<ReplayGap>,
}

impl ReplaySlice {
    pub fn is_complete(&self) -> bool {
        self.gap.is_none()
    }
}

/// Bounded ring of the most recent transient events, shared by every subscriber of a session.
///
/// Every appended event consumes a sequence number; only transient ones are retained.
/// History-backed events are recovered from the transcript instead.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    entries: VecDeque<ReplayEntry>,
    last_seq: u64,
    evicted_through: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
            last_seq: 0,
            evicted_through: 0,
        }
    }

    pub fn append(&mut self, event: &SessionEvent) -> u64 {
        self.last_seq += 1;
        let seq = self.last_seq;
        if event.is_history_backed() {
            return seq;
        }
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.evicted_through = evicted.seq;
            }
        }
        self.entries.push_back(ReplayEntry {
            seq,
            event: event.clone(),
        });
        seq
    }

    pub fn since(&self, cursor: u64) -> ReplaySlice {
        if cursor > self.last_seq {
            return ReplaySlice {
                entries: self.entries.iter().cloned().collect(),
                gap: Some(ReplayGap::UnknownCursor {
                    cursor,
                    last_seq: self.last_seq,
                }),
            };
        }

        let gap = (cursor < self.evicted_through).then_some(ReplayGap::Evicted {
            cursor,
            evicted_through: self.evicted_through,
        });
        let start = self.entries.partition_point(|entry| entry.seq <= cursor);
        ReplaySlice {
            entries: self.entries.range(start..).cloned().collect(),
            gap,
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}
