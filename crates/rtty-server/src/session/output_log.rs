//! Sequenced PTY output log for resumable replay.
//!
//! Every PTY chunk gets the next sequence number. Reconnecting clients
//! present the newest sequence they saw and receive either the chunks after
//! it (delta) or, if it predates everything retained, the whole log.

use rtty_core::ServerMessage;
use std::collections::VecDeque;
use std::sync::Arc;

/// Control sequences that wipe the screen. Anything before the last one in a
/// chunk can never influence what a replaying client ends up displaying.
const CLEAR_SEQUENCES: [&str; 3] = ["\x1b[2J", "\x1b[3J", "\x1bc"];

/// One immutable PTY output chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub seq: u64,
    pub data: Arc<str>,
}

/// Bounded, gapless, append-only output log.
#[derive(Debug)]
pub struct OutputLog {
    records: VecDeque<OutputRecord>,
    next_seq: u64,
    high_water: usize,
    low_water: usize,
}

impl OutputLog {
    /// Create an empty log that trims to `low_water` records whenever it grows
    /// past `high_water`.
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            records: VecDeque::new(),
            next_seq: 1,
            high_water: high_water.max(1),
            low_water: low_water.min(high_water).max(1),
        }
    }

    /// Append one chunk and return the sequence number assigned to it.
    ///
    /// A chunk containing a clear-screen sequence empties the log and only the
    /// text after the last such sequence is retained. The returned sequence
    /// is consumed even when nothing of the chunk is retained.
    pub fn append(&mut self, data: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let retained = match last_clear_end(data) {
            Some(end) => {
                self.records.clear();
                &data[end..]
            }
            None => data,
        };

        if !retained.is_empty() {
            self.records.push_back(OutputRecord {
                seq,
                data: Arc::from(retained),
            });
        }

        if self.records.len() > self.high_water {
            let excess = self.records.len() - self.low_water;
            self.records.drain(..excess);
        }

        seq
    }

    /// Build the reply to a client's `sync`.
    ///
    /// `None` means there is nothing to send: the log is empty or the client
    /// is already up to date.
    pub fn sync_reply(&self, last_seq: Option<u64>) -> Option<ServerMessage> {
        let (oldest, newest) = match (self.oldest_seq(), self.newest_seq()) {
            (Some(o), Some(n)) => (o, n),
            _ => return None,
        };

        match last_seq {
            Some(seen) if seen >= oldest && seen <= newest => {
                let data: Vec<String> = self
                    .records
                    .iter()
                    .filter(|r| r.seq > seen)
                    .map(|r| r.data.to_string())
                    .collect();
                if data.is_empty() {
                    None
                } else {
                    Some(ServerMessage::HistoryDelta {
                        data,
                        last_seq: newest,
                    })
                }
            }
            _ => Some(ServerMessage::History {
                data: self.records.iter().map(|r| r.data.to_string()).collect(),
                last_seq: newest,
            }),
        }
    }

    /// The `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<OutputRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.records.front().map(|r| r.seq)
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.records.back().map(|r| r.seq)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record and restart numbering.
    pub fn clear(&mut self) {
        self.records.clear();
        self.next_seq = 1;
    }

    #[cfg(test)]
    fn seqs(&self) -> Vec<u64> {
        self.records.iter().map(|r| r.seq).collect()
    }
}

/// Byte offset just past the last clear-screen sequence in `data`.
fn last_clear_end(data: &str) -> Option<usize> {
    CLEAR_SEQUENCES
        .iter()
        .filter_map(|pat| data.rfind(pat).map(|pos| pos + pat.len()))
        .max()
}
