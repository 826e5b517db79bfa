use serde::{Deserialize, Serialize};

/// A single record in the replicated log.
///
/// Indices are 1-based and dense; the leader assigns them at append time.
/// The command is opaque to the replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// Entries are stored densely from position 0, so entry `i` lives at
/// position `i - 1`. Every lookup still verifies the stored index.

/// Index and term of the last entry, `(0, 0)` on an empty log.
pub fn last_info(log: &[LogEntry]) -> (u64, u64) {
    log.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
}

/// Storage position of the entry with the given logical index.
pub fn position_of(log: &[LogEntry], index: u64) -> Option<usize> {
    let pos = usize::try_from(index.checked_sub(1)?).ok()?;
    match log.get(pos) {
        Some(e) if e.index == index => Some(pos),
        _ => None,
    }
}

pub fn term_at(log: &[LogEntry], index: u64) -> Option<u64> {
    position_of(log, index).map(|p| log[p].term)
}

/// First index carrying the given term, 0 if the term never appears.
pub fn first_index_for_term(log: &[LogEntry], term: u64) -> u64 {
    log.iter()
        .find(|e| e.term == term)
        .map(|e| e.index)
        .unwrap_or(0)
}

/// Entries with `after < index <= up_to`, in order.
pub fn span(log: &[LogEntry], after: u64, up_to: u64) -> &[LogEntry] {
    if up_to <= after {
        return &[];
    }
    let Some(lo) = position_of(log, after + 1) else {
        return &[];
    };
    let hi = match position_of(log, up_to) {
        Some(p) => p + 1,
        None => log.len(),
    };
    &log[lo..hi]
}
