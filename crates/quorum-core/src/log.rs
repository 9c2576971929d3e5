//! # log
//!
//! why: manage the replicated log of commands with origin-1 indexing
//! relations: owned by node.rs, persisted as part of the state blob
//! what: LogEntry struct, Log store with sentinel entry, conflict scan helpers

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, command: Vec<u8>) -> Self {
        Self { term, command }
    }
}

/// The log store: entries indexed from 1, with a term-0 sentinel at position 0
///
/// The sentinel makes `term(prev_log_index)` a valid lookup for every
/// `prev_log_index >= 0`, so the consistency check needs no special case for
/// the front of the log. An entry's index is its position in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// create a log holding only the sentinel
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::new(0, Vec::new())],
        }
    }

    /// index of the last real entry; 0 when only the sentinel exists
    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    /// term of the last entry (0 for the sentinel)
    pub fn last_term(&self) -> u64 {
        self.entries[self.entries.len() - 1].term
    }

    /// term of the entry at `index`; index 0 is always the sentinel's term 0
    pub fn term(&self, index: u64) -> u64 {
        self.entries[index as usize].term
    }

    /// entry at `index` (callers stay within `0..=last_index`)
    pub fn entry(&self, index: u64) -> &LogEntry {
        &self.entries[index as usize]
    }

    /// append one entry at the tail
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// append entries at the tail
    pub fn append<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = LogEntry>,
    {
        self.entries.extend(entries);
    }

    /// drop every entry at index `to` and above, keeping indices `< to`
    pub fn truncate(&mut self, to: u64) {
        debug_assert!(to >= 1, "the sentinel is never truncated");
        self.entries.truncate(to as usize);
    }

    /// clone of all entries from `from` to the tail
    pub fn tail_from(&self, from: u64) -> Vec<LogEntry> {
        self.entries[from as usize..].to_vec()
    }

    /// smallest index of the contiguous run of entries sharing `term(from)`,
    /// scanning backward from `from`
    ///
    /// This is the conflict hint a follower returns on a term mismatch: the
    /// leader can skip the entire conflicting term in one step.
    pub fn first_index_of_term(&self, from: u64) -> u64 {
        let term = self.term(from);
        let mut index = from;
        while index > 1 && self.term(index - 1) == term {
            index -= 1;
        }
        index
    }

    /// highest index holding an entry of `term`, if any entry does
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        (1..=self.last_index()).rev().find(|&i| self.term(i) == term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> Log {
        let mut log = Log::new();
        for &t in terms {
            log.push(LogEntry::new(t, vec![t as u8]));
        }
        log
    }

    #[test]
    fn new_log_holds_only_the_sentinel() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term(0), 0);
        assert!(log.entry(0).command.is_empty());
    }

    #[test]
    fn push_grows_indices_from_one() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term(1), 1);
        assert_eq!(log.term(3), 2);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn truncate_keeps_entries_below_cutoff() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);

        log.truncate(3);

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn truncate_to_one_leaves_just_the_sentinel() {
        let mut log = log_with_terms(&[1, 2, 3]);

        log.truncate(1);

        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn tail_from_clones_the_suffix() {
        let log = log_with_terms(&[1, 2, 3]);

        let tail = log.tail_from(2);

        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].term, 2);
        assert_eq!(tail[1].term, 3);
    }

    #[test]
    fn first_index_of_term_finds_start_of_run() {
        let log = log_with_terms(&[1, 2, 2, 2, 3]);

        assert_eq!(log.first_index_of_term(4), 2); // run of term 2 starts at 2
        assert_eq!(log.first_index_of_term(5), 5); // lone entry of term 3
        assert_eq!(log.first_index_of_term(1), 1); // run touching the sentinel
    }

    #[test]
    fn last_index_of_term_scans_from_tail() {
        let log = log_with_terms(&[1, 2, 2, 3]);

        assert_eq!(log.last_index_of_term(2), Some(3));
        assert_eq!(log.last_index_of_term(3), Some(4));
        assert_eq!(log.last_index_of_term(7), None);
    }
}
