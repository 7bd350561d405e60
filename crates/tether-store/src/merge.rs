//! Folding replayed or refetched event batches into an ordered log.

use std::collections::HashMap;
use tether_types::SdkMessage;

/// A log entry identified by a stable UUID.
pub trait Record: Clone {
    fn uuid(&self) -> &str;

    fn timestamp(&self) -> i64;
}

impl Record for SdkMessage {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// One entry per UUID, `incoming` winning collisions, ordered by timestamp
/// ascending (UUID breaks ties). Neither input needs to be sorted.
pub fn merge_records<R: Record>(existing: &[R], incoming: &[R]) -> Vec<R> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(existing.len() + incoming.len());
    let mut merged: Vec<R> = Vec::with_capacity(existing.len() + incoming.len());

    for record in existing.iter().chain(incoming) {
        match positions.get(record.uuid()) {
            Some(&index) => merged[index] = record.clone(),
            None => {
                positions.insert(record.uuid(), merged.len());
                merged.push(record.clone());
            }
        }
    }

    merged.sort_by(|a, b| {
        a.timestamp()
            .cmp(&b.timestamp())
            .then_with(|| a.uuid().cmp(b.uuid()))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        id: &'static str,
        at: i64,
        body: &'static str,
    }

    impl Record for Entry {
        fn uuid(&self) -> &str {
            self.id
        }

        fn timestamp(&self) -> i64 {
            self.at
        }
    }

    fn entry(id: &'static str, at: i64) -> Entry {
        Entry { id, at, body: "" }
    }

    fn ids(entries: &[Entry]) -> Vec<&'static str> {
        entries.iter().map(|e| e.id).collect()
    }

    #[test]
    fn overlapping_batches_collapse_to_one_entry_per_uuid() {
        let merged = merge_records(
            &[entry("a", 1), entry("b", 2)],
            &[entry("b", 2), entry("c", 3)],
        );
        assert_eq!(merged, vec![entry("a", 1), entry("b", 2), entry("c", 3)]);
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let batch = [entry("x", 5), entry("y", 4)];
        let once = merge_records(&[], &batch);
        let twice = merge_records(&once, &batch);
        assert_eq!(once, twice);
        assert_eq!(ids(&twice), vec!["y", "x"]);
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let first = merge_records(&[entry("c", 3), entry("a", 1)], &[entry("b", 2)]);
        let second = merge_records(&[entry("b", 2)], &[entry("a", 1), entry("c", 3)]);
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["a", "b", "c"]);
    }

    #[test]
    fn incoming_wins_and_order_is_rederived() {
        let existing = [
            Entry { id: "a", at: 1, body: "draft" },
            entry("b", 2),
        ];
        let incoming = [Entry { id: "a", at: 3, body: "final" }];

        let merged = merge_records(&existing, &incoming);
        assert_eq!(ids(&merged), vec!["b", "a"]);
        assert_eq!(merged[1].body, "final");
    }

    #[test]
    fn equal_timestamps_sort_by_uuid() {
        let merged = merge_records(&[entry("m", 7), entry("k", 7)], &[]);
        assert_eq!(ids(&merged), vec!["k", "m"]);
    }
}
