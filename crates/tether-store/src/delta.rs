use std::collections::HashSet;
use tether_types::{Delta, Entity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub removed: usize,
    pub updated: usize,
    pub added: usize,
    /// Updates and removals whose key was not present.
    pub ignored: usize,
}

/// Applies `delta` in the fixed order remove, update, add. Added entities
/// are prepended, first one first, replacing any entity with the same key.
/// Unknown keys are dropped.
pub fn apply_delta<E: Entity>(items: &mut Vec<E>, delta: &Delta<E>) -> DeltaStats {
    let mut stats = DeltaStats::default();

    if !delta.removed.is_empty() {
        let removed: HashSet<&str> = delta.removed.iter().map(String::as_str).collect();
        let before = items.len();
        items.retain(|item| !removed.contains(item.key()));
        stats.removed = before - items.len();
        stats.ignored += removed.len().saturating_sub(stats.removed);
    }

    for patch in &delta.updated {
        match items
            .iter_mut()
            .find(|item| item.key() == E::patch_key(patch))
        {
            Some(item) => {
                item.apply_patch(patch);
                stats.updated += 1;
            }
            None => stats.ignored += 1,
        }
    }

    if !delta.added.is_empty() {
        // Last occurrence of a repeated key wins.
        let mut seen = HashSet::new();
        let mut added: Vec<&E> = delta
            .added
            .iter()
            .rev()
            .filter(|item| seen.insert(item.key()))
            .collect();
        added.reverse();

        items.retain(|item| !seen.contains(item.key()));
        stats.added = added.len();
        items.splice(0..0, added.into_iter().cloned());
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{Session, SessionPatch};

    fn sessions(ids: &[&str]) -> Vec<Session> {
        ids.iter().map(|id| Session::new(*id, format!("session {id}"))).collect()
    }

    fn keys(items: &[Session]) -> Vec<&str> {
        items.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn removes_then_updates_then_prepends() {
        let mut items = sessions(&["1", "2", "3"]);
        let delta = Delta {
            added: sessions(&["4"]),
            updated: vec![SessionPatch::new("1").title("X")],
            removed: vec!["2".to_string()],
        };

        let stats = apply_delta(&mut items, &delta);

        assert_eq!(keys(&items), vec!["4", "1", "3"]);
        assert_eq!(items[1].title, "X");
        assert_eq!(
            stats,
            DeltaStats {
                removed: 1,
                updated: 1,
                added: 1,
                ignored: 0
            }
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut items = sessions(&["1"]);
        let delta = Delta {
            added: Vec::new(),
            updated: vec![SessionPatch::new("9").title("ghost")],
            removed: vec!["8".to_string()],
        };

        let stats = apply_delta(&mut items, &delta);
        assert_eq!(keys(&items), vec!["1"]);
        assert_eq!(items[0].title, "session 1");
        assert_eq!(stats.ignored, 2);
    }

    #[test]
    fn update_of_key_removed_in_same_delta_is_dropped() {
        let mut items = sessions(&["1", "2"]);
        let delta = Delta {
            added: Vec::new(),
            updated: vec![SessionPatch::new("2").title("late")],
            removed: vec!["2".to_string()],
        };

        apply_delta(&mut items, &delta);
        assert_eq!(keys(&items), vec!["1"]);
    }

    #[test]
    fn re_added_key_replaces_existing_entry() {
        let mut items = sessions(&["1", "2"]);
        let mut fresh = Session::new("2", "fresh");
        fresh.archived = true;
        let delta = Delta {
            added: vec![fresh],
            ..Default::default()
        };

        apply_delta(&mut items, &delta);
        assert_eq!(keys(&items), vec!["2", "1"]);
        assert_eq!(items[0].title, "fresh");
    }

    #[test]
    fn multiple_added_keep_their_order() {
        let mut items = sessions(&["1"]);
        let delta = Delta {
            added: sessions(&["5", "6"]),
            ..Default::default()
        };
        apply_delta(&mut items, &delta);
        assert_eq!(keys(&items), vec!["5", "6", "1"]);
    }

    #[test]
    fn repeated_added_key_keeps_last_entry() {
        let mut items = sessions(&["1", "2"]);
        let delta = Delta {
            added: vec![
                Session::new("2", "first"),
                Session::new("3", "new"),
                Session::new("2", "second"),
            ],
            ..Default::default()
        };

        let stats = apply_delta(&mut items, &delta);
        assert_eq!(keys(&items), vec!["3", "2", "1"]);
        assert_eq!(items[1].title, "second");
        assert_eq!(stats.added, 2);
    }
}
