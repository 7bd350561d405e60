use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// State that can be re-fetched wholesale after the host resumes.
#[async_trait]
pub trait Refresh: Send + Sync {
    fn name(&self) -> &str;

    async fn refresh(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefresherId(u64);

/// Holds refreshers weakly so a registered store can still be dropped.
#[derive(Default)]
pub(crate) struct RefresherRegistry {
    next_id: u64,
    entries: BTreeMap<u64, Weak<dyn Refresh>>,
}

impl RefresherRegistry {
    pub(crate) fn register(&mut self, refresher: Weak<dyn Refresh>) -> RefresherId {
        self.next_id += 1;
        self.entries.insert(self.next_id, refresher);
        RefresherId(self.next_id)
    }

    pub(crate) fn unregister(&mut self, id: RefresherId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    /// Upgrades live entries and forgets dead ones.
    pub(crate) fn live(&mut self) -> Vec<Arc<dyn Refresh>> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|_, weak| match weak.upgrade() {
            Some(refresher) => {
                live.push(refresher);
                true
            }
            None => false,
        });
        live
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Refreshes all targets concurrently. Returns the number that failed.
pub(crate) async fn refresh_all(refreshers: Vec<Arc<dyn Refresh>>) -> usize {
    let results = join_all(refreshers.iter().map(|r| r.refresh())).await;
    let mut failures = 0;
    for (refresher, result) in refreshers.iter().zip(results) {
        if let Err(error) = result {
            failures += 1;
            tracing::warn!(target_name = refresher.name(), %error, "refresh after resume failed");
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Refresh for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn refresh(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("snapshot unavailable");
            }
            Ok(())
        }
    }

    fn as_weak(refresher: &Arc<Counting>) -> Weak<dyn Refresh> {
        let weak = Arc::downgrade(refresher);
        weak
    }

    #[tokio::test]
    async fn refreshes_live_entries_and_prunes_dropped_ones() {
        let ok = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let failing = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let dropped: Arc<dyn Refresh> = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let mut registry = RefresherRegistry::default();
        registry.register(as_weak(&ok));
        let failing_id = registry.register(as_weak(&failing));
        let dropped_weak = Arc::downgrade(&dropped);
        registry.register(dropped_weak);
        drop(dropped);

        let live = registry.live();
        assert_eq!(live.len(), 2);
        assert_eq!(refresh_all(live).await, 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(failing_id));
        assert!(!registry.unregister(failing_id));
        assert_eq!(registry.live().len(), 1);
    }
}
