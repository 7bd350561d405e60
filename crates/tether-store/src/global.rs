//! Sessions, system status and settings shared by every view.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_client::{
    ConnectionManager, PushHandler, Refresh, RefresherId, StateChannel, StateChannelOptions,
    Subscription,
};
use tether_config::ChannelNames;
use tether_types::{
    Delta, Entity, GlobalSnapshot, Session, SessionPatch, Settings, SettingsPatch, Snapshot,
    SystemStatus,
};
use tether_util::CancellableTimer;
use tokio::sync::watch;

use crate::delta::apply_delta;
use crate::error::StoreError;

type GlobalChannel = StateChannel<GlobalSnapshot, Delta<Session>>;

#[derive(Default)]
struct Lifecycle {
    channel: Option<GlobalChannel>,
    subscriptions: Vec<Subscription>,
    refresher: Option<RefresherId>,
}

struct GlobalInner {
    manager: ConnectionManager,
    channels: ChannelNames,
    rpc_timeout: Duration,
    recent_limit: usize,
    save_debounce: Duration,
    sessions: watch::Sender<Vec<Session>>,
    system: watch::Sender<SystemStatus>,
    settings: watch::Sender<Settings>,
    initialized: AtomicBool,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    pending_settings: Mutex<SettingsPatch>,
    save_timer: CancellableTimer,
}

/// Reactive containers for the daemon-wide state.
#[derive(Clone)]
pub struct GlobalStore {
    inner: Arc<GlobalInner>,
}

impl GlobalStore {
    pub fn new(manager: ConnectionManager) -> Self {
        let config = manager.config().clone();
        let (sessions, _) = watch::channel(Vec::new());
        let (system, _) = watch::channel(SystemStatus::default());
        let (settings, _) = watch::channel(Settings::default());
        Self {
            inner: Arc::new(GlobalInner {
                channels: config.channels(),
                rpc_timeout: config.rpc_timeout(),
                recent_limit: config.recent_sessions_limit(),
                save_debounce: config.settings_save_debounce(),
                manager,
                sessions,
                system,
                settings,
                initialized: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
                pending_settings: Mutex::new(SettingsPatch::default()),
                save_timer: CancellableTimer::new(),
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Fetches the snapshot and wires delta and push subscriptions.
    /// Idempotent.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let channel = self.build_channel();
        channel.start().await?;

        let handle = inner.manager.get_hub_or_err()?;
        let system = handle.hub().subscribe_optimistic(
            &inner.channels.system,
            json!({}),
            self.replace_handler(&inner.channels.system, |inner, status: SystemStatus| {
                inner.system.send_replace(status);
            }),
        );
        let settings = handle.hub().subscribe_optimistic(
            &inner.channels.settings,
            json!({}),
            self.replace_handler(&inner.channels.settings, |inner, settings: Settings| {
                inner.settings.send_replace(settings);
            }),
        );

        let weak: Weak<GlobalInner> = Arc::downgrade(&self.inner);
        lifecycle.refresher = Some(inner.manager.register_refresher(weak));
        lifecycle.channel = Some(channel);
        lifecycle.subscriptions = vec![system, settings];
        inner.initialized.store(true, Ordering::SeqCst);
        tracing::info!(sessions = inner.sessions.borrow().len(), "global store initialized");
        Ok(())
    }

    /// Re-fetches and replaces every container. No-op before
    /// `initialize()`; on failure the current state is kept.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        self.inner.refresh().await
    }

    /// Releases every subscription. Failures are logged and do not stop
    /// the remaining cleanup. Idempotent.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        if inner.save_timer.cancel() {
            tracing::debug!("pending settings save discarded");
        }
        *inner.pending_settings.lock() = SettingsPatch::default();

        if let Some(id) = lifecycle.refresher.take() {
            inner.manager.unregister_refresher(id);
        }
        if let Some(channel) = lifecycle.channel.take() {
            if let Err(error) = channel.stop() {
                tracing::warn!(channel = %channel.channel(), %error, "failed to stop state channel");
            }
        }
        for subscription in lifecycle.subscriptions.drain(..) {
            let channel = subscription.channel().to_string();
            if let Err(error) = subscription.unsubscribe() {
                tracing::warn!(channel = %channel, %error, "failed to unsubscribe");
            }
        }

        inner.initialized.store(false, Ordering::SeqCst);
    }

    fn build_channel(&self) -> GlobalChannel {
        let inner = &self.inner;
        let options = StateChannelOptions::new(inner.channels.global.clone(), inner.rpc_timeout)
            .with_delta_channel(inner.channels.sessions_delta.clone());

        let on_snapshot = Arc::downgrade(&self.inner);
        let on_delta = Arc::downgrade(&self.inner);
        StateChannel::new(
            inner.manager.clone(),
            options,
            Arc::new(move |snapshot: Snapshot<GlobalSnapshot>| {
                if let Some(inner) = on_snapshot.upgrade() {
                    inner.apply_snapshot(snapshot.data);
                }
            }),
            Arc::new(move |delta: Delta<Session>| {
                if let Some(inner) = on_delta.upgrade() {
                    inner.apply_sessions_delta(&delta);
                }
            }),
        )
    }

    fn replace_handler<T, F>(&self, channel: &str, apply: F) -> PushHandler
    where
        T: serde::de::DeserializeOwned + 'static,
        F: Fn(&GlobalInner, T) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let channel = channel.to_string();
        Arc::new(move |value: Value| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match serde_json::from_value::<T>(value) {
                Ok(parsed) => apply(&inner, parsed),
                Err(error) => tracing::warn!(channel = %channel, %error, "dropping malformed push"),
            }
        })
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.borrow().clone()
    }

    pub fn subscribe_sessions(&self) -> watch::Receiver<Vec<Session>> {
        self.inner.sessions.subscribe()
    }

    pub fn system(&self) -> SystemStatus {
        self.inner.system.borrow().clone()
    }

    pub fn subscribe_system(&self) -> watch::Receiver<SystemStatus> {
        self.inner.system.subscribe()
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.borrow().clone()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<Settings> {
        self.inner.settings.subscribe()
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.inner
            .sessions
            .borrow()
            .iter()
            .filter(|session| session.is_active())
            .cloned()
            .collect()
    }

    /// Unarchived sessions, most recently active first.
    pub fn recent_sessions(&self) -> Vec<Session> {
        let mut recent: Vec<Session> = self
            .inner
            .sessions
            .borrow()
            .iter()
            .filter(|session| !session.archived)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        recent.truncate(self.inner.recent_limit);
        recent
    }

    pub fn has_archived_sessions(&self) -> bool {
        self.inner
            .sessions
            .borrow()
            .iter()
            .any(|session| session.archived)
    }

    // ------------------------------------------------------------------
    // Local mutators
    // ------------------------------------------------------------------

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.inner
            .sessions
            .borrow()
            .iter()
            .find(|session| session.id == id)
            .cloned()
    }

    /// Returns `false` when no session has this id.
    pub fn update_session(&self, id: &str, mut patch: SessionPatch) -> bool {
        patch.id = id.to_string();
        self.inner.sessions.send_if_modified(|sessions| {
            match sessions.iter_mut().find(|session| session.id == id) {
                Some(session) => {
                    session.apply_patch(&patch);
                    true
                }
                None => false,
            }
        })
    }

    /// Inserts at the front, replacing any session with the same id.
    pub fn add_session(&self, session: Session) {
        self.inner.sessions.send_modify(|sessions| {
            sessions.retain(|existing| existing.id != session.id);
            sessions.insert(0, session);
        });
    }

    pub fn remove_session(&self, id: &str) -> bool {
        self.inner.sessions.send_if_modified(|sessions| {
            let before = sessions.len();
            sessions.retain(|session| session.id != id);
            sessions.len() != before
        })
    }

    // ------------------------------------------------------------------
    // Networked mutations
    // ------------------------------------------------------------------

    /// Applies `patch` locally at once and saves it after the debounce
    /// window. Edits within the window are coalesced into one save.
    pub fn update_settings(&self, patch: SettingsPatch) {
        if patch.is_empty() {
            return;
        }
        self.inner.settings.send_modify(|settings| settings.apply(&patch));
        self.inner.pending_settings.lock().merge(patch);

        let weak = Arc::downgrade(&self.inner);
        self.inner.save_timer.start(self.inner.save_debounce, move || async move {
            if let Some(inner) = weak.upgrade() {
                if let Err(error) = inner.save_settings().await {
                    tracing::warn!(%error, "debounced settings save failed");
                }
            }
        });
    }

    /// Saves pending settings edits now.
    pub async fn flush_settings(&self) -> Result<(), StoreError> {
        self.inner.save_timer.cancel();
        self.inner.save_settings().await
    }

    pub fn has_pending_settings(&self) -> bool {
        !self.inner.pending_settings.lock().is_empty()
    }

    /// Marks the session archived locally, then on the daemon. The local
    /// change is rolled back if the call fails.
    pub async fn archive_session(&self, id: &str) -> Result<(), StoreError> {
        let previous = self
            .get_session(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        self.update_session(id, SessionPatch::new(id).archived(true));

        let result = async {
            let handle = self.inner.manager.get_hub().await?;
            handle
                .call_value(
                    &self.inner.channels.session_archive,
                    json!({ "sessionId": id }),
                    self.inner.rpc_timeout,
                )
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;

        if let Err(error) = &result {
            tracing::warn!(session_id = %id, %error, "archive failed, rolling back");
            self.update_session(id, SessionPatch::new(id).archived(previous.archived));
        }
        result
    }
}

impl GlobalInner {
    fn apply_snapshot(&self, snapshot: GlobalSnapshot) {
        self.sessions.send_replace(snapshot.sessions);
        self.system.send_replace(snapshot.system);
        self.settings.send_replace(snapshot.settings);
    }

    fn apply_sessions_delta(&self, delta: &Delta<Session>) {
        self.sessions.send_if_modified(|sessions| {
            let stats = apply_delta(sessions, delta);
            if stats.ignored > 0 {
                tracing::debug!(ignored = stats.ignored, "session delta referenced unknown keys");
            }
            stats.removed + stats.updated + stats.added > 0
        });
    }

    async fn refresh(&self) -> Result<(), StoreError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let lifecycle = self.lifecycle.lock().await;
        if let Some(channel) = &lifecycle.channel {
            channel.refresh().await?;
        }
        Ok(())
    }

    async fn save_settings(&self) -> Result<(), StoreError> {
        let patch = std::mem::take(&mut *self.pending_settings.lock());
        if patch.is_empty() {
            return Ok(());
        }

        let result = async {
            let params = serde_json::to_value(&patch)?;
            let handle = self.manager.get_hub().await?;
            handle
                .call_value(&self.channels.settings_update, params, self.rpc_timeout)
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;

        if result.is_err() {
            // Keep the edits for the next save; newer edits win.
            let mut pending = self.pending_settings.lock();
            let newer = std::mem::replace(&mut *pending, patch);
            pending.merge(newer);
        }
        result
    }
}

#[async_trait]
impl Refresh for GlobalInner {
    fn name(&self) -> &str {
        "global"
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        GlobalInner::refresh(self).await?;
        Ok(())
    }
}
