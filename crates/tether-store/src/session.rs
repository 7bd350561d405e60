//! Transcript of a single session.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_client::{ConnectionManager, Refresh, RefresherId, StateChannel, StateChannelOptions};
use tether_config::ChannelNames;
use tether_types::{MessageBatch, MessagesSnapshot, SdkMessage, SdkMessageKind, Snapshot};
use tokio::sync::watch;

use crate::error::StoreError;
use crate::merge::merge_records;

type MessagesChannel = StateChannel<MessagesSnapshot, MessageBatch>;

#[derive(Default)]
struct Lifecycle {
    channel: Option<MessagesChannel>,
    refresher: Option<RefresherId>,
}

struct SessionInner {
    session_id: String,
    manager: ConnectionManager,
    channels: ChannelNames,
    rpc_timeout: Duration,
    messages: watch::Sender<Vec<SdkMessage>>,
    initialized: AtomicBool,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// Ordered, deduplicated message log for one session.
///
/// Snapshots and live batches are both merged by UUID, so overlapping
/// refetches after a reconnect never duplicate entries.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    pub fn new(manager: ConnectionManager, session_id: impl Into<String>) -> Self {
        let config = manager.config().clone();
        let (messages, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(SessionInner {
                session_id: session_id.into(),
                channels: config.channels(),
                rpc_timeout: config.rpc_timeout(),
                manager,
                messages,
                initialized: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let channel = self.build_channel();
        channel.start().await?;

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        lifecycle.refresher = Some(inner.manager.register_refresher(weak));
        lifecycle.channel = Some(channel);
        inner.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(
            session_id = %inner.session_id,
            messages = inner.messages.borrow().len(),
            "session store initialized"
        );
        Ok(())
    }

    pub async fn refresh(&self) -> Result<(), StoreError> {
        self.inner.refresh().await
    }

    pub async fn destroy(&self) {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        if let Some(id) = lifecycle.refresher.take() {
            inner.manager.unregister_refresher(id);
        }
        if let Some(channel) = lifecycle.channel.take() {
            if let Err(error) = channel.stop() {
                tracing::warn!(session_id = %inner.session_id, %error, "failed to stop message channel");
            }
        }
        inner.initialized.store(false, Ordering::SeqCst);
    }

    fn build_channel(&self) -> MessagesChannel {
        let inner = &self.inner;
        let options = StateChannelOptions::new(
            inner.channels.session_messages.clone(),
            inner.rpc_timeout,
        )
        .with_delta_channel(inner.channels.session_messages_delta.clone())
        .with_params(json!({ "sessionId": inner.session_id }));

        let on_snapshot = Arc::downgrade(&self.inner);
        let on_batch = Arc::downgrade(&self.inner);
        StateChannel::new(
            inner.manager.clone(),
            options,
            Arc::new(move |snapshot: Snapshot<MessagesSnapshot>| {
                if let Some(inner) = on_snapshot.upgrade() {
                    inner.merge(&snapshot.data.session_id, &snapshot.data.messages);
                }
            }),
            Arc::new(move |batch: MessageBatch| {
                if let Some(inner) = on_batch.upgrade() {
                    inner.merge(&batch.session_id, &batch.messages);
                }
            }),
        )
    }

    pub fn messages(&self) -> Vec<SdkMessage> {
        self.inner.messages.borrow().clone()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<SdkMessage>> {
        self.inner.messages.subscribe()
    }

    pub fn last_message(&self) -> Option<SdkMessage> {
        self.inner.messages.borrow().last().cloned()
    }

    /// Merges messages obtained outside the channel, such as a local echo.
    pub fn append_messages(&self, messages: &[SdkMessage]) {
        self.inner.merge(&self.inner.session_id, messages);
    }

    /// Echoes the message locally, then sends it. The echo is removed if
    /// the call fails; the daemon's copy later merges over it by UUID.
    pub async fn send_message(&self, text: &str) -> Result<SdkMessage, StoreError> {
        let inner = &self.inner;
        let message = SdkMessage::new(
            inner.session_id.clone(),
            SdkMessageKind::User,
            chrono::Utc::now().timestamp_millis(),
            json!({ "text": text }),
        );
        self.append_messages(std::slice::from_ref(&message));

        let result = async {
            let params = json!({
                "sessionId": inner.session_id,
                "message": serde_json::to_value(&message)?,
            });
            let handle = inner.manager.get_hub().await?;
            handle
                .call_value(&inner.channels.session_send, params, inner.rpc_timeout)
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(message),
            Err(error) => {
                tracing::warn!(session_id = %inner.session_id, %error, "send failed, removing local echo");
                inner.messages.send_if_modified(|messages| {
                    let before = messages.len();
                    messages.retain(|m| m.uuid != message.uuid);
                    messages.len() != before
                });
                Err(error)
            }
        }
    }
}

impl SessionInner {
    fn merge(&self, session_id: &str, incoming: &[SdkMessage]) {
        if session_id != self.session_id {
            tracing::debug!(expected = %self.session_id, got = %session_id, "ignoring messages for another session");
            return;
        }
        if incoming.is_empty() {
            return;
        }
        self.messages.send_modify(|messages| {
            *messages = merge_records(messages, incoming);
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
}

#[async_trait]
impl Refresh for SessionInner {
    fn name(&self) -> &str {
        &self.session_id
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        SessionInner::refresh(self).await?;
        Ok(())
    }
}
