//! Push notification contract
//!
//! The topic runtime materializes per-recipient receipts; connectors
//! (HTTP, FCM, ...) register by name and consume them. Handoff is always
//! non-blocking: a slow connector drops receipts, it never stalls a topic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::access::AccessMode;
use crate::types::Uid;

/// What triggered the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushWhat {
    /// New data message.
    Msg,
    /// New subscription.
    Sub,
}

/// Per-recipient delivery details.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Recipient {
    /// Number of live sessions the message was fanned out to. Non-zero means
    /// the push should be marked silent.
    pub delivered: u32,
}

/// Notification body shared by all recipients of one receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub what: PushWhat,
    pub silent: bool,
    /// Topic name as seen by the recipients.
    pub topic: String,
    pub from: String,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_want: Option<AccessMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_given: Option<AccessMode>,
}

/// A materialized push receipt.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub to: HashMap<Uid, Recipient>,
    /// FCM-style channel name for channel-enabled topics, empty otherwise.
    pub channel: String,
    pub payload: Payload,
}

/// Channel (FCM topic) membership change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReq {
    pub uid: Uid,
    pub channel: String,
    pub unsub: bool,
}

/// A push connector. Implementations must not block.
pub trait Pusher: Send + Sync {
    fn name(&self) -> &str;
    fn push(&self, receipt: &Receipt);
    fn channel_sub(&self, req: &ChannelReq);
}

/// Named connector registry. Cloneable; registration happens at startup.
#[derive(Clone, Default)]
pub struct PushRegistry {
    adapters: Vec<Arc<dyn Pusher>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector. Later registrations with the same name replace
    /// earlier ones.
    pub fn register(&mut self, adapter: Arc<dyn Pusher>) {
        self.adapters.retain(|a| a.name() != adapter.name());
        self.adapters.push(adapter);
    }

    /// Fan a receipt out to every connector. Receipts with no recipients and
    /// no channel are discarded.
    pub fn push(&self, receipt: &Receipt) {
        if receipt.to.is_empty() && receipt.channel.is_empty() {
            return;
        }
        for adapter in &self.adapters {
            adapter.push(receipt);
        }
    }

    pub fn channel_sub(&self, req: &ChannelReq) {
        for adapter in &self.adapters {
            adapter.channel_sub(req);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Connector backed by an unbounded queue; used by tests and as a template
/// for real connectors.
pub struct QueuePusher {
    name: String,
    tx: tokio::sync::mpsc::UnboundedSender<Receipt>,
    ch_tx: tokio::sync::mpsc::UnboundedSender<ChannelReq>,
}

impl QueuePusher {
    pub fn new(
        name: &str,
    ) -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<Receipt>,
        tokio::sync::mpsc::UnboundedReceiver<ChannelReq>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (ch_tx, ch_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                name: name.to_string(),
                tx,
                ch_tx,
            },
            rx,
            ch_rx,
        )
    }
}

impl Pusher for QueuePusher {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, receipt: &Receipt) {
        if self.tx.send(receipt.clone()).is_err() {
            warn!(adapter = %self.name, "push receiver gone");
        }
    }

    fn channel_sub(&self, req: &ChannelReq) {
        let _ = self.ch_tx.send(req.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::time_now;

    fn receipt(to: &[(Uid, u32)], channel: &str) -> Receipt {
        Receipt {
            to: to
                .iter()
                .map(|(uid, n)| (*uid, Recipient { delivered: *n }))
                .collect(),
            channel: channel.to_string(),
            payload: Payload {
                what: PushWhat::Msg,
                silent: false,
                topic: "grp1".into(),
                from: Uid(1).user_id(),
                ts: time_now(),
                seq: 1,
                content_type: String::new(),
                content: None,
                mode_want: None,
                mode_given: None,
            },
        }
    }

    #[tokio::test]
    async fn test_empty_receipt_discarded() {
        let (pusher, mut rx, _) = QueuePusher::new("test");
        let mut reg = PushRegistry::new();
        reg.register(Arc::new(pusher));

        reg.push(&receipt(&[], ""));
        assert!(rx.try_recv().is_err());

        reg.push(&receipt(&[(Uid(2), 1)], ""));
        assert_eq!(rx.try_recv().unwrap().to.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_only_receipt_delivered() {
        let (pusher, mut rx, _) = QueuePusher::new("test");
        let mut reg = PushRegistry::new();
        reg.register(Arc::new(pusher));

        reg.push(&receipt(&[], "chn1"));
        assert_eq!(rx.try_recv().unwrap().channel, "chn1");
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let (p1, mut rx1, _) = QueuePusher::new("fcm");
        let (p2, mut rx2, _) = QueuePusher::new("fcm");
        let mut reg = PushRegistry::new();
        reg.register(Arc::new(p1));
        reg.register(Arc::new(p2));

        reg.push(&receipt(&[(Uid(2), 0)], ""));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }
}
