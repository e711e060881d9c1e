//! Message-bus surface used by `Hive::listen`.
//!
//! Only the shape the scheduler needs is defined here: an envelope with a
//! UUID, an optional parent id for correlation chains, and a reply-to link.
//! Real transports implement `MessageBus`; the in-process bus below is enough
//! for embedding and tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Reply topic for a job that produced result bytes.
pub const MSG_TYPE_RESULT: &str = "hive.result";
/// Reply topic for a job that produced no result.
pub const MSG_TYPE_NIL: &str = "hive.nil";
/// Reply topic for a guest-returned run error.
pub const MSG_TYPE_RUN_ERR: &str = "hive.runerr";
/// Reply topic for a host-side execution failure.
pub const MSG_TYPE_JOB_ERR: &str = "hive.joberr";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub msg_type: String,
    pub parent_id: Option<Uuid>,
    pub reply_to: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            msg_type: msg_type.into(),
            parent_id: None,
            reply_to: None,
            payload: payload.into(),
        }
    }

    pub fn with_parent(
        msg_type: impl Into<String>,
        parent_id: Uuid,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::new(msg_type, payload)
        }
    }

    /// Build a reply correlated to `original`: same parent id, reply-to set
    /// to the original's UUID.
    pub fn reply(original: &Message, msg_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            parent_id: original.parent_id,
            reply_to: Some(original.uuid),
            ..Self::new(msg_type, payload)
        }
    }
}

/// Minimal bus contract: typed subscriptions and fire-and-forget publish.
pub trait MessageBus: Send + Sync {
    fn subscribe(&self, msg_type: &str) -> mpsc::UnboundedReceiver<Message>;
    fn publish(&self, msg: Message);
}

/// In-process bus delivering each message to every subscriber of its type.
#[derive(Default)]
pub struct InMemoryBus {
    topics: parking_lot::Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
}

impl MessageBus for InMemoryBus {
    fn subscribe(&self, msg_type: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .entry(msg_type.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn publish(&self, msg: Message) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(&msg.msg_type) {
            subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
        }
    }
}
