//! Persistence contract
//!
//! The topic runtime consumes storage through these traits; concrete
//! database adapters live behind them and are out of scope for the core.
//! All operations are synchronous from the topic's point of view: a store
//! call blocks the calling topic loop, so store latency is topic latency.

mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::access::AccessMode;
use crate::types::{DelRange, Uid};

/// Storage error taxonomy. Everything that is not a missing row or a unique
/// constraint violation is `Unknown` and surfaces to clients as code 500.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("duplicate")]
    Duplicate,
    #[error("store failure: {0}")]
    Unknown(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Default access pair stored on users and topics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

impl Default for DefaultAccess {
    fn default() -> Self {
        Self {
            auth: AccessMode::UNSET,
            anon: AccessMode::UNSET,
        }
    }
}

/// Account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    #[default]
    Ok,
    Suspended,
    Deleted,
}

/// A user row.
#[derive(Debug, Clone, Default)]
pub struct User {
    pub uid: Uid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub state: UserState,
    pub access: DefaultAccess,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

/// A topic row.
#[derive(Debug, Clone, Default)]
pub struct TopicRec {
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub touched: Option<DateTime<Utc>>,
    pub owner: Uid,
    pub access: DefaultAccess,
    pub seq_id: u64,
    pub del_id: u64,
    pub is_chan: bool,
    pub public: Option<Value>,
    pub tags: Vec<String>,
}

/// A subscription row. For `me`-topic queries the topic-side fields
/// (`public`, `with`, `seq_id`, `touched`) are denormalized in.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    pub user: Uid,
    pub topic: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub mode_want: AccessMode,
    pub mode_given: AccessMode,
    pub private: Option<Value>,
    pub read_seq: u64,
    pub recv_seq: u64,
    pub del_id: u64,

    pub public: Option<Value>,
    /// P2P only: the other party's user id.
    pub with: String,
    pub seq_id: u64,
    pub touched: Option<DateTime<Utc>>,
    pub last_seen: Option<(DateTime<Utc>, String)>,
}

/// A validated or pending out-of-band credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub method: String,
    pub value: String,
    pub done: bool,
}

/// A stored message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub topic: String,
    pub seq: u64,
    pub created: DateTime<Utc>,
    pub from: Uid,
    pub head: Option<BTreeMap<String, Value>>,
    pub content: Value,
    /// Users the message is soft-deleted for.
    pub deleted_for: Vec<Uid>,
    pub hard_deleted: bool,
}

/// Paging/filter options shared by the query operations.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub since: u64,
    pub before: u64,
    pub limit: usize,
    pub topic: Option<String>,
    pub user: Option<Uid>,
    pub if_modified_since: Option<DateTime<Utc>>,
}

/// Partial update of a user row. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub public: Option<Value>,
    pub access: Option<DefaultAccess>,
    pub tags: Option<Vec<String>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Partial update of a topic row.
#[derive(Debug, Clone, Default)]
pub struct TopicUpdate {
    pub public: Option<Value>,
    pub access: Option<DefaultAccess>,
    pub tags: Option<Vec<String>>,
    pub seq_id: Option<u64>,
    pub del_id: Option<u64>,
    pub touched: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

/// Partial update of a subscription row. `private` uses a double Option:
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct SubUpdate {
    pub mode_want: Option<AccessMode>,
    pub mode_given: Option<AccessMode>,
    pub private: Option<Option<Value>>,
    pub read_seq: Option<u64>,
    pub recv_seq: Option<u64>,
    pub del_id: Option<u64>,
}

#[async_trait]
pub trait Users: Send + Sync {
    async fn get(&self, uid: Uid) -> StoreResult<Option<User>>;
    async fn get_all(&self, uids: &[Uid]) -> StoreResult<Vec<User>>;
    /// User's subscriptions with topic data denormalized in; excludes deleted.
    async fn get_topics(&self, uid: Uid, opts: &QueryOpts) -> StoreResult<Vec<Subscription>>;
    /// Same, including soft-deleted subscriptions.
    async fn get_topics_any(&self, uid: Uid, opts: &QueryOpts) -> StoreResult<Vec<Subscription>>;
    /// Tag search over users and group topics. `req` is an AND of OR-groups.
    async fn find_subs(
        &self,
        uid: Uid,
        req: &[Vec<String>],
        opt: &[String],
    ) -> StoreResult<Vec<Subscription>>;
    async fn update(&self, uid: Uid, upd: UserUpdate) -> StoreResult<()>;
    async fn update_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn get_all_creds(&self, uid: Uid) -> StoreResult<Vec<Credential>>;
}

#[async_trait]
pub trait Topics: Send + Sync {
    async fn get(&self, name: &str) -> StoreResult<Option<TopicRec>>;
    async fn create(&self, rec: TopicRec) -> StoreResult<()>;
    async fn update(&self, name: &str, upd: TopicUpdate) -> StoreResult<()>;
    /// Subscriptions without subscriber public data (p2p).
    async fn get_subs(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>>;
    async fn get_subs_any(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>>;
    /// Subscriptions with subscriber public data (grp).
    async fn get_users(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>>;
    async fn get_users_any(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>>;
    /// Record the new owner on the topic row.
    async fn owner_change(&self, name: &str, new_owner: Uid) -> StoreResult<()>;
    /// Remove the topic with its subscriptions and messages.
    async fn delete(&self, name: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait Subs: Send + Sync {
    async fn get(&self, topic: &str, uid: Uid) -> StoreResult<Option<Subscription>>;
    async fn create(&self, sub: Subscription) -> StoreResult<()>;
    async fn update(
        &self,
        topic: &str,
        uid: Uid,
        upd: SubUpdate,
        undelete: bool,
    ) -> StoreResult<()>;
    async fn delete(&self, topic: &str, uid: Uid) -> StoreResult<()>;
}

#[async_trait]
pub trait Messages: Send + Sync {
    /// Persist a message. Fails with `Duplicate` when `(topic, seq)` already
    /// exists; this is the backstop against transient double-mastership.
    /// `reader` is false when the sender cannot read the topic; the message
    /// is then marked soft-deleted for the sender.
    async fn save(&self, msg: Message, reader: bool) -> StoreResult<()>;
    async fn get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> StoreResult<Vec<Message>>;
    /// Ranges deleted for the given user (or hard-deleted), and the latest
    /// deletion transaction id.
    async fn get_deleted(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> StoreResult<(Vec<DelRange>, u64)>;
    /// Apply a deletion transaction. `for_user` zero means hard delete.
    async fn delete_list(
        &self,
        topic: &str,
        del_id: u64,
        for_user: Uid,
        ranges: &[DelRange],
    ) -> StoreResult<()>;
}

/// Aggregated store handle threaded through the server context.
#[derive(Clone)]
pub struct Store {
    pub users: Arc<dyn Users>,
    pub topics: Arc<dyn Topics>,
    pub subs: Arc<dyn Subs>,
    pub messages: Arc<dyn Messages>,
}
