//! Topic runtime
//!
//! A topic is an isolated communication channel (chat room, 1:1
//! conversation, a user's `me` meta-topic). Each loaded topic runs a
//! single-writer event loop owning all topic state; everything else talks to
//! it through bounded queues.
//!
//! - `run`: the master event loop, broadcast fan-out and shutdown
//! - `join`: subscribe/leave flows, ownership transfer, eviction
//! - `meta`: get/set/del of desc, subs, data, tags and message ranges
//! - `pres`: presence fan-out primitives
//! - `proxy`: the forwarding loop run on non-master nodes

mod join;
mod meta;
mod pres;
mod proxy;
mod run;

#[cfg(test)]
mod tests_loop;

pub use proxy::ProxyTopic;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::access::{AccessMode, default_access, select_access_mode};
use crate::cluster::ClusterSessUpdate;
use crate::hub::ServerCtx;
use crate::proto::{ClientMsg, ServerMsg};
use crate::push::{Payload, PushWhat, Receipt, Recipient};
use crate::session::{MuxEvent, Session};
use crate::store::{StoreError, Subscription};
use crate::types::{
    AuthLevel, TopicCat, Uid, grp_to_chn, is_channel, parse_p2p, parse_user_id, time_now,
    topic_cat,
};

/// Queue capacities of the topic's input channels.
const REG_QUEUE: usize = 32;
const UNREG_QUEUE: usize = 32;
const BROADCAST_QUEUE: usize = 256;
const META_QUEUE: usize = 32;
const SUPD_QUEUE: usize = 32;
const MASTER_QUEUE: usize = 32;
/// Capacity of the cluster write mailbox shared by proxied sessions.
pub(crate) const MUX_QUEUE: usize = 256;

/// Why a topic is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum StopReason {
    /// Idle timeout, no reason to announce anything.
    #[default]
    None,
    /// Process is shutting down.
    Shutdown,
    /// The topic was deleted by a user.
    Deleted,
    /// Cluster rehash moved the topic to another node.
    Rehashing,
}

/// Subscribe request.
pub struct SessionJoin {
    pub sess: Arc<Session>,
    pub pkt: ClientMsg,
}

/// Leave request. `pkt` is None when a dying session detaches itself or a
/// fan-out eviction is being processed.
pub struct SessionLeave {
    pub sess: Arc<Session>,
    pub pkt: Option<ClientMsg>,
}

/// Meta (get/set/del) request.
pub struct MetaReq {
    pub sess: Arc<Session>,
    pub pkt: ClientMsg,
}

/// Session update: user-agent change (`sess` None) or background session
/// coming to the foreground.
pub struct SessionUpdate {
    pub sess: Option<Arc<Session>>,
    pub user_agent: String,
}

/// Shutdown order, with an optional completion signal.
pub struct ShutdownReq {
    pub reason: StopReason,
    pub done: Option<oneshot::Sender<()>>,
}

/// Why a topic operation was rejected. Replies are queued to the requesting
/// session before the error is returned; the loop only logs these.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("permission denied: {0}")]
    Denied(&'static str),
    #[error("malformed: {0}")]
    Malformed(&'static str),
    #[error("not found")]
    NotFound,
    #[error("policy: {0}")]
    Policy(&'static str),
    #[error("no action")]
    NoAction,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Topic lifecycle bits, readable without entering the loop.
#[derive(Debug, Default)]
pub struct TopicStatus(AtomicU32);

const STATUS_LOADED: u32 = 0x1;
const STATUS_PAUSED: u32 = 0x2;
const STATUS_MARKED_DELETED: u32 = 0x10;
const STATUS_READ_ONLY: u32 = 0x20;

impl TopicStatus {
    fn change_bits(&self, bits: u32, set: bool) {
        loop {
            let old = self.0.load(Ordering::Acquire);
            let new = if set { old | bits } else { old & !bits };
            if new == old
                || self
                    .0
                    .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
        }
    }

    pub fn mark_loaded(&self) {
        self.change_bits(STATUS_LOADED, true);
    }

    pub fn mark_paused(&self, paused: bool) {
        self.change_bits(STATUS_PAUSED, paused);
    }

    pub fn mark_deleted(&self) {
        self.change_bits(STATUS_MARKED_DELETED, true);
    }

    pub fn mark_read_only(&self, read_only: bool) {
        self.change_bits(STATUS_READ_ONLY, read_only);
    }

    pub fn is_loaded(&self) -> bool {
        self.0.load(Ordering::Acquire) & STATUS_LOADED != 0
    }

    /// Paused or marked for deletion: all packets are rejected.
    pub fn is_inactive(&self) -> bool {
        self.0.load(Ordering::Acquire) & (STATUS_PAUSED | STATUS_MARKED_DELETED) != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.0.load(Ordering::Acquire) & STATUS_READ_ONLY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.0.load(Ordering::Acquire) & STATUS_MARKED_DELETED != 0
    }
}

/// In-memory cache of one subscriber's row.
#[derive(Debug, Clone, Default)]
pub struct PerUserData {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    /// Number of attached non-background, non-channel sessions.
    pub online: u32,

    pub recv_id: u64,
    pub read_id: u64,
    pub del_id: u64,

    pub private: Option<Value>,

    pub mode_want: AccessMode,
    pub mode_given: AccessMode,

    /// P2P only: the counterpart's public and the topic name this user
    /// addresses the topic by.
    pub public: Option<Value>,
    pub topic_name: String,
    pub deleted: bool,
}

/// One contact-list entry on a `me` topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerSubsData {
    /// The contact's online status as last seen by this user.
    pub online: bool,
    /// Whether this user cares about updates from the contact.
    pub enabled: bool,
}

/// An attached session with per-topic bookkeeping.
pub struct SessionRecord {
    pub sess: Arc<Session>,
    /// Subscribed user; may differ from `sess.uid` for cluster shims and is
    /// zero for multiplexing sessions.
    pub uid: Uid,
    pub is_chan_sub: bool,
    /// Users attached through this session when it is multiplexing.
    pub muids: Vec<Uid>,
}

/// A presence notice parked for a background session.
pub struct DeferredNotice {
    pub uid: Uid,
    pub sid: String,
    pub user_agent: String,
    pub created: tokio::time::Instant,
}

/// Senders into a topic's queues.
#[derive(Clone)]
pub struct TopicTx {
    pub reg: mpsc::Sender<SessionJoin>,
    pub unreg: mpsc::Sender<SessionLeave>,
    pub broadcast: mpsc::Sender<ServerMsg>,
    pub meta: mpsc::Sender<MetaReq>,
    pub supd: mpsc::Sender<SessionUpdate>,
    pub exit: mpsc::Sender<ShutdownReq>,
    pub master: mpsc::Sender<ClusterSessUpdate>,
}

/// Receiving ends owned by the topic loop.
pub struct TopicReceivers {
    pub reg: mpsc::Receiver<SessionJoin>,
    pub unreg: mpsc::Receiver<SessionLeave>,
    pub broadcast: mpsc::Receiver<ServerMsg>,
    pub meta: mpsc::Receiver<MetaReq>,
    pub supd: mpsc::Receiver<SessionUpdate>,
    pub exit: mpsc::Receiver<ShutdownReq>,
    pub master: mpsc::Receiver<ClusterSessUpdate>,
}

/// Create the channel pair for one topic.
pub fn topic_channels() -> (TopicTx, TopicReceivers) {
    let (reg_tx, reg_rx) = mpsc::channel(REG_QUEUE);
    let (unreg_tx, unreg_rx) = mpsc::channel(UNREG_QUEUE);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);
    let (meta_tx, meta_rx) = mpsc::channel(META_QUEUE);
    let (supd_tx, supd_rx) = mpsc::channel(SUPD_QUEUE);
    let (exit_tx, exit_rx) = mpsc::channel(1);
    let (master_tx, master_rx) = mpsc::channel(MASTER_QUEUE);
    (
        TopicTx {
            reg: reg_tx,
            unreg: unreg_tx,
            broadcast: broadcast_tx,
            meta: meta_tx,
            supd: supd_tx,
            exit: exit_tx,
            master: master_tx,
        },
        TopicReceivers {
            reg: reg_rx,
            unreg: unreg_rx,
            broadcast: broadcast_rx,
            meta: meta_rx,
            supd: supd_rx,
            exit: exit_rx,
            master: master_rx,
        },
    )
}

/// Master-side topic state. All fields are owned by the topic loop; external
/// readers only touch `status`.
pub struct Topic {
    pub(crate) name: String,
    /// Generic client-facing name: `me`/`fnd` for single-user topics, the
    /// expanded name otherwise.
    pub(crate) x_original: String,
    pub(crate) cat: TopicCat,
    pub(crate) is_chan: bool,

    pub(crate) created: DateTime<Utc>,
    pub(crate) updated: DateTime<Utc>,
    pub(crate) touched: Option<DateTime<Utc>>,

    pub(crate) last_seq: u64,
    pub(crate) del_id: u64,

    /// Most recently announced user agent (`me` only).
    pub(crate) user_agent: String,

    pub(crate) owner: Uid,
    pub(crate) access_auth: AccessMode,
    pub(crate) access_anon: AccessMode,
    pub(crate) tags: Vec<String>,
    pub(crate) public: Option<Value>,
    /// Per-session ephemeral search queries (`fnd` only).
    pub(crate) fnd_public: HashMap<String, Value>,

    pub(crate) per_user: HashMap<Uid, PerUserData>,
    pub(crate) mode_want_union: AccessMode,
    pub(crate) mode_given_union: AccessMode,

    /// Contact list (`me` only), keyed by user id or group topic name.
    pub(crate) per_subs: HashMap<String, PerSubsData>,

    /// Attached sessions by sid.
    pub(crate) sessions: HashMap<String, SessionRecord>,

    pub(crate) status: Arc<TopicStatus>,
    pub(crate) ctx: Arc<ServerCtx>,
    /// Own senders, for re-posting work from inside the loop (fan-out
    /// evictions, UA updates) and for linking sessions.
    pub(crate) tx: TopicTx,
    /// Cluster write mailbox; multiplexing sessions post into it.
    pub(crate) mux_tx: mpsc::Sender<MuxEvent>,

    pub(crate) deferred: Vec<DeferredNotice>,
}

impl Topic {
    /// Load a master topic from the store. The hub calls this before
    /// spawning the loop; a `NotFound` means the topic does not exist yet.
    pub async fn load(
        ctx: Arc<ServerCtx>,
        name: &str,
        tx: TopicTx,
        status: Arc<TopicStatus>,
        mux_tx: mpsc::Sender<MuxEvent>,
    ) -> Result<Topic, StoreError> {
        let cat = topic_cat(name).ok_or(StoreError::NotFound)?;
        let now = time_now();

        let mut topic = Topic {
            name: name.to_string(),
            x_original: match cat {
                TopicCat::Me => "me".to_string(),
                TopicCat::Fnd => "fnd".to_string(),
                _ => name.to_string(),
            },
            cat,
            is_chan: false,
            created: now,
            updated: now,
            touched: None,
            last_seq: 0,
            del_id: 0,
            user_agent: String::new(),
            owner: Uid::ZERO,
            access_auth: AccessMode::UNSET,
            access_anon: AccessMode::UNSET,
            tags: Vec::new(),
            public: None,
            fnd_public: HashMap::new(),
            per_user: HashMap::new(),
            mode_want_union: AccessMode::NONE,
            mode_given_union: AccessMode::NONE,
            per_subs: HashMap::new(),
            sessions: HashMap::new(),
            status,
            ctx,
            tx,
            mux_tx,
            deferred: Vec::new(),
        };

        match cat {
            TopicCat::Me | TopicCat::Fnd => {
                let uid = parse_user_id(&format!("usr{}", &name[3..]))
                    .ok_or(StoreError::NotFound)?;
                let user = topic
                    .ctx
                    .store
                    .users
                    .get(uid)
                    .await?
                    .ok_or(StoreError::NotFound)?;
                topic.created = user.created;
                topic.updated = user.updated;
                topic.access_auth = user.access.auth;
                topic.access_anon = user.access.anon;
                topic.tags = user.tags.clone();
                topic.public = user.public.clone();
                topic.per_user.insert(
                    uid,
                    PerUserData {
                        created: user.created,
                        updated: user.updated,
                        mode_want: AccessMode::C_ME,
                        mode_given: AccessMode::C_ME,
                        ..Default::default()
                    },
                );
            }
            TopicCat::P2P => {
                let rec = topic
                    .ctx
                    .store
                    .topics
                    .get(name)
                    .await?
                    .ok_or(StoreError::NotFound)?;
                topic.apply_topic_rec(&rec);

                let (u1, u2) = parse_p2p(name).ok_or(StoreError::NotFound)?;
                let users = topic.ctx.store.users.get_all(&[u1, u2]).await?;
                let subs = topic
                    .ctx
                    .store
                    .topics
                    .get_subs_any(name, &Default::default())
                    .await?;
                for sub in &subs {
                    let other = if sub.user == u1 { u2 } else { u1 };
                    let mut pud = per_user_from_sub(sub);
                    pud.topic_name = other.user_id();
                    pud.public = users
                        .iter()
                        .find(|u| u.uid == other)
                        .and_then(|u| u.public.clone());
                    topic.per_user.insert(sub.user, pud);
                }
                topic.compute_acs_union();
            }
            TopicCat::Grp | TopicCat::Sys => {
                let rec = topic
                    .ctx
                    .store
                    .topics
                    .get(name)
                    .await?
                    .ok_or(StoreError::NotFound)?;
                topic.apply_topic_rec(&rec);

                let subs = topic
                    .ctx
                    .store
                    .topics
                    .get_users_any(name, &Default::default())
                    .await?;
                for sub in &subs {
                    topic.per_user.insert(sub.user, per_user_from_sub(sub));
                }
                topic.compute_acs_union();
                topic.verify_owner().await;
            }
        }

        Ok(topic)
    }

    fn apply_topic_rec(&mut self, rec: &crate::store::TopicRec) {
        self.created = rec.created;
        self.updated = rec.updated;
        self.touched = rec.touched;
        self.owner = rec.owner;
        self.access_auth = rec.access.auth;
        self.access_anon = rec.access.anon;
        self.tags = rec.tags.clone();
        self.public = rec.public.clone();
        self.last_seq = rec.seq_id;
        self.del_id = rec.del_id;
        self.is_chan = rec.is_chan;
    }

    /// Ownership may be dangling after a failed two-write transfer. When no
    /// cached row carries `O` but the topic row names an owner, re-grant it.
    async fn verify_owner(&mut self) {
        if self.cat != TopicCat::Grp || self.owner.is_zero() || self.per_user.is_empty() {
            return;
        }
        let has_owner = self.per_user.values().any(|pud| pud.mode_given.is_owner());
        if has_owner {
            return;
        }
        warn!(topic = %self.name, owner = %self.owner, "ownerless topic, repairing");
        if let Some(pud) = self.per_user.get_mut(&self.owner) {
            pud.mode_given = pud.mode_given | AccessMode::OWNER;
            pud.mode_want = pud.mode_want | AccessMode::OWNER;
            let upd = crate::store::SubUpdate {
                mode_want: Some(pud.mode_want),
                mode_given: Some(pud.mode_given),
                ..Default::default()
            };
            if let Err(e) = self
                .ctx
                .store
                .subs
                .update(&self.name, self.owner, upd, false)
                .await
            {
                warn!(topic = %self.name, error = %e, "owner repair failed");
            }
        }
    }

    pub fn category(&self) -> TopicCat {
        self.cat
    }

    pub fn channel_enabled(&self) -> bool {
        self.is_chan
    }

    /// `want`/`given` pair for a user; zero uids (multiplexing sessions) get
    /// the permissive union over all subscribers.
    pub(crate) fn get_per_user_acs(&self, uid: Uid) -> (AccessMode, AccessMode) {
        if uid.is_zero() {
            return (self.mode_want_union, self.mode_given_union);
        }
        match self.per_user.get(&uid) {
            Some(pud) => (pud.mode_want, pud.mode_given),
            None => (AccessMode::NONE, AccessMode::NONE),
        }
    }

    pub(crate) fn effective_mode(&self, uid: Uid) -> AccessMode {
        let (want, given) = self.get_per_user_acs(uid);
        want & given
    }

    pub(crate) fn user_is_reader(&self, uid: Uid) -> bool {
        self.effective_mode(uid).is_reader()
    }

    /// Recompute the permission unions; call whenever `per_user` changes.
    pub(crate) fn compute_acs_union(&mut self) {
        let mut want = AccessMode::NONE;
        let mut given = AccessMode::NONE;
        for pud in self.per_user.values() {
            want = want | pud.mode_want;
            given = given | pud.mode_given;
        }
        self.mode_want_union = want;
        self.mode_given_union = given;
    }

    /// Default `given` mode for the provided auth level.
    pub(crate) fn access_for(&self, lvl: AuthLevel) -> AccessMode {
        select_access_mode(
            lvl,
            self.access_anon,
            self.access_auth,
            default_access(self.cat),
        )
    }

    /// Topic name as the given user addresses it.
    pub(crate) fn original(&self, uid: Uid) -> String {
        if self.cat == TopicCat::P2P {
            if let Some(pud) = self.per_user.get(&uid) {
                return pud.topic_name.clone();
            }
        }
        if self.cat == TopicCat::Grp && self.is_chan && !self.per_user.contains_key(&uid) {
            // A channel reader.
            return grp_to_chn(&self.x_original);
        }
        self.x_original.clone()
    }

    /// The other party of a P2P topic.
    pub(crate) fn p2p_other_user(&self, uid: Uid) -> Option<Uid> {
        if self.cat != TopicCat::P2P {
            return None;
        }
        self.per_user.keys().find(|u| **u != uid).copied()
    }

    /// Live subscriber count. P2P rows marked deleted do not count.
    pub(crate) fn subs_count(&self) -> usize {
        if self.cat == TopicCat::P2P {
            self.per_user.values().filter(|pud| !pud.deleted).count()
        } else {
            self.per_user.len()
        }
    }

    /// Validate channel-style addressing: a `chn...` name is only good for a
    /// channel-enabled group topic. Returns whether the request is a channel
    /// access.
    pub(crate) fn verify_channel_access(&self, as_topic: &str) -> Result<bool, ()> {
        if !is_channel(as_topic) {
            return Ok(false);
        }
        if self.is_chan { Ok(true) } else { Err(()) }
    }

    /// True if any attached session is foreground.
    pub(crate) fn is_online(&self) -> bool {
        self.sessions.values().any(|rec| {
            if rec.sess.is_multiplex() {
                !rec.muids.is_empty()
            } else {
                !rec.sess.is_background()
            }
        })
    }

    /// Rewrite the topic name in a broadcast for the addressed user. P2P and
    /// channel names depend on the receiver.
    pub(crate) fn fix_topic_name(&self, msg: &mut ServerMsg, uid: Uid) {
        if uid.is_zero() {
            return;
        }
        if self.cat == TopicCat::P2P || (self.cat == TopicCat::Grp && self.is_chan) {
            let name = self.original(uid);
            match &mut msg.payload {
                crate::proto::ServerPayload::Data(data) => data.topic = name,
                crate::proto::ServerPayload::Pres(pres) => pres.topic = name,
                crate::proto::ServerPayload::Info(info) => info.topic = name,
                _ => {}
            }
        }
    }

    /// Register an attached session. Multiplexing sessions aggregate users
    /// in `muids` under their own record. Returns false when the session was
    /// already attached.
    pub(crate) fn add_session(&mut self, sess: &Arc<Session>, as_uid: Uid, is_chan_sub: bool) -> bool {
        let key = sess.multi.as_ref().unwrap_or(sess);
        let background = sess.is_background();
        if let Some(rec) = self.sessions.get_mut(&key.sid) {
            if key.is_multiplex() && !background {
                rec.muids.push(as_uid);
                return true;
            }
            return false;
        }
        let rec = if key.is_multiplex() {
            SessionRecord {
                sess: key.clone(),
                uid: Uid::ZERO,
                is_chan_sub,
                muids: if background { Vec::new() } else { vec![as_uid] },
            }
        } else {
            SessionRecord {
                sess: key.clone(),
                uid: as_uid,
                is_chan_sub,
                muids: Vec::new(),
            }
        };
        self.sessions.insert(key.sid.clone(), rec);
        true
    }

    /// Detach a session, or remove one user from a multiplexing session.
    /// Returns the record data and whether the session itself was removed.
    pub(crate) fn rem_session(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
    ) -> (Option<(Uid, bool, Vec<Uid>)>, bool) {
        let key = sess.multi.as_ref().unwrap_or(sess).sid.clone();
        let Some(rec) = self.sessions.get_mut(&key) else {
            return (None, false);
        };

        if rec.uid == as_uid || as_uid.is_zero() {
            return match self.sessions.remove(&key) {
                Some(rec) => (Some((rec.uid, rec.is_chan_sub, rec.muids)), true),
                None => (None, false),
            };
        }

        if let Some(pos) = rec.muids.iter().position(|u| *u == as_uid) {
            rec.muids.swap_remove(pos);
            let data = (rec.uid, rec.is_chan_sub, rec.muids.clone());
            if rec.muids.is_empty() {
                self.sessions.remove(&key);
                return (Some(data), true);
            }
            return (Some(data), false);
        }

        (None, false)
    }

    /// Most recently active attached session.
    pub(crate) fn most_recent_session(&self) -> Option<&Arc<Session>> {
        self.sessions
            .values()
            .map(|rec| &rec.sess)
            .max_by_key(|s| s.last_action())
    }

    /// Toggle the FCM channel subscription for a channel reader.
    pub(crate) fn channel_sub_unsub(&self, uid: Uid, sub: bool) {
        self.ctx.push.channel_sub(&crate::push::ChannelReq {
            uid,
            channel: grp_to_chn(&self.name),
            unsub: !sub,
        });
    }

    /// Build the push receipt for an accepted `{data}`.
    pub(crate) fn push_for_data(&self, from: Uid, data: &crate::proto::MsgData) -> Option<Receipt> {
        // The receipt's topic is the name as seen by recipients, which for
        // P2P topics is the sender.
        let topic = if self.cat == TopicCat::P2P {
            from.user_id()
        } else {
            self.x_original.clone()
        };
        let content_type = data
            .head
            .as_ref()
            .and_then(|h| h.get("mime"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut receipt = Receipt {
            to: HashMap::with_capacity(self.subs_count()),
            channel: if self.is_chan {
                grp_to_chn(&self.x_original)
            } else {
                String::new()
            },
            payload: Payload {
                what: PushWhat::Msg,
                silent: false,
                topic,
                from: data.from.clone(),
                ts: data.ts,
                seq: data.seq,
                content_type,
                content: Some(data.content.clone()),
                mode_want: None,
                mode_given: None,
            },
        };

        for (uid, pud) in &self.per_user {
            if *uid == from {
                continue;
            }
            let mode = pud.mode_want & pud.mode_given;
            if mode.is_presencer() && mode.is_reader() && !pud.deleted {
                receipt.to.insert(
                    *uid,
                    Recipient {
                        delivered: pud.online,
                    },
                );
            }
        }

        if receipt.to.is_empty() && receipt.channel.is_empty() {
            return None;
        }
        Some(receipt)
    }

    /// Build the push receipt announcing a new subscription to its target.
    pub(crate) fn push_for_sub(
        &self,
        from: Uid,
        to: Uid,
        want: AccessMode,
        given: AccessMode,
        now: DateTime<Utc>,
    ) -> Receipt {
        let topic = if self.cat == TopicCat::P2P {
            from.user_id()
        } else {
            self.x_original.clone()
        };
        Receipt {
            to: HashMap::from([(to, Recipient::default())]),
            channel: String::new(),
            payload: Payload {
                what: PushWhat::Sub,
                silent: false,
                topic,
                from: from.user_id(),
                ts: now,
                seq: self.last_seq,
                content_type: String::new(),
                content: None,
                mode_want: Some(want),
                mode_given: Some(given),
            },
        }
    }
}

pub(crate) fn per_user_from_sub(sub: &Subscription) -> PerUserData {
    PerUserData {
        created: sub.created,
        updated: sub.updated,
        online: 0,
        recv_id: sub.recv_seq,
        read_id: sub.read_seq,
        del_id: sub.del_id,
        private: sub.private.clone(),
        mode_want: sub.mode_want,
        mode_given: sub.mode_given,
        public: None,
        topic_name: String::new(),
        deleted: sub.deleted_at.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let status = TopicStatus::default();
        assert!(!status.is_loaded());
        status.mark_loaded();
        assert!(status.is_loaded());
        assert!(!status.is_inactive());
        status.mark_paused(true);
        assert!(status.is_inactive());
        status.mark_paused(false);
        assert!(!status.is_inactive());
        status.mark_deleted();
        assert!(status.is_inactive());
        assert!(status.is_deleted());
        status.mark_read_only(true);
        assert!(status.is_read_only());
    }

    #[test]
    fn test_stop_reason_default() {
        assert_eq!(StopReason::default(), StopReason::None);
    }
}
