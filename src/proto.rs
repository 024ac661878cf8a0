//! Wire protocol
//!
//! Client-to-server packets (`{hi}`, `{acc}`, `{login}`, `{sub}`, `{leave}`,
//! `{pub}`, `{get}`, `{set}`, `{del}`, `{note}`) and server-to-client packets
//! (`{ctrl}`, `{meta}`, `{data}`, `{pres}`, `{info}`). The JSON layout is the
//! same for WebSocket and long-poll transports; gRPC framing maps onto the
//! same structures.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessMode;
use crate::session::Session;
use crate::types::{AuthLevel, DelRange, Uid};

/// Query options common to all `{get}` variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MsgGetOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(skip_serializing_if = "u64_is_zero")]
    pub since_id: u64,
    #[serde(skip_serializing_if = "u64_is_zero")]
    pub before_id: u64,
    #[serde(skip_serializing_if = "u32_is_zero")]
    pub limit: u32,
}

fn u64_is_zero(v: &u64) -> bool {
    *v == 0
}
fn u32_is_zero(v: &u32) -> bool {
    *v == 0
}

/// What parts of topic metadata a `{get}` asks for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgGetQuery {
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgGetOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<MsgGetOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MsgGetOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<MsgGetOpts>,
}

/// Default access modes for new subscribers, as set by the topic owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgDefaultAcs {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub anon: String,
}

/// Topic description update in a `{set}` or `{sub}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MsgSetDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_acs: Option<MsgDefaultAcs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Subscription parameters in a `{set}` or `{sub}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgSetSub {
    /// Affected user; empty means the requester.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Requested (own sub) or granted (another user's sub) access mode.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

/// Out-of-band credential being added or validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgCredClient {
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response: String,
}

/// Mutation part of a `{set}` or `{sub}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgSetQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgSetDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<MsgSetSub>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cred: Option<MsgCredClient>,
}

/// `{hi}`: session handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MsgClientHi {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ver: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub lang: String,
    pub background: bool,
}

/// `{acc}`: account create/update. Processed by the auth layer; carried here
/// for wire completeness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientAcc {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret: String,
    pub login: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgSetDesc>,
}

/// `{login}`: authentication. Processed by the auth layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientLogin {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub secret: String,
}

/// `{sub}`: attach to a topic, optionally creating it or updating the
/// subscription, optionally piggybacking a `{get}` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientSub {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<MsgSetQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<MsgGetQuery>,

    /// Set by the hub when the topic was created by this request.
    #[serde(skip)]
    pub created: bool,
    /// Set by the hub/topic when this is a first-time subscription.
    #[serde(skip)]
    pub newsub: bool,
}

/// `{leave}`: detach from a topic, optionally deleting the subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientLeave {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub unsub: bool,
}

/// `{pub}`: publish a data message to a topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MsgClientPub {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub no_echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<BTreeMap<String, Value>>,
    pub content: Value,
}

/// `{get}`: query topic metadata or message history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientGet {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(flatten)]
    pub query: MsgGetQuery,
}

/// `{set}`: update topic metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientSet {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(flatten)]
    pub query: MsgSetQuery,
}

/// `{del}`: delete messages, a subscription, or the whole topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MsgClientDel {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// One of `msg`, `sub`, `topic`, `cred`.
    pub what: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub del_seq: Vec<DelRange>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    pub hard: bool,
}

/// `{note}`: client-side notification, fanned out as `{info}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgClientNote {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// One of `kp` (key press), `read`, `recv`.
    pub what: String,
    #[serde(skip_serializing_if = "u64_is_zero")]
    pub seq: u64,
}

/// The payload of a client packet: exactly one of the variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientPayload {
    Hi(MsgClientHi),
    Acc(MsgClientAcc),
    Login(MsgClientLogin),
    Sub(MsgClientSub),
    Leave(MsgClientLeave),
    Pub(MsgClientPub),
    Get(MsgClientGet),
    Set(MsgClientSet),
    Del(MsgClientDel),
    Note(MsgClientNote),
}

/// A client packet with its routing envelope. The envelope (`as_user`,
/// `auth_lvl`, expanded topic name) is filled in by the auth/dispatch layer
/// before the packet reaches a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMsg {
    #[serde(flatten)]
    pub payload: ClientPayload,

    /// Packet id echoed in the `{ctrl}` reply. Empty when the client did not
    /// ask for an acknowledgement.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Topic name as the client addressed it (`me`, `usrX`, `chnX`, `newX`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub original: String,
    /// Expanded routable topic name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rcpt_to: String,
    /// The user this packet acts for.
    #[serde(default)]
    pub as_user: Uid,
    #[serde(default)]
    pub auth_lvl: AuthLevel,
    pub timestamp: DateTime<Utc>,
}

impl ClientMsg {
    pub fn sub(&self) -> Option<&MsgClientSub> {
        match &self.payload {
            ClientPayload::Sub(m) => Some(m),
            _ => None,
        }
    }

    pub fn sub_mut(&mut self) -> Option<&mut MsgClientSub> {
        match &mut self.payload {
            ClientPayload::Sub(m) => Some(m),
            _ => None,
        }
    }

    pub fn leave(&self) -> Option<&MsgClientLeave> {
        match &self.payload {
            ClientPayload::Leave(m) => Some(m),
            _ => None,
        }
    }

    pub fn publish(&self) -> Option<&MsgClientPub> {
        match &self.payload {
            ClientPayload::Pub(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self) -> Option<&MsgClientGet> {
        match &self.payload {
            ClientPayload::Get(m) => Some(m),
            _ => None,
        }
    }

    pub fn set(&self) -> Option<&MsgClientSet> {
        match &self.payload {
            ClientPayload::Set(m) => Some(m),
            _ => None,
        }
    }

    pub fn del(&self) -> Option<&MsgClientDel> {
        match &self.payload {
            ClientPayload::Del(m) => Some(m),
            _ => None,
        }
    }

    pub fn note(&self) -> Option<&MsgClientNote> {
        match &self.payload {
            ClientPayload::Note(m) => Some(m),
            _ => None,
        }
    }
}

/// Parse a raw client packet.
pub fn parse_client(data: &[u8]) -> Result<ClientPayload, serde_json::Error> {
    serde_json::from_slice(data)
}

/// `{ctrl}`: acknowledgement or error, sent only to the originating session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgCtrl {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub code: u16,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub ts: DateTime<Utc>,
}

/// `{data}`: a content message fanned out to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgData {
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<BTreeMap<String, Value>>,
    pub content: Value,
}

/// `{pres}`: presence notification. The serialized part describes the event;
/// the skipped fields steer fan-out and never reach the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgPres {
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,
    pub what: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub clear: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub del_seq: Vec<DelRange>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tgt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub act: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dacs_want: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dacs_given: String,

    /// Deliver only to recipients whose effective mode intersects this.
    #[serde(skip)]
    pub filter_in: u16,
    /// Skip recipients whose effective mode intersects this.
    #[serde(skip)]
    pub filter_out: u16,
    /// Deliver to this user only.
    #[serde(skip)]
    pub single_user: Uid,
    /// Never deliver to this user.
    #[serde(skip)]
    pub exclude_user: Uid,
    /// Skip sessions already attached to this topic.
    #[serde(skip)]
    pub skip_topic: String,
    /// Ask the receiving topic to reply with its own status.
    #[serde(skip)]
    pub want_reply: bool,
}

/// `{info}`: forwarded client notification (read/recv receipt, key press).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgInfo {
    pub topic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    pub what: String,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub seq: u64,
}

/// Access mode triple reported to clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgAccessMode {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub want: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub given: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

impl MsgAccessMode {
    pub fn new(want: AccessMode, given: AccessMode) -> Self {
        Self {
            want: want.to_string(),
            given: given.to_string(),
            mode: (want & given).to_string(),
        }
    }
}

/// Topic description in a `{meta}` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgTopicDesc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_acs: Option<MsgDefaultAcs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs: Option<MsgAccessMode>,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub seq_id: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub read_seq_id: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub recv_seq_id: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub del_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

/// Last-seen info for offline contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgLastSeen {
    pub when: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ua: String,
}

/// A single subscription row in a `{meta}` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgTopicSub {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default)]
    pub acs: MsgAccessMode,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub seq_id: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub read_seq_id: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub recv_seq_id: u64,
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub del_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<MsgLastSeen>,
}

/// Deleted-ranges report in a `{meta}` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgDelValues {
    pub del_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub del_seq: Vec<DelRange>,
}

/// `{meta}`: topic metadata reply, sent only to the requesting session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub topic: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<MsgTopicDesc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub: Vec<MsgTopicSub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del: Option<MsgDelValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred: Option<Vec<crate::store::Credential>>,
}

/// The payload of a server packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerPayload {
    Ctrl(MsgCtrl),
    Data(MsgData),
    Meta(Box<MsgMeta>),
    Pres(MsgPres),
    Info(MsgInfo),
}

/// A server packet with its fan-out envelope. Only the payload is
/// serialized; the envelope steers delivery inside the server.
#[derive(Debug, Clone)]
pub struct ServerMsg {
    pub payload: ServerPayload,
    /// Session id to skip during fan-out (the originator).
    pub skip_sid: String,
    /// The user this message acts for; used in broadcast permission checks.
    pub as_user: Uid,
    /// Client packet id to echo in the acknowledgement, if any.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Session to acknowledge (data publish replies).
    pub sess: Option<Arc<Session>>,
}

impl ServerMsg {
    pub fn new(payload: ServerPayload, ts: DateTime<Utc>) -> Self {
        Self {
            payload,
            skip_sid: String::new(),
            as_user: Uid::ZERO,
            id: String::new(),
            timestamp: ts,
            sess: None,
        }
    }

    pub fn data(&self) -> Option<&MsgData> {
        match &self.payload {
            ServerPayload::Data(m) => Some(m),
            _ => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut MsgData> {
        match &mut self.payload {
            ServerPayload::Data(m) => Some(m),
            _ => None,
        }
    }

    pub fn pres(&self) -> Option<&MsgPres> {
        match &self.payload {
            ServerPayload::Pres(m) => Some(m),
            _ => None,
        }
    }

    pub fn pres_mut(&mut self) -> Option<&mut MsgPres> {
        match &mut self.payload {
            ServerPayload::Pres(m) => Some(m),
            _ => None,
        }
    }

    pub fn info(&self) -> Option<&MsgInfo> {
        match &self.payload {
            ServerPayload::Info(m) => Some(m),
            _ => None,
        }
    }

    pub fn ctrl(&self) -> Option<&MsgCtrl> {
        match &self.payload {
            ServerPayload::Ctrl(m) => Some(m),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&MsgMeta> {
        match &self.payload {
            ServerPayload::Meta(m) => Some(m),
            _ => None,
        }
    }

    /// Encode the wire-visible part of the packet.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }
}

impl Serialize for ServerMsg {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.payload.serialize(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::time_now;

    #[test]
    fn test_parse_sub() {
        let json = br#"{"sub":{"id":"1","topic":"grp1"}}"#;
        match parse_client(json).unwrap() {
            ClientPayload::Sub(sub) => {
                assert_eq!(sub.id, "1");
                assert_eq!(sub.topic, "grp1");
                assert!(sub.get.is_none());
            }
            other => panic!("expected Sub, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_pub() {
        let json = br#"{"pub":{"id":"2","topic":"grp1","content":"hi","noEcho":true}}"#;
        match parse_client(json).unwrap() {
            ClientPayload::Pub(p) => {
                assert_eq!(p.content, Value::String("hi".into()));
                assert!(p.no_echo);
            }
            other => panic!("expected Pub, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_del_ranges() {
        let json = br#"{"del":{"topic":"grp1","what":"msg","delSeq":[{"low":1,"hi":5}],"hard":true}}"#;
        match parse_client(json).unwrap() {
            ClientPayload::Del(d) => {
                assert_eq!(d.what, "msg");
                assert!(d.hard);
                assert_eq!(d.del_seq, vec![DelRange { low: 1, hi: 5 }]);
            }
            other => panic!("expected Del, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_note() {
        let json = br#"{"note":{"topic":"grp1","what":"read","seq":7}}"#;
        match parse_client(json).unwrap() {
            ClientPayload::Note(n) => {
                assert_eq!(n.what, "read");
                assert_eq!(n.seq, 7);
            }
            other => panic!("expected Note, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_data_skips_empty_from() {
        let msg = ServerMsg::new(
            ServerPayload::Data(MsgData {
                topic: "chn1".into(),
                from: String::new(),
                ts: time_now(),
                seq: 3,
                head: None,
                content: Value::String("x".into()),
            }),
            time_now(),
        );
        let json: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(json["data"]["seq"], 3);
        assert!(json["data"].get("from").is_none());
    }

    #[test]
    fn test_encode_pres_omits_routing_fields() {
        let mut pres = MsgPres {
            topic: "me".into(),
            src: "grp1".into(),
            what: "on".into(),
            ..Default::default()
        };
        pres.filter_in = 0x2;
        pres.single_user = Uid(4);
        let msg = ServerMsg::new(ServerPayload::Pres(pres), time_now());
        let json: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(json["pres"]["what"], "on");
        assert!(json["pres"].get("filter_in").is_none());
        assert!(json["pres"].get("single_user").is_none());
    }

    #[test]
    fn test_ctrl_roundtrip() {
        let ctrl = MsgCtrl {
            id: "5".into(),
            topic: "grp1".into(),
            code: 202,
            text: "accepted".into(),
            params: Some(serde_json::json!({"seq": 1})),
            ts: time_now(),
        };
        let msg = ServerMsg::new(ServerPayload::Ctrl(ctrl), time_now());
        let json: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(json["ctrl"]["code"], 202);
        assert_eq!(json["ctrl"]["params"]["seq"], 1);
    }
}
