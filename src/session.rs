//! Client sessions
//!
//! A session represents one long-lived client connection (WebSocket,
//! long-poll or gRPC) or, on a master topic, a *multiplexing* stand-in for a
//! cluster peer relaying many real clients. The session owns a bounded
//! outbound queue; topics enqueue into it without blocking and schedule the
//! session for eviction when the queue is full.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::proto::ServerMsg;
use crate::topic::{MetaReq, SessionLeave, SessionUpdate, StopReason};
use crate::types::Uid;

/// Default capacity of a session's outbound queue.
pub const SEND_QUEUE_LIMIT: usize = 128;
/// Capacity of the detach queue.
const DETACH_QUEUE_LIMIT: usize = 64;

/// Client transport the session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Websock,
    Longpoll,
    Grpc,
    /// Synthetic session representing a cluster peer.
    Multiplex,
}

/// Event posted by a master topic into its cluster write mailbox on behalf of
/// a multiplexing session or one of its per-client shims.
#[derive(Debug)]
pub enum MuxEvent {
    /// Fan a server packet out to the remote proxy. An empty `orig_sid`
    /// addresses every client session the proxy multiplexes; otherwise the
    /// packet is a direct reply to that one session.
    Send {
        node: String,
        orig_sid: String,
        msg: Box<ServerMsg>,
    },
    /// The topic stopped; the proxy should drop its mirror.
    Stop { node: String, reason: StopReason },
    /// Detach the remote proxy from the named topic.
    Detach { node: String, topic: String },
}

/// Where a session's outbound traffic goes.
enum Outbound {
    /// Straight to the transport writer.
    Direct(mpsc::Sender<ServerMsg>),
    /// Into the owning topic's cluster write mailbox.
    Mux(mpsc::Sender<MuxEvent>),
}

/// Handles into a topic's input queues, held by every attached session.
#[derive(Clone)]
pub struct TopicLink {
    pub broadcast: mpsc::Sender<ServerMsg>,
    pub unreg: mpsc::Sender<SessionLeave>,
    pub meta: mpsc::Sender<MetaReq>,
    pub supd: mpsc::Sender<SessionUpdate>,
}

/// Receiving ends handed to the transport writer at session creation.
pub struct SessionReceivers {
    pub send: mpsc::Receiver<ServerMsg>,
    pub stop: mpsc::Receiver<StopReason>,
    pub detach: mpsc::Receiver<String>,
}

/// A client connection.
pub struct Session {
    /// Unique session id.
    pub sid: String,
    /// Authenticated user. Zero for multiplexing sessions.
    pub uid: Uid,
    pub proto: Proto,
    /// Name of the peer node for multiplexing sessions, empty otherwise.
    pub cluster_node: String,
    /// For per-client cluster shims: the multiplexing session that carries
    /// their topic attachment.
    pub multi: Option<std::sync::Arc<Session>>,

    user_agent: Mutex<String>,
    background: AtomicBool,
    last_action: Mutex<DateTime<Utc>>,

    out: Outbound,
    stop_tx: mpsc::Sender<StopReason>,
    detach_tx: mpsc::Sender<String>,

    /// Topics this session is attached to, by expanded name.
    subs: Mutex<HashMap<String, TopicLink>>,
}

impl Session {
    /// Create an ordinary client session with the default queue capacity.
    pub fn new(
        uid: Uid,
        proto: Proto,
        user_agent: &str,
    ) -> (std::sync::Arc<Self>, SessionReceivers) {
        Self::with_queue_size(uid, proto, user_agent, SEND_QUEUE_LIMIT)
    }

    /// Create a session with an explicit outbound queue capacity.
    pub fn with_queue_size(
        uid: Uid,
        proto: Proto,
        user_agent: &str,
        queue_size: usize,
    ) -> (std::sync::Arc<Self>, SessionReceivers) {
        let (send_tx, send_rx) = mpsc::channel(queue_size);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (detach_tx, detach_rx) = mpsc::channel(DETACH_QUEUE_LIMIT);

        let sess = std::sync::Arc::new(Self {
            sid: uuid::Uuid::new_v4().simple().to_string(),
            uid,
            proto,
            cluster_node: String::new(),
            multi: None,
            user_agent: Mutex::new(user_agent.to_string()),
            background: AtomicBool::new(false),
            last_action: Mutex::new(Utc::now()),
            out: Outbound::Direct(send_tx),
            stop_tx,
            detach_tx,
            subs: Mutex::new(HashMap::new()),
        });

        (
            sess,
            SessionReceivers {
                send: send_rx,
                stop: stop_rx,
                detach: detach_rx,
            },
        )
    }

    /// Create a multiplexing session for a cluster peer. Its outbound queue
    /// is the owning topic's cluster write mailbox.
    pub fn new_multiplex(
        node: &str,
        topic: &str,
        mailbox: mpsc::Sender<MuxEvent>,
    ) -> std::sync::Arc<Self> {
        let (stop_tx, _) = mpsc::channel(1);
        let (detach_tx, _) = mpsc::channel(1);
        std::sync::Arc::new(Self {
            sid: format!("mux-{}-{}", node, topic),
            uid: Uid::ZERO,
            proto: Proto::Multiplex,
            cluster_node: node.to_string(),
            multi: None,
            user_agent: Mutex::new(String::new()),
            background: AtomicBool::new(false),
            last_action: Mutex::new(Utc::now()),
            out: Outbound::Mux(mailbox),
            stop_tx,
            detach_tx,
            subs: Mutex::new(HashMap::new()),
        })
    }

    /// Create a per-client shim riding on a multiplexing session. It keeps
    /// the remote client's real sid so direct replies can be routed back to
    /// exactly that session on the proxy side.
    pub fn new_cluster_shim(
        sid: &str,
        uid: Uid,
        user_agent: &str,
        background: bool,
        multi: std::sync::Arc<Session>,
        mailbox: mpsc::Sender<MuxEvent>,
    ) -> std::sync::Arc<Self> {
        let (stop_tx, _) = mpsc::channel(1);
        let (detach_tx, _) = mpsc::channel(1);
        std::sync::Arc::new(Self {
            sid: sid.to_string(),
            uid,
            proto: Proto::Multiplex,
            cluster_node: multi.cluster_node.clone(),
            multi: Some(multi),
            user_agent: Mutex::new(user_agent.to_string()),
            background: AtomicBool::new(background),
            last_action: Mutex::new(Utc::now()),
            out: Outbound::Mux(mailbox),
            stop_tx,
            detach_tx,
            subs: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_multiplex(&self) -> bool {
        self.proto == Proto::Multiplex
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::Relaxed)
    }

    pub fn set_background(&self, bg: bool) {
        self.background.store(bg, Ordering::Relaxed);
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.lock().unwrap().clone()
    }

    pub fn set_user_agent(&self, ua: &str) {
        *self.user_agent.lock().unwrap() = ua.to_string();
    }

    pub fn last_action(&self) -> DateTime<Utc> {
        *self.last_action.lock().unwrap()
    }

    pub fn touch(&self) {
        *self.last_action.lock().unwrap() = Utc::now();
    }

    /// Enqueue an outbound packet without blocking. Returns false when the
    /// queue is full or closed; the caller decides whether to evict.
    pub fn queue_out(&self, msg: ServerMsg) -> bool {
        match &self.out {
            Outbound::Direct(tx) => tx.try_send(msg).is_ok(),
            Outbound::Mux(tx) => {
                // Shims address their own remote session; the registered
                // multiplexing session broadcasts to all of them.
                let orig_sid = if self.multi.is_some() {
                    self.sid.clone()
                } else {
                    String::new()
                };
                tx.try_send(MuxEvent::Send {
                    node: self.cluster_node.clone(),
                    orig_sid,
                    msg: Box::new(msg),
                })
                .is_ok()
            }
        }
    }

    /// Signal the transport writer to close the connection.
    pub fn stop(&self, reason: StopReason) {
        match &self.out {
            Outbound::Direct(_) => {
                let _ = self.stop_tx.try_send(reason);
            }
            Outbound::Mux(tx) => {
                let _ = tx.try_send(MuxEvent::Stop {
                    node: self.cluster_node.clone(),
                    reason,
                });
            }
        }
    }

    /// Tell the session to forget a topic. Called by topics on shutdown.
    pub fn detach(&self, topic: &str) {
        self.del_sub(topic);
        match &self.out {
            Outbound::Direct(_) => {
                if self.detach_tx.try_send(topic.to_string()).is_err() {
                    debug!(sid = %self.sid, topic, "detach queue full");
                }
            }
            Outbound::Mux(tx) => {
                let _ = tx.try_send(MuxEvent::Detach {
                    node: self.cluster_node.clone(),
                    topic: topic.to_string(),
                });
            }
        }
    }

    /// Record an attachment to a topic.
    pub fn add_sub(&self, topic: &str, link: TopicLink) {
        self.subs.lock().unwrap().insert(topic.to_string(), link);
    }

    pub fn get_sub(&self, topic: &str) -> Option<TopicLink> {
        self.subs.lock().unwrap().get(topic).cloned()
    }

    pub fn del_sub(&self, topic: &str) {
        self.subs.lock().unwrap().remove(topic);
    }

    pub fn sub_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Names of all attached topics; used when dropping the session.
    pub fn sub_names(&self) -> Vec<String> {
        self.subs.lock().unwrap().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("uid", &self.uid)
            .field("proto", &self.proto)
            .field("subs", &self.sub_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::no_err;
    use crate::types::time_now;

    #[tokio::test]
    async fn test_queue_out_delivers() {
        let (sess, mut rx) = Session::with_queue_size(Uid(1), Proto::Websock, "ua", 4);
        assert!(sess.queue_out(no_err("1", "t", time_now())));
        let got = rx.send.recv().await.unwrap();
        assert_eq!(got.ctrl().unwrap().code, 200);
    }

    #[tokio::test]
    async fn test_queue_out_full_is_nonblocking() {
        let (sess, _rx) = Session::with_queue_size(Uid(1), Proto::Websock, "ua", 1);
        assert!(sess.queue_out(no_err("1", "t", time_now())));
        // Queue is full now; must fail fast instead of blocking.
        assert!(!sess.queue_out(no_err("2", "t", time_now())));
    }

    #[tokio::test]
    async fn test_detach_posts_topic_name() {
        let (sess, mut rx) = Session::new(Uid(1), Proto::Websock, "ua");
        sess.add_sub(
            "grp1",
            TopicLink {
                broadcast: mpsc::channel(1).0,
                unreg: mpsc::channel(1).0,
                meta: mpsc::channel(1).0,
                supd: mpsc::channel(1).0,
            },
        );
        sess.detach("grp1");
        assert_eq!(rx.detach.recv().await.unwrap(), "grp1");
        assert!(sess.get_sub("grp1").is_none());
    }

    #[tokio::test]
    async fn test_multiplex_outbound_goes_to_mailbox() {
        let (tx, mut rx) = mpsc::channel(4);
        let sess = Session::new_multiplex("n2", "grp1", tx);
        assert!(sess.is_multiplex());
        assert!(sess.queue_out(no_err("1", "grp1", time_now())));
        match rx.recv().await.unwrap() {
            MuxEvent::Send { node, orig_sid, msg } => {
                assert_eq!(node, "n2");
                assert!(orig_sid.is_empty());
                assert_eq!(msg.ctrl().unwrap().code, 200);
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cluster_shim_tags_origin_sid() {
        let (tx, mut rx) = mpsc::channel(4);
        let mux = Session::new_multiplex("n2", "grp1", tx.clone());
        let shim = Session::new_cluster_shim("real-sid", Uid(3), "ua", false, mux, tx);
        assert!(shim.queue_out(no_err("1", "grp1", time_now())));
        match rx.recv().await.unwrap() {
            MuxEvent::Send { orig_sid, .. } => assert_eq!(orig_sid, "real-sid"),
            other => panic!("expected Send, got {:?}", other),
        }
    }
}
