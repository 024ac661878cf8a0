//! Proxy topic
//!
//! On a node that is not the master for a topic, the hub runs a proxy: a
//! thin loop with no business logic that forwards client packets upstream
//! and fans master replies back out to the local sessions it multiplexes.
//! The only state it keeps is per-session bookkeeping and a shadow of the
//! master's `lastSeqId`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::{Cluster, ClusterReq, ClusterReqType, ClusterResp, RemoteSession};
use crate::error::err_cluster_unreachable;
use crate::hub::{HubEvent, ServerCtx};
use crate::proto::ServerMsg;
use crate::session::{Session, TopicLink};
use crate::topic::{StopReason, TopicReceivers, TopicStatus, TopicTx};
use crate::types::time_now;

/// Node-local stand-in for a topic mastered elsewhere.
pub struct ProxyTopic {
    name: String,
    /// Master node name.
    master: String,
    /// Shadow of the master's last data seq id.
    last_seq: u64,
    /// Local sessions by sid.
    sessions: HashMap<String, Arc<Session>>,
    status: Arc<TopicStatus>,
    ctx: Arc<ServerCtx>,
    tx: TopicTx,
}

impl ProxyTopic {
    pub fn new(
        ctx: Arc<ServerCtx>,
        name: &str,
        master: &str,
        tx: TopicTx,
        status: Arc<TopicStatus>,
    ) -> Self {
        Self {
            name: name.to_string(),
            master: master.to_string(),
            last_seq: 0,
            sessions: HashMap::new(),
            status,
            ctx,
            tx,
        }
    }

    fn cluster(&self) -> Option<Arc<Cluster>> {
        self.ctx.cluster.clone()
    }

    fn remote_session(&self, sess: &Session) -> RemoteSession {
        RemoteSession {
            sid: sess.sid.clone(),
            uid: sess.uid,
            auth_lvl: crate::types::AuthLevel::Auth,
            user_agent: sess.user_agent(),
            background: sess.is_background(),
        }
    }

    async fn forward(&self, sess: Option<&Arc<Session>>, req: ClusterReq) {
        let Some(cluster) = self.cluster() else {
            warn!(topic = %self.name, "proxy without a cluster");
            return;
        };
        if let Err(e) = cluster.transport.request(&self.master, req).await {
            warn!(topic = %self.name, master = %self.master, error = %e, "forward failed");
            if let Some(sess) = sess {
                sess.queue_out(err_cluster_unreachable("", &self.name, time_now()));
            }
        }
    }

    /// Run the forwarding loop. `resp_rx` is the proxy channel carrying
    /// master replies.
    pub async fn run(mut self, mut rx: TopicReceivers, mut resp_rx: mpsc::Receiver<ClusterResp>) {
        self.status.mark_loaded();
        loop {
            tokio::select! {
                biased;

                sd = rx.exit.recv() => {
                    let done = sd.and_then(|sd| sd.done);
                    for sess in self.sessions.values() {
                        sess.detach(&self.name);
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }

                Some(join) = rx.reg.recv() => {
                    let node = self.cluster().map(|c| c.self_name.clone()).unwrap_or_default();
                    let mut req = ClusterReq::new(ClusterReqType::Attach, &node, &self.name);
                    req.msg = Some(join.pkt.clone());
                    req.sess = Some(self.remote_session(&join.sess));
                    // Link optimistically; the master's reply confirms or the
                    // session simply detaches again.
                    join.sess.add_sub(&self.name, TopicLink {
                        broadcast: self.tx.broadcast.clone(),
                        unreg: self.tx.unreg.clone(),
                        meta: self.tx.meta.clone(),
                        supd: self.tx.supd.clone(),
                    });
                    self.sessions.insert(join.sess.sid.clone(), join.sess.clone());
                    self.forward(Some(&join.sess), req).await;
                }

                Some(leave) = rx.unreg.recv() => {
                    self.sessions.remove(&leave.sess.sid);
                    leave.sess.del_sub(&self.name);
                    let node = self.cluster().map(|c| c.self_name.clone()).unwrap_or_default();
                    let mut req = ClusterReq::new(ClusterReqType::Detach, &node, &self.name);
                    req.msg = leave.pkt.clone();
                    req.sess = Some(self.remote_session(&leave.sess));
                    self.forward(Some(&leave.sess), req).await;
                }

                Some(msg) = rx.broadcast.recv() => {
                    let node = self.cluster().map(|c| c.self_name.clone()).unwrap_or_default();
                    let req_type = if msg.data().is_some() {
                        ClusterReqType::Data
                    } else {
                        ClusterReqType::Broadcast
                    };
                    let mut req = ClusterReq::new(req_type, &node, &self.name);
                    let sess = msg.sess.clone();
                    req.sess = sess.as_deref().map(|s| self.remote_session(s));
                    req.srv_msg = Some(msg);
                    self.forward(sess.as_ref(), req).await;
                }

                Some(meta) = rx.meta.recv() => {
                    let node = self.cluster().map(|c| c.self_name.clone()).unwrap_or_default();
                    let mut req = ClusterReq::new(ClusterReqType::Meta, &node, &self.name);
                    req.msg = Some(meta.pkt.clone());
                    req.sess = Some(self.remote_session(&meta.sess));
                    self.forward(Some(&meta.sess), req).await;
                }

                Some(upd) = rx.supd.recv() => {
                    let node = self.cluster().map(|c| c.self_name.clone()).unwrap_or_default();
                    let mut req = ClusterReq::new(ClusterReqType::Broadcast, &node, &self.name);
                    if let Some(sess) = &upd.sess {
                        req.sess_update = Some(crate::cluster::ClusterSessUpdate {
                            node: node.clone(),
                            sid: sess.sid.clone(),
                            uid: sess.uid,
                            user_agent: sess.user_agent(),
                            background_to_fg: true,
                        });
                    } else {
                        req.sess_update = Some(crate::cluster::ClusterSessUpdate {
                            node: node.clone(),
                            sid: String::new(),
                            uid: crate::types::Uid::ZERO,
                            user_agent: upd.user_agent.clone(),
                            background_to_fg: false,
                        });
                    }
                    self.forward(None, req).await;
                }

                Some(resp) = resp_rx.recv() => {
                    if self.handle_resp(resp) {
                        return;
                    }
                }
            }
        }
    }

    /// Apply one master response. Returns true when the proxy should stop.
    fn handle_resp(&mut self, resp: ClusterResp) -> bool {
        if let Some(reason) = resp.stop {
            debug!(topic = %self.name, ?reason, "master stopped the topic");
            if reason == StopReason::Deleted {
                self.status.mark_deleted();
            }
            for sess in self.sessions.values() {
                sess.detach(&self.name);
            }
            self.ctx.hub_notify(HubEvent::TopicGone {
                name: self.name.clone(),
            });
            return true;
        }

        if resp.detach {
            if resp.orig_sid.is_empty() {
                for sess in self.sessions.values() {
                    sess.detach(&self.name);
                }
                self.sessions.clear();
            } else if let Some(sess) = self.sessions.remove(&resp.orig_sid) {
                sess.detach(&self.name);
            }
            return false;
        }

        let Some(msg) = resp.msg else {
            return false;
        };

        // Keep the seq shadow fresh so locally-reported descriptions are
        // not stale.
        if let Some(data) = msg.data()
            && data.seq > self.last_seq
        {
            self.last_seq = data.seq;
        }

        if resp.orig_sid.is_empty() {
            self.fanout(msg);
        } else if let Some(sess) = self.sessions.get(&resp.orig_sid) {
            if !sess.queue_out(msg) {
                warn!(topic = %self.name, sid = %resp.orig_sid, "stuck proxied session");
                self.drop_session(&resp.orig_sid);
            }
        } else {
            debug!(topic = %self.name, sid = %resp.orig_sid, "reply for unknown session");
        }
        false
    }

    /// Per-uid filtering of a master broadcast. Mode checks already happened
    /// at the master; only identity-based routing fields apply here.
    fn fanout(&mut self, msg: ServerMsg) {
        let mut stuck: Vec<String> = Vec::new();
        for (sid, sess) in &self.sessions {
            if *sid == msg.skip_sid {
                continue;
            }
            if let Some(pres) = msg.pres() {
                if !pres.single_user.is_zero() && sess.uid != pres.single_user {
                    continue;
                }
                if !pres.exclude_user.is_zero() && sess.uid == pres.exclude_user {
                    continue;
                }
            }
            if let Some(info) = msg.info()
                && info.what == "kp"
                && info.from == sess.uid.user_id()
            {
                continue;
            }
            let mut out = msg.clone();
            out.sess = None;
            if !sess.queue_out(out) {
                warn!(topic = %self.name, sid = %sess.sid, "stuck proxied session");
                stuck.push(sid.clone());
            }
        }
        for sid in stuck {
            self.drop_session(&sid);
        }
    }

    fn drop_session(&mut self, sid: &str) {
        if let Some(sess) = self.sessions.remove(sid) {
            sess.detach(&self.name);
            let leave = super::SessionLeave { sess, pkt: None };
            if self.tx.unreg.try_send(leave).is_err() {
                warn!(topic = %self.name, "unreg queue full while dropping session");
            }
        }
    }
}
