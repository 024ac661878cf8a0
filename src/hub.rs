//! Hub
//!
//! Routes client packets to topics by name, spawns master or proxy topics on
//! demand (placement decided by the cluster's consistent hash), reaps idle
//! topics, relays cluster requests into the local masters, and walks the
//! topic set on rehash.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterReq, ClusterReqType, ClusterResp, FailoverState};
use crate::config::{FailoverConfig, Limits};
use crate::error::{
    err_attach_first, err_auth_required, err_malformed_reply, err_not_found_reply,
    err_not_implemented, err_user_not_found, no_err,
};
use crate::proto::{ClientMsg, ClientPayload, MsgData, MsgInfo, ServerMsg, ServerPayload};
use crate::push::PushRegistry;
use crate::session::{MuxEvent, Session};
use crate::store::{Store, StoreError, Subscription, TopicRec};
use crate::topic::{
    MetaReq, ProxyTopic, SessionJoin, SessionLeave, SessionUpdate, ShutdownReq, StopReason, Topic,
    TopicStatus, TopicTx, topic_channels,
};
use crate::types::{
    AuthLevel, TopicCat, Uid, chn_to_grp, gen_topic_name, is_channel, parse_user_id, time_now,
    topic_cat,
};

/// Capacity of the inter-topic routing queue.
const ROUTE_QUEUE: usize = 256;
/// Capacity of the topic→hub control queue.
const HUB_QUEUE: usize = 64;
/// Capacity of a proxy topic's response channel.
const PROXY_RESP_QUEUE: usize = 64;

/// Control events topics send back to the hub.
#[derive(Debug)]
pub enum HubEvent {
    /// The kill timer fired with no sessions attached.
    TopicIdle { name: String },
    /// The topic was deleted (or its master told the proxy to fold).
    TopicGone { name: String },
}

/// A server message addressed to a topic by name.
pub struct RouteMsg {
    pub topic: String,
    pub msg: ServerMsg,
}

/// Process-wide state threaded through construction instead of globals.
pub struct ServerCtx {
    pub store: Store,
    pub push: PushRegistry,
    pub limits: Limits,
    pub cluster: Option<Arc<Cluster>>,
    route_tx: mpsc::Sender<RouteMsg>,
    hub_tx: mpsc::Sender<HubEvent>,
    /// Cached per-user unread message counts.
    unread: DashMap<Uid, i64>,
}

impl ServerCtx {
    /// Deliver a server message to a topic by name, possibly across the
    /// cluster. Never blocks; drops with a log when the router is saturated.
    pub fn route(&self, topic: &str, msg: ServerMsg) {
        let routed = RouteMsg {
            topic: topic.to_string(),
            msg,
        };
        if self.route_tx.try_send(routed).is_err() {
            warn!(topic, "routing queue full, message dropped");
        }
    }

    pub fn hub_notify(&self, event: HubEvent) {
        if self.hub_tx.try_send(event).is_err() {
            warn!("hub control queue full");
        }
    }

    pub fn update_unread(&self, uid: Uid, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut entry = self.unread.entry(uid).or_insert(0);
        *entry = (*entry + delta).max(0);
    }

    pub fn unread(&self, uid: Uid) -> i64 {
        self.unread.get(&uid).map(|e| *e).unwrap_or(0)
    }
}

/// Senders and shared status of one live topic.
#[derive(Clone)]
pub struct TopicHandle {
    pub tx: TopicTx,
    pub status: Arc<TopicStatus>,
    pub is_proxy: bool,
    pub cat: TopicCat,
    pub is_chan: bool,
    /// Cluster write mailbox (master topics only).
    pub mux_tx: Option<mpsc::Sender<MuxEvent>>,
    /// Master response channel (proxy topics only).
    pub proxy_resp: Option<mpsc::Sender<ClusterResp>>,
}

/// The topic registry and packet router.
pub struct Hub {
    topics: DashMap<String, TopicHandle>,
    /// Registered multiplexing sessions by `mux-<node>-<topic>`.
    mux_sessions: DashMap<String, Arc<Session>>,
    pub ctx: Arc<ServerCtx>,
    failover: Option<Mutex<FailoverState>>,
}

impl Hub {
    /// Build the hub and its server context, and start the router tasks.
    pub fn new(
        store: Store,
        push: PushRegistry,
        limits: Limits,
        cluster: Option<Arc<Cluster>>,
        failover: Option<FailoverConfig>,
    ) -> Arc<Hub> {
        let (route_tx, route_rx) = mpsc::channel(ROUTE_QUEUE);
        let (hub_tx, hub_rx) = mpsc::channel(HUB_QUEUE);

        let ctx = Arc::new(ServerCtx {
            store,
            push,
            limits,
            cluster: cluster.clone(),
            route_tx,
            hub_tx,
            unread: DashMap::new(),
        });

        let failover = match (&cluster, failover) {
            (Some(cluster), Some(cfg)) if cfg.enabled => Some(Mutex::new(FailoverState::new(
                cfg,
                &cluster.self_name,
                &cluster.live_nodes(),
            ))),
            _ => None,
        };

        let hub = Arc::new(Hub {
            topics: DashMap::new(),
            mux_sessions: DashMap::new(),
            ctx,
            failover,
        });

        tokio::spawn(Hub::run(hub.clone(), route_rx, hub_rx));
        hub
    }

    /// The hub's own loop: inter-topic routing and topic lifecycle control.
    async fn run(
        self: Arc<Hub>,
        mut route_rx: mpsc::Receiver<RouteMsg>,
        mut hub_rx: mpsc::Receiver<HubEvent>,
    ) {
        loop {
            tokio::select! {
                Some(routed) = route_rx.recv() => {
                    self.route_msg(routed).await;
                }
                Some(event) = hub_rx.recv() => {
                    match event {
                        HubEvent::TopicIdle { name } => {
                            if let Some((_, handle)) = self.topics.remove(&name) {
                                debug!(topic = %name, "reaping idle topic");
                                let _ = handle.tx.exit.try_send(ShutdownReq {
                                    reason: StopReason::None,
                                    done: None,
                                });
                            }
                            self.mux_sessions.retain(|k, _| !k.ends_with(&format!("-{}", name)));
                        }
                        HubEvent::TopicGone { name } => {
                            if let Some((_, handle)) = self.topics.remove(&name) {
                                handle.status.mark_deleted();
                                let _ = handle.tx.exit.try_send(ShutdownReq {
                                    reason: StopReason::Deleted,
                                    done: None,
                                });
                            }
                            self.mux_sessions.retain(|k, _| !k.ends_with(&format!("-{}", name)));
                        }
                    }
                }
                else => return,
            }
        }
    }

    /// Deliver a routed message to a live local topic, or forward it to the
    /// topic's master node. Messages for unloaded local topics are dropped:
    /// their subscribers are offline by definition.
    async fn route_msg(&self, routed: RouteMsg) {
        if let Some(handle) = self.topics.get(&routed.topic) {
            if handle.tx.broadcast.try_send(routed.msg).is_err() {
                warn!(topic = %routed.topic, "broadcast queue full, routed message dropped");
            }
            return;
        }
        if let Some(cluster) = &self.ctx.cluster
            && let Some(master) = cluster.is_remote(&routed.topic)
        {
            let mut req = ClusterReq::new(ClusterReqType::Broadcast, &cluster.self_name, &routed.topic);
            req.srv_msg = Some(routed.msg);
            if let Err(e) = cluster.transport.request(&master, req).await {
                debug!(topic = %routed.topic, error = %e, "cross-node route failed");
            }
            return;
        }
        debug!(topic = %routed.topic, "route to unloaded topic dropped");
    }

    /// Resolve the name a client addressed into the expanded routable name.
    fn expand_topic_name(&self, pkt: &ClientMsg) -> Result<String, ServerMsg> {
        let now = time_now();
        let original = pkt.original.as_str();

        let expanded = match original {
            "me" => {
                if pkt.as_user.is_zero() {
                    return Err(err_auth_required(&pkt.id, original, now));
                }
                pkt.as_user.me_name()
            }
            "fnd" => {
                if pkt.as_user.is_zero() {
                    return Err(err_auth_required(&pkt.id, original, now));
                }
                pkt.as_user.fnd_name()
            }
            "sys" => "sys".to_string(),
            _ if original.starts_with("usr") => {
                let Some(other) = parse_user_id(original) else {
                    return Err(err_malformed_reply(pkt, now));
                };
                if pkt.as_user.is_zero() {
                    return Err(err_auth_required(&pkt.id, original, now));
                }
                pkt.as_user.p2p_name(other)
            }
            _ if is_channel(original) => chn_to_grp(original),
            _ if original.starts_with("grp") || original.starts_with("p2p") => original.to_string(),
            _ => return Err(err_not_found_reply(pkt, now)),
        };
        Ok(expanded)
    }

    /// Entry point for every client packet after auth.
    pub async fn dispatch(&self, sess: &Arc<Session>, mut pkt: ClientMsg) {
        let now = time_now();
        match &pkt.payload {
            ClientPayload::Hi(hi) => {
                if !hi.user_agent.is_empty() {
                    sess.set_user_agent(&hi.user_agent);
                    // Debounced announcement through the 'me' topic.
                    if let Some(link) = sess.get_sub(&sess.uid.me_name()) {
                        let _ = link.supd.try_send(SessionUpdate {
                            sess: None,
                            user_agent: hi.user_agent.clone(),
                        });
                    }
                }
                if hi.background {
                    // Honored only before the first attachment; flipping to
                    // background later would corrupt the online counters.
                    if sess.sub_count() == 0 {
                        sess.set_background(true);
                    }
                } else if sess.is_background() {
                    // Foregrounded: topics recount the session as online and
                    // flush its deferred notifications.
                    sess.set_background(false);
                    for name in sess.sub_names() {
                        if let Some(link) = sess.get_sub(&name) {
                            let _ = link.supd.try_send(SessionUpdate {
                                sess: Some(sess.clone()),
                                user_agent: sess.user_agent(),
                            });
                        }
                    }
                }
                if !pkt.id.is_empty() {
                    sess.queue_out(no_err(&pkt.id, "", now));
                }
            }
            ClientPayload::Acc(_) | ClientPayload::Login(_) => {
                // Account management and authentication live in front of the
                // core; a packet reaching this point is a dispatch error.
                sess.queue_out(err_not_implemented(&pkt.id, "", now));
            }
            ClientPayload::Sub(_) => {
                self.join(sess, pkt).await;
            }
            ClientPayload::Leave(_) => {
                let expanded = match self.expand_topic_name(&pkt) {
                    Ok(name) => name,
                    Err(reply) => {
                        sess.queue_out(reply);
                        return;
                    }
                };
                pkt.rcpt_to = expanded.clone();
                let Some(link) = sess.get_sub(&expanded) else {
                    sess.queue_out(crate::error::info_no_action_reply(&pkt, now));
                    return;
                };
                let leave = SessionLeave {
                    sess: sess.clone(),
                    pkt: Some(pkt),
                };
                if link.unreg.send(leave).await.is_err() {
                    debug!(topic = %expanded, "leave for a dead topic");
                }
            }
            ClientPayload::Pub(publish) => {
                let expanded = match self.expand_topic_name(&pkt) {
                    Ok(name) => name,
                    Err(reply) => {
                        sess.queue_out(reply);
                        return;
                    }
                };
                let Some(link) = sess.get_sub(&expanded) else {
                    sess.queue_out(err_attach_first(&pkt.id, &pkt.original, now));
                    return;
                };
                let mut msg = ServerMsg::new(
                    ServerPayload::Data(MsgData {
                        topic: pkt.original.clone(),
                        from: pkt.as_user.user_id(),
                        ts: pkt.timestamp,
                        seq: 0,
                        head: publish.head.clone(),
                        content: publish.content.clone(),
                    }),
                    pkt.timestamp,
                );
                msg.id = pkt.id.clone();
                msg.as_user = pkt.as_user;
                msg.sess = Some(sess.clone());
                if publish.no_echo {
                    msg.skip_sid = sess.sid.clone();
                }
                if link.broadcast.send(msg).await.is_err() {
                    debug!(topic = %expanded, "publish to a dead topic");
                }
            }
            ClientPayload::Note(note) => {
                let expanded = match self.expand_topic_name(&pkt) {
                    Ok(name) => name,
                    Err(_) => return,
                };
                // Notes are unacknowledged; silently dropped when detached.
                let Some(link) = sess.get_sub(&expanded) else {
                    return;
                };
                let mut msg = ServerMsg::new(
                    ServerPayload::Info(MsgInfo {
                        topic: pkt.original.clone(),
                        from: pkt.as_user.user_id(),
                        what: note.what.clone(),
                        seq: note.seq,
                    }),
                    pkt.timestamp,
                );
                msg.as_user = pkt.as_user;
                msg.skip_sid = sess.sid.clone();
                msg.sess = Some(sess.clone());
                let _ = link.broadcast.send(msg).await;
            }
            ClientPayload::Get(_) | ClientPayload::Set(_) | ClientPayload::Del(_) => {
                let expanded = match self.expand_topic_name(&pkt) {
                    Ok(name) => name,
                    Err(reply) => {
                        sess.queue_out(reply);
                        return;
                    }
                };
                pkt.rcpt_to = expanded.clone();
                let Some(link) = sess.get_sub(&expanded) else {
                    sess.queue_out(err_attach_first(&pkt.id, &pkt.original, now));
                    return;
                };
                let req = MetaReq {
                    sess: sess.clone(),
                    pkt,
                };
                if link.meta.send(req).await.is_err() {
                    debug!(topic = %expanded, "meta for a dead topic");
                }
            }
        }
    }

    /// `{sub}`: find or create the topic, then forward the join.
    pub async fn join(&self, sess: &Arc<Session>, mut pkt: ClientMsg) {
        let now = time_now();

        if pkt.original.starts_with("new") || pkt.original.starts_with("nch") {
            match self.create_grp_topic(&mut pkt).await {
                Ok(()) => {}
                Err(reply) => {
                    sess.queue_out(reply);
                    return;
                }
            }
        } else {
            let expanded = match self.expand_topic_name(&pkt) {
                Ok(name) => name,
                Err(reply) => {
                    sess.queue_out(reply);
                    return;
                }
            };
            pkt.rcpt_to = expanded;
        }

        let name = pkt.rcpt_to.clone();

        // First contact between two users creates the p2p topic; flag the
        // join so the one-time notifications fire.
        if topic_cat(&name) == Some(TopicCat::P2P)
            && !self.topics.contains_key(&name)
            && self
                .ctx
                .cluster
                .as_ref()
                .map(|c| c.is_remote(&name).is_none())
                .unwrap_or(true)
        {
            match self.ctx.store.topics.get(&name).await {
                Ok(None) => {
                    if let Err(e) = self.create_p2p_topic(&name, &pkt).await {
                        if matches!(e, StoreError::NotFound) {
                            sess.queue_out(err_user_not_found(&pkt.id, &pkt.original, now));
                        } else {
                            warn!(topic = %name, error = %e, "failed to create p2p topic");
                            sess.queue_out(crate::error::err_unknown_reply(&pkt, now));
                        }
                        return;
                    }
                    if let Some(sub) = pkt.sub_mut() {
                        sub.created = true;
                        sub.newsub = true;
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(topic = %name, error = %e, "p2p lookup failed");
                    sess.queue_out(crate::error::err_unknown_reply(&pkt, now));
                    return;
                }
            }
        }

        let handle = match self.get_or_spawn(&name, &pkt).await {
            Ok(handle) => handle,
            Err(StoreError::NotFound) => {
                match topic_cat(&name) {
                    Some(TopicCat::Me) | Some(TopicCat::Fnd) | Some(TopicCat::P2P) => {
                        sess.queue_out(err_user_not_found(&pkt.id, &pkt.original, now));
                    }
                    _ => {
                        sess.queue_out(err_not_found_reply(&pkt, now));
                    }
                }
                return;
            }
            Err(e) => {
                warn!(topic = %name, error = %e, "failed to load topic");
                sess.queue_out(crate::error::err_unknown_reply(&pkt, now));
                return;
            }
        };

        // Channel addressability: a chn name is only valid for channels.
        if is_channel(&pkt.original) && !handle.is_chan && !handle.is_proxy {
            sess.queue_out(err_not_found_reply(&pkt, now));
            return;
        }

        let join = SessionJoin {
            sess: sess.clone(),
            pkt,
        };
        if handle.tx.reg.send(join).await.is_err() {
            debug!(topic = %name, "join for a dead topic");
        }
    }

    /// Look up a live topic handle or load-and-spawn one.
    pub async fn get_or_spawn(&self, name: &str, pkt: &ClientMsg) -> Result<TopicHandle, StoreError> {
        if let Some(handle) = self.topics.get(name) {
            return Ok(handle.clone());
        }

        // Placement check: master here or proxy to the owning node.
        if let Some(cluster) = &self.ctx.cluster
            && let Some(master) = cluster.is_remote(name)
        {
            return Ok(self.spawn_proxy(name, &master));
        }

        self.spawn_master(name, pkt).await
    }

    fn spawn_proxy(&self, name: &str, master: &str) -> TopicHandle {
        let (tx, rx) = topic_channels();
        let (resp_tx, resp_rx) = mpsc::channel(PROXY_RESP_QUEUE);
        let status = Arc::new(TopicStatus::default());
        let handle = TopicHandle {
            tx: tx.clone(),
            status: status.clone(),
            is_proxy: true,
            cat: topic_cat(name).unwrap_or(TopicCat::Grp),
            // Channel addressability is only verifiable at the master.
            is_chan: false,
            mux_tx: None,
            proxy_resp: Some(resp_tx),
        };
        self.topics.insert(name.to_string(), handle.clone());

        let proxy = ProxyTopic::new(self.ctx.clone(), name, master, tx, status);
        info!(topic = %name, master = %master, "proxy topic created");
        tokio::spawn(proxy.run(rx, resp_rx));
        handle
    }

    async fn spawn_master(&self, name: &str, pkt: &ClientMsg) -> Result<TopicHandle, StoreError> {
        // p2p topics materialize on first contact.
        if topic_cat(name) == Some(TopicCat::P2P)
            && self.ctx.store.topics.get(name).await?.is_none()
        {
            self.create_p2p_topic(name, pkt).await?;
        }
        // The sys topic exists from first use.
        if name == "sys" && self.ctx.store.topics.get(name).await?.is_none() {
            let now = time_now();
            self.ctx
                .store
                .topics
                .create(TopicRec {
                    name: "sys".to_string(),
                    created: now,
                    updated: now,
                    access: crate::store::DefaultAccess {
                        auth: crate::access::AccessMode::C_SYS,
                        anon: crate::access::AccessMode::NONE,
                    },
                    ..Default::default()
                })
                .await?;
        }

        let (tx, rx) = topic_channels();
        let (mux_tx, mux_rx) = mpsc::channel(crate::topic::MUX_QUEUE);
        let status = Arc::new(TopicStatus::default());
        let topic = Topic::load(self.ctx.clone(), name, tx.clone(), status.clone(), mux_tx.clone())
            .await?;

        let handle = TopicHandle {
            tx,
            status,
            is_proxy: false,
            cat: topic.category(),
            is_chan: topic.channel_enabled(),
            mux_tx: Some(mux_tx),
            proxy_resp: None,
        };
        self.topics.insert(name.to_string(), handle.clone());
        info!(topic = %name, "master topic loaded");
        tokio::spawn(topic.run(rx, mux_rx));
        Ok(handle)
    }

    /// Create a new group topic for a `{sub topic="newX"}` request.
    async fn create_grp_topic(&self, pkt: &mut ClientMsg) -> Result<(), ServerMsg> {
        let now = time_now();
        if pkt.as_user.is_zero() {
            return Err(err_auth_required(&pkt.id, &pkt.original, now));
        }

        let name = gen_topic_name();
        let is_chan = pkt.original.starts_with("nch");

        let mut access = crate::store::DefaultAccess {
            auth: crate::access::AccessMode::C_PUBLIC,
            anon: crate::access::AccessMode::NONE,
        };
        let mut public = None;
        if let Some(sub) = pkt.sub()
            && let Some(set) = &sub.set
            && let Some(desc) = &set.desc
        {
            if let Some(defacs) = &desc.default_acs {
                if let Ok(auth) = defacs.auth.parse::<crate::access::AccessMode>()
                    && auth.is_defined()
                {
                    access.auth = auth;
                }
                if let Ok(anon) = defacs.anon.parse::<crate::access::AccessMode>()
                    && anon.is_defined()
                {
                    access.anon = anon;
                }
            }
            public = desc.public.clone();
        }

        let rec = TopicRec {
            name: name.clone(),
            created: now,
            updated: now,
            owner: pkt.as_user,
            access,
            is_chan,
            public,
            ..Default::default()
        };
        if let Err(e) = self.ctx.store.topics.create(rec).await {
            warn!(topic = %name, error = %e, "failed to create topic");
            return Err(crate::error::err_unknown_reply(pkt, now));
        }

        pkt.rcpt_to = name;
        if let Some(sub) = pkt.sub_mut() {
            sub.created = true;
            sub.newsub = true;
        }
        Ok(())
    }

    /// Create a p2p topic with both subscription rows.
    async fn create_p2p_topic(&self, name: &str, pkt: &ClientMsg) -> Result<(), StoreError> {
        let now = time_now();
        let Some((u1, u2)) = crate::types::parse_p2p(name) else {
            return Err(StoreError::NotFound);
        };
        let initiator = pkt.as_user;
        let other = if initiator == u1 { u2 } else { u1 };

        let users = self.ctx.store.users.get_all(&[initiator, other]).await?;
        let find = |uid: Uid| users.iter().find(|u| u.uid == uid);
        let other_user = find(other).ok_or(StoreError::NotFound)?;
        let initiator_user = find(initiator).ok_or(StoreError::NotFound)?;

        let mask = |mode: crate::access::AccessMode| {
            (mode & crate::access::AccessMode::C_P2P) | crate::access::AccessMode::APPROVE
        };
        let given1 = mask(if other_user.access.auth.is_defined() {
            other_user.access.auth
        } else {
            crate::access::AccessMode::C_P2P
        });
        let given2 = mask(if initiator_user.access.auth.is_defined() {
            initiator_user.access.auth
        } else {
            crate::access::AccessMode::C_P2P
        });

        let mut want1 = given1;
        if let Some(sub) = pkt.sub()
            && let Some(set) = &sub.set
            && let Some(sub_req) = &set.sub
            && let Ok(mode) = sub_req.mode.parse::<crate::access::AccessMode>()
            && mode.is_defined()
        {
            want1 = mask(mode);
        }
        let want2 = mask(if other_user.access.auth.is_defined() {
            other_user.access.auth
        } else {
            crate::access::AccessMode::C_P2P
        });

        self.ctx
            .store
            .topics
            .create(TopicRec {
                name: name.to_string(),
                created: now,
                updated: now,
                ..Default::default()
            })
            .await?;

        self.ctx
            .store
            .subs
            .create(Subscription {
                user: initiator,
                topic: name.to_string(),
                created: now,
                updated: now,
                mode_want: want1,
                mode_given: given1,
                ..Default::default()
            })
            .await?;
        self.ctx
            .store
            .subs
            .create(Subscription {
                user: other,
                topic: name.to_string(),
                created: now,
                updated: now,
                mode_want: want2,
                mode_given: given2,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Detach a dying session from every topic it holds.
    pub async fn session_gone(&self, sess: &Arc<Session>) {
        for name in sess.sub_names() {
            if let Some(link) = sess.get_sub(&name) {
                let leave = SessionLeave {
                    sess: sess.clone(),
                    pkt: None,
                };
                let _ = link.unreg.send(leave).await;
            }
        }
    }

    /// Get or create the multiplexing session representing a peer node on a
    /// local master topic.
    fn mux_session(&self, node: &str, topic: &str, mailbox: mpsc::Sender<MuxEvent>) -> Arc<Session> {
        let key = format!("mux-{}-{}", node, topic);
        self.mux_sessions
            .entry(key)
            .or_insert_with(|| Session::new_multiplex(node, topic, mailbox))
            .clone()
    }

    /// Master-side entry for proxied traffic.
    pub async fn handle_cluster_req(&self, req: ClusterReq) {
        if req.req_type == ClusterReqType::Ping {
            self.heartbeat_from(&req.node);
            return;
        }

        let handle = match self.get_or_spawn(&req.topic, req.msg.as_ref().unwrap_or(&placeholder_pkt(&req.topic))).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(topic = %req.topic, error = %e, "cluster request for unloadable topic");
                return;
            }
        };
        if handle.is_proxy {
            // Transient double-mastership during a rehash; the store's
            // unique constraints backstop any duplicate writes.
            warn!(topic = %req.topic, node = %req.node, "cluster request but topic is proxied here");
            return;
        }
        let Some(mux_tx) = handle.mux_tx.clone() else {
            return;
        };
        let mux = self.mux_session(&req.node, &req.topic, mux_tx.clone());

        let shim = req.sess.as_ref().map(|desc| {
            Session::new_cluster_shim(
                &desc.sid,
                desc.uid,
                &desc.user_agent,
                desc.background,
                mux.clone(),
                mux_tx.clone(),
            )
        });

        match req.req_type {
            ClusterReqType::Attach => {
                let (Some(sess), Some(pkt)) = (shim, req.msg) else {
                    return;
                };
                let _ = handle.tx.reg.send(SessionJoin { sess, pkt }).await;
            }
            ClusterReqType::Detach => {
                let Some(sess) = shim else {
                    return;
                };
                let _ = handle
                    .tx
                    .unreg
                    .send(SessionLeave { sess, pkt: req.msg })
                    .await;
            }
            ClusterReqType::Meta => {
                let (Some(sess), Some(pkt)) = (shim, req.msg) else {
                    return;
                };
                let _ = handle.tx.meta.send(MetaReq { sess, pkt }).await;
            }
            ClusterReqType::Data | ClusterReqType::Broadcast => {
                if let Some(su) = req.sess_update {
                    let _ = handle.tx.master.send(su).await;
                    return;
                }
                if let Some(mut msg) = req.srv_msg {
                    msg.sess = shim;
                    let _ = handle.tx.broadcast.send(msg).await;
                }
            }
            ClusterReqType::Ping => unreachable!("handled above"),
        }
    }

    /// Origin-side entry for master responses.
    pub async fn handle_cluster_resp(&self, resp: ClusterResp) {
        let sender = self
            .topics
            .get(&resp.topic)
            .and_then(|h| h.proxy_resp.clone());
        match sender {
            Some(tx) => {
                if tx.send(resp).await.is_err() {
                    debug!("proxy response channel closed");
                }
            }
            None => debug!(topic = %resp.topic, "response for unknown proxy"),
        }
    }

    /// Record a heartbeat; a rejoin triggers a rehash.
    pub fn heartbeat_from(&self, node: &str) {
        let Some(failover) = &self.failover else {
            return;
        };
        let rejoined = failover.lock().unwrap().heartbeat_from(node);
        if rejoined {
            let live = failover.lock().unwrap().live_nodes();
            if let Some(cluster) = &self.ctx.cluster {
                cluster.set_live_nodes(live);
            }
            self.rehash();
        }
    }

    /// One failover heartbeat interval elapsed: ping peers, advance the
    /// counters, react to topology changes.
    pub async fn failover_tick(&self) {
        let Some(cluster) = &self.ctx.cluster else {
            return;
        };
        let Some(failover) = &self.failover else {
            return;
        };

        let (peers, verdict) = {
            let mut state = failover.lock().unwrap();
            let peers: Vec<String> = state
                .live_nodes()
                .into_iter()
                .filter(|n| *n != cluster.self_name)
                .collect();
            (peers, state.tick())
        };

        for node in peers {
            let req = ClusterReq::new(ClusterReqType::Ping, &cluster.self_name, "");
            if let Err(e) = cluster.transport.request(&node, req).await {
                debug!(node = %node, error = %e, "heartbeat failed");
            }
        }

        if verdict.topology_changed {
            let live = failover.lock().unwrap().live_nodes();
            info!(?live, "cluster topology changed");
            cluster.set_live_nodes(live);
            self.rehash();
        }
        if verdict.leader_changed {
            info!(leader = %failover.lock().unwrap().leader(), "cluster leader changed");
        }
    }

    /// Recompute topic placement after a topology change. Local masters that
    /// moved away are terminated; proxies that became local are dropped so
    /// the next request creates a master.
    pub fn rehash(&self) {
        let Some(cluster) = &self.ctx.cluster else {
            return;
        };

        let mut terminate: Vec<(String, StopReason)> = Vec::new();
        for entry in self.topics.iter() {
            let remote = cluster.is_remote(entry.key());
            if !entry.value().is_proxy && remote.is_some() {
                terminate.push((entry.key().clone(), StopReason::Rehashing));
            } else if entry.value().is_proxy && remote.is_none() {
                terminate.push((entry.key().clone(), StopReason::None));
            }
        }

        for (name, reason) in terminate {
            if let Some((_, handle)) = self.topics.remove(&name) {
                info!(topic = %name, ?reason, "rehash terminates topic");
                let _ = handle.tx.exit.try_send(ShutdownReq { reason, done: None });
            }
            self.mux_sessions
                .retain(|k, _| !k.ends_with(&format!("-{}", name)));
        }
    }

    /// Orderly shutdown: stop every topic and wait for completion.
    pub async fn shutdown(&self) {
        let mut waits = Vec::new();
        let names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.topics.remove(&name) {
                let (done_tx, done_rx) = oneshot::channel();
                if handle
                    .tx
                    .exit
                    .try_send(ShutdownReq {
                        reason: StopReason::Shutdown,
                        done: Some(done_tx),
                    })
                    .is_ok()
                {
                    waits.push(done_rx);
                }
            }
        }
        for done in waits {
            let _ = done.await;
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Cheap external check used by transports to reject traffic early.
    pub fn topic_status(&self, name: &str) -> Option<Arc<TopicStatus>> {
        self.topics.get(name).map(|h| h.status.clone())
    }
}

fn placeholder_pkt(topic: &str) -> ClientMsg {
    ClientMsg {
        payload: ClientPayload::Sub(Default::default()),
        id: String::new(),
        original: topic.to_string(),
        rcpt_to: topic.to_string(),
        as_user: Uid::ZERO,
        auth_lvl: AuthLevel::None,
        timestamp: time_now(),
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::access::AccessMode;
    use crate::cluster::LoopbackTransport;
    use crate::config::Limits;
    use crate::proto::{MsgClientPub, MsgClientSub};
    use crate::session::{Proto, SessionReceivers};
    use crate::store::{DefaultAccess, MemoryStore, User};

    const A: Uid = Uid(0x11);

    fn test_limits() -> Limits {
        Limits {
            idle_master_topic_timeout: 300,
            ..Default::default()
        }
    }

    async fn seed_topic(store: &MemoryStore, name: &str, owner: Uid, is_chan: bool) {
        store
            .put_user(User {
                uid: owner,
                created: time_now(),
                updated: time_now(),
                access: DefaultAccess {
                    auth: AccessMode::C_AUTH,
                    anon: AccessMode::NONE,
                },
                ..Default::default()
            })
            .await;
        store
            .put_topic(TopicRec {
                name: name.to_string(),
                created: time_now(),
                updated: time_now(),
                owner,
                access: DefaultAccess {
                    auth: AccessMode::C_PUBLIC,
                    anon: AccessMode::NONE,
                },
                is_chan,
                ..Default::default()
            })
            .await;
        store
            .put_sub(Subscription {
                user: owner,
                topic: name.to_string(),
                created: time_now(),
                updated: time_now(),
                mode_want: "JRWPASDO".parse().unwrap(),
                mode_given: "JRWPASDO".parse().unwrap(),
                ..Default::default()
            })
            .await;
    }

    fn sub_pkt(uid: Uid, original: &str) -> ClientMsg {
        ClientMsg {
            payload: ClientPayload::Sub(MsgClientSub {
                id: "1".into(),
                topic: original.to_string(),
                ..Default::default()
            }),
            id: "1".into(),
            original: original.to_string(),
            rcpt_to: String::new(),
            as_user: uid,
            auth_lvl: AuthLevel::Auth,
            timestamp: time_now(),
        }
    }

    fn pub_pkt(uid: Uid, original: &str, content: &str) -> ClientMsg {
        ClientMsg {
            payload: ClientPayload::Pub(MsgClientPub {
                id: "2".into(),
                topic: original.to_string(),
                content: serde_json::json!(content),
                ..Default::default()
            }),
            id: "2".into(),
            original: original.to_string(),
            rcpt_to: String::new(),
            as_user: uid,
            auth_lvl: AuthLevel::Auth,
            timestamp: time_now(),
        }
    }

    async fn wait_for<F>(rx: &mut SessionReceivers, pred: F) -> ServerMsg
    where
        F: Fn(&ServerMsg) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let msg = rx.send.recv().await.expect("session queue closed");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    #[tokio::test]
    async fn test_join_and_publish() {
        let store = MemoryStore::new();
        seed_topic(&store, "grp1", A, false).await;
        let hub = Hub::new(store.handle(), PushRegistry::new(), test_limits(), None, None);

        let (sess, mut rx) = Session::new(A, Proto::Websock, "ua");
        hub.dispatch(&sess, sub_pkt(A, "grp1")).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        assert_eq!(reply.ctrl().unwrap().code, 200);
        assert_eq!(hub.topic_count(), 1);

        hub.dispatch(&sess, pub_pkt(A, "grp1", "hello")).await;
        let ack = wait_for(&mut rx, |m| {
            m.ctrl().map(|c| c.code == 202).unwrap_or(false)
        })
        .await;
        assert_eq!(ack.ctrl().unwrap().params.as_ref().unwrap()["seq"], 1);
        let data = wait_for(&mut rx, |m| m.data().is_some()).await;
        assert_eq!(data.data().unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_new_topic_gets_tmpname() {
        let store = MemoryStore::new();
        store
            .put_user(User {
                uid: A,
                created: time_now(),
                updated: time_now(),
                access: DefaultAccess {
                    auth: AccessMode::C_AUTH,
                    anon: AccessMode::NONE,
                },
                ..Default::default()
            })
            .await;
        let hub = Hub::new(store.handle(), PushRegistry::new(), test_limits(), None, None);

        let (sess, mut rx) = Session::new(A, Proto::Websock, "ua");
        hub.dispatch(&sess, sub_pkt(A, "newAbc")).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        let ctrl = reply.ctrl().unwrap();
        assert_eq!(ctrl.code, 200);
        let params = ctrl.params.as_ref().unwrap();
        assert_eq!(params["tmpname"], "newAbc");
        assert!(ctrl.topic.starts_with("grp"));

        // The creator owns the topic.
        let rec = crate::store::Topics::get(&store, &ctrl.topic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.owner, A);
        let sub = crate::store::Subs::get(&store, &ctrl.topic, A)
            .await
            .unwrap()
            .unwrap();
        assert!(sub.mode_given.is_owner());
    }

    #[tokio::test]
    async fn test_channel_addressing_requires_channel() {
        let store = MemoryStore::new();
        seed_topic(&store, "grp1", A, false).await;
        let hub = Hub::new(store.handle(), PushRegistry::new(), test_limits(), None, None);

        let (sess, mut rx) = Session::new(A, Proto::Websock, "ua");
        hub.dispatch(&sess, sub_pkt(A, "chn1")).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        assert_eq!(reply.ctrl().unwrap().code, 404);
    }

    #[tokio::test]
    async fn test_publish_requires_attach() {
        let store = MemoryStore::new();
        seed_topic(&store, "grp1", A, false).await;
        let hub = Hub::new(store.handle(), PushRegistry::new(), test_limits(), None, None);

        let (sess, mut rx) = Session::new(A, Proto::Websock, "ua");
        hub.dispatch(&sess, pub_pkt(A, "grp1", "hello")).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        assert_eq!(reply.ctrl().unwrap().code, 409);
    }

    #[tokio::test]
    async fn test_p2p_created_on_first_contact() {
        let other = Uid(0x22);
        let store = MemoryStore::new();
        for uid in [A, other] {
            store
                .put_user(User {
                    uid,
                    created: time_now(),
                    updated: time_now(),
                    access: DefaultAccess {
                        auth: AccessMode::C_AUTH,
                        anon: AccessMode::NONE,
                    },
                    ..Default::default()
                })
                .await;
        }
        let hub = Hub::new(store.handle(), PushRegistry::new(), test_limits(), None, None);

        let (sess, mut rx) = Session::new(A, Proto::Websock, "ua");
        hub.dispatch(&sess, sub_pkt(A, &other.user_id())).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        let ctrl = reply.ctrl().unwrap();
        assert_eq!(ctrl.code, 200);
        // The reply names the counterpart, not the p2p routing name.
        assert_eq!(ctrl.topic, other.user_id());

        let name = A.p2p_name(other);
        let sub_a = crate::store::Subs::get(&store, &name, A).await.unwrap().unwrap();
        let sub_b = crate::store::Subs::get(&store, &name, other).await.unwrap().unwrap();
        assert!(sub_a.mode_given.is_approver());
        assert!(!sub_b.mode_given.is_owner());
    }

    fn two_nodes() -> Vec<String> {
        vec!["n1".to_string(), "n2".to_string()]
    }

    fn pump(hub: Arc<Hub>, mut req_rx: mpsc::Receiver<ClusterReq>, mut resp_rx: mpsc::Receiver<ClusterResp>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(req) = req_rx.recv() => hub.handle_cluster_req(req).await,
                    Some(resp) = resp_rx.recv() => hub.handle_cluster_resp(resp).await,
                    else => return,
                }
            }
        });
    }

    #[tokio::test]
    async fn test_cluster_proxy_master_flow() {
        let transport = Arc::new(LoopbackTransport::new());
        let (req1, resp1) = transport.register("n1");
        let (req2, resp2) = transport.register("n2");
        let cluster1 = Arc::new(Cluster::new("n1", two_nodes(), transport.clone()));
        let cluster2 = Arc::new(Cluster::new("n2", two_nodes(), transport.clone()));

        // Pick a topic mastered on n2.
        let topic = (0..)
            .map(|i| format!("grp{:08x}", i))
            .find(|t| cluster1.node_for(t) == "n2")
            .unwrap();

        let store1 = MemoryStore::new();
        let store2 = MemoryStore::new();
        seed_topic(&store1, &topic, A, false).await;
        seed_topic(&store2, &topic, A, false).await;

        let hub1 = Hub::new(
            store1.handle(),
            PushRegistry::new(),
            test_limits(),
            Some(cluster1.clone()),
            None,
        );
        let hub2 = Hub::new(
            store2.handle(),
            PushRegistry::new(),
            test_limits(),
            Some(cluster2.clone()),
            None,
        );
        pump(hub1.clone(), req1, resp1);
        pump(hub2.clone(), req2, resp2);

        // Attach through the proxy.
        let (sess, mut rx) = Session::new(A, Proto::Websock, "ua");
        hub1.dispatch(&sess, sub_pkt(A, &topic)).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        assert_eq!(reply.ctrl().unwrap().code, 200);

        // Publish through the proxy: the master assigns the seq and both the
        // direct ack and the broadcast come back.
        hub1.dispatch(&sess, pub_pkt(A, &topic, "over the wire")).await;
        let ack = wait_for(&mut rx, |m| {
            m.ctrl().map(|c| c.code == 202).unwrap_or(false)
        })
        .await;
        assert_eq!(ack.ctrl().unwrap().params.as_ref().unwrap()["seq"], 1);
        let data = wait_for(&mut rx, |m| m.data().is_some()).await;
        assert_eq!(data.data().unwrap().seq, 1);
        assert_eq!(data.data().unwrap().content, serde_json::json!("over the wire"));

        // The message is persisted on the master's store only.
        let on_master = crate::store::Messages::get_all(&store2, &topic, A, &Default::default())
            .await
            .unwrap();
        assert_eq!(on_master.len(), 1);
        let on_proxy = crate::store::Messages::get_all(&store1, &topic, A, &Default::default())
            .await
            .unwrap();
        assert!(on_proxy.is_empty());

        // Rehash: n2 loses the topic. The master terminates with a direct
        // `term` to every attached session, including the proxied one.
        cluster1.set_live_nodes(vec!["n1".to_string()]);
        cluster2.set_live_nodes(vec!["n1".to_string()]);
        hub2.rehash();
        let term = wait_for(&mut rx, |m| m.pres().is_some()).await;
        assert_eq!(term.pres().unwrap().what, "term");

        // The proxy side folds too; the next join creates a local master.
        hub1.rehash();
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub1.dispatch(&sess, sub_pkt(A, &topic)).await;
        let reply = wait_for(&mut rx, |m| m.ctrl().is_some()).await;
        assert_eq!(reply.ctrl().unwrap().code, 200);
        hub1.dispatch(&sess, pub_pkt(A, &topic, "local now")).await;
        let ack = wait_for(&mut rx, |m| {
            m.ctrl().map(|c| c.code == 202).unwrap_or(false)
        })
        .await;
        // The local store had one message less; seq restarts from its view.
        assert_eq!(ack.ctrl().unwrap().params.as_ref().unwrap()["seq"], 1);
    }
}
