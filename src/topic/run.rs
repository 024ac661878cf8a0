//! Master topic event loop
//!
//! One tokio task per loaded topic. Everything that mutates topic state runs
//! here, serialized over the bounded input queues. Fan-out to session queues
//! is non-blocking; a session whose queue is full is scheduled for eviction
//! instead of stalling the loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::AccessMode;
use crate::cluster::{Cluster, ClusterResp, ClusterSessUpdate};
use crate::error::{
    err_locked, err_permission_denied, err_too_large, err_unknown, no_err_accepted,
};
use crate::hub::HubEvent;
use crate::presence::{PresFilters, PresParams, passes_presence_filters};
use crate::proto::ServerMsg;
use crate::session::MuxEvent;
use crate::store::{Message, SubUpdate};
use crate::types::{TopicCat, time_now};

use super::{
    DeferredNotice, SessionLeave, SessionUpdate, ShutdownReq, StopReason, Topic, TopicReceivers,
};

impl Topic {
    /// Run the master loop until an exit order arrives.
    pub async fn run(mut self, mut rx: TopicReceivers, mux_rx: mpsc::Receiver<MuxEvent>) {
        tokio::spawn(cluster_write_loop(
            self.ctx.cluster.clone(),
            self.name.clone(),
            mux_rx,
        ));

        let keep_alive = self.ctx.limits.idle_topic_timeout();
        let ua_delay = self.ctx.limits.ua_timer_delay();

        let kill_timer = tokio::time::sleep(keep_alive);
        tokio::pin!(kill_timer);
        let mut kill_armed = self.cat != TopicCat::Sys;

        let ua_timer = tokio::time::sleep(ua_delay);
        tokio::pin!(ua_timer);
        let mut ua_armed = false;
        let mut current_ua = String::new();

        let mut defr = tokio::time::interval(self.ctx.limits.deferred_notif_interval());
        defr.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                sd = rx.exit.recv() => {
                    let sd = sd.unwrap_or(ShutdownReq { reason: StopReason::Shutdown, done: None });
                    self.handle_shutdown(sd).await;
                    return;
                }

                Some(join) = rx.reg.recv() => {
                    if self.status.is_inactive() {
                        join.sess.queue_out(crate::error::err_locked_reply(&join.pkt, time_now()));
                    } else {
                        kill_armed = false;
                        if let Err(e) = self.handle_subscription(&join).await {
                            if self.sessions.is_empty() && self.cat != TopicCat::Sys {
                                kill_armed = true;
                                kill_timer.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                            }
                            info!(topic = %self.name, sid = %join.sess.sid, error = %e, "subscription failed");
                        }
                    }
                }

                Some(leave) = rx.unreg.recv() => {
                    self.handle_leave_request(leave).await;
                    if self.sessions.is_empty() && self.cat != TopicCat::Sys {
                        kill_armed = true;
                        kill_timer.as_mut().reset(tokio::time::Instant::now() + keep_alive);
                    }
                }

                Some(msg) = rx.broadcast.recv() => {
                    self.handle_broadcast(msg).await;
                }

                Some(meta) = rx.meta.recv() => {
                    if self.status.is_inactive() {
                        meta.sess.queue_out(crate::error::err_locked_reply(&meta.pkt, time_now()));
                    } else {
                        self.handle_meta(meta).await;
                    }
                }

                Some(upd) = rx.supd.recv() => {
                    if let Some(sess) = upd.sess {
                        self.sess_to_foreground(&sess).await;
                    } else if current_ua != upd.user_agent {
                        if self.cat != TopicCat::Me {
                            warn!(topic = %self.name, "user-agent update on non-me topic");
                        } else {
                            current_ua = upd.user_agent;
                            ua_armed = true;
                            ua_timer.as_mut().reset(tokio::time::Instant::now() + ua_delay);
                        }
                    }
                }

                Some(su) = rx.master.recv() => {
                    self.handle_cluster_sess_update(su).await;
                }

                () = &mut ua_timer, if ua_armed => {
                    ua_armed = false;
                    if !current_ua.is_empty() && current_ua != self.user_agent {
                        self.user_agent = current_ua.clone();
                        let ua = self.user_agent.clone();
                        self.pres_users_of_interest("ua", &ua);
                    }
                }

                () = &mut kill_timer, if kill_armed => {
                    kill_armed = false;
                    self.ctx.hub_notify(HubEvent::TopicIdle { name: self.name.clone() });
                    if self.cat == TopicCat::Me {
                        self.pres_users_of_interest("off", &current_ua);
                    } else if self.cat == TopicCat::Grp {
                        self.pres_subs_offline(
                            "off",
                            &PresParams::default(),
                            &PresFilters::default(),
                            &PresFilters::default(),
                            "",
                            false,
                        );
                    }
                    // The hub responds with an exit order.
                }

                _ = defr.tick() => {
                    self.flush_deferred().await;
                }
            }
        }
    }

    /// Fan a `{data}`, `{pres}` or `{info}` out to attached sessions.
    pub(crate) async fn handle_broadcast(&mut self, mut msg: ServerMsg) {
        let as_uid = msg.as_user;

        if self.status.is_inactive() {
            if msg.data().is_some()
                && let Some(sess) = &msg.sess
            {
                sess.queue_out(err_locked(&msg.id, &self.original(as_uid), msg.timestamp));
            }
            return;
        }

        let mut push_rcpt = None;
        if let Some(data) = msg.data().cloned() {
            if self.status.is_read_only() {
                if let Some(sess) = &msg.sess {
                    sess.queue_out(err_permission_denied(
                        &msg.id,
                        &self.original(as_uid),
                        msg.timestamp,
                    ));
                }
                return;
            }

            // Anyone may post to 'sys'; everywhere else W is required.
            let (want, given) = self.get_per_user_acs(as_uid);
            if self.cat != TopicCat::Sys && !(want & given).is_writer() {
                if let Some(sess) = &msg.sess {
                    sess.queue_out(err_permission_denied(
                        &msg.id,
                        &self.original(as_uid),
                        msg.timestamp,
                    ));
                }
                return;
            }

            let size = serde_json::to_vec(&data.content).map(|v| v.len()).unwrap_or(0);
            if size > self.ctx.limits.max_message_size {
                if let Some(sess) = &msg.sess {
                    sess.queue_out(err_too_large(&msg.id, &self.original(as_uid), msg.timestamp));
                }
                return;
            }

            let seq = self.last_seq + 1;
            let reader = (want & given).is_reader();
            let stored = Message {
                topic: self.name.clone(),
                seq,
                created: data.ts,
                from: as_uid,
                head: data.head.clone(),
                content: data.content.clone(),
                ..Default::default()
            };
            if let Err(e) = self.ctx.store.messages.save(stored, reader).await {
                warn!(topic = %self.name, error = %e, "failed to save message");
                if let Some(sess) = &msg.sess {
                    sess.queue_out(err_unknown(&msg.id, &self.original(as_uid), msg.timestamp));
                }
                return;
            }

            self.last_seq = seq;
            self.touched = Some(data.ts);
            if let Some(data) = msg.data_mut() {
                data.seq = seq;
            }

            // The sender has obviously seen the message.
            if let Some(pud) = self.per_user.get_mut(&as_uid) {
                pud.read_id = seq;
                pud.recv_id = seq;
            }

            if !msg.id.is_empty()
                && let Some(sess) = &msg.sess
            {
                sess.queue_out(no_err_accepted(
                    &msg.id,
                    &self.original(as_uid),
                    msg.timestamp,
                    serde_json::json!({"seq": seq}),
                ));
            }

            if let Some(data) = msg.data() {
                push_rcpt = self.push_for_data(as_uid, data);
            }

            // Wake offline readers through their 'me' topics.
            self.pres_subs_offline(
                "msg",
                &PresParams {
                    seq,
                    actor: data.from.clone(),
                    ..Default::default()
                },
                &PresFilters {
                    filter_in: AccessMode::READ,
                    ..Default::default()
                },
                &PresFilters::default(),
                "",
                true,
            );
        } else if let Some(pres) = msg.pres().cloned() {
            let what = self.pres_proc_req(&pres.src, &pres.what, pres.want_reply);
            if self.x_original != pres.topic || what.is_empty() {
                // Just a status request, nothing to fan out.
                return;
            }
            if let Some(pres) = msg.pres_mut() {
                pres.what = what;
            }
        } else if let Some(info) = msg.info().cloned() {
            if info.seq > self.last_seq {
                // Bogus receipt.
                return;
            }
            let mut pud = self.per_user.get(&as_uid).cloned().unwrap_or_default();
            let mode = if pud.deleted {
                AccessMode::INVALID
            } else {
                pud.mode_given & pud.mode_want
            };

            match info.what.as_str() {
                "kp" => {
                    if !mode.is_writer() || self.status.is_read_only() {
                        return;
                    }
                }
                "read" | "recv" => {
                    if !mode.is_reader() {
                        return;
                    }
                    let mut read = 0;
                    let mut recv = 0;
                    let mut unread: i64 = 0;
                    if info.what == "read" {
                        if info.seq > pud.read_id {
                            unread = pud.read_id as i64 - info.seq as i64;
                            pud.read_id = info.seq;
                            read = pud.read_id;
                        } else {
                            // Stale read pointer.
                            return;
                        }
                    } else if info.seq > pud.recv_id {
                        pud.recv_id = info.seq;
                        recv = pud.recv_id;
                    } else {
                        return;
                    }
                    if pud.read_id > pud.recv_id {
                        pud.recv_id = pud.read_id;
                        recv = pud.recv_id;
                    }

                    let upd = SubUpdate {
                        read_seq: Some(pud.read_id),
                        recv_seq: Some(pud.recv_id),
                        ..Default::default()
                    };
                    if let Err(e) = self
                        .ctx
                        .store
                        .subs
                        .update(&self.name, as_uid, upd, false)
                        .await
                    {
                        warn!(topic = %self.name, error = %e, "failed to update read/recv");
                        return;
                    }

                    self.pres_pub_message_count(as_uid, mode, recv, read, &msg.skip_sid);
                    self.ctx.update_unread(as_uid, unread);
                    self.per_user.insert(as_uid, pud);
                }
                _ => return,
            }
        } else {
            debug!(topic = %self.name, "non-broadcastable message type");
            return;
        }

        self.fanout(msg);

        if let Some(rcpt) = push_rcpt {
            for uid in rcpt.to.keys() {
                self.ctx.update_unread(*uid, 1);
            }
            self.ctx.push.push(&rcpt);
        }
    }

    /// The fan-out step shared by broadcasts and in-loop presence. Applies
    /// per-recipient filters and the backpressure eviction rule.
    pub(crate) fn fanout(&self, msg: ServerMsg) {
        for rec in self.sessions.values() {
            if !rec.sess.is_multiplex() {
                if rec.sess.sid == msg.skip_sid {
                    continue;
                }

                if let Some(pres) = msg.pres() {
                    if !pres.skip_topic.is_empty() && rec.sess.get_sub(&pres.skip_topic).is_some() {
                        continue;
                    }
                    if !pres.single_user.is_zero() && rec.uid != pres.single_user {
                        continue;
                    }
                    if !pres.exclude_user.is_zero() && rec.uid == pres.exclude_user {
                        continue;
                    }
                    if !passes_presence_filters(pres, self.effective_mode(rec.uid)) {
                        continue;
                    }
                } else {
                    // Channel readers qualify for data, not for info.
                    if !self.user_is_reader(rec.uid) && !rec.is_chan_sub {
                        continue;
                    }
                    if msg.info().is_some() && rec.is_chan_sub {
                        continue;
                    }
                    if let Some(info) = msg.info()
                        && info.what == "kp"
                        && info.from == rec.uid.user_id()
                    {
                        // Never echo typing notifications back to the typist.
                        continue;
                    }
                }
            }

            let mut out = msg.clone();
            out.sess = None;
            self.fix_topic_name(&mut out, rec.uid);
            if rec.is_chan_sub
                && let Some(data) = out.data_mut()
            {
                // Channel messages are anonymous.
                data.from.clear();
            }

            if !rec.sess.queue_out(out) {
                warn!(topic = %self.name, sid = %rec.sess.sid, "connection stuck, detaching");
                // Must not block here: queue the eviction or drop it.
                let leave = SessionLeave {
                    sess: rec.sess.clone(),
                    pkt: None,
                };
                if self.tx.unreg.try_send(leave).is_err() {
                    warn!(topic = %self.name, sid = %rec.sess.sid, "unreg queue full");
                }
            }
        }
    }

    /// Terminal handler: announce the shutdown as appropriate for the
    /// reason, detach every session, and signal completion.
    pub(crate) async fn handle_shutdown(&mut self, sd: ShutdownReq) {
        match sd.reason {
            StopReason::Deleted => {
                if self.cat == TopicCat::Grp {
                    self.pres_subs_offline(
                        "gone",
                        &PresParams::default(),
                        &PresFilters::default(),
                        &PresFilters::default(),
                        "",
                        false,
                    );
                }
            }
            StopReason::Rehashing => {
                // The broadcast channel dies with the loop; deliver straight
                // to the sessions.
                self.pres_subs_online_direct("term", &PresParams::default(), &PresFilters::default(), "");
            }
            // Nobody would see notifications of a full shutdown.
            StopReason::Shutdown | StopReason::None => {}
        }

        for rec in self.sessions.values() {
            rec.sess.detach(&self.name);
        }

        if let Some(done) = sd.done {
            let _ = done.send(());
        }
    }

    /// Proxied-session bookkeeping forwarded by a peer node.
    pub(crate) async fn handle_cluster_sess_update(&mut self, su: ClusterSessUpdate) {
        if su.background_to_fg {
            let key = format!("mux-{}-{}", su.node, self.name);
            if let Some(rec) = self.sessions.get_mut(&key) {
                rec.muids.push(su.uid);
            }
            if let Some(pud) = self.per_user.get_mut(&su.uid) {
                pud.online += 1;
            }
            self.send_sub_notifications(su.uid, &key, &su.user_agent).await;
        } else if !su.user_agent.is_empty() {
            let _ = self.tx.supd.try_send(SessionUpdate {
                sess: None,
                user_agent: su.user_agent,
            });
        }
    }

    /// Send the parked notifications of background sessions whose deferral
    /// has run out.
    pub(crate) async fn flush_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let deadline = self.ctx.limits.deferred_notif_interval();
        let now = tokio::time::Instant::now();
        let mut due: Vec<DeferredNotice> = Vec::new();
        self.deferred.retain_mut(|n| {
            if now.duration_since(n.created) >= deadline {
                due.push(DeferredNotice {
                    uid: n.uid,
                    sid: std::mem::take(&mut n.sid),
                    user_agent: std::mem::take(&mut n.user_agent),
                    created: n.created,
                });
                false
            } else {
                true
            }
        });
        for n in due {
            self.send_sub_notifications(n.uid, &n.sid, &n.user_agent).await;
        }
    }
}

/// Consume the cluster write mailbox of one master topic and ship events to
/// the peer proxies. This is the fan-in loop over all proxied sessions: a
/// single tagged queue instead of a dynamic wait set, so membership changes
/// need no rebuilds.
async fn cluster_write_loop(
    cluster: Option<Arc<Cluster>>,
    topic: String,
    mut rx: mpsc::Receiver<MuxEvent>,
) {
    while let Some(ev) = rx.recv().await {
        let Some(cluster) = &cluster else {
            debug!(topic = %topic, "mux event without a cluster, dropped");
            continue;
        };
        let (node, resp) = match ev {
            MuxEvent::Send { node, orig_sid, msg } => (
                node,
                ClusterResp {
                    topic: topic.clone(),
                    orig_sid,
                    msg: Some(*msg),
                    detach: false,
                    stop: None,
                },
            ),
            MuxEvent::Detach { node, topic: tname } => (
                node,
                ClusterResp {
                    topic: tname,
                    orig_sid: String::new(),
                    msg: None,
                    detach: true,
                    stop: None,
                },
            ),
            MuxEvent::Stop { node, reason } => (
                node,
                ClusterResp {
                    topic: topic.clone(),
                    orig_sid: String::new(),
                    msg: None,
                    detach: false,
                    stop: Some(reason),
                },
            ),
        };
        if let Err(e) = cluster.transport.respond(&node, resp).await {
            warn!(topic = %topic, node = %node, error = %e, "cluster respond failed");
        }
    }
}
