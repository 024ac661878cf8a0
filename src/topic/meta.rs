//! Topic metadata flows
//!
//! In-loop handlers for `{get}`, `{set}` and `{del}`: descriptions,
//! subscription lists, message history, tags, credentials, and deletion of
//! message ranges, subscriptions and whole topics.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::access::AccessMode;
use crate::error::{
    err_invalid_range, err_malformed_reply, err_not_allowed, err_not_found_reply,
    err_not_implemented, err_permission_denied_reply, err_unknown_reply, info_no_action_reply,
    info_not_modified_reply, no_content, no_err_params_reply, no_err_reply, store_error_reply,
};
use crate::hub::HubEvent;
use crate::presence::{PresFilters, PresParams};
use crate::proto::{
    ClientMsg, MsgAccessMode, MsgData, MsgDefaultAcs, MsgDelValues, MsgGetOpts, MsgLastSeen,
    MsgMeta, MsgTopicDesc, MsgTopicSub, ServerMsg, ServerPayload,
};
use crate::session::Session;
use crate::store::{QueryOpts, StoreError, SubUpdate, TopicUpdate, UserUpdate};
use crate::types::{TopicCat, Uid, normalize_ranges, parse_user_id, time_now};

use super::{MetaReq, OpError, Topic};

/// Which parts of metadata a request addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MetaWhat {
    pub desc: bool,
    pub sub: bool,
    pub data: bool,
    pub del: bool,
    pub tags: bool,
    pub cred: bool,
}

/// Parse a space-separated `what` list: `"desc sub data"`.
pub(crate) fn parse_meta_what(what: &str) -> MetaWhat {
    let mut out = MetaWhat::default();
    for token in what.split_whitespace() {
        match token {
            "desc" => out.desc = true,
            "sub" => out.sub = true,
            "data" => out.data = true,
            "del" => out.del = true,
            "tags" => out.tags = true,
            "cred" => out.cred = true,
            _ => {}
        }
    }
    out
}

impl Topic {
    /// Dispatch a `{get}`/`{set}`/`{del}` to its handler.
    pub(crate) async fn handle_meta(&mut self, req: MetaReq) {
        let as_uid = req.pkt.as_user;
        let sess = &req.sess;
        let pkt = &req.pkt;

        match &pkt.payload {
            crate::proto::ClientPayload::Get(get) => {
                let what = parse_meta_what(&get.query.what);
                if what.desc
                    && let Err(e) = self
                        .reply_get_desc(sess, as_uid, get.query.desc.as_ref(), pkt)
                        .await
                {
                    debug!(topic = %self.name, error = %e, "get.desc failed");
                }
                if what.sub
                    && let Err(e) = self
                        .reply_get_sub(sess, as_uid, get.query.sub.as_ref(), pkt)
                        .await
                {
                    debug!(topic = %self.name, error = %e, "get.sub failed");
                }
                if what.data
                    && let Err(e) = self
                        .reply_get_data(sess, as_uid, get.query.data.as_ref(), pkt)
                        .await
                {
                    debug!(topic = %self.name, error = %e, "get.data failed");
                }
                if what.del
                    && let Err(e) = self
                        .reply_get_del(sess, as_uid, get.query.del.as_ref(), pkt)
                        .await
                {
                    debug!(topic = %self.name, error = %e, "get.del failed");
                }
                if what.tags
                    && let Err(e) = self.reply_get_tags(sess, as_uid, pkt).await
                {
                    debug!(topic = %self.name, error = %e, "get.tags failed");
                }
                if what.cred
                    && let Err(e) = self.reply_get_creds(sess, as_uid, pkt).await
                {
                    debug!(topic = %self.name, error = %e, "get.cred failed");
                }
            }
            crate::proto::ClientPayload::Set(set) => {
                if set.query.desc.is_some()
                    && let Err(e) = self.reply_set_desc(sess, as_uid, pkt).await
                {
                    debug!(topic = %self.name, error = %e, "set.desc failed");
                }
                if set.query.sub.is_some()
                    && let Err(e) = self.reply_set_sub(sess, pkt).await
                {
                    debug!(topic = %self.name, error = %e, "set.sub failed");
                }
                if set.query.tags.is_some()
                    && let Err(e) = self.reply_set_tags(sess, as_uid, pkt).await
                {
                    debug!(topic = %self.name, error = %e, "set.tags failed");
                }
                if set.query.cred.is_some() {
                    // Credential management belongs to the auth layer.
                    sess.queue_out(err_not_implemented(&pkt.id, &pkt.original, time_now()));
                }
            }
            crate::proto::ClientPayload::Del(del) => {
                let result = match del.what.as_str() {
                    "msg" => self.reply_del_msg(sess, as_uid, pkt).await,
                    "sub" => self.reply_del_sub(sess, as_uid, pkt).await,
                    "topic" => self.reply_del_topic(sess, as_uid, pkt).await,
                    "cred" => {
                        sess.queue_out(err_not_implemented(&pkt.id, &pkt.original, time_now()));
                        Ok(())
                    }
                    _ => {
                        sess.queue_out(err_malformed_reply(pkt, time_now()));
                        Err(OpError::Malformed("bad del.what"))
                    }
                };
                if let Err(e) = result {
                    debug!(topic = %self.name, error = %e, "del failed");
                }
            }
            _ => {
                sess.queue_out(err_malformed_reply(pkt, time_now()));
            }
        }
    }

    /// `{get what="desc"}`: topic description for one session.
    pub(crate) async fn reply_get_desc(
        &self,
        sess: &Arc<Session>,
        as_uid: Uid,
        opts: Option<&MsgGetOpts>,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();

        if let Some(opts) = opts
            && (!opts.user.is_empty() || opts.limit != 0)
        {
            sess.queue_out(err_malformed_reply(pkt, now));
            return Err(OpError::Malformed("invalid desc query"));
        }

        let as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        let if_updated = opts
            .and_then(|o| o.if_modified_since)
            .map(|since| since < self.updated)
            .unwrap_or(true);

        let mut desc = MsgTopicDesc {
            updated_at: Some(self.updated),
            ..Default::default()
        };
        if !if_updated {
            desc.created_at = Some(self.created);
        }

        let pud = self.per_user.get(&as_uid);
        let full = pud.is_some() || self.cat == TopicCat::Me;

        if if_updated {
            if self.public.is_some() {
                desc.public = self.public.clone();
            } else if full && self.cat == TopicCat::P2P {
                desc.public = pud.and_then(|p| p.public.clone());
            }
        }

        if full {
            let pud = pud.cloned().unwrap_or_default();
            let mode = pud.mode_given & pud.mode_want;

            if self.cat != TopicCat::P2P
                && (self.cat == TopicCat::Me || mode.is_sharer())
            {
                desc.default_acs = Some(MsgDefaultAcs {
                    auth: self.access_auth.to_string(),
                    anon: self.access_anon.to_string(),
                });
            }

            desc.acs = Some(MsgAccessMode::new(pud.mode_want, pud.mode_given));

            if self.cat == TopicCat::Grp && mode.is_presencer() {
                desc.online = Some(self.is_online());
            }
            if if_updated {
                desc.private = pud.private.clone();
            }

            if mode.is_reader() {
                desc.seq_id = self.last_seq;
                desc.touched_at = self.touched;
                desc.del_id = pud.del_id.max(self.del_id);
                desc.read_seq_id = pud.read_id;
                desc.recv_seq_id = pud.recv_id.max(pud.read_id);
            } else {
                desc.touched_at = Some(self.updated);
            }
        } else if as_chan {
            desc.seq_id = self.last_seq;
            desc.touched_at = self.touched;
            // Reader cursors live in the chn-name subscription row.
            if let Ok(Some(sub)) = self.ctx.store.subs.get(&pkt.original, as_uid).await {
                desc.acs = Some(MsgAccessMode::new(sub.mode_want, sub.mode_given));
                if if_updated {
                    desc.private = sub.private.clone();
                }
                desc.del_id = sub.del_id.max(self.del_id);
                desc.read_seq_id = sub.read_seq;
                desc.recv_seq_id = sub.recv_seq.max(sub.read_seq);
            }
        }

        sess.queue_out(ServerMsg::new(
            ServerPayload::Meta(Box::new(MsgMeta {
                id: pkt.id.clone(),
                topic: pkt.original.clone(),
                ts: now,
                desc: Some(desc),
                ..Default::default()
            })),
            now,
        ));
        Ok(())
    }

    /// `{get what="sub"}`: list subscriptions/subscribers.
    pub(crate) async fn reply_get_sub(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        opts: Option<&MsgGetOpts>,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();

        if let Some(opts) = opts
            && (opts.since_id != 0 || opts.before_id != 0)
        {
            sess.queue_out(err_malformed_reply(pkt, now));
            return Err(OpError::Malformed("invalid sub query"));
        }
        self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        let pud = self.per_user.get(&as_uid).cloned().unwrap_or_default();
        let host_mode = pud.mode_given & pud.mode_want;
        if self.cat != TopicCat::Me && self.cat != TopicCat::Fnd && !host_mode.is_sharer() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("no S permission"));
        }

        let if_modified = opts.and_then(|o| o.if_modified_since);
        let query = QueryOpts {
            limit: opts.map(|o| o.limit as usize).unwrap_or(0),
            if_modified_since: if_modified,
            ..Default::default()
        };

        let subs = if self.cat == TopicCat::Fnd {
            self.fnd_search(sess, as_uid, pkt).await?
        } else {
            let result = match self.cat {
                TopicCat::Me => {
                    let store = &self.ctx.store.users;
                    if if_modified.is_none() {
                        store.get_topics(as_uid, &query).await
                    } else {
                        store.get_topics_any(as_uid, &query).await
                    }
                }
                TopicCat::P2P => {
                    let store = &self.ctx.store.topics;
                    if if_modified.is_none() {
                        store.get_subs(&self.name, &query).await
                    } else {
                        store.get_subs_any(&self.name, &query).await
                    }
                }
                _ => {
                    let store = &self.ctx.store.topics;
                    if if_modified.is_none() {
                        store.get_users(&self.name, &query).await
                    } else {
                        store.get_users_any(&self.name, &query).await
                    }
                }
            };
            match result {
                Ok(subs) => subs,
                Err(err) => {
                    sess.queue_out(store_error_reply(&err, pkt, now));
                    return Err(err.into());
                }
            }
        };

        if subs.is_empty() {
            sess.queue_out(no_content(
                &pkt.id,
                &pkt.original,
                now,
                serde_json::json!({"what": "sub"}),
            ));
            return Ok(());
        }

        let presencer = host_mode.is_presencer();
        let mut meta = MsgMeta {
            id: pkt.id.clone(),
            topic: self.original(as_uid),
            ts: now,
            ..Default::default()
        };

        for sub in &subs {
            let deleted = sub.deleted_at.is_some();
            let mut mts = MsgTopicSub::default();
            let mut send_pub_priv = true;

            if let Some(cutoff) = if_modified {
                if deleted {
                    match sub.deleted_at {
                        Some(at) if at > cutoff => mts.deleted_at = sub.deleted_at,
                        _ => continue,
                    }
                }
                send_pub_priv = !deleted && sub.updated > cutoff;
            }

            let is_reader = (sub.mode_given & sub.mode_want).is_reader();
            let banned = !(sub.mode_want & sub.mode_given).is_joiner();

            if self.cat == TopicCat::Me {
                let key = if !sub.with.is_empty() {
                    mts.topic = sub.with.clone();
                    sub.with.clone()
                } else {
                    mts.topic = sub.topic.clone();
                    sub.topic.clone()
                };
                mts.online = Some(
                    self.per_subs.get(&key).map(|p| p.online).unwrap_or(false)
                        && !deleted
                        && presencer,
                );

                if !deleted && !banned {
                    if is_reader {
                        mts.touched_at = sub.touched;
                        mts.seq_id = sub.seq_id;
                        mts.del_id = sub.del_id;
                    } else {
                        mts.touched_at = Some(sub.updated);
                    }
                    if let Some((when, ua)) = &sub.last_seen
                        && mts.online != Some(true)
                    {
                        mts.last_seen = Some(MsgLastSeen {
                            when: *when,
                            ua: ua.clone(),
                        });
                    }
                }
            } else {
                mts.user = sub.user.user_id();
                if self.cat == TopicCat::Fnd {
                    mts.topic = sub.topic.clone();
                }
                if !deleted {
                    if sub.user == as_uid && is_reader && !banned {
                        mts.del_id = sub.del_id;
                    }
                    if self.cat == TopicCat::Grp {
                        let online = self
                            .per_user
                            .get(&sub.user)
                            .map(|p| p.online > 0)
                            .unwrap_or(false);
                        mts.online = Some(online && presencer);
                    }
                }
            }

            if !deleted {
                mts.updated_at = Some(sub.updated);
                if is_reader && !banned {
                    mts.read_seq_id = sub.read_seq;
                    mts.recv_seq_id = sub.recv_seq;
                }

                if self.cat != TopicCat::Fnd {
                    mts.acs = MsgAccessMode::new(sub.mode_want, sub.mode_given);
                } else if sub.mode_want.is_defined() && sub.mode_given.is_defined() {
                    mts.acs = MsgAccessMode::new(sub.mode_want, sub.mode_given);
                } else if crate::types::is_channel(&sub.topic) {
                    mts.acs.mode = AccessMode::C_CHN_READER.to_string();
                }

                if send_pub_priv {
                    mts.public = sub.public.clone();
                    if sub.user == as_uid {
                        mts.private = sub.private.clone();
                    }
                }
                if self.cat == TopicCat::Fnd {
                    mts.private = sub.private.clone();
                }
            }

            meta.sub.push(mts);
        }

        sess.queue_out(ServerMsg::new(ServerPayload::Meta(Box::new(meta)), now));
        Ok(())
    }

    /// Run the `fnd` tag search for this session's stored query. Queues its
    /// own error replies.
    async fn fnd_search(
        &self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<Vec<crate::store::Subscription>, OpError> {
        let now = time_now();
        let query = self
            .fnd_public
            .get(&sess.sid)
            .and_then(|v| v.as_str().map(str::to_string))
            .or_else(|| {
                self.per_user
                    .get(&as_uid)
                    .and_then(|pud| pud.private.as_ref())
                    .and_then(|v| v.as_str().map(str::to_string))
            })
            .unwrap_or_default();

        if query.is_empty() {
            return Ok(Vec::new());
        }

        let terms: Vec<String> = query
            .split([',', ' '])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        // Search by masked namespaces is not allowed.
        for term in &terms {
            if let Some((ns, _)) = term.split_once(':')
                && self.ctx.limits.masked_tag_ns.iter().any(|m| m == ns)
            {
                sess.queue_out(err_permission_denied_reply(pkt, now));
                return Err(OpError::Denied("search by masked tags"));
            }
        }

        match self.ctx.store.users.find_subs(as_uid, &[], &terms).await {
            Ok(subs) => Ok(subs),
            Err(e) => {
                sess.queue_out(store_error_reply(&e, pkt, now));
                Err(e.into())
            }
        }
    }

    /// `{set what="sub"}`: own subscription change or an invite.
    pub(crate) async fn reply_set_sub(
        &mut self,
        sess: &Arc<Session>,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let as_uid = pkt.as_user;
        let set = pkt.set().ok_or(OpError::Malformed("not a set"))?;
        let sub_req = set.query.sub.clone().ok_or(OpError::Malformed("no sub"))?;

        self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        let target = if sub_req.user.is_empty() {
            as_uid
        } else {
            match parse_user_id(&sub_req.user) {
                Some(uid) => uid,
                None => {
                    sess.queue_out(err_malformed_reply(pkt, now));
                    return Err(OpError::Malformed("invalid user id"));
                }
            }
        };

        let mode_changed = if target == as_uid {
            let msgsub = crate::proto::MsgClientSub::default();
            self.this_user_sub(sess, pkt, &msgsub, as_uid, &sub_req.mode, None)
                .await?
        } else {
            self.another_user_sub(sess, as_uid, target, pkt).await?
        };

        if let Some(acs) = mode_changed {
            let mut params = serde_json::json!({"acs": acs});
            if target != as_uid {
                params["user"] = serde_json::Value::String(target.user_id());
            }
            sess.queue_out(no_err_params_reply(pkt, now, params));
        } else {
            sess.queue_out(info_not_modified_reply(pkt, now));
        }
        Ok(())
    }

    /// `{set what="desc"}`: public/private/default-access update.
    pub(crate) async fn reply_set_desc(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let set = pkt.set().ok_or(OpError::Malformed("not a set"))?;
        let desc = set.query.desc.clone().ok_or(OpError::Malformed("no desc"))?;

        let as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        let mut core_access: Option<crate::store::DefaultAccess> = None;
        let mut core_public: Option<serde_json::Value> = None;
        let mut sub_private: Option<serde_json::Value> = None;

        let cur_access = crate::store::DefaultAccess {
            auth: self.access_auth,
            anon: self.access_anon,
        };
        let cat = self.cat;
        let parse_defacs = move |mode: &MsgDefaultAcs| -> Result<crate::store::DefaultAccess, OpError> {
            let auth: AccessMode = mode
                .auth
                .parse()
                .map_err(|_| OpError::Malformed("bad auth acs"))?;
            let anon: AccessMode = mode
                .anon
                .parse()
                .map_err(|_| OpError::Malformed("bad anon acs"))?;
            if auth.is_owner() || anon.is_owner() {
                return Err(OpError::Malformed("default owner access not permitted"));
            }
            let mut access = cur_access;
            if auth.is_defined() {
                access.auth = if cat == TopicCat::Me {
                    let capped = auth & AccessMode::C_AUTH;
                    if capped.is_zero() {
                        capped
                    } else {
                        capped | AccessMode::APPROVE
                    }
                } else {
                    auth
                };
            }
            if anon.is_defined() {
                access.anon = if cat == TopicCat::Me {
                    let capped = anon & AccessMode::C_P2P;
                    if capped.is_zero() {
                        capped
                    } else {
                        capped | AccessMode::APPROVE
                    }
                } else {
                    anon
                };
            }
            Ok(access)
        };

        match self.cat {
            TopicCat::Me => {
                if let Some(mode) = &desc.default_acs {
                    match parse_defacs(mode) {
                        Ok(access) => {
                            if access.auth != self.access_auth || access.anon != self.access_anon {
                                core_access = Some(access);
                            }
                        }
                        Err(e) => {
                            sess.queue_out(err_malformed_reply(pkt, now));
                            return Err(e);
                        }
                    }
                }
                core_public = desc.public.clone();
            }
            TopicCat::Fnd => {
                // fnd.public is the per-session search query; never persisted.
                if let Some(public) = &desc.public {
                    if public.is_null() {
                        self.fnd_public.remove(&sess.sid);
                    } else {
                        self.fnd_public.insert(sess.sid.clone(), public.clone());
                    }
                    sess.queue_out(no_err_reply(pkt, now));
                    return Ok(());
                }
            }
            TopicCat::P2P => {
                if desc.public.is_some() || desc.default_acs.is_some() {
                    sess.queue_out(err_permission_denied_reply(pkt, now));
                    return Err(OpError::Denied("p2p metadata is immutable"));
                }
            }
            TopicCat::Grp => {
                if self.owner == as_uid {
                    if let Some(mode) = &desc.default_acs {
                        match parse_defacs(mode) {
                            Ok(access) => {
                                if access.auth != self.access_auth
                                    || access.anon != self.access_anon
                                {
                                    core_access = Some(access);
                                }
                            }
                            Err(e) => {
                                sess.queue_out(err_malformed_reply(pkt, now));
                                return Err(e);
                            }
                        }
                    }
                    core_public = desc.public.clone();
                } else if desc.default_acs.is_some() || desc.public.is_some() {
                    sess.queue_out(err_permission_denied_reply(pkt, now));
                    return Err(OpError::Denied("non-owner cannot change public/defaults"));
                }
            }
            TopicCat::Sys => {
                sess.queue_out(err_not_allowed(&pkt.id, &pkt.original, now));
                return Err(OpError::Denied("sys metadata is immutable"));
            }
        }

        if let Some(private) = &desc.private {
            sub_private = Some(private.clone());
        }

        let send_common = core_access.is_some() || core_public.is_some();
        let send_priv = sub_private.is_some();
        if !send_common && !send_priv {
            sess.queue_out(info_not_modified_reply(pkt, now));
            return Err(OpError::NoAction);
        }

        if send_common {
            let result = if self.cat == TopicCat::Me {
                self.ctx
                    .store
                    .users
                    .update(
                        as_uid,
                        UserUpdate {
                            public: core_public.clone(),
                            access: core_access,
                            updated: Some(now),
                            ..Default::default()
                        },
                    )
                    .await
            } else {
                self.ctx
                    .store
                    .topics
                    .update(
                        &self.name,
                        TopicUpdate {
                            public: core_public.clone(),
                            access: core_access,
                            updated: Some(now),
                            ..Default::default()
                        },
                    )
                    .await
            };
            if let Err(e) = result {
                sess.queue_out(err_unknown_reply(pkt, now));
                return Err(e.into());
            }
        }

        let mut mode = AccessMode::NONE;
        if send_priv {
            let tname = if as_chan {
                crate::types::grp_to_chn(&self.name)
            } else {
                self.name.clone()
            };
            let private = sub_private.clone().unwrap();
            let upd = SubUpdate {
                private: Some(if private.is_null() { None } else { Some(private.clone()) }),
                ..Default::default()
            };
            if let Err(e) = self.ctx.store.subs.update(&tname, as_uid, upd, true).await {
                sess.queue_out(err_unknown_reply(pkt, now));
                return Err(e.into());
            }
            if !as_chan
                && let Some(pud) = self.per_user.get_mut(&as_uid)
            {
                pud.private = if private.is_null() { None } else { Some(private) };
                pud.updated = now;
                mode = pud.mode_given & pud.mode_want;
            }
        }

        // Update the cached values.
        if send_common {
            if let Some(access) = core_access {
                self.access_auth = access.auth;
                self.access_anon = access.anon;
            }
            if let Some(public) = core_public {
                self.public = Some(public);
            }
            self.updated = now;
        }

        if send_common {
            if self.cat == TopicCat::Me {
                self.pres_users_of_interest("upd", "");
            } else {
                let filter = PresFilters {
                    filter_in: AccessMode::JOIN,
                    exclude_user: as_uid,
                    ..Default::default()
                };
                self.pres_subs_offline(
                    "upd",
                    &PresParams::default(),
                    &filter,
                    &filter,
                    &sess.sid,
                    false,
                );
            }
        }
        if send_common || send_priv {
            self.pres_single_user_offline(as_uid, mode, "upd", &PresParams::default(), &sess.sid, false);
        }

        sess.queue_out(no_err_reply(pkt, now));
        Ok(())
    }

    /// `{get what="data"}`: serve message history as `{data}` packets.
    pub(crate) async fn reply_get_data(
        &self,
        sess: &Arc<Session>,
        as_uid: Uid,
        opts: Option<&MsgGetOpts>,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let toriginal = self.original(as_uid);

        if let Some(opts) = opts
            && (opts.if_modified_since.is_some() || !opts.user.is_empty() || !opts.topic.is_empty())
        {
            sess.queue_out(err_malformed_reply(pkt, now));
            return Err(OpError::Malformed("invalid data query"));
        }

        let as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        let mut count = 0;
        if self.user_is_reader(as_uid) || as_chan {
            let query = QueryOpts {
                since: opts.map(|o| o.since_id).unwrap_or(0),
                before: opts.map(|o| o.before_id).unwrap_or(0),
                limit: opts.map(|o| o.limit as usize).unwrap_or(0),
                ..Default::default()
            };
            let messages = match self.ctx.store.messages.get_all(&self.name, as_uid, &query).await {
                Ok(messages) => messages,
                Err(e) => {
                    sess.queue_out(err_unknown_reply(pkt, now));
                    return Err(e.into());
                }
            };
            count = messages.len();
            for mm in messages {
                let from = if as_chan {
                    String::new()
                } else {
                    mm.from.user_id()
                };
                sess.queue_out(ServerMsg::new(
                    ServerPayload::Data(MsgData {
                        topic: toriginal.clone(),
                        from,
                        ts: mm.created,
                        seq: mm.seq,
                        head: mm.head,
                        content: mm.content,
                    }),
                    now,
                ));
            }
        }

        if count == 0 {
            sess.queue_out(no_content(
                &pkt.id,
                &pkt.original,
                now,
                serde_json::json!({"what": "data"}),
            ));
        } else {
            sess.queue_out(no_err_params_reply(
                pkt,
                now,
                serde_json::json!({"what": "data", "count": count}),
            ));
        }
        Ok(())
    }

    /// `{get what="tags"}`.
    pub(crate) async fn reply_get_tags(
        &self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        if self.cat != TopicCat::Me && self.cat != TopicCat::Grp {
            sess.queue_out(err_not_allowed(&pkt.id, &pkt.original, now));
            return Err(OpError::Denied("tags not available here"));
        }
        if self.cat == TopicCat::Grp && self.owner != as_uid {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("tags request from non-owner"));
        }

        if self.tags.is_empty() {
            sess.queue_out(no_content(
                &pkt.id,
                &pkt.original,
                now,
                serde_json::json!({"what": "tags"}),
            ));
            return Ok(());
        }

        sess.queue_out(ServerMsg::new(
            ServerPayload::Meta(Box::new(MsgMeta {
                id: pkt.id.clone(),
                topic: self.original(as_uid),
                ts: now,
                tags: Some(self.tags.clone()),
                ..Default::default()
            })),
            now,
        ));
        Ok(())
    }

    /// `{set what="tags"}`: replace discovery tags.
    pub(crate) async fn reply_set_tags(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let set = pkt.set().ok_or(OpError::Malformed("not a set"))?;
        let Some(tags) = &set.query.tags else {
            sess.queue_out(info_not_modified_reply(pkt, now));
            return Ok(());
        };

        if self.verify_channel_access(&pkt.original).is_err() {
            sess.queue_out(err_not_found_reply(pkt, now));
            return Err(OpError::NotFound);
        }
        if self.cat != TopicCat::Me && self.cat != TopicCat::Grp {
            sess.queue_out(err_not_allowed(&pkt.id, &pkt.original, now));
            return Err(OpError::Denied("cannot assign tags here"));
        }
        if self.cat == TopicCat::Grp && self.owner != as_uid {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("tags update by non-owner"));
        }

        let tags = normalize_tags(tags);
        if !restricted_tags_equal(
            &self.tags,
            &tags,
            &self.ctx.limits.restricted_tag_ns,
        ) && pkt.auth_lvl != crate::types::AuthLevel::Root
        {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("attempt to mutate restricted tags"));
        }

        let (added, removed) = string_slice_delta(&self.tags, &tags);
        if added.is_empty() && removed.is_empty() {
            sess.queue_out(info_not_modified_reply(pkt, now));
            return Ok(());
        }

        let result = if self.cat == TopicCat::Me {
            self.ctx
                .store
                .users
                .update(
                    as_uid,
                    UserUpdate {
                        tags: Some(tags.clone()),
                        updated: Some(now),
                        ..Default::default()
                    },
                )
                .await
        } else {
            self.ctx
                .store
                .topics
                .update(
                    &self.name,
                    TopicUpdate {
                        tags: Some(tags.clone()),
                        updated: Some(now),
                        ..Default::default()
                    },
                )
                .await
        };
        if let Err(e) = result {
            sess.queue_out(err_unknown_reply(pkt, now));
            return Err(e.into());
        }

        self.tags = tags;
        self.pres_subs_online(
            "tags",
            "",
            &PresParams::default(),
            &PresFilters {
                single_user: as_uid,
                ..Default::default()
            },
            "",
        );

        let mut params = serde_json::Map::new();
        if !added.is_empty() {
            params.insert("added".into(), added.len().into());
        }
        if !removed.is_empty() {
            params.insert("removed".into(), removed.len().into());
        }
        sess.queue_out(no_err_params_reply(pkt, now, params.into()));
        Ok(())
    }

    /// `{get what="cred"}`: stored credentials, `me` only.
    pub(crate) async fn reply_get_creds(
        &self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        if self.cat != TopicCat::Me {
            sess.queue_out(err_not_allowed(&pkt.id, &pkt.original, now));
            return Err(OpError::Denied("credentials live on me"));
        }
        let creds = match self.ctx.store.users.get_all_creds(as_uid).await {
            Ok(creds) => creds,
            Err(e) => {
                sess.queue_out(store_error_reply(&e, pkt, now));
                return Err(e.into());
            }
        };
        if creds.is_empty() {
            sess.queue_out(no_content(
                &pkt.id,
                &pkt.original,
                now,
                serde_json::json!({"what": "cred"}),
            ));
            return Ok(());
        }
        sess.queue_out(ServerMsg::new(
            ServerPayload::Meta(Box::new(MsgMeta {
                id: pkt.id.clone(),
                topic: self.original(as_uid),
                ts: now,
                cred: Some(creds),
                ..Default::default()
            })),
            now,
        ));
        Ok(())
    }

    /// `{get what="del"}`: ranges deleted for this user.
    pub(crate) async fn reply_get_del(
        &self,
        sess: &Arc<Session>,
        as_uid: Uid,
        opts: Option<&MsgGetOpts>,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;

        if let Some(opts) = opts
            && (opts.if_modified_since.is_some() || !opts.user.is_empty() || !opts.topic.is_empty())
        {
            sess.queue_out(err_malformed_reply(pkt, now));
            return Err(OpError::Malformed("invalid del query"));
        }

        if as_chan || self.user_is_reader(as_uid) {
            let query = QueryOpts {
                since: opts.map(|o| o.since_id).unwrap_or(0),
                limit: opts.map(|o| o.limit as usize).unwrap_or(0),
                ..Default::default()
            };
            match self
                .ctx
                .store
                .messages
                .get_deleted(&self.name, as_uid, &query)
                .await
            {
                Ok((ranges, del_id)) if !ranges.is_empty() => {
                    sess.queue_out(ServerMsg::new(
                        ServerPayload::Meta(Box::new(MsgMeta {
                            id: pkt.id.clone(),
                            topic: self.original(as_uid),
                            ts: now,
                            del: Some(MsgDelValues {
                                del_id,
                                del_seq: ranges,
                            }),
                            ..Default::default()
                        })),
                        now,
                    ));
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    sess.queue_out(err_unknown_reply(pkt, now));
                    return Err(e.into());
                }
            }
        }

        sess.queue_out(no_content(
            &pkt.id,
            &pkt.original,
            now,
            serde_json::json!({"what": "del"}),
        ));
        Ok(())
    }

    /// `{del what="msg"}`: soft or hard message deletion.
    pub(crate) async fn reply_del_msg(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let del = pkt.del().ok_or(OpError::Malformed("not a del"))?;

        let as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;
        if as_chan {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("channel readers cannot delete"));
        }

        let mode = self.effective_mode(as_uid);
        let mut hard = del.hard;
        if !mode.is_deleter() {
            if !mode.is_reader() {
                sess.queue_out(err_permission_denied_reply(pkt, now));
                return Err(OpError::Denied("del.msg needs R"));
            }
            // Only R: silently degrade to soft delete.
            hard = false;
        }

        if del.del_seq.is_empty() {
            sess.queue_out(err_invalid_range(&pkt.id, &pkt.original, now));
            return Err(OpError::Malformed("no ranges"));
        }

        let mut count: u64 = 0;
        let mut ranges = Vec::with_capacity(del.del_seq.len());
        for dq in &del.del_seq {
            let mut dq = *dq;
            if dq.low > self.last_seq
                || (dq.hi > 0 && dq.low > dq.hi)
                || (dq.low == 0 && dq.hi == 0)
            {
                sess.queue_out(err_invalid_range(&pkt.id, &pkt.original, now));
                return Err(OpError::Malformed("invalid range entry"));
            }
            if dq.hi > self.last_seq + 1 {
                dq.hi = self.last_seq + 1;
            }
            // low == hi is an accepted encoding of a single message.
            if dq.hi == dq.low || dq.hi == dq.low + 1 {
                dq.hi = 0;
            }
            count += dq.count();
            ranges.push(dq);
        }
        let ranges = normalize_ranges(ranges);

        if count > self.ctx.limits.default_max_delete_count && ranges.len() > 1 {
            sess.queue_out(err_invalid_range(&pkt.id, &pkt.original, now));
            return Err(OpError::Malformed("too many messages to delete"));
        }

        let for_user = if hard { Uid::ZERO } else { as_uid };
        if let Err(e) = self
            .ctx
            .store
            .messages
            .delete_list(&self.name, self.del_id + 1, for_user, &ranges)
            .await
        {
            sess.queue_out(err_unknown_reply(pkt, now));
            return Err(e.into());
        }

        self.del_id += 1;
        let del_id = self.del_id;
        if let Err(e) = self
            .ctx
            .store
            .topics
            .update(
                &self.name,
                TopicUpdate {
                    del_id: Some(del_id),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(topic = %self.name, error = %e, "failed to persist delId");
        }

        if hard {
            for pud in self.per_user.values_mut() {
                pud.del_id = del_id;
            }
            let params = PresParams {
                del_id,
                del_seq: ranges.clone(),
                actor: as_uid.user_id(),
                ..Default::default()
            };
            let filters = PresFilters {
                filter_in: AccessMode::READ,
                ..Default::default()
            };
            self.pres_subs_online("del", &params.actor.clone(), &params, &filters, &sess.sid);
            self.pres_subs_offline("del", &params, &filters, &PresFilters::default(), &sess.sid, true);
        } else {
            let mode = if let Some(pud) = self.per_user.get_mut(&as_uid) {
                pud.del_id = del_id;
                pud.mode_given & pud.mode_want
            } else {
                AccessMode::NONE
            };
            self.pres_pub_message_delete(as_uid, mode, del_id, &ranges, &sess.sid);
        }

        sess.queue_out(no_err_params_reply(pkt, now, serde_json::json!({"del": del_id})));
        Ok(())
    }

    /// `{del what="sub"}`: eject another subscriber.
    pub(crate) async fn reply_del_sub(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();
        let del = pkt.del().ok_or(OpError::Malformed("not a del"))?;

        let as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
            sess.queue_out(err_not_found_reply(pkt, now));
            OpError::NotFound
        })?;
        if as_chan {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("readers cannot delete subscriptions"));
        }

        let uid = parse_user_id(&del.user).unwrap_or(Uid::ZERO);

        if !self.effective_mode(as_uid).is_admin() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("del.sub needs admin"));
        }
        if uid.is_zero() || uid == as_uid {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("cannot delete self-subscription here"));
        }
        if self.cat == TopicCat::P2P {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("no del.sub on p2p"));
        }

        let Some(pud) = self.per_user.get(&uid).cloned() else {
            sess.queue_out(info_no_action_reply(pkt, now));
            return Err(OpError::NoAction);
        };
        if (pud.mode_given & pud.mode_want).is_owner() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("cannot evict the owner"));
        }
        if !pud.mode_want.is_joiner() {
            // The user banned the topic; deleting would allow a re-invite.
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("cannot delete banned subscription"));
        }

        match self.ctx.store.subs.delete(&self.name, uid).await {
            Err(StoreError::NotFound) => {
                sess.queue_out(info_no_action_reply(pkt, now));
            }
            Err(e) => {
                sess.queue_out(err_unknown_reply(pkt, now));
                return Err(e.into());
            }
            Ok(()) => {
                sess.queue_out(no_err_reply(pkt, now));
            }
        }

        if (pud.mode_want & pud.mode_given).is_reader() {
            self.ctx
                .update_unread(uid, pud.read_id as i64 - self.last_seq as i64);
        }

        self.notify_sub_change(
            uid,
            as_uid,
            false,
            pud.mode_want,
            pud.mode_given,
            AccessMode::UNSET,
            AccessMode::UNSET,
            &sess.sid,
        );
        self.evict_user(uid, true, "");
        Ok(())
    }

    /// `{del what="topic"}`: owner tears the topic down; a p2p non-owner
    /// with a live counterpart degrades to `leave unsub`.
    pub(crate) async fn reply_del_topic(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        pkt: &ClientMsg,
    ) -> Result<(), OpError> {
        let now = time_now();

        if self.cat == TopicCat::Me || self.cat == TopicCat::Fnd || self.cat == TopicCat::Sys {
            sess.queue_out(err_not_allowed(&pkt.id, &pkt.original, now));
            return Err(OpError::Denied("cannot delete this topic"));
        }
        if self.owner != as_uid && (self.cat != TopicCat::P2P || self.subs_count() == 2) {
            return self.reply_leave_unsub(sess, Some(pkt), as_uid).await;
        }

        self.status.mark_deleted();
        if let Err(e) = self.ctx.store.topics.delete(&self.name).await {
            sess.queue_out(err_unknown_reply(pkt, now));
            return Err(e.into());
        }
        sess.queue_out(no_err_reply(pkt, now));

        // The hub drops the handle and orders the shutdown; `gone`
        // notifications go out from the exit handler.
        self.ctx.hub_notify(HubEvent::TopicGone {
            name: self.name.clone(),
        });
        Ok(())
    }
}

/// Lowercase, trim, dedupe and length-filter a tag list.
pub(crate) fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| t.len() >= 2 && t.len() <= 96)
        .collect();
    out.sort();
    out.dedup();
    out
}

/// True if both slices contain the same tags within the given namespaces.
pub(crate) fn restricted_tags_equal(old: &[String], new: &[String], ns: &[String]) -> bool {
    let filter = |tags: &[String]| -> Vec<String> {
        let mut subset: Vec<String> = tags
            .iter()
            .filter(|t| {
                t.split_once(':')
                    .map(|(prefix, _)| ns.iter().any(|n| n == prefix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        subset.sort();
        subset
    };
    filter(old) == filter(new)
}

/// Added and removed elements between two string sets.
pub(crate) fn string_slice_delta(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let added = new.iter().filter(|t| !old.contains(t)).cloned().collect();
    let removed = old.iter().filter(|t| !new.contains(t)).cloned().collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_what() {
        let what = parse_meta_what("desc sub data del tags cred");
        assert!(what.desc && what.sub && what.data && what.del && what.tags && what.cred);
        assert_eq!(parse_meta_what("desc bogus").desc, true);
        assert_eq!(parse_meta_what(""), MetaWhat::default());
    }

    #[test]
    fn test_normalize_tags() {
        let tags = vec![
            " Travel ".to_string(),
            "travel".to_string(),
            "x".to_string(),
            "email:A@B.C".to_string(),
        ];
        let norm = normalize_tags(&tags);
        assert_eq!(norm, vec!["email:a@b.c".to_string(), "travel".to_string()]);
    }

    #[test]
    fn test_restricted_tags_equal() {
        let ns = vec!["email".to_string()];
        let old = vec!["email:a@b.c".to_string(), "travel".to_string()];
        let same = vec!["email:a@b.c".to_string(), "hiking".to_string()];
        let changed = vec!["email:x@y.z".to_string(), "travel".to_string()];
        assert!(restricted_tags_equal(&old, &same, &ns));
        assert!(!restricted_tags_equal(&old, &changed, &ns));
    }

    #[test]
    fn test_string_slice_delta() {
        let old = vec!["a".to_string(), "b".to_string()];
        let new = vec!["b".to_string(), "c".to_string()];
        let (added, removed) = string_slice_delta(&old, &new);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
    }
}
