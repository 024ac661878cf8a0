//! Subscribe and leave flows
//!
//! Handles `{sub}` (first-time subscription, re-join, permission change,
//! ownership transfer, channel readers), `{leave}` with and without unsub,
//! and user eviction.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::access::AccessMode;
use crate::error::{
    err_malformed_reply, err_not_found_reply, err_permission_denied_reply, err_policy_reply,
    err_unknown_reply, info_no_action_reply, info_use_other, no_err, no_err_evicted,
    no_err_params, no_err_reply,
};
use crate::presence::{PresFilters, PresParams};
use crate::proto::{ClientMsg, MsgAccessMode};
use crate::session::{Session, TopicLink};
use crate::store::{StoreError, SubUpdate, Subscription, UserState};
use crate::types::{TopicCat, Uid, is_channel, time_now};

use super::{DeferredNotice, OpError, PerUserData, SessionJoin, SessionLeave, SessionUpdate, Topic};

impl Topic {
    /// Process a subscribe request end to end: update/create the
    /// subscription, link the session, reply, fire presence, and serve the
    /// piggybacked `{get}` query.
    pub(crate) async fn handle_subscription(&mut self, join: &SessionJoin) -> Result<(), OpError> {
        let as_uid = join.pkt.as_user;
        let as_chan = is_channel(&join.pkt.original);

        self.subscription_reply(as_chan, join).await?;

        let Some(msgsub) = join.pkt.sub() else {
            return Ok(());
        };
        if let Some(get) = msgsub.get.clone() {
            let what = crate::topic::meta::parse_meta_what(&get.what);
            if what.desc
                && let Err(e) = self
                    .reply_get_desc(&join.sess, as_uid, get.desc.as_ref(), &join.pkt)
                    .await
            {
                debug!(topic = %self.name, error = %e, "sub get.desc failed");
            }
            if what.sub
                && let Err(e) = self.reply_get_sub(&join.sess, as_uid, get.sub.as_ref(), &join.pkt).await
            {
                debug!(topic = %self.name, error = %e, "sub get.sub failed");
            }
            if what.tags
                && let Err(e) = self.reply_get_tags(&join.sess, as_uid, &join.pkt).await
            {
                debug!(topic = %self.name, error = %e, "sub get.tags failed");
            }
            if what.data
                && let Err(e) = self
                    .reply_get_data(&join.sess, as_uid, get.data.as_ref(), &join.pkt)
                    .await
            {
                debug!(topic = %self.name, error = %e, "sub get.data failed");
            }
            if what.del
                && let Err(e) = self
                    .reply_get_del(&join.sess, as_uid, get.del.as_ref(), &join.pkt)
                    .await
            {
                debug!(topic = %self.name, error = %e, "sub get.del failed");
            }
            if what.cred
                && let Err(e) = self.reply_get_creds(&join.sess, as_uid, &join.pkt).await
            {
                debug!(topic = %self.name, error = %e, "sub get.cred failed");
            }
        }
        Ok(())
    }

    /// Create or update the requester's subscription and acknowledge it.
    async fn subscription_reply(&mut self, as_chan: bool, join: &SessionJoin) -> Result<(), OpError> {
        let mut msgsub = join.pkt.sub().cloned().ok_or(OpError::Malformed("not a sub"))?;
        let as_uid = join.pkt.as_user;

        // For topics created by this request report creation time.
        let now = if msgsub.created { self.updated } else { time_now() };

        if !msgsub.newsub
            && matches!(self.cat, TopicCat::P2P | TopicCat::Grp | TopicCat::Sys)
        {
            msgsub.newsub = match self.per_user.get(&as_uid) {
                Some(pud) => pud.deleted,
                None => true,
            };
        }

        let mut mode = String::new();
        let mut private = None;
        if let Some(set) = &msgsub.set {
            if let Some(sub) = &set.sub {
                if !sub.user.is_empty() {
                    join.sess.queue_out(err_malformed_reply(&join.pkt, now));
                    return Err(OpError::Malformed("user must not be set in sub"));
                }
                mode = sub.mode.clone();
            }
            if let Some(desc) = &set.desc {
                private = desc.private.clone();
            }
        }

        let mode_changed = self
            .this_user_sub(&join.sess, &join.pkt, &msgsub, as_uid, &mode, private)
            .await?;

        // Link the session and the topic both ways.
        join.sess.add_sub(
            &self.name,
            TopicLink {
                broadcast: self.tx.broadcast.clone(),
                unreg: self.tx.unreg.clone(),
                meta: self.tx.meta.clone(),
                supd: self.tx.supd.clone(),
            },
        );
        let added = self.add_session(&join.sess, as_uid, as_chan);

        if added && !join.sess.is_background() && !as_chan {
            let pud = self.per_user.entry(as_uid).or_default();
            pud.online += 1;
        }

        let toriginal = self.original(as_uid);
        let mut params = serde_json::Map::new();
        if let Some(acs) = &mode_changed {
            params.insert("acs".into(), serde_json::to_value(acs).unwrap_or_default());
        }
        if msgsub.created && join.pkt.original != toriginal {
            params.insert("tmpname".into(), join.pkt.original.clone().into());
        }
        if params.is_empty() {
            join.sess.queue_out(no_err(&join.pkt.id, &toriginal, now));
        } else {
            join.sess
                .queue_out(no_err_params(&join.pkt.id, &toriginal, now, params.into()));
        }

        // New subscriptions announce themselves even when the final mode
        // happens to equal the default.
        let acs_for_notify = mode_changed.clone().or_else(|| {
            if msgsub.newsub {
                self.per_user
                    .get(&as_uid)
                    .map(|pud| MsgAccessMode::new(pud.mode_want, pud.mode_given))
            } else {
                None
            }
        });
        if let Some(acs) = &acs_for_notify {
            self.send_immediate_sub_notifications(as_uid, acs, &msgsub, &join.pkt, &join.sess);
        }

        if !join.sess.is_background() && !as_chan {
            self.send_sub_notifications(as_uid, &join.sess.sid, &join.sess.user_agent())
                .await;
        } else if join.sess.is_background() && !as_chan {
            self.deferred.push(DeferredNotice {
                uid: as_uid,
                sid: join.sess.sid.clone(),
                user_agent: join.sess.user_agent(),
                created: tokio::time::Instant::now(),
            });
        }

        Ok(())
    }

    /// Create or update the requester's own subscription. Returns the new
    /// access mode when it changed.
    pub(crate) async fn this_user_sub(
        &mut self,
        sess: &Arc<Session>,
        pkt: &ClientMsg,
        msgsub: &crate::proto::MsgClientSub,
        as_uid: Uid,
        want: &str,
        private: Option<serde_json::Value>,
    ) -> Result<Option<MsgAccessMode>, OpError> {
        let now = time_now();

        let as_chan = match self.verify_channel_access(&pkt.original) {
            Ok(chan) => chan,
            Err(()) => {
                sess.queue_out(err_not_found_reply(pkt, now));
                return Err(OpError::NotFound);
            }
        };

        let mut mode_want = AccessMode::UNSET;
        if !want.is_empty() {
            mode_want = want.parse().map_err(|_| {
                sess.queue_out(err_malformed_reply(pkt, now));
                OpError::Malformed("bad mode")
            })?;
        }

        let mut old_want = AccessMode::NONE;
        let mut old_given = AccessMode::NONE;

        let existing = self
            .per_user
            .get(&as_uid)
            .map(|pud| !pud.deleted)
            .unwrap_or(false);

        let mut user_data = self.per_user.get(&as_uid).cloned().unwrap_or_default();

        if !existing {
            // New subscription or a channel reader.
            if self.cat == TopicCat::Grp
                && !as_chan
                && self.subs_count() >= self.ctx.limits.max_subscriber_count
            {
                sess.queue_out(err_policy_reply(pkt, now));
                return Err(OpError::Policy("max subscriber count exceeded"));
            }

            let mut store_sub: Option<Subscription> = None;
            let mut tname = self.name.clone();
            match self.cat {
                TopicCat::P2P => {
                    // P2P rows exist from creation; this is an undelete.
                    if mode_want.is_defined() {
                        user_data.mode_want = mode_want;
                    }
                    user_data.mode_want =
                        (user_data.mode_want & AccessMode::C_P2P) | AccessMode::APPROVE;
                }
                TopicCat::Sys => {
                    if pkt.auth_lvl != crate::types::AuthLevel::Root {
                        sess.queue_out(err_permission_denied_reply(pkt, now));
                        return Err(OpError::Denied("sys requires root"));
                    }
                    user_data.mode_want = AccessMode::C_SYS;
                    user_data.mode_given = AccessMode::C_SYS;
                    if mode_want.is_defined() {
                        user_data.mode_want =
                            (mode_want & AccessMode::C_SYS) | AccessMode::WRITE | AccessMode::JOIN;
                    }
                }
                _ if as_chan => {
                    // Channel reader: given is frozen, want is clamped.
                    store_sub = self.ctx.store.subs.get(&pkt.original, as_uid).await?;
                    old_given = AccessMode::C_CHN_READER;
                    user_data.mode_given = AccessMode::C_CHN_READER;
                    old_want = store_sub
                        .as_ref()
                        .map(|s| s.mode_want)
                        .unwrap_or(AccessMode::C_CHN_READER);
                    user_data.mode_want = if mode_want.is_defined() {
                        (mode_want & AccessMode::C_CHN_READER)
                            | AccessMode::READ
                            | AccessMode::JOIN
                    } else {
                        old_want
                    };
                    tname = pkt.original.clone();
                }
                _ => {
                    user_data.mode_given = self.access_for(pkt.auth_lvl);
                    if msgsub.created && self.cat == TopicCat::Grp {
                        user_data.mode_given = user_data.mode_given | AccessMode::OWNER;
                    }
                    user_data.mode_want = if mode_want.is_defined() {
                        mode_want
                    } else {
                        user_data.mode_given
                    };
                }
            }

            user_data.deleted = false;
            user_data.private = private.clone();
            user_data.created = now;
            user_data.updated = now;

            if store_sub.is_none() {
                let sub = Subscription {
                    user: as_uid,
                    topic: tname.clone(),
                    created: now,
                    updated: now,
                    mode_want: user_data.mode_want,
                    mode_given: user_data.mode_given,
                    private: user_data.private.clone(),
                    ..Default::default()
                };
                match self.ctx.store.subs.create(sub).await {
                    Ok(()) => {}
                    Err(StoreError::Duplicate) => {
                        // Row exists but was soft-deleted: revive it.
                        let upd = SubUpdate {
                            mode_want: Some(user_data.mode_want),
                            mode_given: Some(user_data.mode_given),
                            private: Some(user_data.private.clone()),
                            ..Default::default()
                        };
                        self.ctx.store.subs.update(&tname, as_uid, upd, true).await?;
                    }
                    Err(e) => {
                        sess.queue_out(err_unknown_reply(pkt, now));
                        return Err(e.into());
                    }
                }
            } else if as_chan && user_data.mode_want != old_want {
                let upd = SubUpdate {
                    mode_want: Some(user_data.mode_want),
                    ..Default::default()
                };
                if let Err(e) = self.ctx.store.subs.update(&tname, as_uid, upd, true).await {
                    sess.queue_out(err_unknown_reply(pkt, now));
                    return Err(e.into());
                }
                self.channel_sub_unsub(as_uid, user_data.mode_want.is_presencer());
            }
        } else {
            // Update to an existing subscription.
            if as_chan {
                // A full subscriber must address the topic by its group name.
                sess.queue_out(info_use_other(&pkt.id, &self.name, now));
                return Err(OpError::NotFound);
            }

            old_want = user_data.mode_want;
            old_given = user_data.mode_given;

            let mut owner_change = false;
            let mut mode_want = mode_want;

            if mode_want.is_defined() {
                if user_data.mode_given.is_owner() {
                    // The owner cannot self-ban or strip own ownership.
                    if self.owner == as_uid && (!mode_want.is_owner() || !mode_want.is_joiner()) {
                        sess.queue_out(err_permission_denied_reply(pkt, now));
                        return Err(OpError::Denied("owner cannot unset ownership or self-ban"));
                    }
                    owner_change = mode_want.is_owner() && !user_data.mode_want.is_owner();
                    if mode_want.is_owner() && !user_data.mode_given.better_equal(mode_want) {
                        user_data.mode_given = user_data.mode_given | mode_want;
                    }
                } else if mode_want.is_owner() {
                    sess.queue_out(err_permission_denied_reply(pkt, now));
                    return Err(OpError::Denied("non-owner cannot request ownership"));
                } else if self.cat == TopicCat::Grp
                    && user_data.mode_given.is_admin()
                    && mode_want.is_admin()
                {
                    // Admins may self-elevate except for D and O.
                    let capped = mode_want.and_not(AccessMode::DELETE | AccessMode::OWNER);
                    if !user_data.mode_given.better_equal(capped) {
                        user_data.mode_given = user_data.mode_given | capped;
                    }
                }

                if self.cat == TopicCat::P2P {
                    mode_want = (mode_want & AccessMode::C_P2P) | AccessMode::APPROVE;
                } else if self.cat == TopicCat::Sys {
                    mode_want = (mode_want & AccessMode::C_SYS) | AccessMode::WRITE;
                }
            }

            if !mode_want.is_defined() {
                // No explicit mode: un-self-ban if banned, else no change.
                if !old_want.is_joiner() {
                    user_data.mode_want = user_data.mode_given | self.access_for(pkt.auth_lvl);
                }
            } else if user_data.mode_want != mode_want {
                user_data.mode_want = mode_want;
            }

            let mut upd = SubUpdate::default();
            if let Some(p) = &private {
                if p.is_null() {
                    upd.private = Some(None);
                    user_data.private = None;
                } else {
                    upd.private = Some(Some(p.clone()));
                    user_data.private = Some(p.clone());
                }
            }
            if user_data.mode_want != old_want {
                upd.mode_want = Some(user_data.mode_want);
            }
            if user_data.mode_given != old_given {
                upd.mode_given = Some(user_data.mode_given);
            }
            if upd.mode_want.is_some() || upd.mode_given.is_some() || upd.private.is_some() {
                if let Err(e) = self.ctx.store.subs.update(&self.name, as_uid, upd, false).await {
                    sess.queue_out(err_unknown_reply(pkt, now));
                    return Err(e.into());
                }
            }

            if owner_change {
                self.transfer_ownership(as_uid, &sess.sid).await?;
            }
        }

        if !as_chan {
            // Muting the topic: send "off" and stop reporting before the new
            // permissions take effect.
            if (old_want & old_given).is_presencer()
                && !(user_data.mode_want & user_data.mode_given).is_presencer()
            {
                if self.cat == TopicCat::Me {
                    self.pres_users_of_interest("off+dis", &self.user_agent.clone());
                } else {
                    self.pres_single_user_offline(
                        as_uid,
                        user_data.mode_want & user_data.mode_given,
                        "off+dis",
                        &PresParams::default(),
                        "",
                        false,
                    );
                }
            }

            self.per_user.insert(as_uid, user_data.clone());
            self.compute_acs_union();
        }

        let mut mode_changed = None;
        if old_want != user_data.mode_want || old_given != user_data.mode_given {
            if !as_chan {
                let old_reader = (old_want & old_given).is_reader();
                let new_reader = (user_data.mode_want & user_data.mode_given).is_reader();
                if old_reader && !new_reader {
                    self.ctx
                        .update_unread(as_uid, user_data.read_id as i64 - self.last_seq as i64);
                } else if !old_reader && new_reader {
                    self.ctx
                        .update_unread(as_uid, self.last_seq as i64 - user_data.read_id as i64);
                }
            }

            self.notify_sub_change(
                as_uid,
                as_uid,
                as_chan,
                old_want,
                old_given,
                user_data.mode_want,
                user_data.mode_given,
                &sess.sid,
            );

            mode_changed = Some(MsgAccessMode::new(user_data.mode_want, user_data.mode_given));
        }

        if !user_data.mode_want.is_joiner() {
            // Self-ban; a later re-subscription lifts it.
            self.evict_user(as_uid, false, "");
            return Ok(mode_changed);
        }
        if !user_data.mode_given.is_joiner() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("user is banned"));
        }

        Ok(mode_changed)
    }

    /// Strip `O` from the current owner, grant it to `new_owner`, and record
    /// the change on the topic row. On a failed second write the first one is
    /// compensated.
    async fn transfer_ownership(&mut self, new_owner: Uid, skip_sid: &str) -> Result<(), OpError> {
        let old_owner = self.owner;
        let Some(old_data) = self.per_user.get(&old_owner).cloned() else {
            self.owner = new_owner;
            return self
                .ctx
                .store
                .topics
                .owner_change(&self.name, new_owner)
                .await
                .map_err(Into::into);
        };

        let stripped_want = old_data.mode_want.and_not(AccessMode::OWNER);
        let stripped_given = old_data.mode_given.and_not(AccessMode::OWNER);
        let upd = SubUpdate {
            mode_want: Some(stripped_want),
            mode_given: Some(stripped_given),
            ..Default::default()
        };
        self.ctx
            .store
            .subs
            .update(&self.name, old_owner, upd, false)
            .await?;

        if let Err(e) = self.ctx.store.topics.owner_change(&self.name, new_owner).await {
            // Restore the old owner's row rather than leaving the topic
            // ownerless.
            let restore = SubUpdate {
                mode_want: Some(old_data.mode_want),
                mode_given: Some(old_data.mode_given),
                ..Default::default()
            };
            if let Err(e2) = self
                .ctx
                .store
                .subs
                .update(&self.name, old_owner, restore, false)
                .await
            {
                warn!(topic = %self.name, error = %e2, "owner restore failed");
            }
            return Err(e.into());
        }

        let mut new_data = old_data.clone();
        new_data.mode_want = stripped_want;
        new_data.mode_given = stripped_given;
        self.per_user.insert(old_owner, new_data);
        self.compute_acs_union();

        self.notify_sub_change(
            old_owner,
            new_owner,
            false,
            old_data.mode_want,
            old_data.mode_given,
            stripped_want,
            stripped_given,
            skip_sid,
        );
        self.owner = new_owner;
        Ok(())
    }

    /// Invite another user or adjust their granted mode. Requires `S`; an
    /// explicit `given` additionally requires admin standing.
    pub(crate) async fn another_user_sub(
        &mut self,
        sess: &Arc<Session>,
        as_uid: Uid,
        target: Uid,
        pkt: &ClientMsg,
    ) -> Result<Option<MsgAccessMode>, OpError> {
        let now = time_now();
        let set = pkt.set().ok_or(OpError::Malformed("not a set"))?;
        let sub_req = set.query.sub.as_ref().ok_or(OpError::Malformed("no sub"))?;

        let host_mode = match self.per_user.get(&as_uid) {
            Some(pud) => pud.mode_given & pud.mode_want,
            None => {
                sess.queue_out(err_permission_denied_reply(pkt, now));
                return Err(OpError::Denied("approver is not a subscriber"));
            }
        };
        if !host_mode.is_sharer() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("approver has no S permission"));
        }

        match self.verify_channel_access(&pkt.original) {
            Ok(true) => {
                sess.queue_out(err_permission_denied_reply(pkt, now));
                return Err(OpError::Denied("cannot subscribe a reader to a channel"));
            }
            Ok(false) => {}
            Err(()) => {
                sess.queue_out(err_not_found_reply(pkt, now));
                return Err(OpError::NotFound);
            }
        }

        if self.status.is_read_only() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("topic is suspended"));
        }

        let mut mode_given = AccessMode::UNSET;
        if !sub_req.mode.is_empty() {
            mode_given = sub_req.mode.parse().map_err(|_| {
                sess.queue_out(err_malformed_reply(pkt, now));
                OpError::Malformed("bad mode")
            })?;
            if self.cat == TopicCat::P2P {
                mode_given = (mode_given & AccessMode::C_P2P) | AccessMode::APPROVE;
            }
        }

        if mode_given.is_defined() && !host_mode.is_admin() {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("sharer cannot set explicit given"));
        }
        if mode_given.is_defined() && mode_given.is_owner() && self.owner != as_uid {
            sess.queue_out(err_permission_denied_reply(pkt, now));
            return Err(OpError::Denied("ownership transfer by non-owner"));
        }

        let mut old_want = AccessMode::UNSET;
        let mut old_given = AccessMode::UNSET;
        let existing = self.per_user.contains_key(&target);
        let mut user_data;

        if !existing {
            if self.cat == TopicCat::Grp
                && self.subs_count() >= self.ctx.limits.max_subscriber_count
            {
                sess.queue_out(err_policy_reply(pkt, now));
                return Err(OpError::Policy("max subscriber count exceeded"));
            }

            let mut given = mode_given;
            if !given.is_defined() {
                given = self.access_for(crate::types::AuthLevel::Auth) | AccessMode::JOIN;
            }

            let user = match self.ctx.store.users.get(target).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    sess.queue_out(crate::error::err_user_not_found(&pkt.id, &pkt.original, now));
                    return Err(OpError::NotFound);
                }
                Err(e) => {
                    sess.queue_out(err_unknown_reply(pkt, now));
                    return Err(e.into());
                }
            };
            if user.state != UserState::Ok {
                sess.queue_out(err_permission_denied_reply(pkt, now));
                return Err(OpError::Denied("user is suspended"));
            }
            // Don't request more than was granted.
            let want = if user.access.auth.is_defined() {
                user.access.auth & given
            } else {
                AccessMode::NONE
            };

            let sub = Subscription {
                user: target,
                topic: self.name.clone(),
                created: now,
                updated: now,
                mode_want: want,
                mode_given: given,
                ..Default::default()
            };
            if let Err(e) = self.ctx.store.subs.create(sub).await {
                sess.queue_out(err_unknown_reply(pkt, now));
                return Err(e.into());
            }

            user_data = PerUserData {
                created: now,
                updated: now,
                mode_want: want,
                mode_given: given,
                ..Default::default()
            };
            self.per_user.insert(target, user_data.clone());
            self.compute_acs_union();

            let receipt = self.push_for_sub(as_uid, target, want, given, now);
            self.ctx.push.push(&receipt);
        } else {
            user_data = self.per_user.get(&target).cloned().unwrap_or_default();
            old_given = user_data.mode_given;
            old_want = user_data.mode_want;

            if !mode_given.is_defined() {
                // Re-invite without a mode change.
                mode_given = user_data.mode_given;
            } else if mode_given != user_data.mode_given {
                user_data.mode_given = mode_given;
                let upd = SubUpdate {
                    mode_given: Some(mode_given),
                    ..Default::default()
                };
                if let Err(e) = self
                    .ctx
                    .store
                    .subs
                    .update(&self.name, target, upd, false)
                    .await
                {
                    sess.queue_out(err_unknown_reply(pkt, now));
                    return Err(e.into());
                }
                self.per_user.insert(target, user_data.clone());
                self.compute_acs_union();
            }
        }

        let mut mode_changed = None;
        if old_given != user_data.mode_given {
            let old_reader = (old_want & old_given).is_reader();
            let new_reader = (user_data.mode_want & user_data.mode_given).is_reader();
            if old_reader && !new_reader {
                self.ctx
                    .update_unread(target, user_data.read_id as i64 - self.last_seq as i64);
            } else if !old_reader && new_reader {
                self.ctx
                    .update_unread(target, self.last_seq as i64 - user_data.read_id as i64);
            }
            self.notify_sub_change(
                target,
                as_uid,
                false,
                old_want,
                old_given,
                user_data.mode_want,
                user_data.mode_given,
                &sess.sid,
            );
            mode_changed = Some(MsgAccessMode::new(user_data.mode_want, user_data.mode_given));
        }

        if !user_data.mode_given.is_joiner() {
            // The target was banned.
            self.evict_user(target, false, "");
        }

        Ok(mode_changed)
    }

    /// Presence and push sent immediately on subscription, even for
    /// background sessions.
    pub(crate) fn send_immediate_sub_notifications(
        &mut self,
        as_uid: Uid,
        acs: &MsgAccessMode,
        msgsub: &crate::proto::MsgClientSub,
        pkt: &ClientMsg,
        sess: &Arc<Session>,
    ) {
        let want: AccessMode = acs.want.parse().unwrap_or(AccessMode::NONE);
        let given: AccessMode = acs.given.parse().unwrap_or(AccessMode::NONE);
        let mode = want & given;

        if self.cat == TopicCat::P2P
            && let Some(uid2) = self.p2p_other_user(as_uid)
        {
            let pud2 = self.per_user.get(&uid2).cloned().unwrap_or_default();
            let mode2 = if pud2.deleted {
                AccessMode::INVALID
            } else {
                pud2.mode_given & pud2.mode_want
            };

            if msgsub.created {
                self.pres_single_user_offline(
                    uid2,
                    mode2,
                    "acs",
                    &PresParams {
                        d_want: pud2.mode_want.to_string(),
                        d_given: pud2.mode_given.to_string(),
                        actor: as_uid.user_id(),
                        ..Default::default()
                    },
                    "",
                    false,
                );
            }

            if msgsub.newsub {
                // Tell this user's 'me' to accept updates from user2, and
                // probe user2's status.
                self.pres_single_user_offline(as_uid, mode, "?none+en", &PresParams::default(), "", false);
                let status = if mode2.is_presencer() { "?unkn+en" } else { "?unkn" };
                self.pres_single_user_offline(uid2, mode2, status, &PresParams::default(), "", false);

                let receipt =
                    self.push_for_sub(as_uid, uid2, pud2.mode_want, pud2.mode_given, time_now());
                self.ctx.push.push(&receipt);
            }
        }

        if msgsub.newsub {
            // Tell the subscriber's other sessions about the new subscription.
            self.pres_single_user_offline(
                as_uid,
                mode,
                "acs",
                &PresParams {
                    d_want: acs.want.clone(),
                    d_given: acs.given.clone(),
                    actor: as_uid.user_id(),
                    ..Default::default()
                },
                &sess.sid,
                false,
            );

            if self.is_chan && is_channel(&pkt.original) {
                self.channel_sub_unsub(as_uid, true);
            }
        }
    }

    /// Presence sent when a foreground session comes online in the topic.
    pub(crate) async fn send_sub_notifications(&mut self, as_uid: Uid, sid: &str, user_agent: &str) {
        match self.cat {
            TopicCat::Me => {
                if !self.status.is_loaded() {
                    self.status.mark_loaded();
                    if let Err(e) = self.load_contacts(as_uid).await {
                        warn!(topic = %self.name, error = %e, "failed to load contacts");
                    }
                    self.pres_users_of_interest("on", user_agent);
                }
            }
            TopicCat::Grp => {
                let pud = self.per_user.get(&as_uid).cloned().unwrap_or_default();
                if !self.status.is_loaded() {
                    self.status.mark_loaded();
                    let status = if (pud.mode_given & pud.mode_want).is_presencer() {
                        "on+en"
                    } else {
                        "on"
                    };
                    self.pres_subs_offline(
                        status,
                        &PresParams::default(),
                        &PresFilters::default(),
                        &PresFilters::default(),
                        "",
                        false,
                    );
                } else if pud.online == 1 {
                    // First session of this user in the topic.
                    self.pres_subs_online(
                        "on",
                        &as_uid.user_id(),
                        &PresParams::default(),
                        &PresFilters {
                            filter_in: AccessMode::READ,
                            ..Default::default()
                        },
                        sid,
                    );
                }
            }
            _ => {
                self.status.mark_loaded();
            }
        }
    }

    /// Process a leave request or a dropped session.
    pub(crate) async fn handle_leave_request(&mut self, leave: SessionLeave) {
        let now = time_now();

        let mut as_uid = Uid::ZERO;
        let mut as_chan = false;
        if let Some(pkt) = &leave.pkt {
            as_uid = pkt.as_user;
            match self.verify_channel_access(&pkt.original) {
                Ok(chan) => as_chan = chan,
                Err(()) => {
                    leave.sess.queue_out(err_not_found_reply(pkt, now));
                    return;
                }
            }
        }

        if self.status.is_inactive() {
            if let Some(pkt) = &leave.pkt
                && !as_uid.is_zero()
            {
                leave.sess.queue_out(crate::error::err_locked_reply(pkt, now));
            }
            return;
        }

        if let Some(pkt) = &leave.pkt
            && pkt.leave().map(|l| l.unsub).unwrap_or(false)
        {
            if let Err(e) = self.reply_leave_unsub(&leave.sess, Some(pkt), as_uid).await {
                debug!(topic = %self.name, error = %e, sid = %leave.sess.sid, "unsub failed");
            }
            return;
        }

        let (removed, _detached) = self.rem_session(&leave.sess, as_uid);
        let Some((rec_uid, is_chan_sub, muids)) = removed else {
            return;
        };

        if is_chan_sub && as_chan {
            if let Some(pkt) = &leave.pkt {
                leave.sess.queue_out(no_err_reply(pkt, now));
            }
            return;
        }
        if is_chan_sub != as_chan {
            if let Some(pkt) = &leave.pkt {
                leave.sess.queue_out(err_not_found_reply(pkt, now));
            }
            return;
        }

        let uid = if leave.sess.is_multiplex() && !as_uid.is_zero() {
            as_uid
        } else if !rec_uid.is_zero() {
            rec_uid
        } else {
            Uid::ZERO
        };

        if !uid.is_zero() {
            if !leave.sess.is_background()
                && let Some(pud) = self.per_user.get_mut(&uid)
            {
                pud.online = pud.online.saturating_sub(1);
            }
        } else if !muids.is_empty() {
            // The whole multiplexing session is gone.
            for muid in &muids {
                if let Some(pud) = self.per_user.get_mut(muid) {
                    pud.online = pud.online.saturating_sub(1);
                }
            }
        }

        match self.cat {
            TopicCat::Me => {
                if let Some(mrs) = self.most_recent_session() {
                    // Sessions remain; announce the new current user agent,
                    // without blocking.
                    let _ = self.tx.supd.try_send(SessionUpdate {
                        sess: None,
                        user_agent: mrs.user_agent(),
                    });
                } else {
                    // Last session gone: persist its user agent as last seen.
                    let me_uid = if !uid.is_zero() {
                        uid
                    } else {
                        muids.first().copied().unwrap_or(Uid::ZERO)
                    };
                    if !me_uid.is_zero()
                        && let Err(e) = self
                            .ctx
                            .store
                            .users
                            .update_last_seen(me_uid, &leave.sess.user_agent(), now)
                            .await
                    {
                        warn!(topic = %self.name, error = %e, "failed to update last seen");
                    }
                }
            }
            TopicCat::Fnd => {
                self.fnd_public.remove(&leave.sess.sid);
            }
            TopicCat::Grp => {
                let read_filter = PresFilters {
                    filter_in: AccessMode::READ,
                    ..Default::default()
                };
                let offline: Vec<Uid> = if !uid.is_zero() {
                    vec![uid]
                } else {
                    muids.clone()
                };
                for u in offline {
                    if self.per_user.get(&u).map(|p| p.online) == Some(0) {
                        self.pres_subs_online(
                            "off",
                            &u.user_id(),
                            &PresParams::default(),
                            &read_filter,
                            "",
                        );
                    }
                }
            }
            _ => {}
        }

        if !uid.is_zero()
            && let Some(pkt) = &leave.pkt
        {
            leave.sess.queue_out(no_err_reply(pkt, now));
        }
    }

    /// Unsubscribe the user and detach all their sessions.
    pub(crate) async fn reply_leave_unsub(
        &mut self,
        sess: &Arc<Session>,
        pkt: Option<&ClientMsg>,
        as_uid: Uid,
    ) -> Result<(), OpError> {
        let now = time_now();

        if as_uid.is_zero() {
            return Err(OpError::Malformed("zero uid in unsub"));
        }

        if self.owner == as_uid {
            if let Some(pkt) = pkt {
                sess.queue_out(err_permission_denied_reply(pkt, now));
            }
            return Err(OpError::Denied("owner cannot unsubscribe"));
        }

        let mut as_chan = false;
        if let Some(pkt) = pkt {
            as_chan = self.verify_channel_access(&pkt.original).map_err(|()| {
                sess.queue_out(err_not_found_reply(pkt, now));
                OpError::NotFound
            })?;
        }

        let result = if pkt.is_none() && self.is_chan {
            // Try both the subscriber row and the reader row.
            match self.ctx.store.subs.delete(&self.name, as_uid).await {
                Err(StoreError::NotFound) => {
                    as_chan = true;
                    self.ctx
                        .store
                        .subs
                        .delete(&crate::types::grp_to_chn(&self.name), as_uid)
                        .await
                }
                other => other,
            }
        } else if as_chan {
            self.ctx
                .store
                .subs
                .delete(&crate::types::grp_to_chn(&self.name), as_uid)
                .await
        } else {
            self.ctx.store.subs.delete(&self.name, as_uid).await
        };

        match result {
            Err(StoreError::NotFound) => {
                if let Some(pkt) = pkt {
                    sess.queue_out(info_no_action_reply(pkt, now));
                }
                return Ok(());
            }
            Err(e) => {
                if let Some(pkt) = pkt {
                    sess.queue_out(err_unknown_reply(pkt, now));
                }
                return Err(e.into());
            }
            Ok(()) => {}
        }

        if let Some(pkt) = pkt {
            sess.queue_out(no_err_reply(pkt, now));
        }

        let (old_want, old_given) = if !as_chan {
            let pud = self.per_user.get(&as_uid).cloned().unwrap_or_default();
            if (pud.mode_want & pud.mode_given).is_reader() {
                self.ctx
                    .update_unread(as_uid, pud.read_id as i64 - self.last_seq as i64);
            }
            (pud.mode_want, pud.mode_given)
        } else {
            self.channel_sub_unsub(as_uid, false);
            (AccessMode::C_CHN_READER, AccessMode::C_CHN_READER)
        };

        self.notify_sub_change(
            as_uid,
            as_uid,
            as_chan,
            old_want,
            old_given,
            AccessMode::UNSET,
            AccessMode::UNSET,
            &sess.sid,
        );

        self.evict_user(as_uid, true, &sess.sid);

        Ok(())
    }

    /// Detach all of a user's sessions and, on unsub, drop the cached row.
    pub(crate) fn evict_user(&mut self, uid: Uid, unsub: bool, skip_sid: &str) {
        let now = time_now();

        if unsub {
            if self.cat == TopicCat::P2P {
                if let Some(pud) = self.per_user.get_mut(&uid) {
                    pud.online = 0;
                    pud.deleted = true;
                }
            } else if self.per_user.remove(&uid).is_some() {
                self.compute_acs_union();
            }
        } else if let Some(pud) = self.per_user.get_mut(&uid) {
            pud.online = 0;
        }

        let mut msg = no_err_evicted(&self.original(uid), now, serde_json::json!({"unsub": unsub}));
        msg.skip_sid = skip_sid.to_string();
        msg.as_user = uid;

        let sids: Vec<String> = self.sessions.keys().cloned().collect();
        for sid in sids {
            let Some(rec) = self.sessions.get(&sid) else {
                continue;
            };
            let sess = rec.sess.clone();
            let (removed, detached) = self.rem_session(&sess, uid);
            if removed.is_some() {
                if detached {
                    sess.detach(&self.name);
                }
                if sess.sid != skip_sid {
                    sess.queue_out(msg.clone());
                }
            }
        }
    }

    /// A background session came to the foreground: count it online and fire
    /// the deferred notifications.
    pub(crate) async fn sess_to_foreground(&mut self, sess: &Arc<Session>) {
        let key = sess.multi.as_ref().unwrap_or(sess).sid.clone();
        let Some(rec) = self.sessions.get_mut(&key) else {
            return;
        };
        if rec.is_chan_sub {
            return;
        }
        let uid = if rec.sess.is_multiplex() {
            rec.muids.push(sess.uid);
            sess.uid
        } else {
            rec.uid
        };
        if let Some(pud) = self.per_user.get_mut(&uid) {
            pud.online += 1;
        }
        let ua = sess.user_agent();
        let sid = sess.sid.clone();
        self.deferred.retain(|d| d.sid != sid);
        self.send_sub_notifications(uid, &sid, &ua).await;
    }
}
