//! Presence fan-out
//!
//! The four primitives (`pres_subs_online`, `pres_subs_online_direct`,
//! `pres_subs_offline`, `pres_single_user_offline`) plus the contact-list
//! machinery of `me` topics: loading contacts, processing incoming `what`
//! tokens, and notifying users of interest.

use tracing::warn;

use crate::access::AccessMode;
use crate::presence::{PresFilters, PresParams, split_what};
use crate::proto::{MsgPres, ServerMsg, ServerPayload};
use crate::types::{TopicCat, Uid, time_now, topic_cat};

use super::{PerSubsData, Topic};

impl Topic {
    fn make_pres(&self, what: &str, src: &str, params: &PresParams, filters: &PresFilters) -> MsgPres {
        let mut pres = MsgPres {
            topic: self.x_original.clone(),
            src: src.to_string(),
            what: what.to_string(),
            ..Default::default()
        };
        params.apply(&mut pres);
        filters.apply(&mut pres);
        pres
    }

    /// The single subscriber of a `me`/`fnd` topic.
    pub(crate) fn me_uid(&self) -> Uid {
        self.per_user.keys().next().copied().unwrap_or(Uid::ZERO)
    }

    /// Direct `{pres}` to sessions attached to this topic, with per-user
    /// filtering.
    pub(crate) fn pres_subs_online(
        &self,
        what: &str,
        src: &str,
        params: &PresParams,
        filters: &PresFilters,
        skip_sid: &str,
    ) {
        let pres = self.make_pres(what, src, params, filters);
        let mut msg = ServerMsg::new(ServerPayload::Pres(pres), time_now());
        msg.skip_sid = skip_sid.to_string();
        self.fanout(msg);
    }

    /// Direct `{pres}` to every attached session, bypassing per-user mode
    /// checks. Used when the broadcast path is about to disappear (rehash).
    pub(crate) fn pres_subs_online_direct(
        &self,
        what: &str,
        params: &PresParams,
        filters: &PresFilters,
        skip_sid: &str,
    ) {
        let pres = self.make_pres(what, "", params, filters);
        for rec in self.sessions.values() {
            if !rec.sess.is_multiplex() {
                if rec.sess.sid == skip_sid {
                    continue;
                }
                if !filters.single_user.is_zero() && rec.uid != filters.single_user {
                    continue;
                }
            }
            let mut msg = ServerMsg::new(ServerPayload::Pres(pres.clone()), time_now());
            msg.skip_sid = skip_sid.to_string();
            self.fix_topic_name(&mut msg, rec.uid);
            if !rec.sess.queue_out(msg) {
                warn!(topic = %self.name, sid = %rec.sess.sid, "connection stuck on direct pres");
            }
        }
    }

    /// Route a `{pres}` to the `me` topics of subscribers of this topic.
    /// `filter_in_topic` sieves recipients by their mode in *this* topic;
    /// `filter_on_me` is embedded in the message and applied at delivery.
    pub(crate) fn pres_subs_offline(
        &self,
        what: &str,
        params: &PresParams,
        filter_in_topic: &PresFilters,
        filter_on_me: &PresFilters,
        skip_sid: &str,
        offline_only: bool,
    ) {
        for (uid, pud) in &self.per_user {
            if pud.deleted {
                continue;
            }
            let mode = pud.mode_want & pud.mode_given;
            if !filter_in_topic.filter_in.is_zero()
                && (mode & filter_in_topic.filter_in).is_zero()
            {
                continue;
            }
            if !filter_in_topic.exclude_user.is_zero() && *uid == filter_in_topic.exclude_user {
                continue;
            }
            if offline_only && pud.online > 0 {
                continue;
            }
            let mut pres = self.make_pres(what, &self.original(*uid), params, filter_on_me);
            pres.topic = "me".to_string();
            let mut msg = ServerMsg::new(ServerPayload::Pres(pres), time_now());
            msg.skip_sid = skip_sid.to_string();
            self.ctx.route(&uid.me_name(), msg);
        }
    }

    /// Route a `{pres}` to one user's `me` topic. `mode` is the user's mode
    /// in this topic; muted users only get punch-through events.
    pub(crate) fn pres_single_user_offline(
        &self,
        uid: Uid,
        mode: AccessMode,
        what: &str,
        params: &PresParams,
        skip_sid: &str,
        _offline_only: bool,
    ) {
        let (base, cmd) = split_what(what);
        if !mode.is_presencer()
            && base != "gone"
            && base != "acs"
            && !base.starts_with('?')
            && cmd.is_empty()
        {
            return;
        }
        let mut pres = self.make_pres(
            what,
            &self.original(uid),
            params,
            &PresFilters {
                single_user: uid,
                ..Default::default()
            },
        );
        pres.topic = "me".to_string();
        let mut msg = ServerMsg::new(ServerPayload::Pres(pres), time_now());
        msg.skip_sid = skip_sid.to_string();
        self.ctx.route(&uid.me_name(), msg);
    }

    /// Route a `{pres}` about `src` to a user's `me` topic without topic
    /// context (counterpart updates on unsubscribe and mute).
    pub(crate) fn route_user_pres(&self, to: Uid, src: &str, what: &str) {
        let pres = MsgPres {
            topic: "me".to_string(),
            src: src.to_string(),
            what: what.to_string(),
            single_user: to,
            ..Default::default()
        };
        self.ctx
            .route(&to.me_name(), ServerMsg::new(ServerPayload::Pres(pres), time_now()));
    }

    /// `me` only: announce own state to every topic of interest.
    pub(crate) fn pres_users_of_interest(&self, what: &str, user_agent: &str) {
        let me = self.me_uid();
        for key in self.per_subs.keys() {
            let dst = match topic_cat(key) {
                Some(TopicCat::Me) => {
                    // P2P contact: their 'me' topic.
                    key.clone()
                }
                Some(TopicCat::Grp) => key.clone(),
                _ => continue,
            };
            let mut pres = MsgPres {
                topic: if topic_cat(&dst) == Some(TopicCat::Me) {
                    "me".to_string()
                } else {
                    dst.clone()
                },
                src: me.user_id(),
                what: what.to_string(),
                ua: user_agent.to_string(),
                ..Default::default()
            };
            pres.want_reply = what.starts_with('?');
            self.ctx
                .route(&dst, ServerMsg::new(ServerPayload::Pres(pres), time_now()));
        }
    }

    /// Read/recv pointer moved: tell the user's other sessions through `me`.
    pub(crate) fn pres_pub_message_count(
        &self,
        uid: Uid,
        mode: AccessMode,
        recv: u64,
        read: u64,
        skip_sid: &str,
    ) {
        let (what, seq) = if read > 0 { ("read", read) } else { ("recv", recv) };
        self.pres_single_user_offline(
            uid,
            mode,
            what,
            &PresParams {
                seq,
                ..Default::default()
            },
            skip_sid,
            false,
        );
    }

    /// Soft deletion applied: tell the user's other sessions through `me`.
    pub(crate) fn pres_pub_message_delete(
        &self,
        uid: Uid,
        mode: AccessMode,
        del_id: u64,
        ranges: &[crate::types::DelRange],
        skip_sid: &str,
    ) {
        self.pres_single_user_offline(
            uid,
            mode,
            "del",
            &PresParams {
                del_id,
                del_seq: ranges.to_vec(),
                ..Default::default()
            },
            skip_sid,
            false,
        );
    }

    /// A subscription changed (created, deleted, or permissions adjusted):
    /// notify admins, the affected user, and handle mute transitions.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn notify_sub_change(
        &self,
        uid: Uid,
        actor: Uid,
        is_chan: bool,
        old_want: AccessMode,
        old_given: AccessMode,
        new_want: AccessMode,
        new_given: AccessMode,
        skip_sid: &str,
    ) {
        let unsub = !new_want.is_defined() || !new_given.is_defined();
        let target = uid.user_id();

        let d_want = if new_want.is_defined() {
            if old_want.is_defined() && !old_want.is_zero() {
                old_want.delta(new_want)
            } else {
                new_want.to_string()
            }
        } else {
            AccessMode::NONE.to_string()
        };
        let d_given = if new_given.is_defined() {
            if old_given.is_defined() && !old_given.is_zero() {
                old_given.delta(new_given)
            } else {
                new_given.to_string()
            }
        } else {
            AccessMode::NONE.to_string()
        };

        let params = PresParams {
            target: target.clone(),
            actor: actor.user_id(),
            d_want,
            d_given,
            ..Default::default()
        };
        let filter = PresFilters {
            filter_in: AccessMode::C_SHARER,
            exclude_user: uid,
            ..Default::default()
        };

        // Admins online in the topic.
        self.pres_subs_online("acs", &target, &params, &filter, skip_sid);

        // Admins on 'me' when approval might be needed.
        if new_want.better_than(new_given) || old_want == AccessMode::NONE {
            self.pres_subs_offline("acs", &params, &filter, &filter, skip_sid, true);
        }

        let old_mode = if old_want.is_defined() && old_given.is_defined() {
            old_want & old_given
        } else {
            AccessMode::NONE
        };
        let new_mode = if unsub {
            AccessMode::NONE
        } else {
            new_want & new_given
        };

        if unsub {
            if self.cat == TopicCat::P2P {
                if let Some(uid2) = self.p2p_other_user(uid) {
                    self.pres_single_user_offline(
                        uid,
                        AccessMode::C_P2P,
                        "gone",
                        &PresParams::default(),
                        skip_sid,
                        false,
                    );
                    self.route_user_pres(uid2, &target, "off");
                }
            } else if self.cat == TopicCat::Grp && !is_chan {
                self.pres_subs_online("off", &target, &PresParams::default(), &filter, skip_sid);
            }
        } else if !new_mode.is_presencer() && old_mode.is_presencer() {
            // Muted: tell the user to discard updates from this source.
            let source = if self.cat == TopicCat::P2P {
                self.p2p_other_user(uid).map(|u| u.user_id())
            } else if self.cat == TopicCat::Grp && !is_chan {
                Some(self.name.clone())
            } else {
                None
            };
            if let Some(source) = source {
                self.route_user_pres(uid, &source, "off+dis");
            }
        } else if new_mode.is_presencer() && !old_mode.is_presencer() {
            // Un-muted: hook the user back up.
            if self.cat == TopicCat::Grp && !is_chan {
                self.pres_single_user_offline(
                    uid,
                    new_mode,
                    "?unkn+en",
                    &PresParams::default(),
                    "",
                    false,
                );
            } else if self.cat == TopicCat::Me {
                self.pres_users_of_interest("on+en", &self.user_agent);
            }
        }

        if !unsub {
            self.pres_subs_online_direct(
                "acs",
                &params,
                &PresFilters {
                    single_user: uid,
                    ..Default::default()
                },
                skip_sid,
            );
            self.pres_single_user_offline(uid, new_mode, "acs", &params, skip_sid, true);
        }
    }

    /// Populate the contact list of a `me` topic from the user's
    /// subscriptions.
    pub(crate) async fn load_contacts(&mut self, uid: Uid) -> Result<(), crate::store::StoreError> {
        let subs = self
            .ctx
            .store
            .users
            .get_topics(uid, &Default::default())
            .await?;
        for sub in subs {
            let key = if !sub.with.is_empty() {
                crate::types::parse_user_id(&sub.with)
                    .map(|u| u.me_name())
                    .unwrap_or_else(|| sub.with.clone())
            } else {
                sub.topic.clone()
            };
            let enabled = (sub.mode_want & sub.mode_given).is_presencer();
            self.per_subs.insert(
                key,
                PerSubsData {
                    online: false,
                    enabled,
                },
            );
        }
        Ok(())
    }

    /// Pre-process an incoming `{pres}` `what` token. May update the contact
    /// list, reply with own status, and rewrite or drop the token (empty
    /// return means "do not forward to sessions").
    pub(crate) fn pres_proc_req(&mut self, src: &str, what: &str, want_reply: bool) -> String {
        let (base, cmd) = split_what(what);

        if self.cat != TopicCat::Me {
            // Non-'me' topics only answer status queries.
            if base.starts_with('?') {
                if let Some(asker) = crate::types::parse_user_id(src) {
                    let status = if self.is_online() { "on" } else { "off" };
                    self.route_user_pres(asker, &self.name, status);
                }
                return String::new();
            }
            return what.to_string();
        }

        let me = self.me_uid();

        if base.starts_with('?') {
            // Status query from a contact; reply, don't forward.
            let enabled = {
                let entry = self.per_subs.entry(src.to_string()).or_default();
                match cmd {
                    "+en" => entry.enabled = true,
                    "+dis" => entry.enabled = false,
                    _ => {}
                }
                if base == "?none" {
                    entry.online = false;
                }
                entry.enabled
            };
            let status = if self.is_online() { "on" } else { "off" };
            let reply = if enabled {
                format!("{}+en", status)
            } else {
                status.to_string()
            };
            if src != me.me_name() && !src.is_empty() {
                self.ctx.route(
                    src,
                    ServerMsg::new(
                        ServerPayload::Pres(MsgPres {
                            topic: if topic_cat(src) == Some(TopicCat::Me) {
                                "me".to_string()
                            } else {
                                src.to_string()
                            },
                            src: me.user_id(),
                            what: reply,
                            ..Default::default()
                        }),
                        time_now(),
                    ),
                );
            }
            return String::new();
        }

        let entry = self.per_subs.entry(src.to_string()).or_default();
        match cmd {
            "+en" => entry.enabled = true,
            "+dis" => entry.enabled = false,
            _ => {}
        }

        let online = match base {
            "on" => Some(true),
            "off" | "gone" => Some(false),
            _ => None,
        };
        if let Some(on) = online {
            if entry.online == on && cmd.is_empty() && base != "gone" {
                // No state change, nothing to report.
                return String::new();
            }
            entry.online = on;
        }

        let enabled = entry.enabled;

        if want_reply {
            let status = if self.is_online() { "on" } else { "off" };
            if let Some(asker) = crate::types::parse_user_id(src) {
                self.route_user_pres(asker, &me.user_id(), status);
            }
        }

        if !enabled && base != "gone" && base != "acs" {
            return String::new();
        }
        base.to_string()
    }
}
