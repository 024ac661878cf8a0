//! In-memory store adapter
//!
//! Implements the whole store contract with maps behind a single RwLock.
//! Used by tests and single-node development; not durable. The `(topic, seq)`
//! unique constraint is enforced the same way a database index would be.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    Credential, Message, QueryOpts, Store, StoreError, StoreResult, Subscription, SubUpdate,
    TopicRec, TopicUpdate, User, Users, UserUpdate,
};
use crate::types::{DelRange, Uid, normalize_ranges};

#[derive(Default)]
struct State {
    users: HashMap<Uid, User>,
    creds: HashMap<Uid, Vec<Credential>>,
    last_seen: HashMap<Uid, (DateTime<Utc>, String)>,
    topics: HashMap<String, TopicRec>,
    subs: HashMap<(String, Uid), Subscription>,
    messages: HashMap<String, BTreeMap<u64, Message>>,
    del_log: HashMap<String, Vec<DelLogEntry>>,
}

struct DelLogEntry {
    del_id: u64,
    /// Zero uid means hard delete.
    for_user: Uid,
    ranges: Vec<DelRange>,
}

/// Shared in-memory state behind the four trait objects.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this adapter into a [`Store`] handle.
    pub fn handle(&self) -> Store {
        Store {
            users: Arc::new(self.clone()),
            topics: Arc::new(self.clone()),
            subs: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
        }
    }

    /// Test/dev seeding helper.
    pub async fn put_user(&self, user: User) {
        self.state.write().await.users.insert(user.uid, user);
    }

    /// Test/dev seeding helper.
    pub async fn put_topic(&self, rec: TopicRec) {
        self.state.write().await.topics.insert(rec.name.clone(), rec);
    }

    /// Test/dev seeding helper.
    pub async fn put_sub(&self, sub: Subscription) {
        self.state
            .write()
            .await
            .subs
            .insert((sub.topic.clone(), sub.user), sub);
    }

    pub async fn put_creds(&self, uid: Uid, creds: Vec<Credential>) {
        self.state.write().await.creds.insert(uid, creds);
    }
}

fn denormalize(state: &State, sub: &Subscription) -> Subscription {
    let mut out = sub.clone();
    if let Some(topic) = state.topics.get(&sub.topic) {
        out.seq_id = topic.seq_id;
        out.touched = topic.touched;
        out.public = topic.public.clone();
    }
    if let Some((u1, u2)) = crate::types::parse_p2p(&sub.topic) {
        let other = if sub.user == u1 { u2 } else { u1 };
        out.with = other.user_id();
        out.public = state.users.get(&other).and_then(|u| u.public.clone());
        out.last_seen = state.last_seen.get(&other).cloned();
    }
    out
}

fn page<T>(mut items: Vec<T>, opts: &QueryOpts) -> Vec<T> {
    if opts.limit > 0 && items.len() > opts.limit {
        items.truncate(opts.limit);
    }
    items
}

#[async_trait]
impl Users for MemoryStore {
    async fn get(&self, uid: Uid) -> StoreResult<Option<User>> {
        Ok(self.state.read().await.users.get(&uid).cloned())
    }

    async fn get_all(&self, uids: &[Uid]) -> StoreResult<Vec<User>> {
        let state = self.state.read().await;
        Ok(uids
            .iter()
            .filter_map(|uid| state.users.get(uid).cloned())
            .collect())
    }

    async fn get_topics(&self, uid: Uid, opts: &QueryOpts) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let subs = state
            .subs
            .values()
            .filter(|s| s.user == uid && s.deleted_at.is_none())
            .map(|s| denormalize(&state, s))
            .collect();
        Ok(page(subs, opts))
    }

    async fn get_topics_any(&self, uid: Uid, opts: &QueryOpts) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let subs = state
            .subs
            .values()
            .filter(|s| s.user == uid)
            .map(|s| denormalize(&state, s))
            .collect();
        Ok(page(subs, opts))
    }

    async fn find_subs(
        &self,
        uid: Uid,
        req: &[Vec<String>],
        opt: &[String],
    ) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let matches = |tags: &[String]| -> bool {
            let all_groups = req
                .iter()
                .all(|group| group.iter().any(|t| tags.contains(t)));
            let any_opt = opt.is_empty() || opt.iter().any(|t| tags.contains(t));
            if req.is_empty() {
                !opt.is_empty() && opt.iter().any(|t| tags.contains(t))
            } else {
                all_groups && any_opt
            }
        };

        let mut found = Vec::new();
        for user in state.users.values() {
            if user.uid != uid && matches(&user.tags) {
                found.push(Subscription {
                    user: user.uid,
                    topic: user.uid.user_id(),
                    public: user.public.clone(),
                    mode_want: crate::access::AccessMode::UNSET,
                    mode_given: crate::access::AccessMode::UNSET,
                    ..Default::default()
                });
            }
        }
        for topic in state.topics.values() {
            if matches(&topic.tags) {
                found.push(Subscription {
                    topic: if topic.is_chan {
                        crate::types::grp_to_chn(&topic.name)
                    } else {
                        topic.name.clone()
                    },
                    public: topic.public.clone(),
                    mode_want: crate::access::AccessMode::UNSET,
                    mode_given: crate::access::AccessMode::UNSET,
                    ..Default::default()
                });
            }
        }
        Ok(found)
    }

    async fn update(&self, uid: Uid, upd: UserUpdate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user = state.users.get_mut(&uid).ok_or(StoreError::NotFound)?;
        if let Some(public) = upd.public {
            user.public = Some(public);
        }
        if let Some(access) = upd.access {
            user.access = access;
        }
        if let Some(tags) = upd.tags {
            user.tags = tags;
        }
        if let Some(updated) = upd.updated {
            user.updated = updated;
        }
        Ok(())
    }

    async fn update_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&uid) {
            return Err(StoreError::NotFound);
        }
        state.last_seen.insert(uid, (when, user_agent.to_string()));
        Ok(())
    }

    async fn get_all_creds(&self, uid: Uid) -> StoreResult<Vec<Credential>> {
        Ok(self
            .state
            .read()
            .await
            .creds
            .get(&uid)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl super::Topics for MemoryStore {
    async fn get(&self, name: &str) -> StoreResult<Option<TopicRec>> {
        Ok(self.state.read().await.topics.get(name).cloned())
    }

    async fn create(&self, rec: TopicRec) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.topics.contains_key(&rec.name) {
            return Err(StoreError::Duplicate);
        }
        state.topics.insert(rec.name.clone(), rec);
        Ok(())
    }

    async fn update(&self, name: &str, upd: TopicUpdate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let topic = state.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        if let Some(public) = upd.public {
            topic.public = Some(public);
        }
        if let Some(access) = upd.access {
            topic.access = access;
        }
        if let Some(tags) = upd.tags {
            topic.tags = tags;
        }
        if let Some(seq_id) = upd.seq_id {
            topic.seq_id = seq_id;
        }
        if let Some(del_id) = upd.del_id {
            topic.del_id = del_id;
        }
        if let Some(touched) = upd.touched {
            topic.touched = Some(touched);
        }
        if let Some(updated) = upd.updated {
            topic.updated = updated;
        }
        Ok(())
    }

    async fn get_subs(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let subs = state
            .subs
            .values()
            .filter(|s| s.topic == name && s.deleted_at.is_none())
            .cloned()
            .collect();
        Ok(page(subs, opts))
    }

    async fn get_subs_any(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let subs = state
            .subs
            .values()
            .filter(|s| s.topic == name)
            .cloned()
            .collect();
        Ok(page(subs, opts))
    }

    async fn get_users(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let subs = state
            .subs
            .values()
            .filter(|s| s.topic == name && s.deleted_at.is_none())
            .map(|s| {
                let mut out = s.clone();
                out.public = state.users.get(&s.user).and_then(|u| u.public.clone());
                out
            })
            .collect();
        Ok(page(subs, opts))
    }

    async fn get_users_any(&self, name: &str, opts: &QueryOpts) -> StoreResult<Vec<Subscription>> {
        let state = self.state.read().await;
        let subs = state
            .subs
            .values()
            .filter(|s| s.topic == name)
            .map(|s| {
                let mut out = s.clone();
                out.public = state.users.get(&s.user).and_then(|u| u.public.clone());
                out
            })
            .collect();
        Ok(page(subs, opts))
    }

    async fn owner_change(&self, name: &str, new_owner: Uid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let topic = state.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        topic.owner = new_owner;
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.topics.remove(name).is_none() {
            return Err(StoreError::NotFound);
        }
        state.subs.retain(|(topic, _), _| topic != name);
        state.messages.remove(name);
        state.del_log.remove(name);
        Ok(())
    }
}

#[async_trait]
impl super::Subs for MemoryStore {
    async fn get(&self, topic: &str, uid: Uid) -> StoreResult<Option<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .subs
            .get(&(topic.to_string(), uid))
            .cloned())
    }

    async fn create(&self, sub: Subscription) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = (sub.topic.clone(), sub.user);
        if let Some(existing) = state.subs.get(&key)
            && existing.deleted_at.is_none()
        {
            return Err(StoreError::Duplicate);
        }
        state.subs.insert(key, sub);
        Ok(())
    }

    async fn update(
        &self,
        topic: &str,
        uid: Uid,
        upd: SubUpdate,
        undelete: bool,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let sub = state
            .subs
            .get_mut(&(topic.to_string(), uid))
            .ok_or(StoreError::NotFound)?;
        if let Some(want) = upd.mode_want {
            sub.mode_want = want;
        }
        if let Some(given) = upd.mode_given {
            sub.mode_given = given;
        }
        if let Some(private) = upd.private {
            sub.private = private;
        }
        if let Some(read_seq) = upd.read_seq {
            sub.read_seq = read_seq;
        }
        if let Some(recv_seq) = upd.recv_seq {
            sub.recv_seq = recv_seq;
        }
        if let Some(del_id) = upd.del_id {
            sub.del_id = del_id;
        }
        if undelete {
            sub.deleted_at = None;
        }
        sub.updated = Utc::now();
        Ok(())
    }

    async fn delete(&self, topic: &str, uid: Uid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let sub = state
            .subs
            .get_mut(&(topic.to_string(), uid))
            .ok_or(StoreError::NotFound)?;
        if sub.deleted_at.is_some() {
            return Err(StoreError::NotFound);
        }
        sub.deleted_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl super::Messages for MemoryStore {
    async fn save(&self, mut msg: Message, reader: bool) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let log = state.messages.entry(msg.topic.clone()).or_default();
        if log.contains_key(&msg.seq) {
            return Err(StoreError::Duplicate);
        }
        if !reader {
            msg.deleted_for.push(msg.from);
        }
        let (topic, seq, created) = (msg.topic.clone(), msg.seq, msg.created);
        log.insert(msg.seq, msg);
        // Mirror the seq counter onto the topic row, like a trigger would.
        if let Some(rec) = state.topics.get_mut(&topic)
            && seq > rec.seq_id
        {
            rec.seq_id = seq;
            rec.touched = Some(created);
        }
        Ok(())
    }

    async fn get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> StoreResult<Vec<Message>> {
        let state = self.state.read().await;
        let Some(log) = state.messages.get(topic) else {
            return Ok(Vec::new());
        };
        let before = if opts.before > 0 { opts.before } else { u64::MAX };
        let since = opts.since.max(1);
        if since >= before {
            return Ok(Vec::new());
        }
        let mut out: Vec<Message> = log
            .range(since..before)
            .map(|(_, m)| m)
            .filter(|m| !m.hard_deleted && !m.deleted_for.contains(&for_user))
            .cloned()
            .collect();
        // Most recent first, as history pages are served newest-first.
        out.reverse();
        Ok(page(out, opts))
    }

    async fn get_deleted(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> StoreResult<(Vec<DelRange>, u64)> {
        let state = self.state.read().await;
        let Some(entries) = state.del_log.get(topic) else {
            return Ok((Vec::new(), 0));
        };
        let mut ranges = Vec::new();
        let mut del_id = 0;
        for entry in entries {
            if opts.since > 0 && entry.del_id < opts.since {
                continue;
            }
            if entry.for_user.is_zero() || entry.for_user == for_user {
                ranges.extend_from_slice(&entry.ranges);
                del_id = del_id.max(entry.del_id);
            }
        }
        Ok((normalize_ranges(ranges), del_id))
    }

    async fn delete_list(
        &self,
        topic: &str,
        del_id: u64,
        for_user: Uid,
        ranges: &[DelRange],
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(log) = state.messages.get_mut(topic) {
            for range in ranges {
                let hi = if range.hi == 0 { range.low + 1 } else { range.hi };
                for (_, msg) in log.range_mut(range.low..hi) {
                    if for_user.is_zero() {
                        msg.hard_deleted = true;
                        msg.content = serde_json::Value::Null;
                        msg.head = None;
                    } else if !msg.deleted_for.contains(&for_user) {
                        msg.deleted_for.push(for_user);
                    }
                }
            }
        }
        state.del_log.entry(topic.to_string()).or_default().push(DelLogEntry {
            del_id,
            for_user,
            ranges: ranges.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Messages, Subs, Topics};
    use super::*;
    use crate::access::AccessMode;

    fn msg(topic: &str, seq: u64, from: Uid) -> Message {
        Message {
            topic: topic.into(),
            seq,
            created: Utc::now(),
            from,
            content: serde_json::json!("hello"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_seq_rejected() {
        let store = MemoryStore::new();
        store.save(msg("grp1", 1, Uid(1)), true).await.unwrap();
        let err = store.save(msg("grp1", 1, Uid(2)), true).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));
    }

    #[tokio::test]
    async fn test_save_without_read_access_hides_from_sender() {
        let store = MemoryStore::new();
        store.save(msg("grp1", 1, Uid(1)), false).await.unwrap();
        let for_sender = Messages::get_all(&store, "grp1", Uid(1), &QueryOpts::default())
            .await
            .unwrap();
        assert!(for_sender.is_empty());
        let for_other = Messages::get_all(&store, "grp1", Uid(2), &QueryOpts::default())
            .await
            .unwrap();
        assert_eq!(for_other.len(), 1);
    }

    #[tokio::test]
    async fn test_soft_and_hard_delete() {
        let store = MemoryStore::new();
        for seq in 1..=4 {
            store.save(msg("grp1", seq, Uid(1)), true).await.unwrap();
        }
        // Soft delete 1..3 for user 2.
        store
            .delete_list("grp1", 1, Uid(2), &[DelRange { low: 1, hi: 3 }])
            .await
            .unwrap();
        assert_eq!(
            Messages::get_all(&store, "grp1", Uid(2), &QueryOpts::default())
                .await
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            Messages::get_all(&store, "grp1", Uid(1), &QueryOpts::default())
                .await
                .unwrap()
                .len(),
            4
        );
        // Hard delete message 4 for everyone.
        store
            .delete_list("grp1", 2, Uid::ZERO, &[DelRange { low: 4, hi: 0 }])
            .await
            .unwrap();
        assert_eq!(
            Messages::get_all(&store, "grp1", Uid(1), &QueryOpts::default())
                .await
                .unwrap()
                .len(),
            3
        );

        let (ranges, del_id) = store
            .get_deleted("grp1", Uid(2), &QueryOpts::default())
            .await
            .unwrap();
        assert_eq!(del_id, 2);
        assert_eq!(ranges, vec![DelRange { low: 1, hi: 3 }, DelRange { low: 4, hi: 0 }]);
    }

    #[tokio::test]
    async fn test_sub_delete_is_soft_and_idempotent_error() {
        let store = MemoryStore::new();
        store
            .put_sub(Subscription {
                user: Uid(1),
                topic: "grp1".into(),
                mode_want: AccessMode::C_PUBLIC,
                mode_given: AccessMode::C_PUBLIC,
                ..Default::default()
            })
            .await;
        Subs::delete(&store, "grp1", Uid(1)).await.unwrap();
        let err = Subs::delete(&store, "grp1", Uid(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        // Row still exists for cache-managing clients.
        let sub = Subs::get(&store, "grp1", Uid(1)).await.unwrap().unwrap();
        assert!(sub.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_owner_change() {
        let store = MemoryStore::new();
        store
            .put_topic(TopicRec {
                name: "grp1".into(),
                owner: Uid(1),
                ..Default::default()
            })
            .await;
        Topics::owner_change(&store, "grp1", Uid(2)).await.unwrap();
        let rec = Topics::get(&store, "grp1").await.unwrap().unwrap();
        assert_eq!(rec.owner, Uid(2));
    }

    #[tokio::test]
    async fn test_find_subs_by_tags() {
        let store = MemoryStore::new();
        store
            .put_user(User {
                uid: Uid(7),
                tags: vec!["email:a@b.c".into(), "travel".into()],
                ..Default::default()
            })
            .await;
        store
            .put_topic(TopicRec {
                name: "grp9".into(),
                tags: vec!["travel".into()],
                ..Default::default()
            })
            .await;
        let found = Users::find_subs(&store, Uid(1), &[vec!["travel".into()]], &[])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }
}
