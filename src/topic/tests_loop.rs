//! Topic state machine tests
//!
//! Drive the handlers directly against a loaded topic backed by the
//! in-memory store, with real session queues on the receiving end.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::access::AccessMode;
use crate::hub::Hub;
use crate::proto::{
    ClientMsg, ClientPayload, MsgClientDel, MsgClientLeave, MsgClientSet, MsgClientSub, MsgData,
    MsgInfo, MsgSetQuery, MsgSetSub, ServerMsg, ServerPayload,
};
use crate::push::PushRegistry;
use crate::session::{MuxEvent, Proto, Session, SessionReceivers};
use crate::store::{DefaultAccess, MemoryStore, Subscription, TopicRec, User};
use crate::types::{DelRange, Uid, grp_to_chn, time_now};

use super::{SessionJoin, SessionLeave, Topic, TopicReceivers, TopicStatus, topic_channels};

const A: Uid = Uid(0xa1);
const B: Uid = Uid(0xb2);
const C: Uid = Uid(0xc3);

struct Fixture {
    store: MemoryStore,
    topic: Topic,
    rx: TopicReceivers,
    _mux_rx: mpsc::Receiver<MuxEvent>,
}

async fn seed_user(store: &MemoryStore, uid: Uid) {
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

async fn seed_sub(store: &MemoryStore, topic: &str, uid: Uid, want: &str, given: &str) {
    store
        .put_sub(Subscription {
            user: uid,
            topic: topic.to_string(),
            created: time_now(),
            updated: time_now(),
            mode_want: want.parse().unwrap(),
            mode_given: given.parse().unwrap(),
            ..Default::default()
        })
        .await;
}

/// Group topic `grp1` owned by A, with B as a plain member.
async fn grp_fixture(is_chan: bool) -> Fixture {
    let store = MemoryStore::new();
    seed_user(&store, A).await;
    seed_user(&store, B).await;
    seed_user(&store, C).await;
    store
        .put_topic(TopicRec {
            name: "grp1".into(),
            created: time_now(),
            updated: time_now(),
            owner: A,
            access: DefaultAccess {
                auth: AccessMode::C_PUBLIC,
                anon: AccessMode::NONE,
            },
            is_chan,
            ..Default::default()
        })
        .await;
    seed_sub(&store, "grp1", A, "JRWPASDO", "JRWPASDO").await;
    seed_sub(&store, "grp1", B, "JRWPS", "JRWPS").await;

    let hub = Hub::new(
        store.handle(),
        PushRegistry::new(),
        crate::config::Limits {
            idle_master_topic_timeout: 300,
            ..Default::default()
        },
        None,
        None,
    );

    let (tx, rx) = topic_channels();
    let (mux_tx, mux_rx) = mpsc::channel(16);
    let status = Arc::new(TopicStatus::default());
    let topic = Topic::load(hub.ctx.clone(), "grp1", tx, status, mux_tx)
        .await
        .unwrap();

    Fixture {
        store,
        topic,
        rx,
        _mux_rx: mux_rx,
    }
}

fn sub_pkt(uid: Uid, original: &str, mode: &str) -> ClientMsg {
    let set = if mode.is_empty() {
        None
    } else {
        Some(MsgSetQuery {
            sub: Some(MsgSetSub {
                mode: mode.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
    };
    ClientMsg {
        payload: ClientPayload::Sub(MsgClientSub {
            id: "1".into(),
            topic: original.to_string(),
            set,
            ..Default::default()
        }),
        id: "1".into(),
        original: original.to_string(),
        rcpt_to: "grp1".into(),
        as_user: uid,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    }
}

fn data_msg(uid: Uid, sess: &Arc<Session>, content: &str) -> ServerMsg {
    let mut msg = ServerMsg::new(
        ServerPayload::Data(MsgData {
            topic: "grp1".into(),
            from: uid.user_id(),
            ts: time_now(),
            seq: 0,
            head: None,
            content: serde_json::json!(content),
        }),
        time_now(),
    );
    msg.id = "p1".into();
    msg.as_user = uid;
    msg.sess = Some(sess.clone());
    msg
}

fn note_msg(uid: Uid, sess: &Arc<Session>, what: &str, seq: u64) -> ServerMsg {
    let mut msg = ServerMsg::new(
        ServerPayload::Info(MsgInfo {
            topic: "grp1".into(),
            from: uid.user_id(),
            what: what.to_string(),
            seq,
        }),
        time_now(),
    );
    msg.as_user = uid;
    msg.skip_sid = sess.sid.clone();
    msg.sess = Some(sess.clone());
    msg
}

async fn join(topic: &mut Topic, sess: &Arc<Session>, pkt: ClientMsg) {
    topic
        .handle_subscription(&SessionJoin {
            sess: sess.clone(),
            pkt,
        })
        .await
        .unwrap();
}

fn new_session(uid: Uid) -> (Arc<Session>, SessionReceivers) {
    Session::with_queue_size(uid, Proto::Websock, "test-agent", 16)
}

/// Drain one queued message, failing when the queue is empty.
fn recv(rx: &mut SessionReceivers) -> ServerMsg {
    rx.send.try_recv().expect("expected a queued message")
}

fn drain(rx: &mut SessionReceivers) -> Vec<ServerMsg> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.send.try_recv() {
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn test_basic_publish_flow() {
    let mut fx = grp_fixture(false).await;

    let (a1, mut a1_rx) = new_session(A);
    let (a2, mut a2_rx) = new_session(A);
    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &a2, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut a1_rx);
    drain(&mut a2_rx);
    drain(&mut b1_rx);

    fx.topic.handle_broadcast(data_msg(A, &a1, "hi")).await;

    // Publisher gets the ack first, then the echoed data.
    let ack = recv(&mut a1_rx);
    let ctrl = ack.ctrl().unwrap();
    assert_eq!(ctrl.code, 202);
    assert_eq!(ctrl.params.as_ref().unwrap()["seq"], 1);
    assert_eq!(recv(&mut a1_rx).data().unwrap().seq, 1);

    // Other sessions get the data message.
    let got = recv(&mut a2_rx);
    let data = got.data().unwrap();
    assert_eq!(data.seq, 1);
    assert_eq!(data.from, A.user_id());
    assert_eq!(data.content, serde_json::json!("hi"));
    assert_eq!(recv(&mut b1_rx).data().unwrap().seq, 1);

    // Seq ids are strictly monotonic.
    fx.topic.handle_broadcast(data_msg(A, &a1, "again")).await;
    let ack = recv(&mut a1_rx);
    assert_eq!(ack.ctrl().unwrap().params.as_ref().unwrap()["seq"], 2);

    // B reads message 1; A's sessions see the receipt.
    drain(&mut a1_rx);
    drain(&mut a2_rx);
    drain(&mut b1_rx);
    fx.topic.handle_broadcast(note_msg(B, &b1, "read", 1)).await;
    let got = recv(&mut a1_rx);
    let info = got.info().unwrap();
    assert_eq!(info.what, "read");
    assert_eq!(info.seq, 1);
    assert_eq!(info.from, B.user_id());
    // The reader's own session is skipped.
    assert!(b1_rx.send.try_recv().is_err());

    assert_eq!(fx.topic.per_user[&B].read_id, 1);
    assert_eq!(fx.topic.per_user[&B].recv_id, 1);
}

#[tokio::test]
async fn test_read_recv_monotonic() {
    let mut fx = grp_fixture(false).await;
    let (a1, _a1_rx) = new_session(A);
    let (b1, _b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;

    for i in 0..3 {
        fx.topic
            .handle_broadcast(data_msg(A, &a1, &format!("m{}", i)))
            .await;
    }
    assert_eq!(fx.topic.last_seq, 3);

    fx.topic.handle_broadcast(note_msg(B, &b1, "read", 2)).await;
    assert_eq!(fx.topic.per_user[&B].read_id, 2);
    assert_eq!(fx.topic.per_user[&B].recv_id, 2);

    // Stale and bogus pointers are ignored.
    fx.topic.handle_broadcast(note_msg(B, &b1, "read", 1)).await;
    fx.topic.handle_broadcast(note_msg(B, &b1, "recv", 1)).await;
    fx.topic.handle_broadcast(note_msg(B, &b1, "read", 9)).await;
    assert_eq!(fx.topic.per_user[&B].read_id, 2);
    assert_eq!(fx.topic.per_user[&B].recv_id, 2);

    // recv never trails read.
    fx.topic.handle_broadcast(note_msg(B, &b1, "read", 3)).await;
    let pud = &fx.topic.per_user[&B];
    assert!(pud.read_id <= pud.recv_id && pud.recv_id <= fx.topic.last_seq);
    assert_eq!(pud.read_id, 3);
}

#[tokio::test]
async fn test_online_counter() {
    let mut fx = grp_fixture(false).await;
    let (a1, _r1) = new_session(A);
    let (a2, _r2) = new_session(A);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &a2, sub_pkt(A, "grp1", "")).await;
    assert_eq!(fx.topic.per_user[&A].online, 2);

    // Background sessions do not count.
    let (a3, _r3) = new_session(A);
    a3.set_background(true);
    join(&mut fx.topic, &a3, sub_pkt(A, "grp1", "")).await;
    assert_eq!(fx.topic.per_user[&A].online, 2);

    fx.topic
        .handle_leave_request(SessionLeave {
            sess: a1.clone(),
            pkt: None,
        })
        .await;
    assert_eq!(fx.topic.per_user[&A].online, 1);

    // Repeating the leave for an already-detached session changes nothing.
    fx.topic
        .handle_leave_request(SessionLeave {
            sess: a1,
            pkt: None,
        })
        .await;
    assert_eq!(fx.topic.per_user[&A].online, 1);
}

#[tokio::test]
async fn test_foreground_transition_counts_online() {
    let mut fx = grp_fixture(false).await;
    let (b1, mut b1_rx) = new_session(B);
    b1.set_background(true);
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    assert_eq!(fx.topic.per_user[&B].online, 0);

    b1.set_background(false);
    fx.topic.sess_to_foreground(&b1).await;
    assert_eq!(fx.topic.per_user[&B].online, 1);
    drain(&mut b1_rx);
}

#[tokio::test]
async fn test_ownership_transfer() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut a1_rx);
    drain(&mut b1_rx);

    // Owner grants B everything including O.
    let set_pkt = ClientMsg {
        payload: ClientPayload::Set(MsgClientSet {
            id: "2".into(),
            topic: "grp1".into(),
            query: MsgSetQuery {
                sub: Some(MsgSetSub {
                    user: B.user_id(),
                    mode: "JRWPASDO".into(),
                }),
                ..Default::default()
            },
        }),
        id: "2".into(),
        original: "grp1".into(),
        rcpt_to: "grp1".into(),
        as_user: A,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    };
    fx.topic.reply_set_sub(&a1, &set_pkt).await.unwrap();

    // B accepts by requesting O.
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "JRWPASDO")).await;

    assert_eq!(fx.topic.owner, B);
    let owners: Vec<Uid> = fx
        .topic
        .per_user
        .iter()
        .filter(|(_, pud)| (pud.mode_want & pud.mode_given).is_owner())
        .map(|(uid, _)| *uid)
        .collect();
    assert_eq!(owners, vec![B]);

    // The store agrees: exactly one row carries O, and the topic row moved.
    let rec = crate::store::Topics::get(&fx.store, "grp1").await.unwrap().unwrap();
    assert_eq!(rec.owner, B);
    let sub_a = crate::store::Subs::get(&fx.store, "grp1", A).await.unwrap().unwrap();
    let sub_b = crate::store::Subs::get(&fx.store, "grp1", B).await.unwrap().unwrap();
    assert!(!sub_a.mode_given.is_owner());
    assert!(sub_b.mode_given.is_owner() && sub_b.mode_want.is_owner());
}

#[tokio::test]
async fn test_owner_cannot_self_ban_or_unown() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    drain(&mut a1_rx);

    let result = fx
        .topic
        .handle_subscription(&SessionJoin {
            sess: a1.clone(),
            pkt: sub_pkt(A, "grp1", "JRWPASD"),
        })
        .await;
    assert!(result.is_err());
    let reply = recv(&mut a1_rx);
    assert_eq!(reply.ctrl().unwrap().code, 403);
    assert!(fx.topic.per_user[&A].mode_want.is_owner());
}

#[tokio::test]
async fn test_muted_subscriber_pres_filter() {
    let mut fx = grp_fixture(false).await;
    // B never asked for P.
    fx.store
        .put_sub(Subscription {
            user: B,
            topic: "grp1".into(),
            mode_want: "JRW".parse().unwrap(),
            mode_given: "JRWPS".parse().unwrap(),
            ..Default::default()
        })
        .await;
    let (tx, rx) = topic_channels();
    let (mux_tx, _mux_rx) = mpsc::channel(16);
    fx.topic = Topic::load(
        fx.topic.ctx.clone(),
        "grp1",
        tx,
        Arc::new(TopicStatus::default()),
        mux_tx,
    )
    .await
    .unwrap();
    drop(rx);

    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut b1_rx);

    for what in ["on", "off", "ua", "msg"] {
        fx.topic.pres_subs_online(
            what,
            &A.user_id(),
            &crate::presence::PresParams::default(),
            &crate::presence::PresFilters::default(),
            "",
        );
        assert!(
            b1_rx.send.try_recv().is_err(),
            "muted subscriber got pres {}",
            what
        );
    }
    for what in ["gone", "acs"] {
        fx.topic.pres_subs_online(
            what,
            &A.user_id(),
            &crate::presence::PresParams::default(),
            &crate::presence::PresFilters::default(),
            "",
        );
        assert_eq!(recv(&mut b1_rx).pres().unwrap().what, what);
    }
}

#[tokio::test]
async fn test_non_reader_gets_no_data() {
    let mut fx = grp_fixture(false).await;
    fx.store
        .put_sub(Subscription {
            user: B,
            topic: "grp1".into(),
            mode_want: "JW".parse().unwrap(),
            mode_given: "JRWPS".parse().unwrap(),
            ..Default::default()
        })
        .await;
    let (tx, _rx) = topic_channels();
    let (mux_tx, _mux_rx) = mpsc::channel(16);
    fx.topic = Topic::load(
        fx.topic.ctx.clone(),
        "grp1",
        tx,
        Arc::new(TopicStatus::default()),
        mux_tx,
    )
    .await
    .unwrap();

    let (a1, mut a1_rx) = new_session(A);
    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut a1_rx);
    drain(&mut b1_rx);

    fx.topic.handle_broadcast(data_msg(A, &a1, "secret")).await;
    assert!(drain(&mut b1_rx).iter().all(|m| m.data().is_none()));
}

#[tokio::test]
async fn test_channel_reader() {
    let mut fx = grp_fixture(true).await;
    let chn = grp_to_chn("grp1");

    let (a1, mut a1_rx) = new_session(A);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;

    let (c1, mut c1_rx) = new_session(C);
    let mut pkt = sub_pkt(C, &chn, "");
    pkt.original = chn.clone();
    join(&mut fx.topic, &c1, pkt).await;
    drain(&mut a1_rx);
    drain(&mut c1_rx);

    // Channel readers are not cached as subscribers.
    assert!(!fx.topic.per_user.contains_key(&C));
    // But the reader row exists under the chn name.
    let sub = crate::store::Subs::get(&fx.store, &chn, C).await.unwrap().unwrap();
    assert_eq!(sub.mode_given, AccessMode::C_CHN_READER);

    fx.topic.handle_broadcast(data_msg(A, &a1, "anon")).await;
    let got = recv(&mut c1_rx);
    let data = got.data().unwrap();
    assert!(data.from.is_empty(), "channel data must hide the sender");
    assert_eq!(data.topic, chn);

    // Typing indicators from a reader are silently dropped.
    fx.topic.handle_broadcast(note_msg(C, &c1, "kp", 0)).await;
    drain(&mut a1_rx);
    assert!(a1_rx.send.try_recv().is_err());

    // And read receipts are not delivered to channel readers.
    drain(&mut c1_rx);
    let (b1, _b1_rx) = new_session(B);
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut c1_rx);
    fx.topic.handle_broadcast(note_msg(B, &b1, "read", 1)).await;
    assert!(c1_rx.send.try_recv().is_err());

    // del.msg from a reader is refused.
    let del_pkt = ClientMsg {
        payload: ClientPayload::Del(MsgClientDel {
            id: "9".into(),
            topic: chn.clone(),
            what: "msg".into(),
            del_seq: vec![DelRange { low: 1, hi: 0 }],
            hard: false,
            ..Default::default()
        }),
        id: "9".into(),
        original: chn.clone(),
        rcpt_to: "grp1".into(),
        as_user: C,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    };
    let result = fx.topic.reply_del_msg(&c1, C, &del_pkt).await;
    assert!(result.is_err());
    assert_eq!(recv(&mut c1_rx).ctrl().unwrap().code, 403);
}

#[tokio::test]
async fn test_soft_vs_hard_delete() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;

    for i in 0..5 {
        fx.topic
            .handle_broadcast(data_msg(A, &a1, &format!("m{}", i)))
            .await;
    }
    drain(&mut a1_rx);
    drain(&mut b1_rx);

    let del_pkt = ClientMsg {
        payload: ClientPayload::Del(MsgClientDel {
            id: "9".into(),
            topic: "grp1".into(),
            what: "msg".into(),
            del_seq: vec![DelRange { low: 1, hi: 5 }],
            hard: true,
            ..Default::default()
        }),
        id: "9".into(),
        original: "grp1".into(),
        rcpt_to: "grp1".into(),
        as_user: A,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    };
    fx.topic.reply_del_msg(&a1, A, &del_pkt).await.unwrap();

    assert_eq!(fx.topic.del_id, 1);
    for pud in fx.topic.per_user.values() {
        assert_eq!(pud.del_id, 1);
    }

    // B (a reader, not the actor) sees the {pres what="del"}.
    let msgs = drain(&mut b1_rx);
    let pres = msgs
        .iter()
        .find_map(|m| m.pres())
        .expect("expected del presence");
    assert_eq!(pres.what, "del");
    assert_eq!(pres.clear, 1);
    assert_eq!(pres.del_seq, vec![DelRange { low: 1, hi: 5 }]);

    // The actor's ack reports the new deletion transaction id.
    let msgs = drain(&mut a1_rx);
    let ctrl = msgs.iter().find_map(|m| m.ctrl()).unwrap();
    assert_eq!(ctrl.params.as_ref().unwrap()["del"], 1);

    // Messages are gone for everyone.
    let left = crate::store::Messages::get_all(&fx.store, "grp1", B, &Default::default())
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].seq, 5);
}

fn del_pkt(uid: Uid, ranges: Vec<DelRange>, hard: bool) -> ClientMsg {
    ClientMsg {
        payload: ClientPayload::Del(MsgClientDel {
            id: "9".into(),
            topic: "grp1".into(),
            what: "msg".into(),
            del_seq: ranges,
            hard,
            ..Default::default()
        }),
        id: "9".into(),
        original: "grp1".into(),
        rcpt_to: "grp1".into(),
        as_user: uid,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    }
}

#[tokio::test]
async fn test_del_msg_range_edge_encodings() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    for i in 0..5 {
        fx.topic
            .handle_broadcast(data_msg(A, &a1, &format!("m{}", i)))
            .await;
    }
    drain(&mut a1_rx);

    // low == hi addresses exactly one message.
    fx.topic
        .reply_del_msg(&a1, A, &del_pkt(A, vec![DelRange { low: 5, hi: 5 }], true))
        .await
        .unwrap();
    drain(&mut a1_rx);
    let left = crate::store::Messages::get_all(&fx.store, "grp1", A, &Default::default())
        .await
        .unwrap();
    assert_eq!(left.len(), 4);
    assert!(left.iter().all(|m| m.seq != 5));

    // A zero low bound with a real hi is a valid range.
    fx.topic
        .reply_del_msg(&a1, A, &del_pkt(A, vec![DelRange { low: 0, hi: 3 }], true))
        .await
        .unwrap();
    drain(&mut a1_rx);
    let left = crate::store::Messages::get_all(&fx.store, "grp1", A, &Default::default())
        .await
        .unwrap();
    assert_eq!(left.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 3]);

    // The fully-degenerate pair and inverted bounds are rejected.
    for bad in [DelRange { low: 0, hi: 0 }, DelRange { low: 4, hi: 3 }] {
        let result = fx
            .topic
            .reply_del_msg(&a1, A, &del_pkt(A, vec![bad], true))
            .await;
        assert!(result.is_err());
        assert_eq!(recv(&mut a1_rx).ctrl().unwrap().code, 400);
        drain(&mut a1_rx);
    }
}

#[tokio::test]
async fn test_backpressure_eviction() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    let (b1, _b1_rx) = Session::with_queue_size(B, Proto::Websock, "slow", 2);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut a1_rx);

    // The join ack took one slot; fill the other so the next fan-out fails
    // non-blockingly.
    assert!(b1.queue_out(crate::error::no_err("x", "grp1", time_now())));

    fx.topic.handle_broadcast(data_msg(A, &a1, "hi")).await;

    // A still got the ack and the echo.
    let msgs = drain(&mut a1_rx);
    assert!(msgs.iter().any(|m| m.data().is_some()));

    // B was scheduled for eviction on the unreg queue.
    let leave = fx.rx.unreg.try_recv().expect("expected eviction");
    assert_eq!(leave.sess.sid, b1.sid);
    assert!(leave.pkt.is_none());

    fx.topic.handle_leave_request(leave).await;
    assert!(!fx.topic.sessions.contains_key(&b1.sid));
    assert_eq!(fx.topic.per_user[&B].online, 0);
}

#[tokio::test]
async fn test_idempotent_leave_unsub() {
    let mut fx = grp_fixture(false).await;
    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut b1_rx);

    let leave_pkt = ClientMsg {
        payload: ClientPayload::Leave(MsgClientLeave {
            id: "5".into(),
            topic: "grp1".into(),
            unsub: true,
        }),
        id: "5".into(),
        original: "grp1".into(),
        rcpt_to: "grp1".into(),
        as_user: B,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    };

    fx.topic
        .reply_leave_unsub(&b1, Some(&leave_pkt), B)
        .await
        .unwrap();
    let msgs = drain(&mut b1_rx);
    assert_eq!(msgs.first().unwrap().ctrl().unwrap().code, 200);
    assert!(!fx.topic.per_user.contains_key(&B));

    // Doing it again is NoAction, not an error.
    fx.topic
        .reply_leave_unsub(&b1, Some(&leave_pkt), B)
        .await
        .unwrap();
    let msgs = drain(&mut b1_rx);
    let ctrl = msgs.first().unwrap().ctrl().unwrap();
    assert_eq!(ctrl.code, 304);
    assert_eq!(ctrl.text, "no action");
}

#[tokio::test]
async fn test_owner_cannot_unsub() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    drain(&mut a1_rx);

    let leave_pkt = ClientMsg {
        payload: ClientPayload::Leave(MsgClientLeave {
            id: "5".into(),
            topic: "grp1".into(),
            unsub: true,
        }),
        id: "5".into(),
        original: "grp1".into(),
        rcpt_to: "grp1".into(),
        as_user: A,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    };
    let result = fx.topic.reply_leave_unsub(&a1, Some(&leave_pkt), A).await;
    assert!(result.is_err());
    assert_eq!(recv(&mut a1_rx).ctrl().unwrap().code, 403);
    assert!(fx.topic.per_user.contains_key(&A));
}

#[tokio::test]
async fn test_note_kp_requires_write() {
    let mut fx = grp_fixture(false).await;
    // B can read but not write.
    fx.store
        .put_sub(Subscription {
            user: B,
            topic: "grp1".into(),
            mode_want: "JRP".parse().unwrap(),
            mode_given: "JRWPS".parse().unwrap(),
            ..Default::default()
        })
        .await;
    let (tx, _rx) = topic_channels();
    let (mux_tx, _mux_rx) = mpsc::channel(16);
    fx.topic = Topic::load(
        fx.topic.ctx.clone(),
        "grp1",
        tx,
        Arc::new(TopicStatus::default()),
        mux_tx,
    )
    .await
    .unwrap();

    let (a1, mut a1_rx) = new_session(A);
    let (b1, _b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut a1_rx);

    fx.topic.handle_broadcast(note_msg(B, &b1, "kp", 0)).await;
    assert!(a1_rx.send.try_recv().is_err());

    // A writer's kp is delivered to other users but not their own sessions.
    let (a2, mut a2_rx) = new_session(A);
    join(&mut fx.topic, &a2, sub_pkt(A, "grp1", "")).await;
    drain(&mut a1_rx);
    drain(&mut a2_rx);
    fx.topic.handle_broadcast(note_msg(A, &a1, "kp", 0)).await;
    assert!(a2_rx.send.try_recv().is_err(), "kp must not echo to own sessions");
}

#[tokio::test]
async fn test_publish_requires_write() {
    let mut fx = grp_fixture(false).await;
    fx.store
        .put_sub(Subscription {
            user: B,
            topic: "grp1".into(),
            mode_want: "JRP".parse().unwrap(),
            mode_given: "JRWPS".parse().unwrap(),
            ..Default::default()
        })
        .await;
    let (tx, _rx) = topic_channels();
    let (mux_tx, _mux_rx) = mpsc::channel(16);
    fx.topic = Topic::load(
        fx.topic.ctx.clone(),
        "grp1",
        tx,
        Arc::new(TopicStatus::default()),
        mux_tx,
    )
    .await
    .unwrap();

    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut b1_rx);

    fx.topic.handle_broadcast(data_msg(B, &b1, "nope")).await;
    assert_eq!(recv(&mut b1_rx).ctrl().unwrap().code, 403);
    assert_eq!(fx.topic.last_seq, 0);
}

#[tokio::test]
async fn test_eviction_on_ban() {
    let mut fx = grp_fixture(false).await;
    let (a1, mut a1_rx) = new_session(A);
    let (b1, mut b1_rx) = new_session(B);
    join(&mut fx.topic, &a1, sub_pkt(A, "grp1", "")).await;
    join(&mut fx.topic, &b1, sub_pkt(B, "grp1", "")).await;
    drain(&mut a1_rx);
    drain(&mut b1_rx);

    // Owner strips B's J bit: B is banned and all their sessions evicted.
    let set_pkt = ClientMsg {
        payload: ClientPayload::Set(MsgClientSet {
            id: "2".into(),
            topic: "grp1".into(),
            query: MsgSetQuery {
                sub: Some(MsgSetSub {
                    user: B.user_id(),
                    mode: "N".into(),
                }),
                ..Default::default()
            },
        }),
        id: "2".into(),
        original: "grp1".into(),
        rcpt_to: "grp1".into(),
        as_user: A,
        auth_lvl: crate::types::AuthLevel::Auth,
        timestamp: time_now(),
    };
    fx.topic.reply_set_sub(&a1, &set_pkt).await.unwrap();

    assert!(!fx.topic.sessions.contains_key(&b1.sid));
    let msgs = drain(&mut b1_rx);
    let evicted = msgs.iter().find_map(|m| m.ctrl()).expect("expected ctrl");
    assert_eq!(evicted.code, 205);
}
