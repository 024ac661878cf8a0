//! Error taxonomy and `{ctrl}` reply builders
//!
//! Ctrl codes are modeled on HTTP status codes. Every builder returns a
//! ready-to-queue [`ServerMsg`] addressed to a single session.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::proto::{ClientMsg, MsgCtrl, ServerMsg, ServerPayload};
use crate::store::StoreError;

pub mod code {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const NO_CONTENT: u16 = 204;
    pub const EVICTED: u16 = 205;
    pub const USE_OTHER: u16 = 303;
    pub const NOT_MODIFIED: u16 = 304;
    pub const MALFORMED: u16 = 400;
    pub const AUTH_REQUIRED: u16 = 401;
    pub const PERMISSION_DENIED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const NOT_ALLOWED: u16 = 405;
    pub const ALREADY_EXISTS: u16 = 409;
    pub const TOO_LARGE: u16 = 413;
    pub const UNKNOWN: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const CLUSTER_UNREACHABLE: u16 = 502;
    pub const LOCKED: u16 = 503;
    pub const TIMEOUT: u16 = 504;
}

/// Build a bare `{ctrl}` packet.
pub fn ctrl(
    code: u16,
    text: &str,
    id: &str,
    topic: &str,
    ts: DateTime<Utc>,
    params: Option<Value>,
) -> ServerMsg {
    ServerMsg::new(
        ServerPayload::Ctrl(MsgCtrl {
            id: id.to_string(),
            topic: topic.to_string(),
            code,
            text: text.to_string(),
            params,
            ts,
        }),
        ts,
    )
}

pub fn no_err(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::OK, "ok", id, topic, ts, None)
}

pub fn no_err_params(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    ctrl(code::OK, "ok", id, topic, ts, Some(params))
}

pub fn no_err_accepted(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    ctrl(code::ACCEPTED, "accepted", id, topic, ts, Some(params))
}

pub fn no_err_evicted(topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    ctrl(code::EVICTED, "evicted", "", topic, ts, Some(params))
}

pub fn no_content(id: &str, topic: &str, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    ctrl(code::NO_CONTENT, "no content", id, topic, ts, Some(params))
}

pub fn info_use_other(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::USE_OTHER, "use other", id, topic, ts, None)
}

pub fn info_not_modified(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::NOT_MODIFIED, "not modified", id, topic, ts, None)
}

pub fn info_no_action(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::NOT_MODIFIED, "no action", id, topic, ts, None)
}

pub fn err_malformed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::MALFORMED, "malformed", id, topic, ts, None)
}

pub fn err_invalid_range(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::MALFORMED, "invalid range", id, topic, ts, None)
}

pub fn err_auth_required(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::AUTH_REQUIRED, "authentication required", id, topic, ts, None)
}

pub fn err_permission_denied(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::PERMISSION_DENIED, "permission denied", id, topic, ts, None)
}

pub fn err_policy(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::PERMISSION_DENIED, "policy", id, topic, ts, None)
}

pub fn err_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::NOT_FOUND, "not found", id, topic, ts, None)
}

pub fn err_user_not_found(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::NOT_FOUND, "user not found", id, topic, ts, None)
}

pub fn err_not_allowed(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::NOT_ALLOWED, "operation not allowed", id, topic, ts, None)
}

pub fn err_already_exists(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::ALREADY_EXISTS, "already exists", id, topic, ts, None)
}

pub fn err_attach_first(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::ALREADY_EXISTS, "attach first", id, topic, ts, None)
}

pub fn err_too_large(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::TOO_LARGE, "too large", id, topic, ts, None)
}

pub fn err_unknown(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::UNKNOWN, "internal error", id, topic, ts, None)
}

pub fn err_not_implemented(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::NOT_IMPLEMENTED, "not implemented", id, topic, ts, None)
}

pub fn err_cluster_unreachable(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::CLUSTER_UNREACHABLE, "cluster unreachable", id, topic, ts, None)
}

pub fn err_locked(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::LOCKED, "locked", id, topic, ts, None)
}

pub fn err_timeout(id: &str, topic: &str, ts: DateTime<Utc>) -> ServerMsg {
    ctrl(code::TIMEOUT, "timeout", id, topic, ts, None)
}

/// Reply-shaped variants: take id/topic from the client packet.
pub fn no_err_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    no_err(&pkt.id, &pkt.original, ts)
}

pub fn no_err_params_reply(pkt: &ClientMsg, ts: DateTime<Utc>, params: Value) -> ServerMsg {
    no_err_params(&pkt.id, &pkt.original, ts, params)
}

pub fn info_not_modified_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    info_not_modified(&pkt.id, &pkt.original, ts)
}

pub fn info_no_action_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    info_no_action(&pkt.id, &pkt.original, ts)
}

pub fn err_malformed_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    err_malformed(&pkt.id, &pkt.original, ts)
}

pub fn err_permission_denied_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    err_permission_denied(&pkt.id, &pkt.original, ts)
}

pub fn err_policy_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    err_policy(&pkt.id, &pkt.original, ts)
}

pub fn err_not_found_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    err_not_found(&pkt.id, &pkt.original, ts)
}

pub fn err_locked_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    err_locked(&pkt.id, &pkt.original, ts)
}

pub fn err_unknown_reply(pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    err_unknown(&pkt.id, &pkt.original, ts)
}

/// Map a store error onto the ctrl taxonomy.
pub fn store_error_reply(err: &StoreError, pkt: &ClientMsg, ts: DateTime<Utc>) -> ServerMsg {
    match err {
        StoreError::NotFound => err_not_found_reply(pkt, ts),
        StoreError::Duplicate => err_already_exists(&pkt.id, &pkt.original, ts),
        StoreError::Unknown(_) => err_unknown_reply(pkt, ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::time_now;

    #[test]
    fn test_codes() {
        let ts = time_now();
        assert_eq!(no_err("1", "t", ts).ctrl().unwrap().code, 200);
        assert_eq!(err_locked("1", "t", ts).ctrl().unwrap().code, 503);
        assert_eq!(err_permission_denied("1", "t", ts).ctrl().unwrap().code, 403);
        assert_eq!(info_no_action("1", "t", ts).ctrl().unwrap().code, 304);
        assert_eq!(no_err_evicted("t", ts, serde_json::json!({})).ctrl().unwrap().code, 205);
    }

    #[test]
    fn test_store_error_mapping() {
        let ts = time_now();
        let pkt = ClientMsg {
            payload: crate::proto::ClientPayload::Leave(Default::default()),
            id: "9".into(),
            original: "grp1".into(),
            rcpt_to: "grp1".into(),
            as_user: crate::types::Uid(1),
            auth_lvl: crate::types::AuthLevel::Auth,
            timestamp: ts,
        };
        let reply = store_error_reply(&StoreError::NotFound, &pkt, ts);
        let ctrl = reply.ctrl().unwrap();
        assert_eq!(ctrl.code, 404);
        assert_eq!(ctrl.id, "9");
        assert_eq!(ctrl.topic, "grp1");
    }
}
