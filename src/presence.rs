//! Presence primitives
//!
//! Parameter and filter types for `{pres}` fan-out, and the `what`-token
//! helpers shared by the topic loops. The four fan-out primitives themselves
//! are topic methods (see `topic::pres`) since they walk topic state.

use crate::access::AccessMode;
use crate::proto::MsgPres;
use crate::types::{DelRange, Uid};

/// Values substituted into a `{pres}` notification.
#[derive(Debug, Clone, Default)]
pub struct PresParams {
    pub user_agent: String,
    pub seq: u64,
    pub del_id: u64,
    pub del_seq: Vec<DelRange>,
    /// User affected by the change.
    pub target: String,
    /// User who made the change.
    pub actor: String,
    /// Delta-encoded change of `want`.
    pub d_want: String,
    /// Delta-encoded change of `given`.
    pub d_given: String,
}

/// Recipient filters applied during `{pres}` fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresFilters {
    /// Deliver only to users whose effective mode intersects this.
    pub filter_in: AccessMode,
    /// Skip users whose effective mode intersects this.
    pub filter_out: AccessMode,
    /// Deliver to this user only.
    pub single_user: Uid,
    /// Never deliver to this user.
    pub exclude_user: Uid,
}

impl PresParams {
    /// Fill the wire-visible parameter fields of a `{pres}`.
    pub fn apply(&self, pres: &mut MsgPres) {
        pres.ua = self.user_agent.clone();
        pres.seq = self.seq;
        pres.clear = self.del_id;
        pres.del_seq = self.del_seq.clone();
        pres.tgt = self.target.clone();
        pres.act = self.actor.clone();
        pres.dacs_want = self.d_want.clone();
        pres.dacs_given = self.d_given.clone();
    }
}

impl PresFilters {
    /// Fill the routing fields of a `{pres}`.
    pub fn apply(&self, pres: &mut MsgPres) {
        pres.filter_in = self.filter_in.bits();
        pres.filter_out = self.filter_out.bits();
        pres.single_user = self.single_user;
        pres.exclude_user = self.exclude_user;
    }
}

/// Split a `what` token into its base and command suffix:
/// `"on+en"` → `("on", "+en")`.
pub fn split_what(what: &str) -> (&str, &str) {
    if let Some(idx) = what.find('+') {
        what.split_at(idx)
    } else {
        (what, "")
    }
}

/// Per-recipient presence filter check. `gone` and `acs` punch through a
/// muted (`P`-less) subscription; everything else requires the presence bit
/// and must pass the in/out mode filters.
pub fn passes_presence_filters(pres: &MsgPres, effective: AccessMode) -> bool {
    (effective.is_presencer() || pres.what == "gone" || pres.what == "acs")
        && (pres.filter_in == 0 || effective.bits() & pres.filter_in != 0)
        && (pres.filter_out == 0 || effective.bits() & pres.filter_out == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pres(what: &str) -> MsgPres {
        MsgPres {
            topic: "grp1".into(),
            what: what.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_what() {
        assert_eq!(split_what("on+en"), ("on", "+en"));
        assert_eq!(split_what("off+dis"), ("off", "+dis"));
        assert_eq!(split_what("?unkn+en"), ("?unkn", "+en"));
        assert_eq!(split_what("read"), ("read", ""));
    }

    #[test]
    fn test_muted_gets_only_gone_and_acs() {
        let muted: AccessMode = "JRW".parse().unwrap();
        assert!(!passes_presence_filters(&pres("on"), muted));
        assert!(!passes_presence_filters(&pres("msg"), muted));
        assert!(passes_presence_filters(&pres("gone"), muted));
        assert!(passes_presence_filters(&pres("acs"), muted));
    }

    #[test]
    fn test_filter_in_out() {
        let mode: AccessMode = "JRWP".parse().unwrap();
        let mut p = pres("on");
        p.filter_in = AccessMode::READ.bits();
        assert!(passes_presence_filters(&p, mode));

        p.filter_in = AccessMode::OWNER.bits();
        assert!(!passes_presence_filters(&p, mode));

        let mut p = pres("on");
        p.filter_out = AccessMode::WRITE.bits();
        assert!(!passes_presence_filters(&p, mode));
    }
}
