//! Core identifiers and topic naming
//!
//! User ids, topic categories, and the codec between *expanded* (routable)
//! topic names and the names clients address topics by.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authentication level assigned to a session by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthLevel {
    #[default]
    None,
    Anon,
    Auth,
    Root,
}

/// Server-assigned user id. Zero is reserved for "no user" (multiplexing
/// sessions impersonating many users, system actions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uid(pub u64);

impl Uid {
    pub const ZERO: Uid = Uid(0);

    /// Generate a new random non-zero uid.
    pub fn generate() -> Uid {
        loop {
            let v: u64 = rand::random();
            if v != 0 {
                return Uid(v);
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The `usrXXX` form clients address this user by.
    pub fn user_id(&self) -> String {
        format!("usr{:016x}", self.0)
    }

    /// Expanded name of this user's `me` topic.
    pub fn me_name(&self) -> String {
        self.user_id()
    }

    /// Expanded name of this user's `fnd` topic.
    pub fn fnd_name(&self) -> String {
        format!("fnd{:016x}", self.0)
    }

    /// Expanded name of the P2P topic between this user and another.
    /// The name is the same regardless of argument order.
    pub fn p2p_name(&self, other: Uid) -> String {
        let (lo, hi) = if self.0 < other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        format!("p2p{:016x}{:016x}", lo, hi)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_id())
    }
}

impl Serialize for Uid {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if self.is_zero() {
            s.serialize_str("")
        } else {
            s.serialize_str(&self.user_id())
        }
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        if text.is_empty() {
            return Ok(Uid::ZERO);
        }
        parse_user_id(&text).ok_or_else(|| serde::de::Error::custom("invalid user id"))
    }
}

/// Parse a `usrXXX` string. Returns None on malformed input.
pub fn parse_user_id(name: &str) -> Option<Uid> {
    let hex = name.strip_prefix("usr")?;
    u64::from_str_radix(hex, 16).ok().map(Uid)
}

/// Parse an expanded `p2pXXXYYY` name into its two user ids.
pub fn parse_p2p(name: &str) -> Option<(Uid, Uid)> {
    let hex = name.strip_prefix("p2p")?;
    if hex.len() != 32 {
        return None;
    }
    let lo = u64::from_str_radix(&hex[..16], 16).ok()?;
    let hi = u64::from_str_radix(&hex[16..], 16).ok()?;
    Some((Uid(lo), Uid(hi)))
}

/// Topic category, inferred from the expanded name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCat {
    Me,
    Fnd,
    P2P,
    Grp,
    Sys,
}

/// Infer the category of an expanded (routable) topic name.
pub fn topic_cat(name: &str) -> Option<TopicCat> {
    if name == "sys" {
        Some(TopicCat::Sys)
    } else if name.starts_with("usr") {
        Some(TopicCat::Me)
    } else if name.starts_with("fnd") {
        Some(TopicCat::Fnd)
    } else if name.starts_with("p2p") {
        Some(TopicCat::P2P)
    } else if name.starts_with("grp") || name.starts_with("chn") {
        Some(TopicCat::Grp)
    } else {
        None
    }
}

/// True if the name addresses a group topic through its channel alias.
pub fn is_channel(name: &str) -> bool {
    name.starts_with("chn")
}

/// Convert a `grpXXX` name to its `chnXXX` alias.
pub fn grp_to_chn(name: &str) -> String {
    match name.strip_prefix("grp") {
        Some(tail) => format!("chn{}", tail),
        None => name.to_string(),
    }
}

/// Convert a `chnXXX` alias back to the expanded `grpXXX` name.
pub fn chn_to_grp(name: &str) -> String {
    match name.strip_prefix("chn") {
        Some(tail) => format!("grp{}", tail),
        None => name.to_string(),
    }
}

/// Generate a random name for a new group topic.
pub fn gen_topic_name() -> String {
    format!("grp{:016x}", rand::random::<u64>())
}

/// Expanded topic name as a particular user should see it.
/// P2P topics are presented as the other party's `usrXXX`; `me`/`fnd` by
/// their short aliases; channel names pass through unchanged.
pub fn topic_name_for_user(name: &str, uid: Uid, is_chan: bool) -> String {
    match topic_cat(name) {
        Some(TopicCat::Me) => "me".to_string(),
        Some(TopicCat::Fnd) => "fnd".to_string(),
        Some(TopicCat::P2P) => {
            if let Some((u1, u2)) = parse_p2p(name) {
                if uid == u1 {
                    return u2.user_id();
                }
                return u1.user_id();
            }
            name.to_string()
        }
        Some(TopicCat::Grp) if is_chan && is_channel(name) => name.to_string(),
        _ => name.to_string(),
    }
}

/// A half-open `[low, hi)` range of message seq ids scheduled for deletion.
/// `hi == 0` means a single message `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelRange {
    #[serde(default)]
    pub low: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub hi: u64,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

impl DelRange {
    /// Number of messages covered by the range.
    pub fn count(&self) -> u64 {
        if self.hi == 0 { 1 } else { self.hi - self.low }
    }
}

/// Sort ranges by `low` ascending / `hi` descending and collapse overlaps.
pub fn normalize_ranges(mut ranges: Vec<DelRange>) -> Vec<DelRange> {
    ranges.sort_by(|a, b| a.low.cmp(&b.low).then(b.hi.cmp(&a.hi)));

    let mut out: Vec<DelRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        let r_hi = if r.hi == 0 { r.low + 1 } else { r.hi };
        if let Some(last) = out.last_mut() {
            let last_hi = if last.hi == 0 { last.low + 1 } else { last.hi };
            if r.low <= last_hi {
                if r_hi > last_hi {
                    last.hi = r_hi;
                }
                continue;
            }
        }
        out.push(r);
    }
    out
}

/// Wall-clock timestamp in the resolution used on the wire.
pub fn time_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_roundtrip() {
        let uid = Uid(0xdeadbeef00112233);
        let parsed = parse_user_id(&uid.user_id()).unwrap();
        assert_eq!(uid, parsed);
    }

    #[test]
    fn test_p2p_name_symmetric() {
        let a = Uid(5);
        let b = Uid(9);
        assert_eq!(a.p2p_name(b), b.p2p_name(a));
        let (u1, u2) = parse_p2p(&a.p2p_name(b)).unwrap();
        assert_eq!((u1, u2), (a, b));
    }

    #[test]
    fn test_topic_cat() {
        assert_eq!(topic_cat("sys"), Some(TopicCat::Sys));
        assert_eq!(topic_cat("usr00000000000000ff"), Some(TopicCat::Me));
        assert_eq!(topic_cat("fnd00000000000000ff"), Some(TopicCat::Fnd));
        assert_eq!(topic_cat("grpabc"), Some(TopicCat::Grp));
        assert_eq!(topic_cat("chnabc"), Some(TopicCat::Grp));
        assert_eq!(topic_cat("p2pX"), Some(TopicCat::P2P));
        assert_eq!(topic_cat("bogus"), None);
    }

    #[test]
    fn test_chn_alias() {
        assert_eq!(grp_to_chn("grpabc"), "chnabc");
        assert_eq!(chn_to_grp("chnabc"), "grpabc");
        assert!(is_channel("chnabc"));
        assert!(!is_channel("grpabc"));
    }

    #[test]
    fn test_topic_name_for_user() {
        let a = Uid(1);
        let b = Uid(2);
        let p2p = a.p2p_name(b);
        assert_eq!(topic_name_for_user(&p2p, a, false), b.user_id());
        assert_eq!(topic_name_for_user(&p2p, b, false), a.user_id());
        assert_eq!(topic_name_for_user(&a.me_name(), a, false), "me");
    }

    #[test]
    fn test_normalize_ranges() {
        let ranges = vec![
            DelRange { low: 5, hi: 8 },
            DelRange { low: 1, hi: 3 },
            DelRange { low: 2, hi: 6 },
            DelRange { low: 10, hi: 0 },
        ];
        let norm = normalize_ranges(ranges);
        assert_eq!(
            norm,
            vec![DelRange { low: 1, hi: 8 }, DelRange { low: 10, hi: 0 }]
        );
    }

    #[test]
    fn test_range_count() {
        assert_eq!(DelRange { low: 3, hi: 0 }.count(), 1);
        assert_eq!(DelRange { low: 3, hi: 7 }.count(), 4);
    }
}
