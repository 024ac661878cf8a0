//! Access mode algebra
//!
//! A fixed-width permission bitmask with a text codec. Each subscription
//! carries two modes: `want` (requested by the user) and `given` (granted by
//! the topic); the *effective* mode is `want & given`.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{AuthLevel, TopicCat};

/// Permission bitmask. Named bits: J(oin), R(ead), W(rite), P(resence),
/// A(pprove), S(hare), D(elete), O(wner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessMode(u16);

impl AccessMode {
    pub const NONE: AccessMode = AccessMode(0);
    pub const JOIN: AccessMode = AccessMode(0x01);
    pub const READ: AccessMode = AccessMode(0x02);
    pub const WRITE: AccessMode = AccessMode(0x04);
    pub const PRES: AccessMode = AccessMode(0x08);
    pub const APPROVE: AccessMode = AccessMode(0x10);
    pub const SHARE: AccessMode = AccessMode(0x20);
    pub const DELETE: AccessMode = AccessMode(0x40);
    pub const OWNER: AccessMode = AccessMode(0x80);

    /// "Mode not specified": distinct from NONE which is an explicit "no
    /// permissions".
    pub const UNSET: AccessMode = AccessMode(0x100);
    /// Sentinel for subscriptions whose counterpart is marked deleted.
    pub const INVALID: AccessMode = AccessMode(0x200);

    /// Maximum permissions a user may hold in a P2P topic.
    pub const C_P2P: AccessMode = AccessMode(0x01 | 0x02 | 0x04 | 0x08 | 0x10);
    /// Default mode for authenticated users where the topic sets no default.
    pub const C_AUTH: AccessMode = AccessMode(0x01 | 0x02 | 0x04 | 0x08 | 0x10);
    /// Default mode of a full group subscriber.
    pub const C_PUBLIC: AccessMode = AccessMode(0x01 | 0x02 | 0x04 | 0x08 | 0x20);
    /// Permissions on the `sys` topic: anyone may join and write.
    pub const C_SYS: AccessMode = AccessMode(0x01 | 0x04);
    /// Frozen `given` mode of a channel reader.
    pub const C_CHN_READER: AccessMode = AccessMode(0x01 | 0x02 | 0x08);
    /// Mode of a user on their own `me`/`fnd` topic.
    pub const C_ME: AccessMode = AccessMode(0x01 | 0x02 | 0x04 | 0x08 | 0x10);
    /// Bits that mark admin-grade access.
    pub const C_SHARER: AccessMode = AccessMode(0x10 | 0x20 | 0x80);

    const ALL_BITS: u16 = 0xff;
    const LETTERS: [(u16, char); 8] = [
        (0x01, 'J'),
        (0x02, 'R'),
        (0x04, 'W'),
        (0x08, 'P'),
        (0x10, 'A'),
        (0x20, 'S'),
        (0x40, 'D'),
        (0x80, 'O'),
    ];

    pub fn is_defined(&self) -> bool {
        *self != Self::UNSET && *self != Self::INVALID
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_joiner(&self) -> bool {
        self.has(Self::JOIN)
    }

    pub fn is_reader(&self) -> bool {
        self.has(Self::READ)
    }

    pub fn is_writer(&self) -> bool {
        self.has(Self::WRITE)
    }

    pub fn is_presencer(&self) -> bool {
        self.has(Self::PRES)
    }

    pub fn is_approver(&self) -> bool {
        self.has(Self::APPROVE)
    }

    pub fn is_sharer(&self) -> bool {
        self.has(Self::SHARE)
    }

    pub fn is_deleter(&self) -> bool {
        self.has(Self::DELETE)
    }

    pub fn is_owner(&self) -> bool {
        self.has(Self::OWNER)
    }

    /// Approver or owner.
    pub fn is_admin(&self) -> bool {
        self.is_owner() || self.is_approver()
    }

    fn has(&self, bits: AccessMode) -> bool {
        self.is_defined() && (self.0 & bits.0) == bits.0
    }

    /// True if `other` is a subset of this mode.
    pub fn better_equal(&self, other: AccessMode) -> bool {
        self.is_defined() && other.is_defined() && (self.0 & other.0) == other.0
    }

    /// Strict superset.
    pub fn better_than(&self, other: AccessMode) -> bool {
        self.better_equal(other) && self.0 != other.0
    }

    /// Bits present in `self` but not in `other` (`&^` in the original).
    pub fn and_not(&self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 & !other.0 & Self::ALL_BITS)
    }

    /// Raw bit pattern, used by presence filter intersection checks.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Textual delta `"+ADDED-REMOVED"` that turns `self` into `new`.
    /// Equal modes produce an empty string.
    pub fn delta(&self, new: AccessMode) -> String {
        let added = new.and_not(*self);
        let removed = self.and_not(new);
        let mut out = String::new();
        if !added.is_zero() {
            out.push('+');
            out.push_str(&added.letters());
        }
        if !removed.is_zero() {
            out.push('-');
            out.push_str(&removed.letters());
        }
        out
    }

    /// Apply a delta string produced by [`AccessMode::delta`].
    pub fn apply_delta(&self, delta: &str) -> Result<AccessMode, ParseModeError> {
        let mut mode = *self;
        let mut grant = true;
        for ch in delta.chars() {
            match ch {
                '+' => grant = true,
                '-' => grant = false,
                _ => {
                    let bit = Self::LETTERS
                        .iter()
                        .find(|(_, l)| *l == ch)
                        .map(|(b, _)| *b)
                        .ok_or(ParseModeError(ch))?;
                    if grant {
                        mode.0 |= bit;
                    } else {
                        mode.0 &= !bit;
                    }
                }
            }
        }
        Ok(mode)
    }

    fn letters(&self) -> String {
        Self::LETTERS
            .iter()
            .filter(|(b, _)| self.0 & b != 0)
            .map(|(_, l)| *l)
            .collect()
    }
}

impl BitAnd for AccessMode {
    type Output = AccessMode;
    fn bitand(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 & rhs.0 & Self::ALL_BITS)
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode((self.0 | rhs.0) & Self::ALL_BITS)
    }
}

impl Not for AccessMode {
    type Output = AccessMode;
    fn not(self) -> AccessMode {
        AccessMode(!self.0 & Self::ALL_BITS)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_defined() {
            return f.write_str("");
        }
        if self.is_zero() {
            return f.write_str("N");
        }
        f.write_str(&self.letters())
    }
}

/// Error parsing a mode string: carries the offending character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid access mode character '{0}'")]
pub struct ParseModeError(pub char);

impl FromStr for AccessMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(AccessMode::UNSET);
        }
        let mut mode = AccessMode::NONE;
        for ch in s.chars() {
            match ch {
                'N' | 'n' => return Ok(AccessMode::NONE),
                _ => {
                    let bit = AccessMode::LETTERS
                        .iter()
                        .find(|(_, l)| *l == ch.to_ascii_uppercase())
                        .map(|(b, _)| *b)
                        .ok_or(ParseModeError(ch))?;
                    mode.0 |= bit;
                }
            }
        }
        Ok(mode)
    }
}

impl Serialize for AccessMode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Default access for a given auth level, falling back to the category
/// default when the topic defines none.
pub fn select_access_mode(
    lvl: AuthLevel,
    anon: AccessMode,
    auth: AccessMode,
    fallback: AccessMode,
) -> AccessMode {
    match lvl {
        AuthLevel::None => AccessMode::NONE,
        AuthLevel::Anon => {
            if anon.is_defined() {
                anon
            } else {
                AccessMode::NONE
            }
        }
        AuthLevel::Auth | AuthLevel::Root => {
            if auth.is_defined() {
                auth
            } else {
                fallback
            }
        }
    }
}

/// Category default used when a topic carries no explicit defaults.
pub fn default_access(cat: TopicCat) -> AccessMode {
    match cat {
        TopicCat::P2P => AccessMode::C_P2P,
        TopicCat::Sys => AccessMode::C_SYS,
        _ => AccessMode::C_PUBLIC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_roundtrip() {
        for text in ["JRWP", "JRWPASDO", "N", "O", "RP"] {
            let mode: AccessMode = text.parse().unwrap();
            assert_eq!(mode.to_string(), text);
            assert_eq!(mode.to_string().parse::<AccessMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_parse_empty_is_unset() {
        assert_eq!("".parse::<AccessMode>().unwrap(), AccessMode::UNSET);
        assert!(!AccessMode::UNSET.is_defined());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("JRX".parse::<AccessMode>().is_err());
    }

    #[test]
    fn test_delta_identity() {
        let m: AccessMode = "JRWP".parse().unwrap();
        assert_eq!(m.delta(m), "");
    }

    #[test]
    fn test_delta_apply() {
        let a: AccessMode = "JRWP".parse().unwrap();
        let b: AccessMode = "JRS".parse().unwrap();
        let d = a.delta(b);
        assert_eq!(d, "+S-WP");
        assert_eq!(a.apply_delta(&d).unwrap(), b);
    }

    #[test]
    fn test_better_equal() {
        let big: AccessMode = "JRWPASDO".parse().unwrap();
        let small: AccessMode = "JR".parse().unwrap();
        assert!(big.better_equal(small));
        assert!(big.better_than(small));
        assert!(!small.better_equal(big));
        assert!(big.better_equal(big));
        assert!(!big.better_than(big));
    }

    #[test]
    fn test_p2p_masking() {
        let want: AccessMode = "JRWPASDO".parse().unwrap();
        let masked = (want & AccessMode::C_P2P) | AccessMode::APPROVE;
        assert!(!masked.is_owner());
        assert!(!masked.is_deleter());
        assert!(masked.is_approver());
        assert!(masked.is_writer());
    }

    #[test]
    fn test_invalid_sentinel() {
        assert!(!AccessMode::INVALID.is_reader());
        assert!(!AccessMode::INVALID.is_presencer());
        assert!(AccessMode::INVALID.is_invalid());
    }

    #[test]
    fn test_effective_mode() {
        let want: AccessMode = "JRWPD".parse().unwrap();
        let given: AccessMode = "JRWPAS".parse().unwrap();
        assert_eq!((want & given).to_string(), "JRWP");
    }

    #[test]
    fn test_select_access_mode() {
        let anon: AccessMode = "JR".parse().unwrap();
        let auth: AccessMode = "JRWPS".parse().unwrap();
        assert_eq!(
            select_access_mode(AuthLevel::Anon, anon, auth, AccessMode::C_PUBLIC),
            anon
        );
        assert_eq!(
            select_access_mode(AuthLevel::Auth, anon, auth, AccessMode::C_PUBLIC),
            auth
        );
        assert_eq!(
            select_access_mode(AuthLevel::Auth, anon, AccessMode::UNSET, AccessMode::C_PUBLIC),
            AccessMode::C_PUBLIC
        );
        assert_eq!(
            select_access_mode(AuthLevel::None, anon, auth, AccessMode::C_PUBLIC),
            AccessMode::NONE
        );
    }
}
