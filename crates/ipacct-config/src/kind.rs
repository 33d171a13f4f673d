//! Counter kinds.
//!
//! A group's `kind` is handed to the counting subprocess verbatim, but the
//! daemon still needs to know which address family the subprocess reports so
//! that storage plugins can render addresses. The accepted grammar is
//! `(ipv4|ipv6)(src|dst)` with an optional `/prefix` netmask suffix.

use std::fmt;
use std::str::FromStr;

/// Address family reported by a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Length in bytes of a raw address of this family.
    pub fn address_len(self) -> usize {
        match self {
            AddressFamily::Ipv4 => 4,
            AddressFamily::Ipv6 => 16,
        }
    }

    /// Longest valid netmask prefix for this family.
    pub fn max_prefix(self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 32,
            AddressFamily::Ipv6 => 128,
        }
    }
}

/// Which end of a packet the counter attributes traffic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Source,
    Destination,
}

/// Parsed form of a group's `kind` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKind {
    pub family: AddressFamily,
    pub direction: Direction,
    /// Netmask applied by the counter before aggregation, if any.
    pub prefix: Option<u8>,
}

/// A `kind` string that does not follow the counter kind grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KindError {
    #[error("unknown counter kind {0:?}, expected ipv4src, ipv4dst, ipv6src or ipv6dst")]
    Unknown(String),

    #[error("invalid netmask {0:?}")]
    Netmask(String),

    #[error("netmask /{prefix} exceeds /{max} for this address family")]
    PrefixTooLong { prefix: u8, max: u8 },
}

impl FromStr for CounterKind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, mask) = match s.split_once('/') {
            Some((base, mask)) => (base, Some(mask)),
            None => (s, None),
        };

        let (family, direction) = match base {
            "ipv4src" => (AddressFamily::Ipv4, Direction::Source),
            "ipv4dst" => (AddressFamily::Ipv4, Direction::Destination),
            "ipv6src" => (AddressFamily::Ipv6, Direction::Source),
            "ipv6dst" => (AddressFamily::Ipv6, Direction::Destination),
            _ => return Err(KindError::Unknown(base.to_string())),
        };

        let prefix = match mask {
            None => None,
            Some(mask) => {
                let prefix: u8 = mask
                    .parse()
                    .map_err(|_| KindError::Netmask(mask.to_string()))?;
                if prefix > family.max_prefix() {
                    return Err(KindError::PrefixTooLong {
                        prefix,
                        max: family.max_prefix(),
                    });
                }
                Some(prefix)
            }
        };

        Ok(Self {
            family,
            direction,
            prefix,
        })
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.family {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        };
        let direction = match self.direction {
            Direction::Source => "src",
            Direction::Destination => "dst",
        };
        write!(f, "{family}{direction}")?;
        if let Some(prefix) = self.prefix {
            write!(f, "/{prefix}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_plain_kinds() {
        let kind: CounterKind = "ipv4src".parse().unwrap();
        assert_eq!(kind.family, AddressFamily::Ipv4);
        assert_eq!(kind.direction, Direction::Source);
        assert_eq!(kind.prefix, None);

        let kind: CounterKind = "ipv6dst".parse().unwrap();
        assert_eq!(kind.family, AddressFamily::Ipv6);
        assert_eq!(kind.direction, Direction::Destination);
    }

    #[test]
    fn test_parse_netmask_suffix() {
        let kind: CounterKind = "ipv4dst/24".parse().unwrap();
        assert_eq!(kind.prefix, Some(24));
        assert_eq!(kind.family.address_len(), 4);

        let kind: CounterKind = "ipv6src/64".parse().unwrap();
        assert_eq!(kind.prefix, Some(64));
        assert_eq!(kind.family.address_len(), 16);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = "ethsrc".parse::<CounterKind>().unwrap_err();
        assert_eq!(err, KindError::Unknown("ethsrc".to_string()));
    }

    #[test]
    fn test_rejects_bad_netmask() {
        assert!(matches!(
            "ipv4src/abc".parse::<CounterKind>(),
            Err(KindError::Netmask(_))
        ));
        assert_eq!(
            "ipv4src/33".parse::<CounterKind>().unwrap_err(),
            KindError::PrefixTooLong {
                prefix: 33,
                max: 32
            }
        );
        assert!("ipv6src/128".parse::<CounterKind>().is_ok());
    }

    #[test]
    fn test_display_round_trips_input() {
        for input in ["ipv4src", "ipv4dst/16", "ipv6src", "ipv6dst/48"] {
            let kind: CounterKind = input.parse().unwrap();
            assert_eq!(kind.to_string(), input);
        }
    }
}
