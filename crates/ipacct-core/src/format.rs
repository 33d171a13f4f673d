//! Address formatting for storage plugins.
//!
//! Counters report raw network-order address bytes. Only storage plugins
//! turn them into text, using the address family implied by the group's
//! configured kind.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipacct_config::{AddressFamily, Group, GroupId};

/// Errors from formatting an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("group {0} is not configured")]
    UnknownGroup(GroupId),

    #[error("group {group} expects {expected} address bytes, got {actual}")]
    Length {
        group: GroupId,
        expected: usize,
        actual: usize,
    },
}

/// Maps groups to address families and renders raw addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressFormatter {
    families: HashMap<GroupId, AddressFamily>,
}

impl AddressFormatter {
    pub fn new(groups: &[Group]) -> Self {
        Self {
            families: groups
                .iter()
                .map(|g| (g.id, g.counter_kind.family))
                .collect(),
        }
    }

    /// Address family of a configured group.
    pub fn family(&self, group: GroupId) -> Option<AddressFamily> {
        self.families.get(&group).copied()
    }

    /// Render `address` as reported by `group`.
    pub fn format(&self, group: GroupId, address: &[u8]) -> Result<String, FormatError> {
        let family = self
            .family(group)
            .ok_or(FormatError::UnknownGroup(group))?;
        let length_error = || FormatError::Length {
            group,
            expected: family.address_len(),
            actual: address.len(),
        };
        match family {
            AddressFamily::Ipv4 => {
                let octets: [u8; 4] = address.try_into().map_err(|_| length_error())?;
                Ok(Ipv4Addr::from(octets).to_string())
            }
            AddressFamily::Ipv6 => {
                let octets: [u8; 16] = address.try_into().map_err(|_| length_error())?;
                Ok(Ipv6Addr::from(octets).to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn group(id: GroupId, kind: &str) -> Group {
        Group {
            id,
            kind: kind.to_string(),
            counter_kind: kind.parse().unwrap(),
        }
    }

    fn formatter() -> AddressFormatter {
        AddressFormatter::new(&[group(1, "ipv4src"), group(2, "ipv6dst/64")])
    }

    #[test]
    fn test_formats_ipv4() {
        assert_eq!(
            formatter().format(1, &[192, 168, 1, 20]).unwrap(),
            "192.168.1.20"
        );
    }

    #[test]
    fn test_formats_ipv6() {
        let mut address = [0u8; 16];
        address[0] = 0x20;
        address[1] = 0x01;
        address[2] = 0x0d;
        address[3] = 0xb8;
        address[15] = 1;
        assert_eq!(formatter().format(2, &address).unwrap(), "2001:db8::1");
    }

    #[test]
    fn test_ipv6_group_rejects_four_bytes() {
        assert_eq!(
            formatter().format(2, &[10, 0, 0, 1]),
            Err(FormatError::Length {
                group: 2,
                expected: 16,
                actual: 4
            })
        );
    }

    #[test]
    fn test_ipv4_group_rejects_sixteen_bytes() {
        assert_eq!(
            formatter().format(1, &[0; 16]),
            Err(FormatError::Length {
                group: 1,
                expected: 4,
                actual: 16
            })
        );
    }

    #[test]
    fn test_unknown_group() {
        assert_eq!(
            formatter().format(9, &[1, 2, 3, 4]),
            Err(FormatError::UnknownGroup(9))
        );
    }
}
