//! Prefix key naming.
//!
//! Legacy form: `prefix:<node>:<area>:<cidr>`
//! Compact form: `prefix:v2:<node>:<area>:<cidr>`
//!
//! A node emits exactly one form (per the compact-keys knob) but parses
//! both, so stale keys from either side of a rolling upgrade can still
//! be recognized and withdrawn. Node and area names must not contain
//! `:`; the CIDR may (IPv6).

use ipnet::IpNet;

use trellis_model::constants::PREFIX_DB_MARKER;

const V2_MARKER: &str = "v2:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixKey {
    pub node: String,
    pub area: String,
    pub prefix: IpNet,
}

impl PrefixKey {
    pub fn new(node: impl Into<String>, area: impl Into<String>, prefix: IpNet) -> Self {
        Self {
            node: node.into(),
            area: area.into(),
            prefix,
        }
    }

    pub fn format(&self, compact: bool) -> String {
        if compact {
            format!(
                "{}{}{}:{}:{}",
                PREFIX_DB_MARKER, V2_MARKER, self.node, self.area, self.prefix
            )
        } else {
            format!("{}{}:{}:{}", PREFIX_DB_MARKER, self.node, self.area, self.prefix)
        }
    }

    /// Parse either key form; `None` for anything else.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(PREFIX_DB_MARKER)?;
        let rest = rest.strip_prefix(V2_MARKER).unwrap_or(rest);
        let (node, rest) = rest.split_once(':')?;
        let (area, cidr) = rest.split_once(':')?;
        let prefix: IpNet = cidr.parse().ok()?;
        Some(Self {
            node: node.to_string(),
            area: area.to_string(),
            prefix,
        })
    }

    /// Dump filter patterns matching every key this node owns, in both
    /// forms.
    pub fn node_patterns(node: &str) -> Vec<String> {
        let escaped = regex_escape(node);
        vec![
            format!("^{}{}:", PREFIX_DB_MARKER, escaped),
            format!("^{}{}{}:", PREFIX_DB_MARKER, V2_MARKER, escaped),
        ]
    }
}

/// Escape regex metacharacters in a node name for filter patterns.
fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn legacy_roundtrip() {
        let key = PrefixKey::new("node-1", "area-a", net("10.0.0.0/24"));
        let s = key.format(false);
        assert_eq!(s, "prefix:node-1:area-a:10.0.0.0/24");
        assert_eq!(PrefixKey::parse(&s), Some(key));
    }

    #[test]
    fn compact_roundtrip() {
        let key = PrefixKey::new("node-1", "area-a", net("10.0.0.0/24"));
        let s = key.format(true);
        assert_eq!(s, "prefix:v2:node-1:area-a:10.0.0.0/24");
        assert_eq!(PrefixKey::parse(&s), Some(key));
    }

    #[test]
    fn ipv6_prefix_keeps_its_colons() {
        let key = PrefixKey::new("n", "a", net("fc00:1::/64"));
        for compact in [false, true] {
            let s = key.format(compact);
            assert_eq!(PrefixKey::parse(&s), Some(key.clone()));
        }
    }

    #[test]
    fn rejects_foreign_keys() {
        assert_eq!(PrefixKey::parse("adj:node-1:area-a"), None);
        assert_eq!(PrefixKey::parse("prefix:node-1"), None);
        assert_eq!(PrefixKey::parse("prefix:node-1:area:not-a-cidr"), None);
    }
}
