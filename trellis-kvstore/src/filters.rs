//! Key and originator filters for merges and dumps.

use regex::RegexSet;
use std::collections::BTreeSet;
use std::fmt;

use trellis_model::{DumpParams, FilterOp, Value};

/// Compiled filter over two axes: key prefixes (anchored regexes) and
/// originator ids. An empty axis is a wildcard under AND and is ignored
/// under OR.
#[derive(Clone, Debug)]
pub struct KvFilters {
    key_regexes: Option<RegexSet>,
    key_prefixes: Vec<String>,
    originator_ids: BTreeSet<String>,
    op: FilterOp,
}

impl KvFilters {
    pub fn new(
        key_prefixes: Vec<String>,
        originator_ids: BTreeSet<String>,
        op: FilterOp,
    ) -> Result<Self, regex::Error> {
        let key_regexes = if key_prefixes.is_empty() {
            None
        } else {
            let anchored: Vec<String> = key_prefixes
                .iter()
                .map(|p| {
                    if p.starts_with('^') {
                        p.clone()
                    } else {
                        format!("^{p}")
                    }
                })
                .collect();
            Some(RegexSet::new(anchored)?)
        };
        Ok(Self {
            key_regexes,
            key_prefixes,
            originator_ids,
            op,
        })
    }

    /// Wildcard filter: matches every entry.
    pub fn match_all() -> Self {
        Self {
            key_regexes: None,
            key_prefixes: Vec::new(),
            originator_ids: BTreeSet::new(),
            op: FilterOp::Or,
        }
    }

    pub fn from_params(params: &DumpParams) -> Result<Self, regex::Error> {
        Self::new(
            params.key_prefixes.clone(),
            params.originator_ids.clone(),
            params.op,
        )
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self.op {
            FilterOp::Or => self.match_any(key, value),
            FilterOp::And => self.match_all_axes(key, value),
        }
    }

    fn match_any(&self, key: &str, value: &Value) -> bool {
        if self.key_regexes.is_none() && self.originator_ids.is_empty() {
            return true;
        }
        if let Some(re) = &self.key_regexes {
            if re.is_match(key) {
                return true;
            }
        }
        !self.originator_ids.is_empty() && self.originator_ids.contains(&value.originator_id)
    }

    fn match_all_axes(&self, key: &str, value: &Value) -> bool {
        let key_ok = self.key_regexes.as_ref().map_or(true, |re| re.is_match(key));
        let orig_ok = self.originator_ids.is_empty()
            || self.originator_ids.contains(&value.originator_id);
        key_ok && orig_ok
    }
}

impl fmt::Display for KvFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "keys=[{}] originators=[{}] op={:?}",
            self.key_prefixes.join(","),
            self.originator_ids
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            self.op
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_model::TTL_INFINITY;

    fn val(originator: &str) -> Value {
        Value::new(1, originator, b"x".to_vec(), TTL_INFINITY)
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = KvFilters::match_all();
        assert!(f.matches("anything", &val("anyone")));
    }

    #[test]
    fn or_matches_either_axis() {
        let f = KvFilters::new(
            vec!["prefix:".to_string()],
            BTreeSet::from(["node-b".to_string()]),
            FilterOp::Or,
        )
        .unwrap();
        assert!(f.matches("prefix:x", &val("node-a")));
        assert!(f.matches("adj:x", &val("node-b")));
        assert!(!f.matches("adj:x", &val("node-a")));
    }

    #[test]
    fn and_requires_both_axes() {
        let f = KvFilters::new(
            vec!["prefix:".to_string()],
            BTreeSet::from(["node-b".to_string()]),
            FilterOp::And,
        )
        .unwrap();
        assert!(f.matches("prefix:x", &val("node-b")));
        assert!(!f.matches("prefix:x", &val("node-a")));
        assert!(!f.matches("adj:x", &val("node-b")));
    }

    #[test]
    fn empty_axis_is_wildcard_under_and() {
        let f = KvFilters::new(vec!["prefix:".to_string()], BTreeSet::new(), FilterOp::And)
            .unwrap();
        assert!(f.matches("prefix:x", &val("anyone")));
        assert!(!f.matches("adj:x", &val("anyone")));
    }

    #[test]
    fn prefixes_are_anchored_at_key_start() {
        let f =
            KvFilters::new(vec!["prefix:".to_string()], BTreeSet::new(), FilterOp::Or).unwrap();
        assert!(!f.matches("not-a-prefix:", &val("a")));
    }
}
