//! Internal prefix entries and best-route selection.

use std::collections::{BTreeSet, HashMap};

use trellis_model::{NextHop, PrefixEntry, PrefixType};

/// One advertised entry plus the bookkeeping the manager needs: where to
/// send it and whether it carries installable nexthops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixEntryInternal {
    pub entry: PrefixEntry,
    pub dst_areas: BTreeSet<String>,
    /// Present only for entries the forwarding plane should install.
    pub nexthops: Option<BTreeSet<NextHop>>,
}

impl PrefixEntryInternal {
    pub fn new(entry: PrefixEntry, dst_areas: BTreeSet<String>) -> Self {
        Self {
            entry,
            dst_areas,
            nexthops: None,
        }
    }

    pub fn should_install(&self) -> bool {
        self.nexthops.as_ref().is_some_and(|nh| !nh.is_empty())
    }
}

/// Winning types under the metric ordering (path preference desc, source
/// preference desc, distance asc). Ties return every winner.
pub fn select_best_prefix_metrics(
    entries: &HashMap<PrefixType, PrefixEntryInternal>,
) -> BTreeSet<PrefixType> {
    let mut best: BTreeSet<PrefixType> = BTreeSet::new();
    let mut best_rank = None;
    for (ptype, entry) in entries {
        let rank = entry.entry.metrics.rank();
        match best_rank {
            None => {
                best_rank = Some(rank);
                best.insert(*ptype);
            }
            Some(current) if rank < current => {
                best_rank = Some(rank);
                best.clear();
                best.insert(*ptype);
            }
            Some(current) if rank == current => {
                best.insert(*ptype);
            }
            Some(_) => {}
        }
    }
    best
}

/// Break a metric tie down to one type. The lowest-ordinal type wins
/// deterministically, except that a BGP vs CONFIG tie goes to CONFIG
/// when the node prefers its own originated routes.
pub fn pick_best_type(
    best: &BTreeSet<PrefixType>,
    prefer_originated: bool,
) -> Option<PrefixType> {
    let first = *best.iter().next()?;
    if prefer_originated
        && first == PrefixType::Bgp
        && best.contains(&PrefixType::Config)
    {
        return Some(PrefixType::Config);
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_model::PrefixMetrics;

    fn entry(ptype: PrefixType, metrics: PrefixMetrics) -> PrefixEntryInternal {
        let mut e = PrefixEntry::new("10.0.0.0/24".parse().unwrap(), ptype);
        e.metrics = metrics;
        PrefixEntryInternal::new(e, BTreeSet::new())
    }

    fn metrics(path: i32, source: i32, distance: i32) -> PrefixMetrics {
        PrefixMetrics {
            path_preference: path,
            source_preference: source,
            distance,
        }
    }

    #[test]
    fn higher_path_preference_wins() {
        let entries = HashMap::from([
            (PrefixType::Rib, entry(PrefixType::Rib, metrics(2000, 100, 0))),
            (PrefixType::Bgp, entry(PrefixType::Bgp, metrics(1000, 900, 0))),
        ]);
        assert_eq!(
            select_best_prefix_metrics(&entries),
            BTreeSet::from([PrefixType::Rib])
        );
    }

    #[test]
    fn source_preference_breaks_path_tie() {
        let entries = HashMap::from([
            (PrefixType::Rib, entry(PrefixType::Rib, metrics(1000, 100, 0))),
            (PrefixType::Bgp, entry(PrefixType::Bgp, metrics(1000, 200, 0))),
        ]);
        assert_eq!(
            select_best_prefix_metrics(&entries),
            BTreeSet::from([PrefixType::Bgp])
        );
    }

    #[test]
    fn lower_distance_breaks_remaining_tie() {
        let entries = HashMap::from([
            (PrefixType::Rib, entry(PrefixType::Rib, metrics(1000, 100, 4))),
            (PrefixType::Config, entry(PrefixType::Config, metrics(1000, 100, 2))),
        ]);
        assert_eq!(
            select_best_prefix_metrics(&entries),
            BTreeSet::from([PrefixType::Config])
        );
    }

    #[test]
    fn full_tie_returns_all_winners() {
        let entries = HashMap::from([
            (PrefixType::Bgp, entry(PrefixType::Bgp, metrics(1000, 100, 0))),
            (PrefixType::Config, entry(PrefixType::Config, metrics(1000, 100, 0))),
        ]);
        let best = select_best_prefix_metrics(&entries);
        assert_eq!(best.len(), 2);
        assert_eq!(pick_best_type(&best, false), Some(PrefixType::Bgp));
        assert_eq!(pick_best_type(&best, true), Some(PrefixType::Config));
    }
}
