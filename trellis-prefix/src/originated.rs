//! Locally originated aggregates and their supporting routes.

use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};

use trellis_model::constants::{LOCAL_ROUTE_NEXTHOP_V4, LOCAL_ROUTE_NEXTHOP_V6};
use trellis_model::{
    NextHop, OriginatedPrefixConfig, PrefixEntry, PrefixType, RibUnicastEntry,
};

use crate::PrefixManagerError;

/// A configured aggregate plus the more-specific RIB routes currently
/// supporting it.
#[derive(Clone, Debug)]
pub struct OriginatedRoute {
    pub config: OriginatedPrefixConfig,
    pub unicast_entry: RibUnicastEntry,
    pub supporting_routes: BTreeSet<IpNet>,
    pub is_advertised: bool,
}

impl OriginatedRoute {
    pub fn should_advertise(&self) -> bool {
        !self.is_advertised
            && self.supporting_routes.len() >= self.config.minimum_supporting_routes
    }

    pub fn should_withdraw(&self) -> bool {
        self.is_advertised
            && self.supporting_routes.len() < self.config.minimum_supporting_routes
    }
}

/// `inner` is a supporting route of `outer` iff it is a strictly more
/// specific prefix inside it.
pub fn strictly_contains(outer: &IpNet, inner: &IpNet) -> bool {
    outer.prefix_len() < inner.prefix_len() && outer.contains(inner)
}

/// Build the originated-prefix table from configuration.
pub fn build_originated_prefix_db(
    node_name: &str,
    prefixes: &[OriginatedPrefixConfig],
) -> Result<HashMap<IpNet, OriginatedRoute>, PrefixManagerError> {
    let mut db = HashMap::new();
    for cfg in prefixes {
        let network: IpNet = cfg
            .prefix
            .parse()
            .map_err(|_| PrefixManagerError::InvalidPrefix(cfg.prefix.clone()))?;

        let mut entry = PrefixEntry::new(network, PrefixType::Config);
        if let Some(pref) = cfg.path_preference {
            entry.metrics.path_preference = pref;
        }
        if let Some(pref) = cfg.source_preference {
            entry.metrics.source_preference = pref;
        }
        entry.tags = cfg.tags.clone();

        let nexthop = match network {
            IpNet::V4(_) => LOCAL_ROUTE_NEXTHOP_V4,
            IpNet::V6(_) => LOCAL_ROUTE_NEXTHOP_V6,
        };
        let unicast_entry = RibUnicastEntry {
            prefix: network,
            nexthops: BTreeSet::from([NextHop::new(nexthop, None)]),
            best_entry: entry,
            best_area: String::new(),
        };

        tracing::debug!(
            node = %node_name,
            prefix = %network,
            min_supporting = cfg.minimum_supporting_routes,
            "originated prefix configured"
        );
        db.insert(
            network,
            OriginatedRoute {
                config: cfg.clone(),
                unicast_entry,
                supporting_routes: BTreeSet::new(),
                is_advertised: false,
            },
        );
    }
    Ok(db)
}
