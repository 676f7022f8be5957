//! Optimized flooding over the spanning tree: tree formation via DUAL
//! plus end-to-end delivery through tree edges only.

mod common;

use std::collections::BTreeSet;

use common::*;
use trellis_kvstore::MemNetwork;
use trellis_model::{Config, Value, TTL_INFINITY};

fn tree_config(name: &str, is_root: bool) -> Config {
    let mut config = Config::new(name, &[AREA]);
    config.enable_flood_optimization = true;
    config.is_flood_root = is_root;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn triangle_forms_a_tree_and_floods_through_it() {
    let network = MemNetwork::new();
    let (r0, _) = spawn_node(&network, &tree_config("r0", true));
    let (n1, _) = spawn_node(&network, &tree_config("n1", false));
    let (n2, _) = spawn_node(&network, &tree_config("n2", false));

    // Full mesh peering, both directions.
    r0.add_peers(AREA, peers(&["n1", "n2"])).await.unwrap();
    n1.add_peers(AREA, peers(&["r0", "n2"])).await.unwrap();
    n2.add_peers(AREA, peers(&["r0", "n1"])).await.unwrap();

    for (handle, others) in [
        (&r0, ["n1", "n2"]),
        (&n1, ["r0", "n2"]),
        (&n2, ["r0", "n1"]),
    ] {
        for other in others {
            eventually("mesh initialized", || {
                let handle = handle.clone();
                async move { peer_initialized(&handle, other).await }
            })
            .await;
        }
    }

    // Both non-root nodes pick the root as parent and tell it so.
    eventually("tree converged", || {
        let (r0, n1, n2) = (r0.clone(), n1.clone(), n2.clone());
        async move {
            let root = r0.spt_infos(AREA).await.unwrap();
            let one = n1.spt_infos(AREA).await.unwrap();
            let two = n2.spt_infos(AREA).await.unwrap();
            let children = root
                .infos
                .get("r0")
                .map(|i| i.children.clone())
                .unwrap_or_default();
            children == BTreeSet::from(["n1".to_string(), "n2".to_string()])
                && one.infos.get("r0").map(|i| i.parent.as_deref()) == Some(Some("r0"))
                && two.infos.get("r0").map(|i| i.parent.as_deref()) == Some(Some("r0"))
                && one.flood_root_id.as_deref() == Some("r0")
        }
    })
    .await;

    // A leaf publication still reaches everyone through the tree.
    n1.set_key_vals(
        AREA,
        publication_of("via-tree", Value::new(1, "n1", b"x".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();

    for handle in [&r0, &n1, &n2] {
        eventually("key delivered through the tree", || {
            let handle = handle.clone();
            async move { get_value(&handle, "via-tree").await.is_some() }
        })
        .await;
    }
}
