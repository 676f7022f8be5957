//! Multi-node replication over the in-process network: flooding, full
//! sync, tiebreaks, TTL expiry, and rate-limit coalescing.

mod common;

use std::time::Duration;

use common::*;
use trellis_kvstore::MemNetwork;
use trellis_model::{Config, Value, TTL_INFINITY};

#[tokio::test(flavor = "multi_thread")]
async fn two_node_flood() {
    let network = MemNetwork::new();
    let (a, _a_peers) = spawn_node(&network, &Config::new("node-a", &[AREA]));
    let (b, _b_peers) = spawn_node(&network, &Config::new("node-b", &[AREA]));

    a.add_peers(AREA, peers(&["node-b"])).await.unwrap();
    eventually("a initialized toward b", || {
        let a = a.clone();
        async move { peer_initialized(&a, "node-b").await }
    })
    .await;

    a.set_key_vals(
        AREA,
        publication_of("k1", Value::new(1, "node-a", b"v1".to_vec(), 60_000)),
    )
    .await
    .unwrap();

    eventually("k1 replicated to b", || {
        let b = b.clone();
        async move {
            get_value(&b, "k1")
                .await
                .is_some_and(|v| v.version == 1 && v.value.as_deref() == Some(b"v1".as_slice()))
        }
    })
    .await;

    // The sender keeps its own copy untouched.
    let at_a = get_value(&a, "k1").await.unwrap();
    assert_eq!(at_a.version, 1);
    assert_eq!(at_a.originator_id, "node-a");

    // One live countdown entry per store.
    assert_eq!(counter(&a, "kvstore.ttl_countdown_entries").await, 1);
    assert_eq!(counter(&b, "kvstore.ttl_countdown_entries").await, 1);

    // The replicated copy's TTL was decremented on the way out.
    let at_b = get_value(&b, "k1").await.unwrap();
    assert!(at_b.ttl_ms < 60_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn version_tiebreak_prefers_higher_originator() {
    let network = MemNetwork::new();
    let (a, _) = spawn_node(&network, &Config::new("node-a", &[AREA]));
    let (b, _) = spawn_node(&network, &Config::new("node-b", &[AREA]));

    a.set_key_vals(
        AREA,
        publication_of("k1", Value::new(1, "node-a", b"from-a".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();
    b.set_key_vals(
        AREA,
        publication_of("k1", Value::new(1, "node-b", b"from-b".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();

    a.add_peers(AREA, peers(&["node-b"])).await.unwrap();

    for handle in [&a, &b] {
        eventually("k1 converged to node-b's copy", || {
            let handle = handle.clone();
            async move {
                get_value(&handle, "k1")
                    .await
                    .is_some_and(|v| v.originator_id == "node-b")
            }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ttl_expiry_removes_key_everywhere() {
    let network = MemNetwork::new();
    let (a, _) = spawn_node(&network, &Config::new("node-a", &[AREA]));
    let (b, _) = spawn_node(&network, &Config::new("node-b", &[AREA]));

    a.add_peers(AREA, peers(&["node-b"])).await.unwrap();
    eventually("a initialized toward b", || {
        let a = a.clone();
        async move { peer_initialized(&a, "node-b").await }
    })
    .await;

    let mut a_updates = a.subscribe();
    let mut b_updates = b.subscribe();

    a.set_key_vals(
        AREA,
        publication_of("k1", Value::new(1, "node-a", b"soon-gone".to_vec(), 200)),
    )
    .await
    .unwrap();

    eventually("k1 replicated", || {
        let b = b.clone();
        async move { get_value(&b, "k1").await.is_some() }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    eventually("k1 expired on both", || {
        let (a, b) = (a.clone(), b.clone());
        async move { get_value(&a, "k1").await.is_none() && get_value(&b, "k1").await.is_none() }
    })
    .await;

    // Exactly one expiry publication per node, delivered locally.
    for updates in [&mut a_updates, &mut b_updates] {
        let mut expiries = 0;
        while let Ok(publication) = updates.try_recv() {
            if publication.expired_keys.contains(&"k1".to_string()) {
                expiries += 1;
            }
        }
        assert_eq!(expiries, 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_coalesces_without_losing_keys() {
    let network = MemNetwork::new();
    let mut config = Config::new("node-a", &[AREA]);
    config.kvstore.flood_msg_per_sec = 10;
    config.kvstore.flood_msg_burst = 5;
    let (a, _) = spawn_node(&network, &config);
    let (b, _) = spawn_node(&network, &Config::new("node-b", &[AREA]));

    a.add_peers(AREA, peers(&["node-b"])).await.unwrap();
    eventually("a initialized toward b", || {
        let a = a.clone();
        async move { peer_initialized(&a, "node-b").await }
    })
    .await;

    for i in 0..100 {
        let key = format!("burst-{i:03}");
        a.set_key_vals(
            AREA,
            publication_of(&key, Value::new(1, "node-a", vec![i as u8], TTL_INFINITY)),
        )
        .await
        .unwrap();
    }

    eventually("all 100 keys on b", || {
        let b = b.clone();
        async move { counter(&b, "kvstore.num_keys").await == 100 }
    })
    .await;

    // Coalescing bounds the publication count: burst passes through, the
    // rest drain in batched publications.
    let sent = counter(&a, "kvstore.sent_publications").await;
    assert!(sent <= 25, "expected coalesced flooding, sent {sent} publications");
    assert!(counter(&a, "kvstore.rate_limit_suppressed").await > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_reconciles_both_directions() {
    let network = MemNetwork::new();
    let (a, _) = spawn_node(&network, &Config::new("node-a", &[AREA]));
    let (b, _) = spawn_node(&network, &Config::new("node-b", &[AREA]));

    // Disjoint keys on each side plus a conflict A should win.
    a.set_key_vals(
        AREA,
        publication_of("only-a", Value::new(1, "node-a", b"a".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();
    a.set_key_vals(
        AREA,
        publication_of("conflict", Value::new(5, "node-a", b"newer".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();
    b.set_key_vals(
        AREA,
        publication_of("only-b", Value::new(1, "node-b", b"b".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();
    b.set_key_vals(
        AREA,
        publication_of("conflict", Value::new(2, "node-b", b"older".to_vec(), TTL_INFINITY)),
    )
    .await
    .unwrap();

    a.add_peers(AREA, peers(&["node-b"])).await.unwrap();

    // Three-way sync: A pulls B's better keys, then pushes back the keys
    // B flagged as out of date.
    for handle in [&a, &b] {
        eventually("stores converged", || {
            let handle = handle.clone();
            async move {
                let only_a = get_value(&handle, "only-a").await;
                let only_b = get_value(&handle, "only-b").await;
                let conflict = get_value(&handle, "conflict").await;
                only_a.is_some()
                    && only_b.is_some()
                    && conflict.is_some_and(|v| v.version == 5 && v.originator_id == "node-a")
            }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_event_queue_drives_membership() {
    let network = MemNetwork::new();
    let (a, a_peers) = spawn_node(&network, &Config::new("node-a", &[AREA]));
    let (_b, _b_peers) = spawn_node(&network, &Config::new("node-b", &[AREA]));

    a_peers
        .send(trellis_model::PeerEvent {
            area: AREA.to_string(),
            peers_to_add: peers(&["node-b"]),
            peers_to_del: vec![],
        })
        .await
        .unwrap();

    eventually("peer added via queue", || {
        let a = a.clone();
        async move { peer_initialized(&a, "node-b").await }
    })
    .await;

    a_peers
        .send(trellis_model::PeerEvent {
            area: AREA.to_string(),
            peers_to_add: Default::default(),
            peers_to_del: vec!["node-b".to_string()],
        })
        .await
        .unwrap();

    eventually("peer removed via queue", || {
        let a = a.clone();
        async move { a.peer_state(AREA, "node-b").await.unwrap().is_none() }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_area_is_rejected() {
    let network = MemNetwork::new();
    let (a, _) = spawn_node(&network, &Config::new("node-a", &[AREA]));
    let err = a.get_key_vals("nowhere", vec![]).await.unwrap_err();
    assert!(matches!(err, trellis_kvstore::KvStoreError::UnknownArea(_)));
}
