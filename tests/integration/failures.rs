use crate::*;
use hastings_core::ReputationEvent;

#[tokio::test]
async fn dead_neighbours_lose_reputation_and_walk_rolls_back() {
    let net = SimNetwork::new(Duration::from_millis(1));
    // Nodes 1 and 2 are not on the network at all
    net.set_neighbours(0, &[1, 2]);
    let mut walker = Walker::spawn(
        &net,
        WalkerConfig {
            known: vec![1, 2],
            ..WalkerConfig::default()
        },
    );

    let rolled_back = walker
        .wait_for(Duration::from_secs(3), |e| {
            *e == DiscoveryEvent::RolledBack { to: walker_handle() }
        })
        .await;
    assert!(rolled_back.is_some());

    assert!(
        eventually(Duration::from_secs(3), || {
            walker.reputation_of(1).is_some_and(|r| r < 0)
                && walker.reputation_of(2).is_some_and(|r| r < 0)
        })
        .await
    );
    // The live seed is stored and in good standing
    assert!(walker.reputation_of(0).is_some_and(|r| r >= 0));

    walker.shutdown().await;
}

#[tokio::test]
async fn dead_seed_keeps_reseeding_until_it_comes_back() {
    let net = SimNetwork::clique(2, Duration::from_millis(1));
    net.kill(0);
    let mut walker = Walker::spawn(&net, WalkerConfig::default());

    for _ in 0..2 {
        let reseeded = walker
            .wait_for(Duration::from_secs(3), |e| matches!(e, DiscoveryEvent::Reseeded { .. }))
            .await;
        assert!(reseeded.is_some());
    }
    assert!(walker.store.get(&node(0)).is_none());

    net.revive(0);
    let advanced = walker
        .wait_for(Duration::from_secs(3), |e| {
            matches!(e, DiscoveryEvent::Advanced { to, .. } if *to == node(0))
        })
        .await;
    assert!(advanced.is_some());

    walker.shutdown().await;
}

#[tokio::test]
async fn empty_seed_list_idles() {
    let net = SimNetwork::clique(2, Duration::from_millis(1));
    let mut walker = Walker::spawn(
        &net,
        WalkerConfig {
            seeds: Vec::new(),
            ..WalkerConfig::default()
        },
    );

    assert!(walker
        .wait_for(Duration::from_millis(500), |_| true)
        .await
        .is_none());
    assert!(walker.correlation.is_empty());

    walker.shutdown().await;
}

#[tokio::test]
async fn rogue_peer_is_penalised_for_uncorrelatable_responses() {
    let net = SimNetwork::clique(2, Duration::from_millis(1));
    net.make_rogue(0);
    let mut walker = Walker::spawn(
        &net,
        WalkerConfig {
            known: vec![0],
            ..WalkerConfig::default()
        },
    );

    let uncorrelatable = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match walker.reputation.recv().await {
                Ok(c) if c.reason == ReputationEvent::UnCorrelatableMessage => return c,
                _ => continue,
            }
        }
    })
    .await
    .expect("uncorrelatable response within 2s");
    assert_eq!(uncorrelatable.peer, node(0));
    assert!(uncorrelatable.amount < 0);

    // One bogus pong plus the real ping timing out
    assert!(
        eventually(Duration::from_secs(3), || {
            walker.reputation_of(0).is_some_and(|r| r <= -110)
        })
        .await
    );

    walker.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_no_pending_requests() {
    let net = SimNetwork::ring(10, 2, Duration::from_millis(50));
    let mut walker = Walker::spawn(
        &net,
        WalkerConfig {
            ttl: Duration::from_secs(30),
            ..WalkerConfig::default()
        },
    );

    assert!(walker
        .wait_for(Duration::from_secs(2), |e| matches!(e, DiscoveryEvent::Advanced { .. }))
        .await
        .is_some());

    let correlation = walker.correlation.clone();
    walker.shutdown().await;
    assert!(correlation.is_empty());
}
