use crate::*;

#[tokio::test]
async fn walk_advances_from_seed_into_the_ring() {
    let net = SimNetwork::ring(10, 2, Duration::from_millis(1));
    let mut walker = Walker::spawn(&net, WalkerConfig::default());

    let first = walker
        .wait_for(Duration::from_secs(2), |e| matches!(e, DiscoveryEvent::Advanced { .. }))
        .await;
    assert_eq!(
        first,
        Some(DiscoveryEvent::Advanced {
            from: walker_handle(),
            to: node(0)
        })
    );

    let second = walker
        .wait_for(Duration::from_secs(2), |e| matches!(e, DiscoveryEvent::Advanced { .. }))
        .await;
    match second {
        Some(DiscoveryEvent::Advanced { from, to }) => {
            assert_eq!(from, node(0));
            assert!(to == node(1) || to == node(2), "stepped outside node 0's neighbours");
        }
        other => panic!("expected a second step, got {other:?}"),
    }

    walker.shutdown().await;
}

#[tokio::test]
async fn clique_is_fully_discovered() {
    let net = SimNetwork::clique(6, Duration::from_millis(1));
    let walker = Walker::spawn(&net, WalkerConfig::default());

    assert!(eventually(Duration::from_secs(5), || walker.store.len() == 6).await);
    assert!(walker.store.get(&walker_handle()).is_none());

    walker.shutdown().await;
}

#[tokio::test]
async fn matched_responses_raise_reputation() {
    let net = SimNetwork::clique(4, Duration::from_millis(1));
    let walker = Walker::spawn(&net, WalkerConfig::default());

    assert!(
        eventually(Duration::from_secs(5), || {
            walker.store.all().iter().any(|r| r.reputation > 0 && r.last_seen > 0)
        })
        .await
    );
    assert!(walker.store.all().iter().all(|r| r.reputation >= 0));

    walker.shutdown().await;
}

#[tokio::test]
async fn burn_in_holds_back_the_first_peers() {
    let net = SimNetwork::clique(6, Duration::from_millis(200));
    let mut config = WalkerConfig::default();
    config.ttl = Duration::from_secs(2);
    config.settings.burn_in = 3;
    let mut walker = Walker::spawn(&net, config);

    let first = walker
        .wait_for(Duration::from_secs(2), |e| matches!(e, DiscoveryEvent::Advanced { .. }))
        .await;
    assert!(first.is_some());
    // The seed alone is within the burn-in
    assert_eq!(walker.store.len(), 0);

    // Peers seen during the burn-in are stored once the walk meets them again
    assert!(eventually(Duration::from_secs(5), || walker.store.len() == 6).await);

    walker.shutdown().await;
}

#[tokio::test]
async fn same_seed_same_first_steps() {
    async fn steps(n: usize) -> Vec<PeerHandle> {
        let net = SimNetwork::clique(8, Duration::from_millis(1));
        let mut walker = Walker::spawn(&net, WalkerConfig::default());
        let mut to_list = Vec::new();
        while to_list.len() < n {
            match walker
                .wait_for(Duration::from_secs(2), |e| matches!(e, DiscoveryEvent::Advanced { .. }))
                .await
            {
                Some(DiscoveryEvent::Advanced { to, .. }) => to_list.push(to),
                other => panic!("walk stalled: {other:?}"),
            }
        }
        walker.shutdown().await;
        to_list
    }

    assert_eq!(steps(4).await, steps(4).await);
}
