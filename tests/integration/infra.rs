use crate::*;

#[tokio::test]
async fn sim_network_answers_live_nodes_only() {
    let net = SimNetwork::ring(3, 1, Duration::from_millis(1));
    net.kill(1);
    let (tx, mut rx) = mpsc::channel(8);
    let endpoint = net.endpoint(tx);

    let id = endpoint.send_ping(&node(0)).unwrap();
    let response = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.correlation_id, id);
    assert_eq!(response.sender, node(0));
    assert_eq!(response.kind, ResponseKind::Pong);

    // Dead node: the send succeeds, nothing ever comes back
    endpoint.send_ping(&node(1)).unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());

    let id = endpoint.send_neighbours_request(&node(2)).unwrap();
    let response = rx.recv().await.unwrap();
    assert_eq!(response.correlation_id, id);
    assert_eq!(response.kind, ResponseKind::Neighbours(vec![node(0)]));
}

#[tokio::test]
async fn rogue_node_answers_with_unknown_ids() {
    let net = SimNetwork::clique(2, Duration::from_millis(1));
    net.make_rogue(0);
    let (tx, mut rx) = mpsc::channel(8);
    let endpoint = net.endpoint(tx);

    let id = endpoint.send_ping(&node(0)).unwrap();
    let response = rx.recv().await.unwrap();
    assert_ne!(response.correlation_id, id);
    assert_eq!(response.sender, node(0));
}
