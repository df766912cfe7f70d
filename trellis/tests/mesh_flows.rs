//! End-to-end node flows over real loopback sockets: genesis boot,
//! invitation join with replay protection, and ordered pub/sub delivery
//! with history replay for late subscribers.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use trellis::{NodeConfig, Peer};

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.bootstrap_url = None;
    config.node.listen_addr = Some("127.0.0.1:0".to_string());
    config
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn start_peer() -> Arc<Peer> {
    Peer::start(test_config()).await.unwrap()
}

#[tokio::test]
async fn genesis_boot_stores_and_reads() {
    let peer = start_peer().await;

    let token = peer.become_genesis().await.unwrap();
    assert!(token.is_genesis);
    assert_eq!(token.holder, token.issuer);

    assert!(peer.store("hello", json!("world")).await.unwrap());
    assert_eq!(peer.get("hello").await.unwrap(), Some(json!("world")));

    peer.shutdown().await;
}

#[tokio::test]
async fn invitation_join_and_replay_protection() {
    let genesis = start_peer().await;
    genesis.become_genesis().await.unwrap();
    genesis.store("hello", json!("world")).await.unwrap();

    let joiner = start_peer().await;
    joiner.connect_to(&genesis.contact_info()).await.unwrap();
    settle().await;
    assert!(genesis.connected_peers().contains(&joiner.node_id()));

    // The genesis member invites; the joiner verifies, burns the nonce,
    // and mints membership.
    let token = genesis.invite_new_client(joiner.node_id()).await.unwrap();
    joiner.accept_invitation_token(token.clone()).await;
    assert!(joiner.identity().is_member());

    // The consumed-nonce marker is in the DHT.
    let marker_key = lib_identity::consumed_token_key(&token.nonce);
    assert!(joiner.get(&marker_key).await.unwrap().is_some());

    // Mesh data is visible to the new member.
    assert_eq!(joiner.get("hello").await.unwrap(), Some(json!("world")));

    // Presenting the same nonce again changes nothing and stays rejected.
    joiner.accept_invitation_token(token).await;
    assert!(joiner.identity().is_member());

    genesis.shutdown().await;
    joiner.shutdown().await;
}

#[tokio::test]
async fn pubsub_delivers_in_order_and_replays_history() {
    let a = start_peer().await;
    a.become_genesis().await.unwrap();
    let b = start_peer().await;
    let c = start_peer().await;

    b.connect_to(&a.contact_info()).await.unwrap();
    c.connect_to(&a.contact_info()).await.unwrap();
    c.connect_to(&b.contact_info()).await.unwrap();
    settle().await;

    // B subscribes; the election names a coordinator for the topic.
    let mut rx_b = b.subscribe("chat").await.unwrap();

    // A publishes two messages; sequence numbers are contiguous from 0.
    let seq1 = a.publish("chat", json!({"text": "m1"})).await.unwrap();
    let seq2 = a.publish("chat", json!({"text": "m2"})).await.unwrap();
    assert_eq!(seq1, 0);
    assert_eq!(seq2, 1);

    let first = tokio::time::timeout(Duration::from_secs(10), rx_b.recv())
        .await
        .expect("first message timed out")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(10), rx_b.recv())
        .await
        .expect("second message timed out")
        .unwrap();
    assert_eq!(first.seq, 0);
    assert_eq!(first.data, json!({"text": "m1"}));
    assert_eq!(second.seq, 1);
    assert_eq!(second.data, json!({"text": "m2"}));

    // A late subscriber replays the full history before anything new.
    let mut rx_c = c.subscribe("chat").await.unwrap();
    let replayed_1 = rx_c.try_recv().expect("history seq 0 not replayed");
    let replayed_2 = rx_c.try_recv().expect("history seq 1 not replayed");
    assert_eq!(replayed_1.seq, 0);
    assert_eq!(replayed_2.seq, 1);

    // Idle polls see nothing new.
    assert_eq!(c.poll("chat").await.unwrap(), 0);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}
