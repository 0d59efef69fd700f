mod common;

use common::{call, eventually, leaders, memory_cluster};
use ride_cluster::election::Role;
use ride_cluster::heartbeat::Beat;
use ride_cluster::protocol::{ClientCall, UserType};
use std::time::Duration;

#[tokio::test]
async fn smallest_id_leads_at_start() {
    let (_net, nodes) = memory_cluster(3);
    assert_eq!(leaders(&nodes), vec![1, 1, 1]);
    assert!(nodes[0].election().is_leader());
    assert_eq!(nodes[0].heartbeat().tick().await, Beat::Idle);
    assert_eq!(nodes[1].heartbeat().tick().await, Beat::Alive(1));
}

#[tokio::test]
async fn killed_leader_is_replaced_through_its_ring_successor() {
    let (net, nodes) = memory_cluster(3);
    net.kill(1);

    // node 3 sees node 2 alive between itself and the dead leader
    assert_eq!(nodes[2].heartbeat().tick().await, Beat::Deferred(1));
    assert_eq!(nodes[2].election().state().role, Role::Follower);
    assert_eq!(nodes[1].heartbeat().tick().await, Beat::Elected(1));
    assert_eq!(nodes[1].heartbeat().failures(), 1);

    assert!(eventually(|| nodes[1].election().known_leader() == 3 && nodes[2].election().known_leader() == 3).await);
    assert!(nodes[2].election().is_leader());
    assert!(!nodes[1].election().is_leader());

    assert_eq!(nodes[1].heartbeat().tick().await, Beat::Alive(3));
    assert_eq!(nodes[1].heartbeat().failures(), 0);
    assert_eq!(nodes[2].heartbeat().tick().await, Beat::Idle);
}

#[tokio::test]
async fn background_monitors_recover_without_help() {
    let (net, nodes) = memory_cluster(3);
    for node in &nodes {
        node.spawn_monitor();
    }
    net.kill(1);
    assert!(eventually(|| leaders(&nodes[1..]) == vec![3, 3]).await);
    assert_eq!(nodes[2].election().state().leader_epoch, 1);
}

#[tokio::test]
async fn round_survives_a_member_dropping_out_mid_round() {
    let (net, nodes) = memory_cluster(5);
    net.kill(1);
    assert_eq!(nodes[1].heartbeat().tick().await, Beat::Elected(1));
    // node 4 goes away while node 2 is still waiting out its jitter
    net.kill(4);

    let live = [1usize, 2, 4];
    assert!(eventually(|| live.iter().all(|&i| nodes[i].election().known_leader() == 5)).await);
    assert!(nodes[4].election().is_leader());
    assert_eq!(live.iter().filter(|&&i| nodes[i].election().is_leader()).count(), 1);
}

#[tokio::test]
async fn restarted_former_leader_rejoins_as_follower() {
    let (net, nodes) = memory_cluster(3);
    net.kill(1);
    nodes[1].heartbeat().tick().await;
    assert!(eventually(|| nodes[2].election().is_leader()).await);

    net.revive(1);
    assert!(nodes[0].election().is_leader(), "node 1 still believes its old view");
    nodes[0].discover_leader().await;
    assert_eq!(nodes[0].election().known_leader(), 3);
    assert_eq!(nodes[0].election().state().role, Role::Follower);
}

#[tokio::test]
async fn followers_learn_a_newer_leader_through_heartbeat_acks() {
    let (_net, nodes) = memory_cluster(3);
    // nodes 1 and 3 heard about round 1; node 2 missed it
    assert!(nodes[2].election().offer(3, 1));
    assert!(nodes[0].election().offer(3, 1));
    assert_eq!(nodes[1].election().known_leader(), 1);

    // node 2 still pings node 1, which points it at node 3
    assert_eq!(nodes[1].heartbeat().tick().await, Beat::Alive(1));
    assert_eq!(nodes[1].election().known_leader(), 3);
    assert_eq!(nodes[1].heartbeat().tick().await, Beat::Alive(3));
    assert!(!nodes[1].election().offer(1, 1));
}

#[tokio::test]
async fn writes_continue_after_failover() {
    let (net, nodes) = memory_cluster(3);
    let first = call(
        &nodes[1],
        ClientCall::RegisterUser("alice".into(), "pw".into(), UserType::Rider, None, None, None),
    )
    .await;
    assert!(first.success, "{:?}", first.message);

    net.kill(1);
    nodes[1].heartbeat().tick().await;
    assert!(eventually(|| leaders(&nodes[1..]) == vec![3, 3]).await);

    let resp = call(
        &nodes[1],
        ClientCall::RegisterUser("bob".into(), "pw".into(), UserType::Driver, None, None, None),
    )
    .await;
    assert!(resp.success, "{:?}", resp.message);
    assert!(nodes[1].store().user("bob").is_some());
    assert!(nodes[2].store().user("bob").is_some());
    assert!(nodes[0].store().user("bob").is_none());
}

#[tokio::test]
async fn writes_during_an_election_ask_for_a_retry() {
    let (net, nodes) = memory_cluster(3);
    net.kill(1);
    net.kill(3);
    // node 2 alone: its round stalls and it stays behind a dead leader
    nodes[1].heartbeat().tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp = call(&nodes[1], ClientCall::CancelRide("R1-1".into())).await;
    assert!(!resp.success);
    assert!(resp.message.unwrap_or_default().contains("retry"));
}
