//! Routing between two nodes over an in-process transport.

use std::sync::Arc;

use weft::{
    Driver, DriverObject, Error, Handle, Node, NodeType, Portal, SyncDriver,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn connected_pair(portals: usize) -> (Arc<Node>, Arc<Node>, Vec<Portal>, Vec<Portal>) {
    init_tracing();
    let driver = SyncDriver::new();
    let broker = Node::new(NodeType::Broker, driver.clone());
    let node = Node::new(NodeType::Normal, driver.clone());
    let (broker_end, node_end) = driver.create_transport_pair();
    let broker_portals = broker.connect(broker_end, portals).unwrap();
    let node_portals = node.connect(node_end, portals).unwrap();
    (broker, node, broker_portals, node_portals)
}

#[test]
fn initial_portals_are_paired_by_index() {
    let (_broker, _node, mut ours, mut theirs) = connected_pair(2);

    ours[0].put(b"zero", Vec::new()).unwrap();
    ours[1].put(b"one", Vec::new()).unwrap();

    assert_eq!(theirs[0].get().unwrap().0, b"zero");
    assert_eq!(theirs[1].get().unwrap().0, b"one");

    theirs[1].put(b"reply", Vec::new()).unwrap();
    assert_eq!(ours[1].get().unwrap().0, b"reply");
    let _ = (ours.pop(), theirs.pop());
}

#[test]
fn surplus_initial_portals_observe_closure() {
    let driver = SyncDriver::new();
    let broker = Node::new(NodeType::Broker, driver.clone());
    let node = Node::new(NodeType::Normal, driver.clone());
    let (broker_end, node_end) = driver.create_transport_pair();
    let broker_portals = broker.connect(broker_end, 1).unwrap();
    let node_portals = node.connect(node_end, 3).unwrap();

    assert!(!node_portals[0].query_status().is_peer_closed());
    assert!(node_portals[1].query_status().is_dead());
    assert!(node_portals[2].query_status().is_dead());
    let _ = broker_portals;
}

#[test]
fn closure_crosses_the_link_after_all_parcels() {
    let (_broker, _node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    ours.put(b"final", Vec::new()).unwrap();
    drop(ours);

    let status = theirs.query_status();
    assert!(status.is_peer_closed());
    assert!(!status.is_dead());
    assert_eq!(theirs.get().unwrap().0, b"final");
    assert!(theirs.query_status().is_dead());
}

#[test]
fn a_portal_moves_across_the_link_and_keeps_its_parcels() {
    let (broker, _node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    let (keep, send) = broker.create_portal_pair();
    keep.put(b"queued before the move", Vec::new()).unwrap();

    ours.put(b"portal incoming", vec![Handle::Portal(send)])
        .unwrap();
    let (data, mut handles) = theirs.get().unwrap();
    assert_eq!(data, b"portal incoming");
    let Handle::Portal(moved) = handles.remove(0) else {
        panic!("expected a portal handle");
    };

    // Parcels sent before the move arrive at the new location.
    assert_eq!(moved.get().unwrap().0, b"queued before the move");

    // Traffic keeps flowing in both directions afterwards.
    moved.put(b"hello from over here", Vec::new()).unwrap();
    assert_eq!(keep.get().unwrap().0, b"hello from over here");
    keep.put(b"still connected", Vec::new()).unwrap();
    assert_eq!(moved.get().unwrap().0, b"still connected");
}

#[test]
fn a_moved_portal_can_move_again() {
    // Move a portal to the other node and back; each hop leaves a proxy that
    // must keep forwarding until it is bypassed.
    let (broker, _node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    let (keep, send) = broker.create_portal_pair();
    ours.put(b"", vec![Handle::Portal(send)]).unwrap();
    let (_, mut handles) = theirs.get().unwrap();
    let Handle::Portal(send) = handles.remove(0) else {
        panic!("expected a portal handle");
    };

    theirs.put(b"", vec![Handle::Portal(send)]).unwrap();
    let (_, mut handles) = ours.get().unwrap();
    let Handle::Portal(send) = handles.remove(0) else {
        panic!("expected a portal handle");
    };

    for round in 0..10u8 {
        keep.put(&[round], Vec::new()).unwrap();
        assert_eq!(send.get().unwrap().0, vec![round]);
        send.put(&[round, round], Vec::new()).unwrap();
        assert_eq!(keep.get().unwrap().0, vec![round, round]);
    }
}

#[test]
fn closing_a_moved_portal_reaches_the_peer() {
    let (broker, _node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    let (keep, send) = broker.create_portal_pair();
    ours.put(b"", vec![Handle::Portal(send)]).unwrap();
    let (_, mut handles) = theirs.get().unwrap();
    let Handle::Portal(moved) = handles.remove(0) else {
        panic!("expected a portal handle");
    };

    moved.put(b"goodbye", Vec::new()).unwrap();
    drop(moved);

    assert!(keep.query_status().is_peer_closed());
    assert_eq!(keep.get().unwrap().0, b"goodbye");
    assert!(keep.query_status().is_dead());
}

#[test]
fn boxed_driver_objects_ride_along() {
    let (_broker, _node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    ours.put(
        b"object attached",
        vec![Handle::Box(DriverObject::Blob(vec![9, 8, 7]))],
    )
    .unwrap();

    let (data, mut handles) = theirs.get().unwrap();
    assert_eq!(data, b"object attached");
    let Handle::Box(DriverObject::Blob(bytes)) = handles.remove(0) else {
        panic!("expected a blob");
    };
    assert_eq!(bytes, vec![9, 8, 7]);
}

#[test]
fn node_shutdown_disconnects_remote_routes() {
    let (_broker, node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    ours.put(b"arrived", Vec::new()).unwrap();
    node.close();

    // Everything delivered before the disconnect stays retrievable.
    assert_eq!(theirs.get().unwrap().0, b"arrived");
    assert_eq!(theirs.get().unwrap_err(), Error::NotFound);
    assert!(ours.query_status().is_peer_closed());
    assert_eq!(ours.put(b"too late", Vec::new()).unwrap_err(), Error::NotFound);
}

#[test]
fn parcels_sent_during_a_move_are_not_lost() {
    let (broker, _node, mut ours, mut theirs) = connected_pair(1);
    let ours = ours.remove(0);
    let theirs = theirs.remove(0);

    let (keep, send) = broker.create_portal_pair();
    for i in 0..5u8 {
        keep.put(&[i], Vec::new()).unwrap();
    }
    ours.put(b"", vec![Handle::Portal(send)]).unwrap();
    for i in 5..10u8 {
        keep.put(&[i], Vec::new()).unwrap();
    }

    let (_, mut handles) = theirs.get().unwrap();
    let Handle::Portal(moved) = handles.remove(0) else {
        panic!("expected a portal handle");
    };
    for i in 0..10u8 {
        assert_eq!(moved.get().unwrap().0, vec![i], "parcel {i} out of order");
    }
}
