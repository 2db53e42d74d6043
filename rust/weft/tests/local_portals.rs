//! Portal behavior within a single node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use weft::{conditions, Error, Handle, Node, NodeType, SyncDriver, TrapConditions};

fn test_node() -> Arc<Node> {
    Node::new(NodeType::Normal, SyncDriver::new())
}

#[test]
fn put_then_get_round_trips_data() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();

    a.put(b"hello", Vec::new()).unwrap();
    a.put(b"world", Vec::new()).unwrap();

    let (data, handles) = b.get().unwrap();
    assert_eq!(data, b"hello");
    assert!(handles.is_empty());
    assert_eq!(b.get().unwrap().0, b"world");
    assert_eq!(b.get().unwrap_err(), Error::Unavailable);
}

#[test]
fn portals_travel_inside_parcels() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();
    let (x, y) = node.create_portal_pair();

    x.put(b"sent before the move", Vec::new()).unwrap();
    a.put(b"here is a portal", vec![Handle::Portal(y)]).unwrap();

    let (_, mut handles) = b.get().unwrap();
    assert_eq!(handles.len(), 1);
    let Handle::Portal(y_again) = handles.remove(0) else {
        panic!("expected a portal handle");
    };
    assert_eq!(y_again.get().unwrap().0, b"sent before the move");

    y_again.put(b"and back", Vec::new()).unwrap();
    assert_eq!(x.get().unwrap().0, b"and back");
}

#[test]
fn putting_a_portal_into_itself_or_its_peer_is_rejected() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();

    // The peer cannot ride through its own route.
    assert_eq!(
        a.put(b"", vec![Handle::Portal(b)]).unwrap_err(),
        Error::InvalidArgument
    );
    // The rejected portal's route is closed rather than leaked.
    assert!(a.query_status().is_peer_closed());
}

#[test]
fn dropping_a_portal_closes_its_route() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();

    a.put(b"parting gift", Vec::new()).unwrap();
    drop(a);

    let status = b.query_status();
    assert!(status.is_peer_closed());
    assert!(!status.is_dead());
    assert_eq!(b.get().unwrap().0, b"parting gift");
    assert!(b.query_status().is_dead());
    assert_eq!(b.get().unwrap_err(), Error::NotFound);
    assert_eq!(b.put(b"", Vec::new()).unwrap_err(), Error::NotFound);
}

#[test]
fn two_phase_get_commits_or_restores() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();
    a.put(b"abcdef", Vec::new()).unwrap();

    {
        let txn = b.begin_get().unwrap();
        assert_eq!(txn.data(), b"abcdef");
        // Overlapping gets are refused while the parcel is checked out.
        assert_eq!(b.get().unwrap_err(), Error::AlreadyExists);
        // Dropped without commit: the parcel goes back untouched.
    }

    let txn = b.begin_get().unwrap();
    let (head, _) = txn.commit_partial(2).unwrap();
    assert_eq!(head, b"ab");

    let (rest, _) = b.get().unwrap();
    assert_eq!(rest, b"cdef");
}

#[test]
fn two_phase_put_builds_a_parcel_in_place() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();

    let mut txn = a.begin_put();
    txn.append(b"one ").append(b"two");
    txn.commit(Vec::new()).unwrap();

    assert_eq!(b.get().unwrap().0, b"one two");
}

#[test]
fn trap_fires_on_parcel_arrival() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();

    let fired = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&fired);
    b.add_trap(
        TrapConditions {
            flags: conditions::NEW_LOCAL_PARCEL,
            min_local_parcels: None,
        },
        Arc::new(move |event| {
            seen.fetch_or(event.condition_flags, Ordering::Relaxed);
        }),
        0,
    )
    .unwrap();

    assert_eq!(fired.load(Ordering::Relaxed), 0);
    a.put(b"ding", Vec::new()).unwrap();
    assert_eq!(
        fired.load(Ordering::Relaxed) & conditions::NEW_LOCAL_PARCEL,
        conditions::NEW_LOCAL_PARCEL
    );
}

#[test]
fn traps_are_removed_when_their_portal_moves() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();
    let (x, y) = node.create_portal_pair();

    let fired = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&fired);
    y.add_trap(
        TrapConditions {
            flags: conditions::PEER_CLOSED,
            min_local_parcels: None,
        },
        Arc::new(move |event| {
            seen.fetch_or(event.condition_flags, Ordering::Relaxed);
        }),
        0,
    )
    .unwrap();

    a.put(b"", vec![Handle::Portal(y)]).unwrap();
    assert_eq!(
        fired.load(Ordering::Relaxed) & conditions::REMOVED,
        conditions::REMOVED
    );
    let _ = (b, x);
}

#[test]
fn merged_routes_behave_like_one() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();
    let (c, d) = node.create_portal_pair();

    b.merge(c).unwrap();

    a.put(b"across the seam", Vec::new()).unwrap();
    assert_eq!(d.get().unwrap().0, b"across the seam");
    d.put(b"echo", Vec::new()).unwrap();
    assert_eq!(a.get().unwrap().0, b"echo");

    drop(d);
    assert!(a.query_status().is_peer_closed());
}

#[test]
fn merge_rejects_a_portal_pair_with_itself() {
    let node = test_node();
    let (a, b) = node.create_portal_pair();

    let rejected = a.merge(b).unwrap_err();
    assert_eq!(rejected.error, Error::InvalidArgument);

    // The pair comes back unharmed and keeps working.
    let (a, b) = rejected.portals;
    a.put(b"still here", Vec::new()).unwrap();
    assert_eq!(b.get().unwrap().0, b"still here");
}
