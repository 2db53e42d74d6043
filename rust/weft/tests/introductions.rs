//! Routes spanning three nodes: broker introductions and message relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use weft::{
    Driver, DriverObject, Handle, Node, NodeType, Portal, Region, SyncDriver, Transport,
};

/// Wraps the reference driver so that transport pairs created after a
/// cutover refuse to carry objects. Connections made before the cutover are
/// unrestricted; links introduced afterwards must use the broker relay for
/// any parcel with transports or memory attached.
struct CutoverDriver {
    inner: Arc<SyncDriver>,
    restricted: AtomicBool,
}

impl CutoverDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SyncDriver::new(),
            restricted: AtomicBool::new(false),
        })
    }

    fn restrict_new_transports(&self) {
        self.restricted.store(true, Ordering::Relaxed);
    }
}

impl Driver for CutoverDriver {
    fn create_transport_pair(&self) -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        if self.restricted.load(Ordering::Relaxed) {
            SyncDriver::create_restricted_transport_pair()
        } else {
            self.inner.create_transport_pair()
        }
    }

    fn allocate_region(&self, num_words: usize) -> Region {
        self.inner.allocate_region(num_words)
    }
}

struct Network {
    broker: Arc<Node>,
    /// Broker-side portals of the two spokes.
    to_first: Portal,
    to_second: Portal,
    first: Portal,
    second: Portal,
}

/// A broker with two connected nodes, plus one portal pair whose ends have
/// been moved out to each node. Parcels between `first` and `second`
/// initially flow through two proxies on the broker; collapsing them forces
/// the broker to introduce the two nodes to each other.
///
/// With `restrict_introduced_links` the driver cuts over after the broker
/// connections are made, so the link the introduction creates refuses
/// out-of-band objects.
fn three_node_network(driver: &Arc<CutoverDriver>, restrict_introduced_links: bool) -> Network {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();

    let broker = Node::new(NodeType::Broker, driver.clone());
    let node_1 = Node::new(NodeType::Normal, driver.clone());
    let node_2 = Node::new(NodeType::Normal, driver.clone());

    let (b1, n1) = driver.create_transport_pair();
    let mut to_first = broker.connect(b1, 1).unwrap();
    let mut spoke_1 = node_1.connect(n1, 1).unwrap();
    let (b2, n2) = driver.create_transport_pair();
    let mut to_second = broker.connect(b2, 1).unwrap();
    let mut spoke_2 = node_2.connect(n2, 1).unwrap();
    if restrict_introduced_links {
        driver.restrict_new_transports();
    }

    let (p, q) = broker.create_portal_pair();
    let to_first = to_first.remove(0);
    let to_second = to_second.remove(0);
    to_first.put(b"", vec![Handle::Portal(p)]).unwrap();
    to_second.put(b"", vec![Handle::Portal(q)]).unwrap();

    let claim = |portal: &Portal| -> Portal {
        let (_, mut handles) = portal.get().unwrap();
        match handles.remove(0) {
            Handle::Portal(moved) => moved,
            Handle::Box(_) => panic!("expected a portal handle"),
        }
    };
    let first = claim(&spoke_1.remove(0));
    let second = claim(&spoke_2.remove(0));

    Network {
        broker,
        to_first,
        to_second,
        first,
        second,
    }
}

#[test]
fn spokes_talk_through_and_then_past_the_broker() {
    let driver = CutoverDriver::new();
    let network = three_node_network(&driver, false);

    for round in 0..10u8 {
        network.first.put(&[round], Vec::new()).unwrap();
        assert_eq!(network.second.get().unwrap().0, vec![round]);
        network.second.put(&[round, round], Vec::new()).unwrap();
        assert_eq!(network.first.get().unwrap().0, vec![round, round]);
    }

    // The route no longer depends on the broker's proxies once they have
    // been bypassed; traffic survives the broker shutting down.
    drop(network.to_first);
    drop(network.to_second);
    network.broker.close();

    network.first.put(b"direct", Vec::new()).unwrap();
    assert_eq!(network.second.get().unwrap().0, b"direct");
}

#[test]
fn spoke_closure_reaches_the_other_spoke() {
    let driver = CutoverDriver::new();
    let network = three_node_network(&driver, false);

    network.first.put(b"last", Vec::new()).unwrap();
    drop(network.first);

    assert!(network.second.query_status().is_peer_closed());
    assert_eq!(network.second.get().unwrap().0, b"last");
    assert!(network.second.query_status().is_dead());
}

#[test]
fn objects_cross_a_restricted_link_via_the_broker_relay() {
    let driver = CutoverDriver::new();
    // Broker connections stay unrestricted; the link the broker introduces
    // between the two spokes will refuse out-of-band objects.
    let network = three_node_network(&driver, true);

    // Drive enough traffic to collapse the proxies onto a direct link.
    for round in 0..10u8 {
        network.first.put(&[round], Vec::new()).unwrap();
        assert_eq!(network.second.get().unwrap().0, vec![round]);
        network.second.put(&[round], Vec::new()).unwrap();
        assert_eq!(network.first.get().unwrap().0, vec![round]);
    }

    let region = driver.allocate_region(4);
    region.word(0).store(42, Ordering::Relaxed);
    network
        .first
        .put(b"shared memory", vec![Handle::Box(DriverObject::Memory(region))])
        .unwrap();

    let (data, mut handles) = network.second.get().unwrap();
    assert_eq!(data, b"shared memory");
    let Handle::Box(DriverObject::Memory(received)) = handles.remove(0) else {
        panic!("expected a memory object");
    };
    assert_eq!(received.word(0).load(Ordering::Relaxed), 42);
}

#[test]
fn a_portal_can_hop_between_spokes() {
    let driver = CutoverDriver::new();
    let network = three_node_network(&driver, false);

    let (keep, send) = network.first.node().create_portal_pair();
    network.first.put(b"", vec![Handle::Portal(send)]).unwrap();
    let (_, mut handles) = network.second.get().unwrap();
    let Handle::Portal(moved) = handles.remove(0) else {
        panic!("expected a portal handle");
    };

    keep.put(b"spoke to spoke", Vec::new()).unwrap();
    assert_eq!(moved.get().unwrap().0, b"spoke to spoke");
    moved.put(b"and back again", Vec::new()).unwrap();
    assert_eq!(keep.get().unwrap().0, b"and back again");
}
