use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use distro_replication::test_utils::{
    localhost,
    LoopbackNetwork,
    MemProcessor,
    MemStore,
    RecordingFailedTaskHandler,
    TEST_RESOURCE_TYPE,
};
use distro_replication::{
    DataOperation,
    DistroConfig,
    DistroData,
    DistroError,
    DistroKey,
    DistroProtocol,
    MemberList,
    MemberView,
};

struct TestNode {
    protocol: Arc<DistroProtocol>,
    store: MemStore,
    _view: MemberView,
}

fn spawn_node(
    addr: SocketAddr,
    all_addrs: &[SocketAddr],
    network: &LoopbackNetwork,
    config: DistroConfig,
) -> TestNode {
    let (view, changes) = MemberView::new(MemberList::from_members(all_addrs.iter().copied()));
    let protocol = Arc::new(DistroProtocol::new(addr, changes, config));

    let store = MemStore::default();
    let processor = Arc::new(MemProcessor::new(store.clone()));
    protocol
        .components()
        .register_data_storage(TEST_RESOURCE_TYPE, Arc::new(store.clone()));
    protocol.components().register_data_processor(processor);
    protocol
        .components()
        .register_transport_agent(TEST_RESOURCE_TYPE, Arc::new(network.transport(TEST_RESOURCE_TYPE)));

    network.register(addr, protocol.clone());
    protocol.start();

    TestNode {
        protocol,
        store,
        _view: view,
    }
}

fn spawn_cluster(
    ports: &[u16],
    network: &LoopbackNetwork,
    config: DistroConfig,
) -> Vec<TestNode> {
    let addrs: Vec<SocketAddr> = ports.iter().map(|p| localhost(*p)).collect();
    addrs
        .iter()
        .map(|addr| spawn_node(*addr, &addrs, network, config.clone()))
        .collect()
}

fn key(name: &str) -> DistroKey {
    DistroKey::new(name, TEST_RESOURCE_TYPE)
}

#[tokio::test]
async fn unreachable_peer_does_not_block_reachable_peers() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = LoopbackNetwork::default();
    let nodes = spawn_cluster(&[9201, 9202, 9203], &network, DistroConfig::default());

    network.set_down(localhost(9203), true);

    nodes[0].store.put("svc-1", b"v1".to_vec());
    nodes[0].protocol.sync(key("svc-1"), DataOperation::Add).unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;

    // The healthy peer converged in the same window the dead one failed in.
    assert_eq!(nodes[1].store.get("svc-1"), Some(b"v1".to_vec()));
    assert!(!nodes[2].store.contains("svc-1"));

    let stats = nodes[0].protocol.statistics();
    assert!(stats.sync_sends_success() >= 1);
    assert!(stats.sync_sends_failed() >= 1);

    // Once the peer comes back, retries or anti-entropy repair it.
    network.set_down(localhost(9203), false);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(nodes[2].store.get("svc-1"), Some(b"v1".to_vec()));

    for node in &nodes {
        node.protocol.shutdown();
    }
}

#[tokio::test]
async fn exhausted_retries_are_counted_and_dropped() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = LoopbackNetwork::default();
    let nodes = spawn_cluster(&[9211, 9212], &network, DistroConfig::default());

    network.set_down(localhost(9212), true);

    nodes[0].store.put("svc-1", b"v1".to_vec());
    nodes[0].protocol.sync(key("svc-1"), DataOperation::Add).unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let stats = nodes[0].protocol.statistics();
    assert!(
        stats.retries_exhausted() >= 1,
        "the task should have given up after its retry budget",
    );

    // Verification broadcasts to the dead peer are counted, not raised.
    let record = nodes[0].protocol.last_verify_record();
    assert!(record.failed >= 1);

    // The engine is still fully operational for new work.
    nodes[0].store.put("svc-2", b"v2".to_vec());
    nodes[0].protocol.sync(key("svc-2"), DataOperation::Add).unwrap();

    for node in &nodes {
        node.protocol.shutdown();
    }
}

#[tokio::test]
async fn registered_failed_task_handler_owns_the_retry_policy() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = LoopbackNetwork::default();
    let nodes = spawn_cluster(&[9221, 9222], &network, DistroConfig::default());

    let handler = RecordingFailedTaskHandler::default();
    nodes[0]
        .protocol
        .components()
        .register_failed_task_handler(TEST_RESOURCE_TYPE, Arc::new(handler.clone()));

    network.set_down(localhost(9222), true);

    nodes[0].store.put("svc-1", b"v1".to_vec());
    nodes[0].protocol.sync(key("svc-1"), DataOperation::Add).unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;

    let retries = handler.retries();
    assert!(!retries.is_empty());
    let (failed_key, operation, attempts) = &retries[0];
    assert_eq!(failed_key.resource_key(), "svc-1");
    assert_eq!(failed_key.target(), Some(localhost(9222)));
    assert_eq!(*operation, DataOperation::Add);
    assert_eq!(*attempts, 1);

    // The default backoff path never ran.
    assert_eq!(nodes[0].protocol.statistics().retries_exhausted(), 0);

    for node in &nodes {
        node.protocol.shutdown();
    }
}

#[tokio::test]
async fn unregistered_resource_type_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = LoopbackNetwork::default();
    let nodes = spawn_cluster(&[9231, 9232], &network, DistroConfig::default());

    let res = nodes[0]
        .protocol
        .sync(DistroKey::new("cfg-1", "persistent-config"), DataOperation::Add);
    assert!(matches!(res, Err(DistroError::UnregisteredType(t)) if t == "persistent-config"));

    let inbound = DistroData::new(
        DistroKey::new("cfg-1", "persistent-config"),
        DataOperation::Add,
        b"v1".to_vec(),
    );
    let res = nodes[0].protocol.on_receive(inbound).await;
    assert!(matches!(res, Err(DistroError::UnregisteredType(_))));

    // Control operations cannot be handed to sync.
    let res = nodes[0].protocol.sync(key("svc-1"), DataOperation::Verify);
    assert!(matches!(res, Err(DistroError::InvalidOperation(_))));

    for node in &nodes {
        node.protocol.shutdown();
    }
}
