use std::net::SocketAddr;
use std::time::Duration;

use discovery::{LocalRegistry, Service, ServiceEvent, ServiceRegistry};
use protocol::DuplicateNode;
use tokio::time::timeout;

fn setup_tracing() {
    use tracing_subscriber::{filter, prelude::*};

    let fmt = tracing_subscriber::fmt::layer()
        .pretty()
        .with_test_writer();

    let _ignore_err = tracing_subscriber::registry()
        .with(fmt)
        .with(filter::LevelFilter::INFO)
        .try_init();
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[test]
fn resolves_registered_nodes() {
    setup_tracing();
    let registry = LocalRegistry::new();
    registry.register(Service::new("disk", "1", addr(4000)));
    registry.register(Service::new("disk", "2", addr(4001)));
    registry.register(Service::new("other", "1", addr(4002)));

    assert_eq!(registry.resolve(&DuplicateNode::new("disk", "2")).unwrap(), addr(4001));
    assert!(registry.resolve(&DuplicateNode::new("disk", "3")).is_err());
    let ids: Vec<_> = registry.services("disk").into_iter().map(|s| s.id).collect();
    assert_eq!(ids, ["1", "2"]);
}

#[test]
fn registering_twice_is_not_news() {
    let registry = LocalRegistry::new();
    assert!(registry.register(Service::new("disk", "1", addr(4000))));
    assert!(!registry.register(Service::new("disk", "1", addr(4000))));
    assert!(registry.register(Service::new("disk", "1", addr(4010))));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn watch_only_sees_its_group() {
    setup_tracing();
    let registry = LocalRegistry::new();
    let mut watch = registry.watch("disk");

    registry.register(Service::new("other", "9", addr(5000)));
    registry.register(Service::new("disk", "1", addr(5001)));
    registry.unregister("disk", "1");

    let added = timeout(Duration::from_secs(1), watch.recv()).await.unwrap();
    assert_eq!(added, Some(ServiceEvent::Added(Service::new("disk", "1", addr(5001)))));
    let removed = timeout(Duration::from_secs(1), watch.recv()).await.unwrap();
    assert!(matches!(removed, Some(ServiceEvent::Removed(s)) if s.id == "1"));
}

#[test]
fn unregister_unknown_is_none() {
    let registry = LocalRegistry::new();
    assert!(registry.unregister("disk", "1").is_none());
}
