//! Integration tests for l4plane.
//!
//! These drive a full balancer through its operation API with the
//! in-memory store and synchronizer backends.

use l4plane::balancer::{Addressing, Balancer, Components, Settings};
use l4plane::config::load_config;
use l4plane::error::{EntityKind, Error};
use l4plane::metrics::MetricsCollector;
use l4plane::model::{Destination, ForwardMode, Scheduler, Service, State};
use l4plane::store::{ElectionKey, MemoryStore, Store};
use l4plane::sync::memory::{MemoryFirewall, MemoryInterface, MemoryKernel, MemoryRoutes};
use l4plane::sync::{FirewallSyncer, InterfaceSyncer, KernelSyncer, RouteSyncer, SnatRule};
use std::collections::HashSet;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const OUTBOUND: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);

/// One balancer node and handles on its backends.
struct Node {
    balancer: Arc<Balancer>,
    kernel: Arc<MemoryKernel>,
    firewall: Arc<MemoryFirewall>,
    iface: Arc<MemoryInterface>,
    routes: Arc<MemoryRoutes>,
}

async fn start_node(store: &Arc<MemoryStore>, id: &str, ranges: &[&str], anycast: bool) -> Node {
    let kernel = Arc::new(MemoryKernel::new());
    let firewall = Arc::new(MemoryFirewall::new());
    let iface = Arc::new(MemoryInterface::new());
    let routes = Arc::new(MemoryRoutes::new());

    let addressing = if anycast {
        Addressing::Anycast(Arc::new(RouteSyncer::new(routes.clone())))
    } else {
        Addressing::Unicast(Arc::new(InterfaceSyncer::new(iface.clone())))
    };
    let components = Components {
        store: store.clone(),
        election: store.election(id),
        kernel: Arc::new(KernelSyncer::new(kernel.clone())),
        firewall: Arc::new(
            FirewallSyncer::new(firewall.clone(), Some(OUTBOUND))
                .await
                .unwrap(),
        ),
        addressing,
        metrics: MetricsCollector::new(),
    };
    let settings = Settings {
        vip_ranges: ranges.iter().map(|r| r.parse().unwrap()).collect(),
        ..Settings::default()
    };

    Node {
        balancer: Balancer::start(settings, components).await.unwrap(),
        kernel,
        firewall,
        iface,
        routes,
    }
}

async fn single_node(ranges: &[&str]) -> Node {
    start_node(&Arc::new(MemoryStore::new()), "node-1", ranges, false).await
}

async fn settle<F>(balancer: &Balancer, predicate: F)
where
    F: FnMut(&State) -> bool,
{
    assert!(
        balancer.wait_until(Duration::from_secs(2), predicate).await,
        "state never converged"
    );
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn network_bases(ranges: &[&str]) -> HashSet<Ipv4Addr> {
    ranges
        .iter()
        .map(|r| r.parse::<cidr::Ipv4Cidr>().unwrap().first_address())
        .collect()
}

#[tokio::test]
async fn test_vips_unique_and_never_network_base() {
    let ranges = ["192.168.0.0/30", "192.168.1.0/29"];
    let node = single_node(&ranges).await;

    let mut seen = HashSet::new();
    for i in 0..8 {
        let svc = node
            .balancer
            .add_service(Service::new(format!("svc-{}", i), 80))
            .await
            .unwrap();
        let vip = svc.address.expect("address assigned");
        assert!(!network_bases(&ranges).contains(&vip));
        assert!(seen.insert(vip), "{} handed out twice", vip);
    }

    // 3 usable addresses in the /30 plus 7 in the /29.
    settle(&node.balancer, |s| s.service_count() == 8).await;
    let first = node.balancer.get_service("svc-0").unwrap();
    assert_eq!(first.address, Some(Ipv4Addr::new(192, 168, 0, 1)));
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_service_name_conflicts() {
    let node = single_node(&["192.168.0.0/28"]).await;
    node.balancer.add_service(Service::new("web", 80)).await.unwrap();

    // Rejected by the store even before the first add has propagated.
    let err = node.balancer.add_service(Service::new("web", 443)).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { kind: EntityKind::Service, .. }));

    settle(&node.balancer, |s| s.get_service("web").is_some()).await;
    let err = node.balancer.add_service(Service::new("web", 443)).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { kind: EntityKind::Service, .. }));
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_pool_exhaustion() {
    let node = single_node(&["10.1.0.0/31"]).await;
    let svc = node.balancer.add_service(Service::new("a", 80)).await.unwrap();
    assert_eq!(svc.address, Some(Ipv4Addr::new(10, 1, 0, 1)));

    let err = node.balancer.add_service(Service::new("b", 80)).await.unwrap_err();
    assert!(matches!(err, Error::NoAddressAvailable));

    // Deleting the owner frees its address again.
    settle(&node.balancer, |s| s.get_service("a").is_some()).await;
    node.balancer.delete_service("a").await.unwrap();
    settle(&node.balancer, |s| s.service_count() == 0).await;
    let svc = node.balancer.add_service(Service::new("b", 80)).await.unwrap();
    assert_eq!(svc.address, Some(Ipv4Addr::new(10, 1, 0, 1)));
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_no_ranges_configured() {
    let node = single_node(&[]).await;
    let err = node.balancer.add_service(Service::new("a", 80)).await.unwrap_err();
    assert!(matches!(err, Error::NoAddressAvailable));
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_destinations_match_adds_and_deletes() {
    let node = single_node(&["192.168.0.0/28"]).await;
    node.balancer.add_service(Service::new("web", 80)).await.unwrap();
    settle(&node.balancer, |s| s.get_service("web").is_some()).await;

    for (name, last) in [("web-c", 3), ("web-a", 1), ("web-b", 2)] {
        let dst = Destination::new(name, "", Ipv4Addr::new(10, 0, 0, last), 8080);
        node.balancer.add_destination("web", dst).await.unwrap();
    }
    settle(&node.balancer, |s| s.get_destinations("web").len() == 3).await;
    node.balancer.delete_destination("web-a").await.unwrap();
    settle(&node.balancer, |s| s.get_destinations("web").len() == 2).await;

    let names: HashSet<String> = node
        .balancer
        .get_destinations("web")
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    let expected: HashSet<String> = ["web-b", "web-c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(names, expected);
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_snat_rule_follows_nat_service() {
    let node = single_node(&["192.168.0.0/28"]).await;
    let mut svc = Service::new("svcA", 80);
    svc.mode = ForwardMode::Nat;
    svc.scheduler = Scheduler::Rr;
    let svc = node.balancer.add_service(svc).await.unwrap();
    settle(&node.balancer, |s| s.get_service("svcA").is_some()).await;

    let d1 = Destination::new("d1", "", Ipv4Addr::new(10, 0, 0, 1), 8080);
    node.balancer.add_destination("svcA", d1).await.unwrap();
    settle(&node.balancer, |s| s.get_destination("d1").is_some()).await;

    node.balancer.reconcile().await.unwrap();
    assert_eq!(
        node.firewall.rules_now(),
        vec![SnatRule {
            vip: svc.address.unwrap(),
            port: 80,
            to_source: OUTBOUND,
        }]
    );
    assert_eq!(node.kernel.table().len(), 1);
    assert_eq!(node.kernel.table()[0].destinations.len(), 1);

    node.balancer.delete_service("svcA").await.unwrap();
    settle(&node.balancer, |s| s.service_count() == 0).await;
    node.balancer.reconcile().await.unwrap();
    assert!(node.firewall.rules_now().is_empty());
    assert!(node.kernel.table().is_empty());
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_routed_service_gets_no_snat_rule() {
    let node = single_node(&["192.168.0.0/28"]).await;
    let mut svc = Service::new("dr", 80);
    svc.mode = ForwardMode::Route;
    node.balancer.add_service(svc).await.unwrap();
    settle(&node.balancer, |s| s.get_service("dr").is_some()).await;

    node.balancer.reconcile().await.unwrap();
    assert!(node.firewall.rules_now().is_empty());
    assert_eq!(node.kernel.table().len(), 1);
    node.balancer.shutdown().await;
}

#[tokio::test]
async fn test_failover_moves_vips() {
    let store = Arc::new(MemoryStore::with_election(Arc::new(ElectionKey::new())));
    let first = start_node(&store, "node-1", &["192.168.0.0/28"], false).await;
    eventually(|| first.balancer.is_leader()).await;
    let second = start_node(&store, "node-2", &["192.168.0.0/28"], false).await;

    for (name, port) in [("web", 80), ("dns", 53)] {
        first.balancer.add_service(Service::new(name, port)).await.unwrap();
    }
    settle(&second.balancer, |s| s.service_count() == 2).await;
    eventually(|| first.iface.addresses_now().len() == 2).await;
    assert!(!second.balancer.is_leader());
    assert!(second.iface.addresses_now().is_empty());

    // The leader goes away; its VIPs move to the remaining node.
    first.balancer.shutdown().await;
    assert!(first.iface.addresses_now().is_empty());
    eventually(|| second.balancer.is_leader()).await;
    eventually(|| second.iface.addresses_now().len() == 2).await;
    second.balancer.shutdown().await;
}

#[tokio::test]
async fn test_anycast_nodes_all_announce() {
    let store = Arc::new(MemoryStore::new());
    let a = start_node(&store, "node-a", &["192.168.0.0/28"], true).await;
    let b = start_node(&store, "node-b", &["192.168.0.0/28"], true).await;

    let svc = a.balancer.add_service(Service::new("web", 80)).await.unwrap();
    let vip = svc.address.unwrap();

    eventually(|| a.routes.routes_now() == vec![vip]).await;
    eventually(|| b.routes.routes_now() == vec![vip]).await;
    assert!(a.iface.addresses_now().is_empty());
    assert!(b.iface.addresses_now().is_empty());

    store.delete_service("web").await.unwrap();
    eventually(|| a.routes.routes_now().is_empty() && b.routes.routes_now().is_empty()).await;
    a.balancer.shutdown().await;
    b.balancer.shutdown().await;
}

#[tokio::test]
async fn test_seed_from_config_file() {
    let yaml = r#"
node:
  id: node-1
  outbound_address: 10.0.0.254
  vip_ranges: ["192.168.0.0/28"]
  backend: memory

health_check_defaults:
  interval: 1h
  timeout: 2s

services:
  - name: web
    port: 80
    destinations:
      - name: web-1
        address: 10.0.0.10
        port: 8080
      - name: web-2
        address: 10.0.0.11
        port: 8080
    checks:
      - type: tcp
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    let config = load_config(file.path()).unwrap();

    let store = Arc::new(MemoryStore::new());
    let node = start_node(&store, &config.node.id, &["192.168.0.0/28"], false).await;
    node.balancer.set_vip_ranges(config.node.vip_ranges.clone());

    assert_eq!(node.balancer.apply_seed(&config.services).await, 4);
    settle(&node.balancer, |s| {
        s.get_destinations("web").len() == 2 && s.get_checks().len() == 1
    })
    .await;
    assert_eq!(node.balancer.get_checks()[0].id, "web-tcp");
    eventually(|| node.balancer.health().running().len() == 2).await;

    // A reload with the same seed list changes nothing.
    assert_eq!(node.balancer.apply_seed(&config.services).await, 0);
    node.balancer.shutdown().await;
}
