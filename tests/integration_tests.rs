//! End-to-end NAT classification against scripted STUN servers

use netscout_discovery::{
    AddressDiagnosticsKit, AddressPool, AddressPoolEntry, AddressPreference, DiagnosticsState,
    DiscoveryConfig, EntryKey, FirewallType, NatType, NetworkAddressManager, StaticInterfaces,
};
use netscout_integration_tests::fixtures::{Mapping, ScriptedStunServer, ServerBehavior};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config(server: &ScriptedStunServer) -> DiscoveryConfig {
    DiscoveryConfig {
        transaction_timeout_ms: 300,
        port_range: (20000, 60000),
        ..DiscoveryConfig::with_stun_server(server.addr().to_string())
    }
}

fn loopback_kit(server: &ScriptedStunServer, config: DiscoveryConfig) -> AddressDiagnosticsKit {
    let entry = Arc::new(AddressPoolEntry::new("127.0.0.1".parse().unwrap(), "lo").unwrap());
    AddressDiagnosticsKit::new(
        entry,
        Arc::new(config),
        Some(server.addr()),
        CancellationToken::new(),
    )
}

fn public(port: u16) -> SocketAddr {
    SocketAddr::new("203.0.113.5".parse().unwrap(), port)
}

// ============================================================================
// Scenarios without STUN
// ============================================================================

#[tokio::test]
async fn test_ipv6_link_local_never_contacts_server() {
    let server = ScriptedStunServer::spawn(ServerBehavior::open_internet()).await;
    let interfaces = StaticInterfaces::default().with("eth0", "fe80::1".parse().unwrap());
    let mut pool = AddressPool::new(fast_config(&server), Arc::new(interfaces));

    pool.init_pool().await.unwrap();
    pool.wait_for_diagnostics().await;

    let entries = pool.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].preference(), Some(AddressPreference::LOCAL_IPV6));
    assert_eq!(
        pool.state_of(entries[0].key()).await,
        Some(DiagnosticsState::Terminated)
    );
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn test_private_ipv4_with_stun_disabled() {
    let server = ScriptedStunServer::spawn(ServerBehavior::open_internet()).await;
    let config = DiscoveryConfig {
        stun_enabled: false,
        ..fast_config(&server)
    };
    let interfaces = StaticInterfaces::default().with("eth0", "192.168.1.10".parse().unwrap());
    let mut pool = AddressPool::new(config, Arc::new(interfaces));

    pool.init_pool().await.unwrap();
    pool.wait_for_diagnostics().await;

    let key = EntryKey {
        address: "192.168.1.10".parse().unwrap(),
        interface: "eth0".to_string(),
    };
    assert_eq!(pool.state_of(&key).await, Some(DiagnosticsState::Terminated));
    assert_eq!(
        pool.entries()[0].preference(),
        Some(AddressPreference::PRIVATE_IPV4)
    );
    assert!(pool.stun_server().is_none());
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn test_unresolvable_server_disables_stun() {
    let config = DiscoveryConfig {
        transaction_timeout_ms: 300,
        ..DiscoveryConfig::with_stun_server("stun.invalid:3478")
    };
    let interfaces = StaticInterfaces::default().with("eth0", "10.0.0.1".parse().unwrap());
    let mut pool = AddressPool::new(config, Arc::new(interfaces));

    assert_eq!(pool.init_pool().await.unwrap(), 1);
    pool.wait_for_diagnostics().await;
    assert!(pool.stun_server().is_none());
    assert_eq!(
        pool.entries()[0].preference(),
        Some(AddressPreference::PRIVATE_IPV4)
    );
}

#[tokio::test]
async fn test_manager_falls_back_to_wildcard() {
    let interfaces = StaticInterfaces::default().with("lo", "127.0.0.1".parse().unwrap());
    let manager =
        NetworkAddressManager::start(DiscoveryConfig::stun_disabled(), Arc::new(interfaces))
            .await
            .unwrap();

    assert_eq!(manager.best_local_address(), IpAddr::from([0, 0, 0, 0]));
    assert_eq!(manager.discovery_report().nat_type(), NatType::Unknown);
    assert_eq!(
        manager.public_address_for(4000).await.unwrap(),
        "0.0.0.0:4000".parse().unwrap()
    );
}

// ============================================================================
// STUN classification
// ============================================================================

#[tokio::test]
async fn test_udp_blocked() {
    let server = ScriptedStunServer::spawn(ServerBehavior::silent()).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let entry = kit.entry();
    assert_eq!(entry.preference(), Some(AddressPreference::GLOBAL_IPV4));
    assert!(entry.firewall_descriptor().is_none());
    assert_eq!(server.request_count(), 1);

    let report = kit.report().unwrap();
    assert_eq!(report.nat_type(), NatType::UdpBlockingFirewall);
    assert!(report.public_address().is_none());
}

#[tokio::test]
async fn test_open_internet() {
    let server = ScriptedStunServer::spawn(ServerBehavior::open_internet()).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let entry = kit.entry();
    assert_eq!(entry.preference(), Some(AddressPreference::GLOBAL_IPV4));

    let descriptor = entry.firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::OpenInternet);
    assert_eq!(descriptor.preference_subtrahend(), AddressPreference::MIN);
    assert!(!descriptor.is_translating_addresses());
    assert_eq!(descriptor.bindings_lifetime_seconds(), 30);

    let report = kit.report().unwrap();
    assert_eq!(report.nat_type(), NatType::OpenInternet);
    assert_eq!(report.public_address(), descriptor.public_address());
    assert_eq!(
        report.public_address().map(|addr| addr.ip()),
        Some("127.0.0.1".parse().unwrap())
    );
}

#[tokio::test]
async fn test_open_internet_is_stable() {
    let server = ScriptedStunServer::spawn(ServerBehavior::open_internet()).await;

    for _ in 0..3 {
        let kit = loopback_kit(&server, fast_config(&server));
        kit.run().await;
        assert_eq!(
            kit.entry().firewall_descriptor().map(|d| d.firewall_type()),
            Some(FirewallType::OpenInternet)
        );
    }
}

#[tokio::test]
async fn test_symmetric_udp_firewall() {
    let server = ScriptedStunServer::spawn(ServerBehavior::symmetric_firewall()).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::Symmetric);
    assert!(!descriptor.is_translating_addresses());
    assert_eq!(kit.entry().preference(), Some(AddressPreference::new(20)));
    assert_eq!(kit.report().unwrap().nat_type(), NatType::SymmetricUdpFirewall);
}

#[tokio::test]
async fn test_full_cone() {
    let behavior = ServerBehavior {
        answer_change_ip: true,
        answer_change_port: true,
        ..ServerBehavior::nat(public(40000))
    };
    let server = ScriptedStunServer::spawn(behavior).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::FullCone);
    assert!(descriptor.is_translating_addresses());
    assert_eq!(descriptor.public_address(), Some(public(40000)));
    assert_eq!(kit.entry().preference(), Some(AddressPreference::new(55)));
    assert_eq!(kit.report().unwrap().nat_type(), NatType::FullConeNat);
}

#[tokio::test]
async fn test_symmetric_nat() {
    let secondary = ScriptedStunServer::spawn(ServerBehavior::nat(public(40001))).await;
    let primary = ScriptedStunServer::spawn(
        ServerBehavior::nat(public(40000)).with_changed_address(secondary.addr()),
    )
    .await;
    let kit = loopback_kit(&primary, fast_config(&primary));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::Symmetric);
    assert!(descriptor.is_translating_addresses());
    assert_eq!(kit.entry().preference(), Some(AddressPreference::new(20)));
    assert_eq!(secondary.request_count(), 1);

    let report = kit.report().unwrap();
    assert_eq!(report.nat_type(), NatType::SymmetricNat);
    assert_eq!(report.public_address(), Some(public(40000)));
}

#[tokio::test]
async fn test_port_restricted_cone() {
    let secondary = ScriptedStunServer::spawn(ServerBehavior::nat(public(40000))).await;
    let primary = ScriptedStunServer::spawn(
        ServerBehavior::nat(public(40000)).with_changed_address(secondary.addr()),
    )
    .await;
    let kit = loopback_kit(&primary, fast_config(&primary));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::PortRestrictedCone);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::new(45)));
    assert_eq!(kit.report().unwrap().nat_type(), NatType::PortRestrictedConeNat);
    // Test I, test II, test III
    assert_eq!(primary.request_count(), 3);
}

#[tokio::test]
async fn test_restricted_cone() {
    let secondary = ScriptedStunServer::spawn(ServerBehavior::nat(public(40000))).await;
    let behavior = ServerBehavior {
        answer_change_port: true,
        ..ServerBehavior::nat(public(40000)).with_changed_address(secondary.addr())
    };
    let primary = ScriptedStunServer::spawn(behavior).await;
    let kit = loopback_kit(&primary, fast_config(&primary));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::RestrictedCone);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::new(50)));
    assert_eq!(kit.report().unwrap().nat_type(), NatType::RestrictedConeNat);
}

// ============================================================================
// Inconclusive runs
// ============================================================================

#[tokio::test]
async fn test_missing_mapped_address() {
    let behavior = ServerBehavior {
        omit_mapped_address: true,
        ..ServerBehavior::open_internet()
    };
    let server = ScriptedStunServer::spawn(behavior).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::GLOBAL_IPV4));
    assert!(kit.entry().firewall_descriptor().is_none());
    assert_eq!(kit.report().unwrap().nat_type(), NatType::Unknown);
    assert_eq!(server.request_count(), 1);
}

#[tokio::test]
async fn test_secondary_server_down() {
    let secondary = ScriptedStunServer::spawn(ServerBehavior::silent()).await;
    let primary = ScriptedStunServer::spawn(
        ServerBehavior::nat(public(40000)).with_changed_address(secondary.addr()),
    )
    .await;
    let kit = loopback_kit(&primary, fast_config(&primary));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert!(kit.entry().firewall_descriptor().is_none());
    assert_eq!(kit.entry().preference(), Some(AddressPreference::GLOBAL_IPV4));

    let report = kit.report().unwrap();
    assert_eq!(report.nat_type(), NatType::Unknown);
    assert_eq!(report.public_address(), Some(public(40000)));
}

#[tokio::test]
async fn test_missing_changed_address() {
    // NAT detected, test II unanswered, nowhere to run the secondary test I
    let server = ScriptedStunServer::spawn(ServerBehavior::nat(public(40000))).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::GLOBAL_IPV4));
    assert!(kit.entry().firewall_descriptor().is_none());

    let report = kit.report().unwrap();
    assert_eq!(report.nat_type(), NatType::Unknown);
    assert_eq!(report.public_address(), Some(public(40000)));
    assert_eq!(server.request_count(), 2);
}

#[tokio::test]
async fn test_transport_error_terminates_entry() {
    // An IPv4 socket cannot send to an IPv6 server
    let server: SocketAddr = "[::1]:3478".parse().unwrap();
    let config = DiscoveryConfig {
        transaction_timeout_ms: 300,
        port_range: (20000, 60000),
        ..DiscoveryConfig::with_stun_server(server.to_string())
    };
    let entry = Arc::new(AddressPoolEntry::new("127.0.0.1".parse().unwrap(), "lo").unwrap());
    let kit = AddressDiagnosticsKit::new(
        entry,
        Arc::new(config),
        Some(server),
        CancellationToken::new(),
    );

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::GLOBAL_IPV4));
    assert!(kit.entry().firewall_descriptor().is_none());
    assert!(kit.report().is_none());
}

#[tokio::test]
async fn test_ignored_change_request_is_not_full_cone() {
    let server =
        ScriptedStunServer::spawn(ServerBehavior::ignoring_change_request(Mapping::Fixed(
            public(40000),
        )))
        .await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);

    // Test II was answered from the primary address and so discarded
    let report = kit.report().unwrap();
    assert_ne!(report.nat_type(), NatType::FullConeNat);
    assert_eq!(report.nat_type(), NatType::Unknown);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::GLOBAL_IPV4));
    assert!(kit.entry().firewall_descriptor().is_none());
}

#[tokio::test]
async fn test_ignored_change_request_cannot_pass_test_three() {
    let secondary = ScriptedStunServer::spawn(ServerBehavior::nat(public(40000))).await;
    let primary = ScriptedStunServer::spawn(
        ServerBehavior::ignoring_change_request(Mapping::Fixed(public(40000)))
            .with_changed_address(secondary.addr()),
    )
    .await;
    let kit = loopback_kit(&primary, fast_config(&primary));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert_eq!(
        kit.report().unwrap().nat_type(),
        NatType::PortRestrictedConeNat
    );
    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::PortRestrictedCone);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::new(45)));
}

#[tokio::test]
async fn test_error_response_counts_as_no_response() {
    let behavior = ServerBehavior {
        error_response: true,
        ..ServerBehavior::open_internet()
    };
    let server = ScriptedStunServer::spawn(behavior).await;
    let kit = loopback_kit(&server, fast_config(&server));

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert_eq!(kit.report().unwrap().nat_type(), NatType::UdpBlockingFirewall);
    assert!(kit.entry().firewall_descriptor().is_none());
}

// ============================================================================
// Binding lifetime and cancellation
// ============================================================================

#[tokio::test]
async fn test_binding_lifetime_discovery() {
    let server = ScriptedStunServer::spawn(ServerBehavior::symmetric_firewall()).await;
    let config = DiscoveryConfig {
        discover_binding_lifetime: true,
        max_binding_lifetime_secs: 2,
        ..fast_config(&server)
    };
    let kit = loopback_kit(&server, config);

    assert_eq!(kit.run().await, DiagnosticsState::Completed);

    let descriptor = kit.entry().firewall_descriptor().unwrap();
    assert_eq!(descriptor.firewall_type(), FirewallType::Symmetric);
    // Nothing ever expires on loopback, so the search ends at the bound
    assert_eq!(descriptor.bindings_lifetime_seconds(), 2);
}

#[tokio::test]
async fn test_open_internet_skips_lifetime_discovery() {
    let server = ScriptedStunServer::spawn(ServerBehavior::open_internet()).await;
    let config = DiscoveryConfig {
        discover_binding_lifetime: true,
        max_binding_lifetime_secs: 2,
        ..fast_config(&server)
    };
    let kit = loopback_kit(&server, config);

    assert_eq!(kit.run().await, DiagnosticsState::Terminated);
    assert_eq!(server.request_count(), 2);
}

#[tokio::test]
async fn test_cancellation_stops_kit() {
    let server = ScriptedStunServer::spawn(ServerBehavior::silent()).await;
    let config = DiscoveryConfig {
        transaction_timeout_ms: 30_000,
        ..fast_config(&server)
    };
    let cancel = CancellationToken::new();
    let entry = Arc::new(AddressPoolEntry::new("127.0.0.1".parse().unwrap(), "lo").unwrap());
    let kit = Arc::new(AddressDiagnosticsKit::new(
        entry,
        Arc::new(config),
        Some(server.addr()),
        cancel.clone(),
    ));

    let runner = kit.clone();
    let task = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(kit.state().await, DiagnosticsState::Resolving);
    cancel.cancel();

    let state = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("kit did not stop")
        .unwrap();
    assert_eq!(state, DiagnosticsState::Terminated);
    assert_eq!(kit.entry().preference(), Some(AddressPreference::GLOBAL_IPV4));
    assert!(kit.report().is_none());
}
