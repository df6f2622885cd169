//! Peer Module Tests
//!
//! Runs the master's connection layer against simulated peers over in-memory
//! duplex streams.
//!
//! ## Test Scopes
//! - **Lifecycle**: handshake outcomes, registry bookkeeping, state events.
//! - **RPC**: correlation of out-of-order responses, timeouts, in-flight failure.
//! - **Health**: error threshold boundary, unrecoverable remote errors, keepalive.

#[cfg(test)]
mod tests {
    use crate::error::{PeerError, RpcError};
    use crate::peer::connection::PeerConnection;
    use crate::peer::registry::PeerRegistry;
    use crate::peer::remote::RemotePeer;
    use crate::peer::types::{
        Direction, DiskStatus, HealthSettings, PeerDefinition, PeerName, PeerState,
    };
    use crate::protocol::central::{ProtocolCentral, RpcSettings};
    use crate::protocol::envelope::ResponseBody;
    use crate::protocol::issuer::basic;
    use crate::protocol::testing::{MemoryDisk, spawn_peer};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn disk() -> DiskStatus {
        DiskStatus {
            free_bytes: 10_000,
            total_bytes: 20_000,
        }
    }

    fn registry() -> Arc<PeerRegistry> {
        PeerRegistry::new(HealthSettings::default(), RpcSettings::default())
    }

    async fn connected(
        registry: &PeerRegistry,
        name: &str,
        memory: &Arc<MemoryDisk>,
    ) -> Arc<RemotePeer> {
        let peer = registry
            .add_peer(PeerDefinition::new(name, "memory"))
            .unwrap();
        let stream = spawn_peer(name, memory.registry(), disk());
        peer.connect_stream(stream, &ProtocolCentral::builtin())
            .await
            .unwrap();
        peer
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_handshake_makes_peer_available() {
        let registry = registry();
        let mut events = registry.subscribe();
        let memory = MemoryDisk::new();

        let peer = connected(&registry, "alpha", &memory).await;

        assert_eq!(peer.state(), PeerState::Available);
        assert!(registry.is_available(&PeerName::new("alpha")));
        assert_eq!(
            peer.connection().unwrap().extensions(),
            &["basic".to_string(), "transfer".to_string()]
        );

        let first = events.recv().await.unwrap();
        assert_eq!(first.to, PeerState::Handshaking);
        let second = events.recv().await.unwrap();
        assert_eq!(second.from, PeerState::Handshaking);
        assert_eq!(second.to, PeerState::Available);
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_peer_offline() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = registry
            .add_peer(PeerDefinition::new("alpha", "memory"))
            .unwrap();
        let stream = spawn_peer("alpha", memory.basic_only_registry(), disk());

        let result = peer
            .connect_stream(stream, &ProtocolCentral::builtin())
            .await;

        assert!(matches!(result, Err(PeerError::HandshakeError { .. })));
        assert_eq!(peer.state(), PeerState::Offline);
        assert!(!peer.is_available());
        assert!(matches!(
            peer.issue(basic::EXTENSION, basic::PING, Vec::new()).await,
            Err(RpcError::Peer(PeerError::PeerUnavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        let again = peer
            .connect_stream(
                spawn_peer("alpha", memory.registry(), disk()),
                &ProtocolCentral::builtin(),
            )
            .await;

        assert!(matches!(again, Err(PeerError::AlreadyOnline(_))));
        assert_eq!(peer.state(), PeerState::Available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_yield_one_connection() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = registry
            .add_peer(PeerDefinition::new("alpha", "memory"))
            .unwrap();
        let central = ProtocolCentral::builtin();

        let mut dialers = Vec::new();
        for _ in 0..8 {
            let peer = peer.clone();
            let central = central.clone();
            let stream = spawn_peer("alpha", memory.registry(), disk());
            dialers.push(tokio::spawn(async move {
                peer.connect_stream(stream, &central).await
            }));
        }

        let mut connected = 0;
        for dialer in dialers {
            match dialer.await.unwrap() {
                Ok(()) => connected += 1,
                Err(e) => assert!(matches!(e, PeerError::AlreadyOnline(_)), "{:?}", e),
            }
        }

        assert_eq!(connected, 1);
        assert_eq!(peer.state(), PeerState::Available);
    }

    #[tokio::test]
    async fn test_removal_reports_a_single_disconnect() {
        let registry = registry();
        let memory = MemoryDisk::new();
        connected(&registry, "alpha", &memory).await;
        let mut events = registry.subscribe();

        let peer = registry.remove_peer(&PeerName::new("alpha")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = events.try_recv().unwrap();
        assert_eq!(event.from, PeerState::Available);
        assert_eq!(event.to, PeerState::Disconnected);
        assert!(events.try_recv().is_err(), "removal is not an offline fault");
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert!(peer.connection().is_err());
    }

    #[tokio::test]
    async fn test_initial_disk_status_is_recorded() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        assert!(wait_for(|| peer.disk_status() == Some(disk())).await);
    }

    #[test]
    fn test_registry_bookkeeping() {
        let registry = registry();
        registry
            .add_peer(PeerDefinition::new("beta", "b:1"))
            .unwrap();
        registry
            .add_peer(PeerDefinition::new("alpha", "a:1"))
            .unwrap();

        assert!(matches!(
            registry.add_peer(PeerDefinition::new("alpha", "a:2")),
            Err(PeerError::AlreadyExists(_))
        ));
        let names: Vec<_> = registry
            .peers()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(registry.available_peers().is_empty());

        registry.remove_peer(&PeerName::new("alpha")).unwrap();
        assert!(matches!(
            registry.get(&PeerName::new("alpha")),
            Err(PeerError::UnknownPeer(_))
        ));
        assert!(!registry.is_available(&PeerName::new("alpha")));
        assert_eq!(registry.len(), 1);
    }

    // ============================================================
    // RPC TESTS
    // ============================================================

    #[tokio::test]
    async fn test_issue_before_handshake_fails_fast() {
        let conn = PeerConnection::new(PeerName::new("alpha"), vec!["basic".into()], 4);

        let result = conn
            .issue(basic::EXTENSION, basic::PING, Vec::new(), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(RpcError::HandshakeIncomplete { .. })));
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_extension_must_be_negotiated() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        let result = peer.issue("compression", "squeeze", Vec::new()).await;

        assert!(matches!(result, Err(RpcError::ExtensionNotNegotiated(_))));
    }

    #[tokio::test]
    async fn test_responses_are_correlated_out_of_order() {
        let registry = registry();
        let memory = MemoryDisk::new();
        memory.add_file("/slow.bin", 1, 111);
        memory.add_file("/fast.bin", 1, 222);
        memory
            .checksum_delays
            .lock()
            .insert("/slow.bin".into(), Duration::from_millis(300));
        let peer = connected(&registry, "alpha", &memory).await;
        let central = ProtocolCentral::builtin();

        let slow = central.basic().issue_checksum(&peer, "/slow.bin").await.unwrap();
        let fast = central.basic().issue_checksum(&peer, "/fast.bin").await.unwrap();
        assert_ne!(slow, fast);

        assert_eq!(
            peer.fetch_response(fast).await.unwrap(),
            ResponseBody::Checksum(222)
        );
        assert_eq!(
            peer.fetch_response(slow).await.unwrap(),
            ResponseBody::Checksum(111)
        );
        assert_eq!(peer.connection().unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_fetching_unknown_index_fails() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        assert!(matches!(
            peer.fetch_response(999).await,
            Err(RpcError::UnknownIndex(999))
        ));
    }

    #[tokio::test]
    async fn test_timeout_fails_only_that_call() {
        let registry = registry();
        let memory = MemoryDisk::new();
        memory.add_file("/slow.bin", 1, 1);
        memory
            .checksum_delays
            .lock()
            .insert("/slow.bin".into(), Duration::from_secs(5));
        let peer = connected(&registry, "alpha", &memory).await;
        let central = ProtocolCentral::builtin();

        let index = central.basic().issue_checksum(&peer, "/slow.bin").await.unwrap();
        let result = peer
            .fetch_response_within(index, Duration::from_millis(50))
            .await;

        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(peer.connection().unwrap().outstanding(), 0);
        assert_eq!(peer.recent_errors(), 1);
        assert_eq!(peer.state(), PeerState::Available);

        central
            .basic()
            .ping(&peer, Duration::from_secs(5))
            .await
            .expect("connection should still be usable");
    }

    #[tokio::test]
    async fn test_cancelled_fetch_releases_its_index() {
        let registry = registry();
        let memory = MemoryDisk::new();
        memory.add_file("/slow.bin", 1, 1);
        memory
            .checksum_delays
            .lock()
            .insert("/slow.bin".into(), Duration::from_millis(300));
        let peer = connected(&registry, "alpha", &memory).await;
        let central = ProtocolCentral::builtin();

        let index = central.basic().issue_checksum(&peer, "/slow.bin").await.unwrap();
        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.fetch_response(index).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(peer.connection().unwrap().outstanding(), 0);

        // The late response finds nobody waiting and changes nothing.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(peer.connection().unwrap().outstanding(), 0);
        assert_eq!(peer.state(), PeerState::Available);
        assert_eq!(peer.recent_errors(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_commands_fail_when_peer_goes_offline() {
        let registry = registry();
        let memory = MemoryDisk::new();
        memory.add_file("/slow.bin", 1, 1);
        memory
            .checksum_delays
            .lock()
            .insert("/slow.bin".into(), Duration::from_secs(5));
        let peer = connected(&registry, "alpha", &memory).await;

        let waiter = {
            let peer = peer.clone();
            tokio::spawn(async move {
                ProtocolCentral::builtin()
                    .basic()
                    .checksum(&peer, "/slow.bin")
                    .await
            })
        };
        assert!(wait_for(|| peer.connection().map(|c| c.outstanding()) == Ok(1)).await);

        peer.mark_unavailable("operator pulled the plug");

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(peer.state(), PeerState::Offline);
    }

    #[tokio::test]
    async fn test_exhausted_index_pool_takes_peer_offline() {
        let health = HealthSettings {
            response_timeout: Duration::from_millis(200),
            ..HealthSettings::default()
        };
        let rpc = RpcSettings {
            index_pool_size: 2,
            ..RpcSettings::default()
        };
        let registry = PeerRegistry::new(health, rpc);
        let memory = MemoryDisk::new();
        memory.add_file("/slow.bin", 1, 1);
        memory
            .checksum_delays
            .lock()
            .insert("/slow.bin".into(), Duration::from_secs(5));
        let peer = connected(&registry, "alpha", &memory).await;
        let central = ProtocolCentral::builtin();

        central.basic().issue_checksum(&peer, "/slow.bin").await.unwrap();
        central.basic().issue_checksum(&peer, "/slow.bin").await.unwrap();
        let third = central.basic().issue_checksum(&peer, "/slow.bin").await;

        assert!(third.unwrap_err().is_unavailable());
        assert_eq!(peer.state(), PeerState::Offline);
    }

    // ============================================================
    // HEALTH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_error_threshold_boundary() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        for i in 0..5 {
            assert!(!peer.record_error(&format!("error {}", i)));
            assert_eq!(peer.state(), PeerState::Available);
        }
        assert!(peer.record_error("one too many"));
        assert_eq!(peer.state(), PeerState::Offline);
        assert!(peer.connection().is_err());
    }

    #[tokio::test]
    async fn test_per_peer_threshold_override() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let mut definition = PeerDefinition::new("alpha", "memory");
        definition
            .properties
            .insert("max_errors".into(), "1".into());
        let peer = registry.add_peer(definition).unwrap();
        peer.connect_stream(
            spawn_peer("alpha", memory.registry(), disk()),
            &ProtocolCentral::builtin(),
        )
        .await
        .unwrap();

        assert!(!peer.record_error("first"));
        assert!(peer.record_error("second"));
    }

    #[tokio::test]
    async fn test_recoverable_remote_error_keeps_peer_online() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        let result = ProtocolCentral::builtin()
            .basic()
            .checksum(&peer, "/missing.bin")
            .await;

        assert!(matches!(result, Err(RpcError::Remote(_))));
        assert_eq!(peer.state(), PeerState::Available);
    }

    #[tokio::test]
    async fn test_unrecoverable_remote_error_takes_peer_offline() {
        let registry = registry();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        let result = ProtocolCentral::builtin()
            .basic()
            .checksum(&peer, "/explode")
            .await;

        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(peer.state(), PeerState::Offline);
    }

    #[tokio::test]
    async fn test_silent_peer_degrades_then_goes_offline() {
        let health = HealthSettings {
            response_timeout: Duration::from_millis(300),
            ..HealthSettings::default()
        };
        let registry = PeerRegistry::new(health, RpcSettings::default());
        let mut events = registry.subscribe();
        let memory = MemoryDisk::new();
        memory.stall_pings.store(true, Ordering::SeqCst);
        let peer = connected(&registry, "alpha", &memory).await;

        assert!(wait_for(|| peer.state() == PeerState::Offline).await);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.to);
        }
        assert!(seen.contains(&PeerState::Degraded), "events: {:?}", seen);
        assert_eq!(seen.last(), Some(&PeerState::Offline));
    }

    #[tokio::test]
    async fn test_answered_keepalive_restores_availability() {
        let health = HealthSettings {
            response_timeout: Duration::from_millis(300),
            ..HealthSettings::default()
        };
        let registry = PeerRegistry::new(health, RpcSettings::default());
        let mut events = registry.subscribe();
        let memory = MemoryDisk::new();
        let peer = connected(&registry, "alpha", &memory).await;

        tokio::time::sleep(Duration::from_millis(800)).await;

        assert!(peer.state().is_connected());
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.to);
        }
        assert!(!seen.contains(&PeerState::Offline), "events: {:?}", seen);
    }

    // ============================================================
    // TRANSFER BOOKKEEPING TESTS
    // ============================================================

    #[test]
    fn test_transfer_guard_tracks_active_transfers() {
        let registry = registry();
        let peer = registry
            .add_peer(PeerDefinition::new("alpha", "memory"))
            .unwrap();
        assert_eq!(peer.last_transfer(Direction::Store), 0);

        let guard = peer.begin_transfer(Direction::Store);
        assert_eq!(peer.active_transfers(), 1);
        assert!(peer.last_transfer(Direction::Store) > 0);
        assert_eq!(peer.last_transfer(Direction::Retrieve), 0);

        drop(guard);
        assert_eq!(peer.active_transfers(), 0);
    }
}
