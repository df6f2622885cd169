//! Coordinator Module Tests
//!
//! ## Test Scopes
//! - **Client calls**: store/retrieve/replication selection against the
//!   namespace built by remerge.
//! - **Admin surface**: peer removal, forced remerge, chain replacement,
//!   the HTTP handlers.
//! - **Background work**: snapshot round trip, reconnect over TCP.

#[cfg(test)]
mod tests {
    use crate::config::MasterConfig;
    use crate::coordinator::handlers::{
        AddPeerRequest, SelectRequest, handle_add_peer, handle_list_owners, handle_remove_peer,
        handle_select, handle_set_chain, OwnersQuery,
    };
    use crate::coordinator::service::Coordinator;
    use crate::error::{CoordinatorError, NamespaceError, NoPeerReason, PeerError};
    use crate::peer::types::{DiskStatus, PeerDefinition, PeerName, PeerState};
    use crate::protocol::endpoint::PeerEndpoint;
    use crate::protocol::testing::{MemoryDisk, spawn_peer};
    use crate::selection::types::{ChainKind, FilterSpec, SelectionContext};
    use axum::Json;
    use axum::extract::{Extension, Path, Query};
    use axum::http::StatusCode;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::Duration;

    const GB: u64 = 1 << 30;

    fn test_config() -> MasterConfig {
        MasterConfig {
            state_path: None,
            reconnect_interval_secs: 1,
            ..MasterConfig::default()
        }
    }

    fn disk(free: u64) -> DiskStatus {
        DiskStatus {
            free_bytes: free,
            total_bytes: free * 2,
        }
    }

    /// Registers `name`, connects it to `memory` and waits for the initial remerge.
    async fn attach(coordinator: &Arc<Coordinator>, name: &str, memory: &Arc<MemoryDisk>) {
        if coordinator.registry().get(&PeerName::new(name)).is_err() {
            coordinator
                .add_peer(PeerDefinition::new(name, "memory"))
                .unwrap();
        }
        let stream = spawn_peer(name, memory.registry(), disk(10 * GB));
        let remerge = coordinator
            .attach_peer(&PeerName::new(name), stream)
            .await
            .unwrap();
        let report = remerge.await.unwrap().unwrap();
        assert!(report.completed);
    }

    fn owners(names: &[&str]) -> BTreeSet<PeerName> {
        names.iter().map(|n| PeerName::new(*n)).collect()
    }

    // ============================================================
    // CLIENT CALL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_connect_publishes_files() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/releases/x/file1.bin", 100, 7);

        attach(&coordinator, "alpha", &alpha).await;

        assert!(coordinator.is_peer_available(&PeerName::new("alpha")));
        assert_eq!(
            coordinator.list_owners("/releases/x/file1.bin").unwrap(),
            owners(&["alpha"])
        );
        assert!(!coordinator.registry().get(&PeerName::new("alpha")).unwrap().is_remerging());
    }

    #[tokio::test]
    async fn test_store_selection_uses_all_peers() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        attach(&coordinator, "beta", &MemoryDisk::new()).await;
        attach(&coordinator, "alpha", &MemoryDisk::new()).await;

        let ranked = coordinator
            .select_peer_for_store(&SelectionContext::store("/new/file", Some(GB)))
            .await
            .unwrap();

        assert_eq!(ranked.len(), 2);
        // Equal scores apart from cycle's bonus to the first name.
        assert_eq!(ranked[0].name().as_str(), "alpha");
    }

    #[tokio::test]
    async fn test_retrieve_selection_only_offers_owners() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/data/a.bin", 10, 1);
        attach(&coordinator, "alpha", &alpha).await;
        attach(&coordinator, "beta", &MemoryDisk::new()).await;

        let ranked = coordinator
            .select_peer_for_retrieve(&SelectionContext::retrieve("/data/a.bin"))
            .await
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name().as_str(), "alpha");

        let missing = coordinator
            .select_peer_for_retrieve(&SelectionContext::retrieve("/data/none.bin"))
            .await;
        assert_eq!(missing.unwrap_err().reason(), NoPeerReason::FileNotFound);

        let directory = coordinator
            .select_peer_for_retrieve(&SelectionContext::retrieve("/data"))
            .await;
        assert_eq!(directory.unwrap_err().reason(), NoPeerReason::FileNotFound);

        coordinator
            .registry()
            .get(&PeerName::new("alpha"))
            .unwrap()
            .mark_unavailable("maintenance");
        let offline = coordinator
            .select_peer_for_retrieve(&SelectionContext::retrieve("/data/a.bin"))
            .await;
        assert_eq!(offline.unwrap_err().reason(), NoPeerReason::NoOwnersOnline);
        // Ownership survives the outage.
        assert_eq!(coordinator.list_owners("/data/a.bin").unwrap(), owners(&["alpha"]));
    }

    #[tokio::test]
    async fn test_replication_excludes_current_owners() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/data/a.bin", 10, 1);
        attach(&coordinator, "alpha", &alpha).await;
        attach(&coordinator, "beta", &MemoryDisk::new()).await;

        let target = coordinator
            .select_replication_target(&SelectionContext::store("/data/a.bin", Some(10)))
            .await
            .unwrap();
        assert_eq!(target.len(), 1);
        assert_eq!(target[0].name().as_str(), "beta");

        let source = coordinator
            .select_replication_source(&SelectionContext::retrieve("/data/a.bin"))
            .await
            .unwrap();
        assert_eq!(source[0].name().as_str(), "alpha");
    }

    // ============================================================
    // ADMIN TESTS
    // ============================================================

    #[tokio::test]
    async fn test_remove_peer_strips_ownership() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/shared/f.bin", 10, 1);
        alpha.add_file("/only-alpha/g.bin", 10, 2);
        let beta = MemoryDisk::new();
        beta.add_file("/shared/f.bin", 10, 1);
        attach(&coordinator, "alpha", &alpha).await;
        attach(&coordinator, "beta", &beta).await;

        let stripped = coordinator.remove_peer(&PeerName::new("alpha")).unwrap();

        // Only the file alpha held alone disappears.
        assert_eq!(stripped, 1);
        assert_eq!(coordinator.list_owners("/shared/f.bin").unwrap(), owners(&["beta"]));
        assert!(matches!(
            coordinator.list_owners("/only-alpha/g.bin"),
            Err(NamespaceError::NotFound(_))
        ));
        assert!(!coordinator.is_peer_available(&PeerName::new("alpha")));
        assert!(matches!(
            coordinator.remove_peer(&PeerName::new("alpha")),
            Err(PeerError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_force_remerge_of_subtree() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/a/one.bin", 10, 1);
        alpha.add_file("/b/two.bin", 10, 2);
        attach(&coordinator, "alpha", &alpha).await;

        alpha.add_file("/a/three.bin", 30, 3);
        alpha.remove_file("/b/two.bin");
        let report = coordinator
            .force_remerge(&PeerName::new("alpha"), Some("/a"))
            .await
            .unwrap();

        assert!(report.completed);
        assert_eq!(report.files_created, 1);
        assert_eq!(coordinator.list_owners("/a/three.bin").unwrap(), owners(&["alpha"]));
        // Outside the subtree nothing was re-read.
        assert_eq!(coordinator.list_owners("/b/two.bin").unwrap(), owners(&["alpha"]));
    }

    #[tokio::test]
    async fn test_force_remerge_needs_connection() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        coordinator
            .add_peer(PeerDefinition::new("alpha", "memory"))
            .unwrap();

        let result = coordinator.force_remerge(&PeerName::new("alpha"), None).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Peer(PeerError::PeerUnavailable { .. }))
        ));

        let result = coordinator.force_remerge(&PeerName::new("ghost"), None).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Peer(PeerError::UnknownPeer(_)))
        ));
    }

    #[tokio::test]
    async fn test_bad_chain_config_is_rejected() {
        let coordinator = Coordinator::new(&test_config()).unwrap();

        let result =
            coordinator.set_filter_chain_config(ChainKind::Retrieve, &[FilterSpec::new("nope")]);
        assert!(matches!(result, Err(CoordinatorError::Config(_))));

        coordinator
            .set_filter_chain_config(ChainKind::Retrieve, &[FilterSpec::new("cycle")])
            .unwrap();
        assert_eq!(
            coordinator.filter_chain_config().retrieve,
            vec![FilterSpec::new("cycle")]
        );
    }

    #[tokio::test]
    async fn test_bad_config_fails_construction() {
        let mut config = test_config();
        config.selection.store = vec![FilterSpec::new("matchdir")];
        assert!(matches!(
            Coordinator::new(&config),
            Err(CoordinatorError::Config(_))
        ));
    }

    // ============================================================
    // BACKGROUND TESTS
    // ============================================================

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.state_path = Some(dir.path().join("state").join("master.json"));
        config.peers = vec![PeerDefinition::new("seed", "10.0.0.9:7500")];

        let coordinator = Coordinator::bootstrap(&config).await.unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/kept/file.bin", 10, 1);
        attach(&coordinator, "alpha", &alpha).await;
        coordinator.save_state().await.unwrap();

        let restored = Coordinator::bootstrap(&config).await.unwrap();

        assert_eq!(restored.registry().len(), 2);
        let peer = restored.registry().get(&PeerName::new("alpha")).unwrap();
        assert_eq!(peer.state(), PeerState::Disconnected);
        assert_eq!(restored.list_owners("/kept/file.bin").unwrap(), owners(&["alpha"]));
        assert!(!restored.is_peer_available(&PeerName::new("alpha")));
    }

    #[tokio::test]
    async fn test_reconnect_dials_offline_peers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let memory = MemoryDisk::new();
        memory.add_file("/remote/f.bin", 5, 9);
        let handlers = memory.registry();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let endpoint = PeerEndpoint::new(PeerName::new("alpha"), handlers.clone())
                    .with_disk_status(disk(GB));
                tokio::spawn(endpoint.serve(stream));
            }
        });

        let mut config = test_config();
        config.peers = vec![PeerDefinition::new("alpha", addr.to_string())];
        let coordinator = Coordinator::new(&config).unwrap();

        assert_eq!(coordinator.reconnect_once().await, 1);
        assert!(coordinator.is_peer_available(&PeerName::new("alpha")));
        // Connected peers are left alone.
        assert_eq!(coordinator.reconnect_once().await, 0);

        for _ in 0..200 {
            if coordinator.list_owners("/remote/f.bin").is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coordinator.list_owners("/remote/f.bin").unwrap(), owners(&["alpha"]));
    }

    #[tokio::test]
    async fn test_reconnect_tolerates_unreachable_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = test_config();
        config.peers = vec![PeerDefinition::new("alpha", addr.to_string())];
        let coordinator = Coordinator::new(&config).unwrap();

        assert_eq!(coordinator.reconnect_once().await, 0);
        assert!(!coordinator.is_peer_available(&PeerName::new("alpha")));
    }

    // ============================================================
    // HTTP HANDLER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_handlers() {
        let coordinator = Coordinator::new(&test_config()).unwrap();
        let alpha = MemoryDisk::new();
        alpha.add_file("/h/f.bin", 10, 1);
        attach(&coordinator, "alpha", &alpha).await;

        let duplicate = handle_add_peer(
            Extension(coordinator.clone()),
            Json(AddPeerRequest {
                name: "alpha".into(),
                endpoint: "x".into(),
                credentials: None,
                properties: BTreeMap::new(),
                connect: false,
            }),
        )
        .await;
        assert_eq!(duplicate.unwrap_err().0, StatusCode::CONFLICT);

        let Json(found) = handle_list_owners(
            Extension(coordinator.clone()),
            Query(OwnersQuery {
                path: "/h/f.bin".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.owners, vec!["alpha"]);
        assert_eq!(found.available, vec!["alpha"]);

        let missing = handle_list_owners(
            Extension(coordinator.clone()),
            Query(OwnersQuery {
                path: "/h/none".into(),
            }),
        )
        .await;
        assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);

        let bad_chain = handle_set_chain(
            Extension(coordinator.clone()),
            Path("upload".into()),
            Json(vec![FilterSpec::new("cycle")]),
        )
        .await;
        assert_eq!(bad_chain.unwrap_err().0, StatusCode::BAD_REQUEST);

        let Json(chain) = handle_set_chain(
            Extension(coordinator.clone()),
            Path("retrieve".into()),
            Json(vec![FilterSpec::new("cycle")]),
        )
        .await
        .unwrap();
        assert_eq!(chain, vec![FilterSpec::new("cycle")]);

        let Json(ranked) = handle_select(
            Extension(coordinator.clone()),
            Json(SelectRequest {
                chain: ChainKind::Retrieve,
                path: "/h/f.bin".into(),
                size: None,
                user: None,
                source_peer: None,
                exclude: Vec::new(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].peer, "alpha");

        let gone = handle_remove_peer(Extension(coordinator.clone()), Path("ghost".into())).await;
        assert_eq!(gone.unwrap_err().0, StatusCode::NOT_FOUND);

        let Json(removed) =
            handle_remove_peer(Extension(coordinator.clone()), Path("alpha".into()))
                .await
                .unwrap();
        assert_eq!(removed.files_dropped, 1);

        let none_left = handle_select(
            Extension(coordinator.clone()),
            Json(SelectRequest {
                chain: ChainKind::Store,
                path: "/h/g.bin".into(),
                size: Some(1),
                user: None,
                source_peer: None,
                exclude: Vec::new(),
            }),
        )
        .await;
        assert_eq!(none_left.unwrap_err().0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
