//! Cluster E2E Test Suite
//!
//! Drives a real controller and real nodes over TCP, verifying:
//! - Routing and redirects from any entry node
//! - Write locking and stopped nodes
//! - Range hand-over when nodes join and leave
//! - Rollback when a migration cannot complete
//! - Recovery when a MOVE_DATA reply is lost
//!
//! # Test Cases
//!
//! | Scenario                        | Verification                            |
//! |---------------------------------|-----------------------------------------|
//! | Put/get through any node        | Each key stored once, on its owner      |
//! | Add node                        | Owned range moves, donor drops it       |
//! | Remove node                     | Range moves to successor, machine freed |
//! | Unreachable destination         | Metadata and donor data unchanged       |
//! | Destination rejects a batch     | Partial copy reverted, donor unlocked   |
//! | MOVE_DATA reply times out       | Outcome resolved, join rolls forward    |
//! | Launch failures at init         | Launched nodes stopped, pool restored   |
//! | Shut down                       | Every machine back in the pool          |

#[cfg(test)]
mod tests {
    use crate::client::KvClient;
    use crate::cluster::{ClusterEvent, ClusterEventListener, InProcessLauncher, NodeLauncher};
    use crate::error::{ClusterError, Error, MigrationError};
    use crate::network::client::RpcClient;
    use crate::network::rpc::{
        decode_message, read_frame, ClientResponse, ControlRequest, ControlResponse, Frame,
        Message, MAX_MESSAGE_SIZE,
    };
    use crate::rebalancing::RebalanceState;
    use crate::testing::utils::{
        fast_retry, test_controller_config, wait_for, FaultyPeerLauncher, LocalLauncher,
        PeerFault, TestCluster,
    };
    use crate::types::{NodeState, ServerIdentity};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn key(i: usize) -> String {
        format!("key-{:04}", i)
    }

    async fn fill(client: &mut KvClient, count: usize) {
        for i in 0..count {
            let reply = client.put(&key(i), &format!("value-{}", i)).await.unwrap();
            assert_eq!(reply, ClientResponse::PutSuccess { key: key(i) });
        }
    }

    fn assert_placement<L: LocalLauncher>(cluster: &TestCluster<L>, count: usize) {
        let metadata = cluster.controller.metadata();
        for i in 0..count {
            let owner = metadata.route(&key(i)).unwrap();
            assert_eq!(
                cluster.holder_of(&key(i)).as_ref(),
                Some(owner),
                "{} should live only on {}",
                key(i),
                owner
            );
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<ClusterEvent>>,
    }

    impl ClusterEventListener for RecordingListener {
        fn on_event(&self, event: ClusterEvent) {
            self.events.lock().push(event);
        }
    }

    impl RecordingListener {
        fn degraded(&self, node: &ServerIdentity, command: &str) -> bool {
            self.events.lock().iter().any(|e| {
                matches!(
                    e,
                    ClusterEvent::NodeDegraded { node: n, command: c, .. } if n == node && *c == command
                )
            })
        }
    }

    /// A running cluster of `nodes` out of `machines` whose nodes misbehave
    /// as `launcher` dictates.
    async fn faulty_cluster(
        nodes: usize,
        machines: usize,
        launcher: FaultyPeerLauncher,
        config: crate::config::ControllerConfig,
        listener: Arc<RecordingListener>,
    ) -> TestCluster<FaultyPeerLauncher> {
        let mut cluster = TestCluster::with_config(machines, launcher, config)
            .await
            .with_listener(listener);
        cluster.controller.init_service(nodes).await.unwrap();
        cluster.controller.start().await.unwrap();
        cluster
    }

    #[test(tokio::test)]
    async fn test_put_get_through_any_node() {
        let mut cluster = TestCluster::running(3, 3).await;
        let nodes = cluster.controller.nodes().to_vec();

        let mut writer = KvClient::connect(nodes[0].clone()).with_retry(fast_retry());
        fill(&mut writer, 60).await;
        assert_eq!(cluster.total_records(), 60);
        assert_placement(&cluster, 60);

        // A client that only knows another node learns the ring on redirect
        let mut reader = KvClient::connect(nodes[2].clone()).with_retry(fast_retry());
        for i in 0..60 {
            let reply = reader.get(&key(i)).await.unwrap();
            assert_eq!(
                reply,
                ClientResponse::GetSuccess {
                    key: key(i),
                    value: format!("value-{}", i),
                }
            );
        }
        assert_eq!(reader.metadata(), cluster.controller.metadata());

        let reply = reader.put(&key(0), "changed").await.unwrap();
        assert_eq!(reply, ClientResponse::PutUpdate { key: key(0) });
        let reply = reader.delete(&key(0)).await.unwrap();
        assert_eq!(reply, ClientResponse::DeleteSuccess { key: key(0) });
        let reply = reader.get(&key(0)).await.unwrap();
        assert_eq!(reply, ClientResponse::GetError { key: key(0) });
        let reply = reader.delete(&key(0)).await.unwrap();
        assert_eq!(reply, ClientResponse::DeleteError { key: key(0) });

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_write_lock_and_stop() {
        let mut cluster = TestCluster::running(3, 3).await;
        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        client.put("k", "v").await.unwrap();

        let owner = cluster.controller.metadata().route("k").unwrap().clone();
        let rpc = RpcClient::new(fast_retry());
        let reply = rpc
            .send_control(&owner, ControlRequest::LockWrite)
            .await
            .unwrap();
        assert_eq!(reply, ControlResponse::Success);
        assert_eq!(cluster.node(&owner).state(), NodeState::WriteLocked);

        assert_eq!(
            client.put("k", "v2").await.unwrap(),
            ClientResponse::ServerWriteLock
        );
        assert_eq!(
            client.get("k").await.unwrap(),
            ClientResponse::GetSuccess {
                key: "k".to_string(),
                value: "v".to_string(),
            }
        );

        rpc.send_control(&owner, ControlRequest::UnlockWrite)
            .await
            .unwrap();
        assert_eq!(
            client.put("k", "v2").await.unwrap(),
            ClientResponse::PutUpdate {
                key: "k".to_string()
            }
        );

        cluster.controller.stop().await.unwrap();
        assert!(!cluster.controller.is_running());
        assert_eq!(client.get("k").await.unwrap(), ClientResponse::ServerStopped);
        assert_eq!(
            client.put("k", "v3").await.unwrap(),
            ClientResponse::ServerStopped
        );

        cluster.controller.start().await.unwrap();
        assert_eq!(
            client.get("k").await.unwrap(),
            ClientResponse::GetSuccess {
                key: "k".to_string(),
                value: "v2".to_string(),
            }
        );

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_add_node_moves_range() {
        let listener = Arc::new(RecordingListener::default());
        let mut cluster = TestCluster::with_pool(4)
            .await
            .with_listener(listener.clone());

        cluster.controller.init_service(3).await.unwrap();
        cluster.controller.start().await.unwrap();

        let old_metadata = cluster.controller.metadata().clone();
        let mut client = KvClient::with_metadata(old_metadata.clone()).with_retry(fast_retry());
        fill(&mut client, 200).await;

        let added = cluster.controller.add_node().await.unwrap();
        assert_eq!(cluster.controller.nodes().len(), 4);
        assert_eq!(cluster.controller.repository().available_count(), 0);
        assert!(!cluster.controller.coordinator().is_rebalancing());

        let metadata = cluster.controller.metadata().clone();
        let donor = metadata.successor(&added).unwrap().clone();
        let expected = (0..200)
            .filter(|i| metadata.route(&key(*i)).unwrap() == &added)
            .count();

        assert_eq!(cluster.total_records(), 200);
        assert_eq!(cluster.node(&added).storage().len(), expected);
        assert_placement(&cluster, 200);

        for machine in cluster.controller.nodes() {
            let node = cluster.node(machine);
            assert_eq!(node.state(), NodeState::Serving);
            assert_eq!(node.metadata(), metadata);
        }

        // The stale client is redirected by the donor
        for i in 0..200 {
            let reply = client.get(&key(i)).await.unwrap();
            assert!(matches!(reply, ClientResponse::GetSuccess { .. }));
        }
        assert_eq!(client.metadata(), &metadata);

        let events = listener.events.lock().clone();
        assert!(events.iter().any(|e| matches!(
            e,
            ClusterEvent::MigrationCompleted { donor: d, destination, transferred, .. }
                if d == &donor && destination == &added && *transferred == expected
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, ClusterEvent::NodeJoined { node, migration_id: Some(_) } if node == &added)));
        assert!(!events.iter().any(ClusterEvent::is_failure));

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_add_node_with_small_batches() {
        let launcher = InProcessLauncher::new().with_transfer_batch_bytes(256);
        let mut cluster = TestCluster::with_launcher(3, launcher).await;
        cluster.controller.init_service(2).await.unwrap();
        cluster.controller.start().await.unwrap();

        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        fill(&mut client, 300).await;

        cluster.controller.add_node().await.unwrap();
        assert_eq!(cluster.total_records(), 300);
        assert_placement(&cluster, 300);

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_add_node_requires_idle_machine() {
        let mut cluster = TestCluster::running(2, 2).await;

        let err = cluster.controller.add_node().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Cluster(ClusterError::NoMachineAvailable)
        ));
        assert_eq!(cluster.controller.nodes().len(), 2);

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_remove_node_hands_range_to_successor() {
        let mut cluster = TestCluster::running(3, 3).await;
        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        fill(&mut client, 150).await;

        let removed = cluster.controller.remove_node().await.unwrap();
        assert_eq!(cluster.controller.nodes().len(), 2);
        assert!(!cluster.controller.metadata().contains(&removed));
        assert_eq!(cluster.controller.repository().available_count(), 1);
        assert!(cluster.launcher.node(&removed).is_none());

        assert_eq!(cluster.total_records(), 150);
        assert_placement(&cluster, 150);

        let history = cluster.controller.coordinator().history();
        assert_eq!(history.last().unwrap().state, RebalanceState::Complete);

        // The removed machine can host a node again
        let added = cluster.controller.add_node().await.unwrap();
        assert_eq!(added, removed);
        assert_eq!(cluster.total_records(), 150);
        assert_placement(&cluster, 150);

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_remove_last_node_refused() {
        let mut cluster = TestCluster::running(1, 1).await;
        let only = cluster.controller.nodes()[0].clone();

        let err = cluster.controller.remove_node().await.unwrap_err();
        assert!(matches!(err, Error::Cluster(ClusterError::LastNode)));
        assert_eq!(cluster.controller.nodes(), &[only.clone()]);
        assert_eq!(cluster.node(&only).state(), NodeState::Serving);

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_failed_migration_keeps_data() {
        let listener = Arc::new(RecordingListener::default());
        let mut cluster = TestCluster::with_pool(3)
            .await
            .with_listener(listener.clone());
        cluster.controller.init_service(3).await.unwrap();
        cluster.controller.start().await.unwrap();
        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        fill(&mut client, 100).await;

        let metadata = cluster.controller.metadata().clone();
        let leaving = metadata.servers()[0].clone();
        let destination = metadata.successor(&leaving).unwrap().clone();
        let held = cluster.node(&leaving).storage().len();

        // The successor dies before the range can be handed over
        cluster.launcher.terminate(&destination).await.unwrap();

        let err = cluster.controller.remove_server(&leaving).await;
        assert!(err.is_err());

        assert_eq!(cluster.controller.metadata(), &metadata);
        assert!(!cluster.controller.coordinator().is_rebalancing());
        assert_eq!(
            cluster.controller.coordinator().history().last().unwrap().state,
            RebalanceState::Failed
        );

        let node = cluster.node(&leaving);
        assert_eq!(node.state(), NodeState::Serving);
        assert_eq!(node.storage().len(), held);
        assert_eq!(node.metadata(), metadata);
        assert!(listener.degraded(&leaving, "REMOVE_NODE"));

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_failed_leave_reverts_partial_transfer() {
        let listener = Arc::new(RecordingListener::default());
        let launcher =
            FaultyPeerLauncher::new(PeerFault::RejectBatchesAfter(2)).with_transfer_batch_bytes(256);
        let mut cluster =
            faulty_cluster(3, 3, launcher, test_controller_config(), listener.clone()).await;
        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        fill(&mut client, 300).await;

        let metadata = cluster.controller.metadata().clone();
        let leaving = metadata
            .servers()
            .iter()
            .max_by_key(|m| cluster.node(m).storage().len())
            .unwrap()
            .clone();
        let successor = metadata.successor(&leaving).unwrap().clone();
        let leaving_keys = cluster.node(&leaving).storage().keys();
        let successor_held = cluster.node(&successor).storage().len();
        // Enough records for several batches before the rejected one
        assert!(leaving_keys.len() >= 100);

        let err = cluster.controller.remove_server(&leaving).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::TransferFailed { .. })
        ));

        // The batches the successor accepted were taken back
        let successor_node = cluster.node(&successor);
        assert_eq!(successor_node.storage().len(), successor_held);
        assert!(leaving_keys
            .iter()
            .all(|k| !successor_node.storage().contains(k)));

        let leaving_node = cluster.node(&leaving);
        assert_eq!(leaving_node.state(), NodeState::Serving);
        assert_eq!(leaving_node.storage().len(), leaving_keys.len());
        assert_eq!(cluster.controller.metadata(), &metadata);
        assert_eq!(cluster.total_records(), 300);
        assert_placement(&cluster, 300);
        assert!(listener.degraded(&leaving, "REMOVE_NODE"));

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_failed_join_rolls_back() {
        let listener = Arc::new(RecordingListener::default());
        let launcher = FaultyPeerLauncher::new(PeerFault::RejectBatchesAfter(0));
        let mut cluster =
            faulty_cluster(2, 3, launcher, test_controller_config(), listener.clone()).await;
        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        fill(&mut client, 100).await;

        let metadata = cluster.controller.metadata().clone();
        let candidate = cluster
            .machines
            .iter()
            .find(|m| !metadata.contains(m))
            .unwrap()
            .clone();

        let err = cluster.controller.add_node().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::TransferFailed { .. })
        ));

        // Old metadata everywhere, the donor unlocked, the machine free
        assert_eq!(cluster.controller.metadata(), &metadata);
        for machine in metadata.servers() {
            let node = cluster.node(machine);
            assert_eq!(node.state(), NodeState::Serving);
            assert_eq!(node.metadata(), metadata);
        }
        assert_eq!(cluster.controller.repository().available_count(), 1);
        assert!(cluster.launcher.node(&candidate).is_none());
        assert!(!cluster.launcher.running().contains(&candidate));
        assert!(!cluster.controller.coordinator().is_rebalancing());
        assert_eq!(
            cluster.controller.coordinator().history().last().unwrap().state,
            RebalanceState::Failed
        );
        assert!(listener.degraded(&candidate, "ADD_NODE"));

        assert_eq!(cluster.total_records(), 100);
        assert_placement(&cluster, 100);
        for i in 0..100 {
            let reply = client.get(&key(i)).await.unwrap();
            assert!(matches!(reply, ClientResponse::GetSuccess { .. }));
        }

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_lost_move_data_reply_rolls_forward() {
        let listener = Arc::new(RecordingListener::default());
        // Every batch outlives the MOVE_DATA timeout
        let launcher = FaultyPeerLauncher::new(PeerFault::Delay(Duration::from_millis(400)));
        let config = test_controller_config().with_migration_timeout(Duration::from_millis(100));
        let mut cluster = faulty_cluster(2, 3, launcher, config, listener.clone()).await;
        let mut client =
            KvClient::with_metadata(cluster.controller.metadata().clone()).with_retry(fast_retry());
        fill(&mut client, 100).await;

        let added = cluster.controller.add_node().await.unwrap();

        let metadata = cluster.controller.metadata().clone();
        assert!(metadata.contains(&added));
        assert_eq!(metadata.len(), 3);
        for machine in metadata.servers() {
            let node = cluster.node(machine);
            assert_eq!(node.state(), NodeState::Serving);
            assert_eq!(node.metadata(), metadata);
        }
        assert_eq!(cluster.total_records(), 100);
        assert_placement(&cluster, 100);
        assert_eq!(
            cluster.controller.coordinator().history().last().unwrap().state,
            RebalanceState::Complete
        );
        assert!(!listener.events.lock().iter().any(ClusterEvent::is_failure));

        for i in 0..100 {
            let reply = client.get(&key(i)).await.unwrap();
            assert_eq!(
                reply,
                ClientResponse::GetSuccess {
                    key: key(i),
                    value: format!("value-{}", i),
                }
            );
        }

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_init_service_shortfall_releases_machines() {
        let mut cluster = TestCluster::with_pool(2).await;
        let blocked = cluster.machines[0].clone();
        let squatter = TcpListener::bind(blocked.endpoint()).await.unwrap();

        let err = cluster.controller.init_service(2).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Cluster(ClusterError::InsufficientNodes {
                requested: 2,
                launched: 1
            })
        ));
        assert!(cluster.controller.metadata().is_empty());
        assert_eq!(cluster.controller.repository().available_count(), 2);
        assert!(cluster.launcher.running().is_empty());

        // Once the port is free the pool is usable again
        drop(squatter);
        cluster.controller.init_service(2).await.unwrap();
        assert_eq!(cluster.controller.nodes().len(), 2);

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_lifecycle_errors() {
        let mut cluster = TestCluster::with_pool(2).await;

        assert!(matches!(
            cluster.controller.start().await,
            Err(Error::Cluster(ClusterError::NotInitialized))
        ));
        assert!(matches!(
            cluster.controller.init_service(3).await,
            Err(Error::Cluster(ClusterError::NoMachineAvailable))
        ));

        cluster.controller.init_service(1).await.unwrap();
        assert!(matches!(
            cluster.controller.init_service(1).await,
            Err(Error::Cluster(ClusterError::AlreadyInitialized))
        ));

        // Initialized but not started
        let node = cluster.controller.nodes()[0].clone();
        assert_eq!(cluster.node(&node).state(), NodeState::Stopped);

        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_malformed_payload_gets_failed_reply() {
        let mut cluster = TestCluster::running(1, 1).await;
        let node = cluster.controller.nodes()[0].clone();

        let mut stream = TcpStream::connect(node.endpoint()).await.unwrap();
        let garbage = [0xffu8; 8];
        stream
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&garbage).await.unwrap();

        let frame = read_frame(&mut stream, MAX_MESSAGE_SIZE)
            .await
            .unwrap()
            .unwrap();
        let Frame::Payload(payload) = frame else {
            panic!("unexpected oversized reply");
        };
        assert!(matches!(
            decode_message(&payload).unwrap(),
            Message::Failed(_)
        ));

        // The node keeps serving
        assert_eq!(cluster.node(&node).state(), NodeState::Serving);
        cluster.controller.shut_down().await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_shut_down_releases_machines() {
        let mut cluster = TestCluster::running(2, 3).await;
        let nodes = cluster.controller.nodes().to_vec();

        cluster.controller.shut_down().await.unwrap();
        assert!(cluster.controller.metadata().is_empty());
        assert!(!cluster.controller.is_running());
        assert_eq!(
            cluster.controller.repository().available_count(),
            cluster.machines.len()
        );

        let launcher = cluster.launcher.clone();
        assert!(
            wait_for(
                move || launcher.running().is_empty(),
                Duration::from_secs(5),
                Duration::from_millis(50),
            )
            .await
        );

        for node in &nodes {
            assert!(TcpStream::connect(node.endpoint()).await.is_err());
        }
    }
}
