//! End-to-end replication across a chain topology: node0 -- node1 -- node2.
//! node2 never talks to node0 directly, so this exercises the full gossip /
//! update-request / batch-update path, not just a direct broadcast.

mod support;

use std::time::Duration;

use driftsync::update::{DataStream, Update, UpdateType};
use driftsync::clock::Timestamp;

fn placeholder_update(update_type: UpdateType, database_name: &str, record_id: &str, data: &[u8]) -> Update {
    Update {
        node_id: 0,
        sequence_no: 0,
        timestamp: Timestamp::ZERO,
        update_type,
        record_id: record_id.to_string(),
        database_name: database_name.to_string(),
        data_streams: if data.is_empty() {
            vec![]
        } else {
            vec![DataStream { stream_id: 0, data: data.to_vec() }]
        },
    }
}

#[tokio::test]
async fn basic_replication_converges_across_a_chain() {
    let node0 = support::spawn_node(0, "node0").await;
    let node1 = support::spawn_node(1, "node1").await;
    let node2 = support::spawn_node(2, "node2").await;

    support::link(&node0, &node1).await;
    support::link(&node1, &node2).await;

    node0
        .handle
        .submit_local(vec![placeholder_update(UpdateType::CreateDatabase, "db1", "", &[])])
        .await
        .unwrap();
    node0
        .handle
        .submit_local(vec![placeholder_update(UpdateType::UpsertRecord, "db1", "r1", b"v1")])
        .await
        .unwrap();

    let converged = support::wait_until(
        || async {
            node2.storage.get_record("db1", "r1").await.ok().flatten().is_some()
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(converged, "node2 never received r1 via gossip relay");

    let record = node2.storage.get_record("db1", "r1").await.unwrap().unwrap();
    assert_eq!(record[0].data, b"v1");

    // node1, the direct recipient of the broadcast, should also hold it.
    let direct = node1.storage.get_record("db1", "r1").await.unwrap().unwrap();
    assert_eq!(direct[0].data, b"v1");
}
