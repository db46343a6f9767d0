//! Multi-partition fragments under synchronous command logging.
//!
//! With a synchronous log the first fragment of an MP transaction may not
//! run until its record is fsynced; follow-up fragments and the complete
//! message queue behind it and drain in arrival order after the durability
//! callback. Here the real file-backed log provides the callback.

mod common;

use std::sync::Arc;

use common::{
    cluster, endpoint, fragment_request, probe, KvEngine, COORDINATOR, IO_TIMEOUT, LEADER,
};
use spindle_node::{CommandLogConfig, FileCommandLog, LoggedRecord};
use spindle_sched::{CommandLog, CompleteTxn, FragmentStatus, Message, ReadLevel, NO_HANDLE};

#[test]
fn fragments_drain_in_order_after_first_fragment_durability() {
    let dir = tempfile::tempdir().expect("log dir");
    let log: Arc<FileCommandLog> = Arc::new(
        FileCommandLog::open_dir(
            dir.path(),
            CommandLogConfig {
                synchronous: true,
                ..CommandLogConfig::default()
            },
        )
        .expect("open log"),
    );
    let log_handle = log.clone();

    let c = cluster(
        ReadLevel::Safe,
        &[],
        |_| Box::new(KvEngine::new()),
        move |_| Some(log_handle.clone() as Arc<dyn CommandLog>),
    );
    let coord = endpoint(&c.network, COORDINATOR);

    coord.send(LEADER, fragment_request(900, false));
    coord.send(LEADER, fragment_request(900, false));
    coord.send(
        LEADER,
        Message::CompleteTxn(CompleteTxn {
            txn_id: 900,
            sp_handle: NO_HANDLE,
            coordinator: COORDINATOR,
            to_leader: true,
            restart: false,
            read_only: false,
            ack_requested: false,
            trunc_handle: NO_HANDLE,
        }),
    );

    // Both fragment responses come back to the coordinator once the first
    // fragment's record is durable; arrival order is preserved.
    let mut handles = Vec::new();
    for step in ["first fragment", "second fragment"] {
        match coord.inbox.recv_timeout(IO_TIMEOUT) {
            Some(Message::FragmentResponse(resp)) => {
                assert_eq!(resp.status, FragmentStatus::Success, "{step}");
                assert_eq!(resp.executor_site, LEADER, "{step}");
                assert_eq!(resp.txn_id, 900, "{step}");
                handles.push(resp.sp_handle);
            }
            Some(other) => panic!("{step}: unexpected message {other:?}"),
            None => panic!("{step}: no fragment response within {IO_TIMEOUT:?}"),
        }
    }
    assert!(handles[0] < handles[1], "fragments ran in arrival order");

    // The complete-transaction work drained too: the txn closed out and the
    // commit point reached its first local handle.
    let first_handle = handles[0];
    let (outstanding, trunc) = probe(&c.leader, |sched| {
        (sched.outstanding_len(), sched.truncation_handle())
    });
    assert_eq!(outstanding, 0, "transaction state removed after completion");
    assert_eq!(trunc, first_handle, "commit point is the txn's first handle");

    // Only the first fragment of the transaction was logged.
    let txn_records = log
        .load()
        .expect("load log")
        .iter()
        .filter(|record| matches!(record, LoggedRecord::Txn { .. }))
        .count();
    assert_eq!(txn_records, 1);

    c.leader.shutdown().expect("leader shuts down cleanly");
}
