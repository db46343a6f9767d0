//! SAFE reads against a replicated partition.
//!
//! A SAFE read submitted after a write must observe that write, and its
//! response is gated on the cluster commit point rather than on local
//! execution alone. The gating mechanics are unit-tested in the scheduler;
//! here the full loop (leader, replica, client) runs for real.

mod common;

use common::{
    cluster, expect_initiate_response, probe, read_request, write_request, KvEngine, LEADER,
    REPLICA,
};
use spindle_sched::{ReadLevel, ResponseStatus};

#[test]
fn safe_read_observes_the_preceding_write() {
    let c = cluster(
        ReadLevel::Safe,
        &[REPLICA],
        |_| Box::new(KvEngine::new()),
        |_| None,
    );

    c.client.send(LEADER, write_request(1, "set color teal"));
    c.client.send(LEADER, read_request(2, "get color"));

    let mut write_resp = None;
    let mut read_resp = None;
    for _ in 0..2 {
        let resp = expect_initiate_response(&c.client.inbox, "safe read flow");
        assert_eq!(resp.status, ResponseStatus::Success);
        if resp.read_only {
            read_resp = Some(resp);
        } else {
            write_resp = Some(resp);
        }
    }
    let write_resp = write_resp.expect("write response arrives");
    let read_resp = read_resp.expect("read response arrives");

    assert_eq!(
        read_resp.result.as_ref(),
        b"teal",
        "the read reflects the write scheduled before it"
    );
    assert!(
        read_resp.sp_handle <= write_resp.sp_handle,
        "reads reuse the newest scheduled handle rather than minting one"
    );

    // Once both answered, nothing is left buffered and the commit point
    // covers the write.
    let write_handle = write_resp.sp_handle;
    let (buffered, trunc) = probe(&c.leader, |sched| {
        (sched.buffered_read_len(), sched.truncation_handle())
    });
    assert_eq!(buffered, 0);
    assert!(trunc >= write_handle);

    c.leader.shutdown().expect("leader shuts down cleanly");
    for replica in c.replicas {
        replica.shutdown().expect("replica shuts down cleanly");
    }
}

#[test]
fn fast_reads_short_circuit_on_a_replica() {
    let c = cluster(
        ReadLevel::Fast,
        &[REPLICA],
        |_| Box::new(KvEngine::new()),
        |_| None,
    );

    c.client.send(LEADER, write_request(1, "set color teal"));
    let write_resp = expect_initiate_response(&c.client.inbox, "fast write");
    assert_eq!(write_resp.status, ResponseStatus::Success);

    // FAST reads are served by any replica without coordination; the
    // replica already applied the leader's copy.
    c.client.send(REPLICA, read_request(2, "get color"));
    let read_resp = expect_initiate_response(&c.client.inbox, "fast replica read");
    assert_eq!(read_resp.result.as_ref(), b"teal");

    c.leader.shutdown().expect("leader shuts down cleanly");
    for replica in c.replicas {
        replica.shutdown().expect("replica shuts down cleanly");
    }
}
