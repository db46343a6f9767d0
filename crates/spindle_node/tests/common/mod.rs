//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use spindle_node::{
    ExecOutcome, ExecutionEngine, LocalNetwork, PartitionConfig, PartitionHandle, SiteInbox,
};
use spindle_sched::{
    make_site_id, CommandLog, CompleteTxn, FragmentKind, FragmentTask, InitiateResponse,
    InitiateTask, Invocation, Mailbox, Message, ReadLevel, SiteId, SpScheduler, TxnState,
    NO_HANDLE,
};
use std::sync::Arc;

/// Timeout for message round-trips through the in-process network.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub const LEADER: SiteId = make_site_id(1, 1);
pub const REPLICA: SiteId = make_site_id(2, 1);
/// Client interface colocated with the replica host, so short-circuit
/// reads against the replica are legal.
pub const CLIENT: SiteId = make_site_id(2, 90);
pub const COORDINATOR: SiteId = make_site_id(3, 1);

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic key-value engine. Commands are `set <key> <value>` and
/// `get <key>`; identical command streams produce identical results on
/// every replica. `skew` poisons results to simulate a diverging replica.
#[derive(Default)]
pub struct KvEngine {
    rows: BTreeMap<String, String>,
    skew: Option<String>,
}

impl KvEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skewed(tag: impl Into<String>) -> Self {
        Self {
            rows: BTreeMap::new(),
            skew: Some(tag.into()),
        }
    }

    fn run_command(&mut self, params: &[u8]) -> String {
        let text = String::from_utf8_lossy(params);
        let mut words = text.split_whitespace();
        let result = match (words.next(), words.next(), words.next()) {
            (Some("set"), Some(key), Some(value)) => {
                self.rows.insert(key.to_string(), value.to_string());
                "ok".to_string()
            }
            (Some("get"), Some(key), None) => self
                .rows
                .get(key)
                .cloned()
                .unwrap_or_else(|| "<missing>".to_string()),
            _ => "<bad command>".to_string(),
        };
        match &self.skew {
            Some(tag) => format!("{result}-{tag}"),
            None => result,
        }
    }
}

impl ExecutionEngine for KvEngine {
    fn procedure(&mut self, task: &InitiateTask, _txn: &TxnState) -> ExecOutcome {
        ExecOutcome::success(self.run_command(&task.invocation.params))
    }

    fn fragment(
        &mut self,
        task: &FragmentTask,
        _input_deps: Option<&BTreeMap<u32, Bytes>>,
        _txn: &TxnState,
    ) -> ExecOutcome {
        ExecOutcome::success(format!("frag-{}", task.txn_id))
    }

    fn complete(&mut self, _msg: &CompleteTxn) {}
}

pub struct Cluster {
    pub network: LocalNetwork,
    pub client: ClientEndpoint,
    pub leader: PartitionHandle,
    pub replicas: Vec<PartitionHandle>,
}

pub struct ClientEndpoint {
    pub mailbox: Arc<dyn Mailbox>,
    pub inbox: SiteInbox,
}

impl ClientEndpoint {
    pub fn send(&self, dest: SiteId, msg: Message) {
        self.mailbox.send(dest, msg);
    }
}

/// Register an extra endpoint (client, coordinator) on the network.
pub fn endpoint(network: &LocalNetwork, site: SiteId) -> ClientEndpoint {
    let (mailbox, inbox) = network.register(site);
    ClientEndpoint { mailbox, inbox }
}

/// Build a one-leader cluster with the given replica sites, register a
/// client endpoint, and wire the replica set on the leader.
pub fn cluster(
    read_level: ReadLevel,
    replica_sites: &[SiteId],
    engines: impl FnMut(SiteId) -> Box<dyn ExecutionEngine>,
    mut command_logs: impl FnMut(SiteId) -> Option<Arc<dyn CommandLog>>,
) -> Cluster {
    init_tracing();
    let mut engines = engines;
    let network = LocalNetwork::new();
    let (mailbox, inbox) = network.register(CLIENT);

    let leader = PartitionHandle::spawn(
        PartitionConfig {
            partition: 0,
            site_id: LEADER,
            read_level,
        },
        &network,
        engines(LEADER),
        command_logs(LEADER),
    )
    .expect("spawn leader");
    leader.set_leader(true);

    let mut replicas = Vec::new();
    for site in replica_sites {
        let replica = PartitionHandle::spawn(
            PartitionConfig {
                partition: 0,
                site_id: *site,
                read_level,
            },
            &network,
            engines(*site),
            command_logs(*site),
        )
        .expect("spawn replica");
        replicas.push(replica);
    }

    let mut members = vec![LEADER];
    members.extend_from_slice(replica_sites);
    leader.update_replicas(members, BTreeMap::new());

    Cluster {
        network,
        client: ClientEndpoint { mailbox, inbox },
        leader,
        replicas,
    }
}

pub fn write_request(txn_id: i64, command: &str) -> Message {
    Message::Initiate(InitiateTask {
        initiator: CLIENT,
        coordinator: CLIENT,
        trunc_handle: NO_HANDLE,
        txn_id,
        unique_id: NO_HANDLE,
        read_only: false,
        single_partition: true,
        invocation: Invocation::partition("Apply", Bytes::from(command.to_string())),
        ci_handle: txn_id,
        connection_id: 1,
        for_replay: false,
        replica_copy: false,
        sp_handle: NO_HANDLE,
    })
}

pub fn read_request(txn_id: i64, command: &str) -> Message {
    match write_request(txn_id, command) {
        Message::Initiate(mut task) => {
            task.read_only = true;
            Message::Initiate(task)
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

pub fn fragment_request(txn_id: i64, final_task: bool) -> Message {
    Message::Fragment(FragmentTask {
        initiator: COORDINATOR,
        coordinator: COORDINATOR,
        txn_id,
        sp_handle: NO_HANDLE,
        trunc_handle: NO_HANDLE,
        involved_partitions: vec![0, 1],
        kind: FragmentKind::Normal,
        final_task,
        read_only: false,
        for_replay: false,
        replica_copy: false,
        handled_by_original_leader: false,
        initiate: None,
    })
}

/// Next initiate response at this endpoint, panicking with context on
/// timeout or foreign traffic.
pub fn expect_initiate_response(inbox: &SiteInbox, context: &str) -> InitiateResponse {
    match inbox.recv_timeout(IO_TIMEOUT) {
        Some(Message::InitiateResponse(resp)) => resp,
        Some(other) => panic!("{context}: unexpected message {other:?}"),
        None => panic!("{context}: no response within {IO_TIMEOUT:?}"),
    }
}

/// Run a probe against the partition's scheduler on its own thread.
pub fn probe<T: Send + 'static>(
    handle: &PartitionHandle,
    f: impl FnOnce(&mut SpScheduler) -> T + Send + 'static,
) -> T {
    let (tx, rx) = mpsc::channel();
    handle.control(move |sched| {
        let _ = tx.send(f(sched));
        Ok(())
    });
    rx.recv_timeout(IO_TIMEOUT).expect("partition loop alive")
}
