//! File-backed command log for one partition.
//!
//! Records are framed as `[len u32][crc u32][payload]` with JSON payloads;
//! a dedicated worker thread batches appends and fsyncs according to the
//! configured sync mode. In synchronous mode the log retains each task and
//! redelivers it through the durability sink once its record is on disk;
//! in asynchronous mode tasks run immediately carrying a back-pressure
//! completion that resolves at fsync time.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use spindle_sched::{
    CommandLog, Completion, DurabilitySink, LogEnvelope, LogResult, PartitionId, SiteId,
    SiteTask, SpHandle, StatusHandle, UniqueId,
};

const LOG_FILE: &str = "command.log";
const DEFAULT_BATCH_MAX: usize = 64;
const DEFAULT_BATCH_WAIT_US: u64 = 200;

/// What fsync runs after a batch is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    None,
    Data,
    All,
}

#[derive(Clone, Copy, Debug)]
pub struct CommandLogConfig {
    /// Synchronous logging withholds tasks until their record is durable.
    pub synchronous: bool,
    pub sync_mode: SyncMode,
    pub batch_max: usize,
    pub batch_wait: Duration,
}

impl Default for CommandLogConfig {
    fn default() -> Self {
        Self {
            synchronous: false,
            sync_mode: SyncMode::Data,
            batch_max: DEFAULT_BATCH_MAX,
            batch_wait: Duration::from_micros(DEFAULT_BATCH_WAIT_US),
        }
    }
}

/// One durable record, as reread from disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LoggedRecord {
    Txn {
        envelope: LogEnvelope,
    },
    /// Viable-replay fault entry written on membership transitions.
    Fault {
        leader: SiteId,
        replicas: Vec<SiteId>,
        partition: PartitionId,
        fault_handle: SpHandle,
    },
}

struct AppendWork {
    payload: Vec<u8>,
    /// Task retained under synchronous logging, redelivered once durable.
    task: Option<SiteTask>,
    completion: Option<Completion>,
    status: Option<StatusHandle>,
}

type SinkCell = Mutex<Option<Arc<dyn DurabilitySink>>>;

pub struct FileCommandLog {
    log_path: PathBuf,
    synchronous: bool,
    tx: mpsc::Sender<AppendWork>,
    last_durable_unique_id: AtomicI64,
    sink: Arc<SinkCell>,
}

impl FileCommandLog {
    pub fn open_dir(path: impl AsRef<Path>, config: CommandLogConfig) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).context("create command log dir")?;
        let log_path = dir.join(LOG_FILE);

        let sink: Arc<SinkCell> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();
        let worker_path = log_path.clone();
        let worker_sink = sink.clone();
        thread::Builder::new()
            .name("command-log".to_string())
            .spawn(move || {
                log_worker(
                    &worker_path,
                    rx,
                    config.sync_mode,
                    config.batch_max.max(1),
                    config.batch_wait,
                    worker_sink,
                )
            })
            .context("spawn command log thread")?;

        Ok(Self {
            log_path,
            synchronous: config.synchronous,
            tx,
            last_durable_unique_id: AtomicI64::new(i64::MIN),
            sink,
        })
    }

    /// Reread every record, verifying checksums. Used for replay on
    /// startup and by tests probing durability.
    pub fn load(&self) -> anyhow::Result<Vec<LoggedRecord>> {
        read_records(&self.log_path)
    }

    pub fn last_durable_unique_id(&self) -> UniqueId {
        self.last_durable_unique_id.load(Ordering::Acquire)
    }

    fn encode(record: &LoggedRecord) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(record).context("encode command log record")
    }
}

impl CommandLog for FileCommandLog {
    fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn log(&self, task: SiteTask, envelope: LogEnvelope) -> LogResult {
        let payload = match Self::encode(&LoggedRecord::Txn { envelope }) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = ?err, "command log encode failed");
                return LogResult::Offer {
                    task,
                    completion: None,
                };
            }
        };

        if self.synchronous {
            let work = AppendWork {
                payload,
                task: Some(task),
                completion: None,
                status: None,
            };
            if let Err(err) = self.tx.send(work) {
                tracing::error!("command log worker is gone; running task undurable");
                return LogResult::Offer {
                    task: err.0.task.expect("task still in undelivered work"),
                    completion: None,
                };
            }
            LogResult::Pending
        } else {
            let completion = Completion::new();
            let work = AppendWork {
                payload,
                task: None,
                completion: Some(completion.clone()),
                status: None,
            };
            if self.tx.send(work).is_err() {
                tracing::error!("command log worker is gone; completing immediately");
                completion.complete();
            }
            LogResult::Offer {
                task,
                completion: Some(completion),
            }
        }
    }

    fn log_fault(
        &self,
        leader: SiteId,
        replicas: &[SiteId],
        partition: PartitionId,
        fault_handle: SpHandle,
    ) -> Option<StatusHandle> {
        let record = LoggedRecord::Fault {
            leader,
            replicas: replicas.to_vec(),
            partition,
            fault_handle,
        };
        let status = StatusHandle::new();
        let payload = match Self::encode(&record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = ?err, "fault log encode failed");
                status.set(false);
                return Some(status);
            }
        };
        let work = AppendWork {
            payload,
            task: None,
            completion: None,
            status: Some(status.clone()),
        };
        if self.tx.send(work).is_err() {
            status.set(false);
        }
        Some(status)
    }

    fn initialize_last_durable(&self, unique_id: UniqueId) {
        self.last_durable_unique_id
            .fetch_max(unique_id, Ordering::AcqRel);
    }

    fn register_sink(&self, sink: Arc<dyn DurabilitySink>) {
        *self.sink.lock().expect("sink lock poisoned") = Some(sink);
    }
}

fn log_worker(
    log_path: &Path,
    rx: mpsc::Receiver<AppendWork>,
    sync_mode: SyncMode,
    batch_max: usize,
    batch_wait: Duration,
    sink: Arc<SinkCell>,
) {
    let mut file = match open_for_append(log_path) {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(error = ?err, "open command log failed");
            return;
        }
    };

    let mut disconnected = false;
    while !disconnected {
        let first = match rx.recv() {
            Ok(work) => work,
            Err(_) => break,
        };

        let mut batch = Vec::with_capacity(batch_max);
        batch.push(first);
        if batch_max > 1 {
            let deadline = (!batch_wait.is_zero()).then(|| Instant::now() + batch_wait);
            loop {
                if batch.len() >= batch_max {
                    break;
                }
                match rx.try_recv() {
                    Ok(work) => {
                        batch.push(work);
                        continue;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                    Err(mpsc::TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
                let Some(deadline) = deadline else {
                    break;
                };
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match rx.recv_timeout(deadline.saturating_duration_since(now)) {
                    Ok(work) => batch.push(work),
                    Err(mpsc::RecvTimeoutError::Timeout) => break,
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }

        let mut write_ok = true;
        for work in &batch {
            if let Err(err) = write_record(&mut file, &work.payload) {
                tracing::error!(error = ?err, "command log write failed");
                write_ok = false;
                break;
            }
        }
        if write_ok {
            if let Err(err) = file.flush().and_then(|()| sync_file(&file, sync_mode)) {
                tracing::error!(error = ?err, "command log sync failed");
                write_ok = false;
            }
        }

        // Resolve every batched item. Completions carry no error; failures
        // are reported through logging and the fault statuses.
        for work in batch {
            if let Some(completion) = work.completion {
                completion.complete();
            }
            if let Some(status) = work.status {
                status.set(write_ok);
            }
            if let Some(task) = work.task {
                let sink = sink.lock().expect("sink lock poisoned").clone();
                match sink {
                    Some(sink) => sink.durable(task),
                    None => tracing::error!(
                        "durable task dropped: no durability sink registered"
                    ),
                }
            }
        }
    }
}

fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn sync_file(file: &File, mode: SyncMode) -> std::io::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data(),
        SyncMode::All => file.sync_all(),
    }
}

fn read_records(path: &Path) -> anyhow::Result<Vec<LoggedRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(
            hasher.finalize() == expected_crc,
            "command log checksum mismatch"
        );
        records.push(serde_json::from_slice(&payload).context("decode command log record")?);
    }
    Ok(records)
}
