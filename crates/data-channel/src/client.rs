//! Resumable transfer client.
//!
//! A transfer opens one control connection (`Init`), then sends the chunks the
//! receiver does not have yet over up to `max_concurrent_chunks` connections.
//! The first worker reuses the control connection; the others `Attach` to the
//! transfer with its resume token. The receiver's completed set is the only
//! source of truth for what to skip, so a resumed transfer never re-sends a
//! confirmed chunk and never skips an unconfirmed one.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dbshuttle_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT, DEFAULT_MAX_CONCURRENT_CHUNKS,
};
use dbshuttle_protocol::{
    AttachRequest, ChunkMessage, ChunkResponse, ErrorKind, FileMetadata, FinalizeRequest,
    FinalizeResponse, StatusRequest, TransferAccepted, TransferInit, TransferStatus,
};
use dbshuttle_transfer::{
    ProgressTracker, TransferError, TransferProgress, TransferState, calculate_file_checksum_async,
    read_chunk_at,
};

use crate::TCP_BUFFER_SIZE;
use crate::error::{DataChannelError, TransferFailed};
use crate::wire::{Frame, read_frame, write_frame};

/// How long to wait for the receiver to reassemble and verify an archive.
pub const DEFAULT_FINALIZE_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Backoff for transient and integrity failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): exponential, capped,
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25 * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Client-side transfer settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Receiver address (`host:port`).
    pub server_addr: String,
    pub chunk_size: u64,
    /// Upper bound on connections sending chunks at once.
    pub max_concurrent_chunks: usize,
    pub connect_timeout: Duration,
    /// Per frame exchange.
    pub io_timeout: Duration,
    pub finalize_timeout: Duration,
    pub retry: RetryPolicy,
}

impl TransferConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            finalize_timeout: DEFAULT_FINALIZE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn open(config: &TransferConfig, cancel: &CancellationToken) -> Result<Self, DataChannelError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = tokio::time::timeout(
                config.connect_timeout,
                TcpStream::connect(config.server_addr.as_str()),
            ) => {
                match result {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::with_capacity(TCP_BUFFER_SIZE, reader),
            writer: BufWriter::with_capacity(TCP_BUFFER_SIZE, writer),
        })
    }

    /// Sends `frame` and waits for one reply, both under `timeout`.
    async fn request(
        &mut self,
        frame: &Frame,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Frame, DataChannelError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DataChannelError::Cancelled),
            result = tokio::time::timeout(timeout, write_frame(&mut self.writer, frame)) => {
                match result {
                    Ok(r) => r?,
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        }
        self.recv(timeout, cancel).await
    }

    /// Reads one reply. Error frames become [`DataChannelError::Rejected`].
    async fn recv(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Frame, DataChannelError> {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DataChannelError::Cancelled),
            result = tokio::time::timeout(timeout, read_frame(&mut self.reader, 0)) => {
                match result {
                    Ok(r) => r?,
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };
        match frame {
            None => Err(DataChannelError::ConnectionClosed),
            Some(Frame::Error(e)) => Err(DataChannelError::Rejected {
                kind: e.kind,
                message: e.message,
                retry_after: e.retry_after_ms.map(Duration::from_millis),
            }),
            Some(frame) => Ok(frame),
        }
    }
}

fn unexpected(expected: &str, got: &Frame) -> DataChannelError {
    DataChannelError::Protocol(format!("expected {expected}, got {:?}", got.kind()))
}

/// Decides whether failed attempt `attempt` may be retried and sleeps for the
/// backoff delay if so. Returns `err` when the caller must give up.
async fn backoff(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    attempt: u32,
    err: DataChannelError,
    op: &str,
) -> Result<(), DataChannelError> {
    if matches!(err, DataChannelError::Cancelled) {
        return Err(err);
    }
    let kind = err.kind();
    if !kind.is_retryable() || attempt >= policy.max_attempts {
        return Err(err);
    }
    let mut delay = policy.delay_for_attempt(attempt);
    if let DataChannelError::Rejected {
        retry_after: Some(hint),
        ..
    } = &err
    {
        delay = delay.max(*hint);
    }
    warn!(
        op,
        attempt,
        kind = %kind,
        delay_ms = delay.as_millis() as u64,
        "{err}, retrying"
    );
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DataChannelError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Number of worker connections for `pending` chunks.
fn worker_count(max_concurrent: usize, pending: usize) -> usize {
    max_concurrent.max(1).min(pending)
}

// ---------------------------------------------------------------------------
// TransferClient
// ---------------------------------------------------------------------------

/// Result of a transfer the receiver has reassembled and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub transfer_id: String,
    pub file_name: String,
    pub total_bytes: u64,
    pub final_checksum: String,
    /// Chunks newly confirmed during this run (excludes resumed ones).
    pub chunks_sent: u32,
}

/// Starts and resumes transfers against one receiver.
pub struct TransferClient {
    config: Arc<TransferConfig>,
    cancel: CancellationToken,
}

impl TransferClient {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Ties every transfer started by this client to `cancel`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Hashes `path`, opens a new transfer and starts sending it.
    pub async fn start_transfer(&self, path: &Path) -> Result<TransferHandle, DataChannelError> {
        self.begin(path, None).await
    }

    /// Re-opens the transfer owned by `token` and sends only what the receiver
    /// is missing.
    pub async fn resume_transfer(
        &self,
        path: &Path,
        token: &str,
    ) -> Result<TransferHandle, DataChannelError> {
        self.begin(path, Some(token.to_string())).await
    }

    /// Asks the receiver which chunks of a transfer it holds.
    pub async fn query_status(
        &self,
        transfer_id: &str,
        token: &str,
    ) -> Result<TransferStatus, DataChannelError> {
        let mut conn = Connection::open(&self.config, &self.cancel).await?;
        let attach = Frame::Attach(AttachRequest {
            transfer_id: transfer_id.to_string(),
            resume_token: token.to_string(),
        });
        match conn.request(&attach, self.config.io_timeout, &self.cancel).await? {
            Frame::AttachAck(_) => {}
            other => return Err(unexpected("AttachAck", &other)),
        }
        let status = Frame::Status(StatusRequest {
            transfer_id: transfer_id.to_string(),
        });
        match conn.request(&status, self.config.io_timeout, &self.cancel).await? {
            Frame::StatusAck(s) => Ok(s),
            other => Err(unexpected("StatusAck", &other)),
        }
    }

    async fn begin(
        &self,
        path: &Path,
        resume_token: Option<String>,
    ) -> Result<TransferHandle, DataChannelError> {
        let cancel = self.cancel.child_token();
        let meta = describe_file(path, self.config.chunk_size).await?;
        info!(
            file = %meta.file_name,
            total_size = meta.total_size,
            total_chunks = meta.total_chunks(),
            resume = resume_token.is_some(),
            "starting transfer"
        );

        let init = Frame::Init(TransferInit::new(&meta, resume_token));
        let (conn, accepted) = self.open_with_retry(&init, &cancel).await?;
        let completed = check_accepted(&meta, &accepted)?;

        let tracker = ProgressTracker::new(&accepted.transfer_id, meta.total_size, meta.total_chunks());
        tracker.restore(completed.iter().map(|&i| (i, meta.chunk_len(i))));
        let pending: VecDeque<u32> = (0..meta.total_chunks())
            .filter(|i| !completed.contains(i))
            .collect();
        debug!(
            transfer_id = %accepted.transfer_id,
            pending = pending.len(),
            skipped = completed.len(),
            "transfer accepted"
        );

        let session = Arc::new(Session {
            config: Arc::clone(&self.config),
            path: path.to_path_buf(),
            meta,
            transfer_id: accepted.transfer_id.clone(),
            token: accepted.resume_token.clone(),
            tracker,
            queue: Mutex::new(pending),
            last_confirmed: Mutex::new(None),
            chunks_sent: AtomicU32::new(0),
            finalized: Mutex::new(None),
            abort: cancel.child_token(),
        });
        let progress = session.tracker.subscribe();
        let task = tokio::spawn(Arc::clone(&session).run(conn));

        Ok(TransferHandle {
            transfer_id: accepted.transfer_id,
            resume_token: accepted.resume_token,
            progress,
            cancel,
            task,
        })
    }

    async fn open_with_retry(
        &self,
        init: &Frame,
        cancel: &CancellationToken,
    ) -> Result<(Connection, TransferAccepted), DataChannelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<_, DataChannelError> = async {
                let mut conn = Connection::open(&self.config, cancel).await?;
                match conn.request(init, self.config.io_timeout, cancel).await? {
                    Frame::InitAck(accepted) => Ok((conn, accepted)),
                    other => Err(unexpected("InitAck", &other)),
                }
            }
            .await;
            match result {
                Ok(opened) => return Ok(opened),
                Err(e) => backoff(&self.config.retry, cancel, attempt, e, "init").await?,
            }
        }
    }
}

/// Size, layout and whole-file digest of the archive at `path`.
async fn describe_file(path: &Path, chunk_size: u64) -> Result<FileMetadata, DataChannelError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidPath(path.display().to_string()))?
        .to_string();
    let total_size = tokio::fs::metadata(path).await?.len();
    let file_checksum = calculate_file_checksum_async(path.to_path_buf()).await?;
    Ok(FileMetadata {
        file_name,
        total_size,
        chunk_size: if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        },
        file_checksum,
    })
}

/// Checks the receiver agrees on the layout and returns its completed set.
fn check_accepted(
    meta: &FileMetadata,
    accepted: &TransferAccepted,
) -> Result<BTreeSet<u32>, DataChannelError> {
    let total = meta.total_chunks();
    if accepted.chunk_size != meta.chunk_size || accepted.total_chunks != total {
        return Err(DataChannelError::Protocol(format!(
            "receiver layout {}x{} does not match local {}x{}",
            accepted.total_chunks, accepted.chunk_size, total, meta.chunk_size
        )));
    }
    let completed: BTreeSet<u32> = accepted.completed_chunks.iter().copied().collect();
    if let Some(&bad) = completed.iter().find(|&&i| i >= total) {
        return Err(DataChannelError::Protocol(format!(
            "receiver reports chunk {bad} of {total} as completed"
        )));
    }
    Ok(completed)
}

// ---------------------------------------------------------------------------
// Session (one running transfer)
// ---------------------------------------------------------------------------

struct Session {
    config: Arc<TransferConfig>,
    path: PathBuf,
    meta: FileMetadata,
    transfer_id: String,
    token: String,
    tracker: ProgressTracker,
    queue: Mutex<VecDeque<u32>>,
    last_confirmed: Mutex<Option<u32>>,
    chunks_sent: AtomicU32,
    /// Set when the receiver finalizes after the ack of the last chunk.
    finalized: Mutex<Option<FinalizeResponse>>,
    /// Cancelled by the handle or by the first worker failure.
    abort: CancellationToken,
}

impl Session {
    async fn run(self: Arc<Self>, conn: Connection) -> Result<CompletedTransfer, TransferFailed> {
        let mut spare = Some(conn);
        let mut round = 0;
        let response = loop {
            round += 1;
            self.tracker.set_state(TransferState::Sending);
            if let Err(e) = self.send_pending(&mut spare).await {
                return Err(self.fail(e));
            }

            self.tracker.set_state(TransferState::AwaitingFinalization);
            let auto = self.finalized.lock().unwrap().take();
            let response = match auto {
                Some(r) if r.success || r.error_kind != Some(ErrorKind::Transient) => r,
                _ => match self.finalize_with_retry(spare.take()).await {
                    Ok(r) => r,
                    Err(e) => return Err(self.fail(e)),
                },
            };
            if response.success
                || response.error_kind != Some(ErrorKind::Integrity)
                || round >= self.config.retry.max_attempts.max(1)
            {
                break response;
            }
            // The receiver drops stored chunks that fail verification.
            match self.requeue_missing(&mut spare).await {
                Ok(0) => break response,
                Ok(requeued) => warn!(
                    transfer_id = %self.transfer_id,
                    requeued,
                    round,
                    "receiver rejected stored chunks, sending them again"
                ),
                Err(e) => {
                    debug!(transfer_id = %self.transfer_id, "status after failed finalize: {e}");
                    break response;
                }
            }
        };

        if !response.success {
            let source = DataChannelError::rejected(
                response.error_kind.unwrap_or(ErrorKind::Protocol),
                response.error.unwrap_or_else(|| "finalization failed".into()),
            );
            return Err(self.fail(source));
        }
        let final_checksum = response.final_checksum.unwrap_or_default();
        if !final_checksum.eq_ignore_ascii_case(&self.meta.file_checksum) {
            let source = DataChannelError::rejected(
                ErrorKind::Integrity,
                format!(
                    "receiver reports checksum {final_checksum}, expected {}",
                    self.meta.file_checksum
                ),
            );
            return Err(self.fail(source));
        }

        self.tracker.set_state(TransferState::Completed);
        let chunks_sent = self.chunks_sent.load(Ordering::Relaxed);
        info!(
            transfer_id = %self.transfer_id,
            file = %self.meta.file_name,
            total_bytes = self.meta.total_size,
            chunks_sent,
            "transfer completed"
        );
        Ok(CompletedTransfer {
            transfer_id: self.transfer_id.clone(),
            file_name: self.meta.file_name.clone(),
            total_bytes: self.meta.total_size,
            final_checksum,
            chunks_sent,
        })
    }

    /// Drains the queue with up to `max_concurrent_chunks` workers. The first
    /// worker takes `spare`; it is left in place when nothing is pending.
    async fn send_pending(
        self: &Arc<Self>,
        spare: &mut Option<Connection>,
    ) -> Result<(), DataChannelError> {
        let pending = self.queue.lock().unwrap().len();
        let workers = worker_count(self.config.max_concurrent_chunks, pending);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let session = Arc::clone(self);
            let conn = if worker == 0 { spare.take() } else { None };
            set.spawn(async move { session.worker(conn).await });
        }

        let mut failure: Option<DataChannelError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(std::io::Error::other(e).into()));
            if let Err(e) = result {
                self.abort.cancel();
                // Workers stopped by the abort report Cancelled; keep the cause.
                let replace = match &failure {
                    None => true,
                    Some(DataChannelError::Cancelled) => !matches!(e, DataChannelError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if self.abort.is_cancelled() {
            return Err(DataChannelError::Cancelled);
        }
        Ok(())
    }

    /// Asks the receiver which chunks it holds and queues the rest. Returns
    /// how many were queued.
    async fn requeue_missing(
        &self,
        spare: &mut Option<Connection>,
    ) -> Result<usize, DataChannelError> {
        let mut conn = match spare.take() {
            Some(c) => c,
            None => self.attach().await?,
        };
        let request = Frame::Status(StatusRequest {
            transfer_id: self.transfer_id.clone(),
        });
        let status = match conn.request(&request, self.config.io_timeout, &self.abort).await? {
            Frame::StatusAck(s) => s,
            other => return Err(unexpected("StatusAck", &other)),
        };
        let held: BTreeSet<u32> = status.completed_chunks.into_iter().collect();
        let missing: VecDeque<u32> = (0..self.meta.total_chunks())
            .filter(|i| !held.contains(i))
            .collect();
        let requeued = missing.len();
        *self.queue.lock().unwrap() = missing;
        *spare = Some(conn);
        Ok(requeued)
    }

    fn fail(&self, source: DataChannelError) -> TransferFailed {
        let state = if matches!(source, DataChannelError::Cancelled)
            || source.kind() == ErrorKind::Transient
        {
            TransferState::Interrupted
        } else {
            TransferState::Failed
        };
        self.tracker.set_state(state);
        let last_confirmed_chunk = *self.last_confirmed.lock().unwrap();
        warn!(
            transfer_id = %self.transfer_id,
            state = ?state,
            last_confirmed_chunk = ?last_confirmed_chunk,
            "transfer stopped: {source}"
        );
        TransferFailed {
            transfer_id: self.transfer_id.clone(),
            resume_token: self.token.clone(),
            last_confirmed_chunk,
            state,
            source,
        }
    }

    async fn worker(&self, mut conn: Option<Connection>) -> Result<(), DataChannelError> {
        loop {
            if self.abort.is_cancelled() {
                return Err(DataChannelError::Cancelled);
            }
            let next = self.queue.lock().unwrap().pop_front();
            let Some(index) = next else {
                return Ok(());
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.send_chunk(&mut conn, index).await {
                    Ok(()) => break,
                    Err(e) => {
                        let op = format!("chunk {index}");
                        backoff(&self.config.retry, &self.abort, attempt, e, &op).await?;
                    }
                }
            }
        }
    }

    /// One attempt at delivering chunk `index`. The connection is kept only
    /// when it is known to be in sync (the receiver answered with an ack).
    async fn send_chunk(
        &self,
        conn: &mut Option<Connection>,
        index: u32,
    ) -> Result<(), DataChannelError> {
        let mut c = match conn.take() {
            Some(c) => c,
            None => self.attach().await?,
        };
        let ack = self.exchange_chunk(&mut c, index).await?;
        if !ack.accepted {
            *conn = Some(c);
            return Err(DataChannelError::rejected(
                ack.error_kind.unwrap_or(ErrorKind::Protocol),
                ack.reason.unwrap_or_else(|| format!("chunk {index} rejected")),
            ));
        }

        self.tracker.confirm(index, self.meta.chunk_len(index));
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_confirmed.lock().unwrap() = Some(index);
        debug!(
            transfer_id = %self.transfer_id,
            chunk = index,
            completed = ack.completed_chunks,
            total = ack.total_chunks,
            "chunk confirmed"
        );

        if ack.all_confirmed() {
            self.tracker.set_state(TransferState::AwaitingFinalization);
            let response = match c.recv(self.config.finalize_timeout, &self.abort).await? {
                Frame::Finalized(r) => r,
                other => return Err(unexpected("Finalized", &other)),
            };
            *self.finalized.lock().unwrap() = Some(response);
        }
        *conn = Some(c);
        Ok(())
    }

    async fn exchange_chunk(
        &self,
        conn: &mut Connection,
        index: u32,
    ) -> Result<ChunkResponse, DataChannelError> {
        // Re-read on every attempt so an integrity retry sends fresh bytes.
        let chunk = read_chunk_at(&self.path, &self.meta, index).await?;
        let msg = ChunkMessage {
            transfer_id: self.transfer_id.clone(),
            chunk_index: index,
            chunk_size: chunk.size(),
            chunk_checksum: chunk.checksum,
            is_last_chunk: chunk.is_last,
        };
        let frame = Frame::Chunk(msg, chunk.data);
        match conn.request(&frame, self.config.io_timeout, &self.abort).await? {
            Frame::ChunkAck(ack) if ack.chunk_index == index => Ok(ack),
            other => Err(unexpected("ChunkAck", &other)),
        }
    }

    async fn attach(&self) -> Result<Connection, DataChannelError> {
        let mut conn = Connection::open(&self.config, &self.abort).await?;
        let frame = Frame::Attach(AttachRequest {
            transfer_id: self.transfer_id.clone(),
            resume_token: self.token.clone(),
        });
        match conn.request(&frame, self.config.io_timeout, &self.abort).await? {
            Frame::AttachAck(_) => Ok(conn),
            other => Err(unexpected("AttachAck", &other)),
        }
    }

    async fn finalize_with_retry(
        &self,
        mut conn: Option<Connection>,
    ) -> Result<FinalizeResponse, DataChannelError> {
        let request = Frame::Finalize(FinalizeRequest {
            transfer_id: self.transfer_id.clone(),
        });
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<FinalizeResponse, DataChannelError> = async {
                let mut c = match conn.take() {
                    Some(c) => c,
                    None => self.attach().await?,
                };
                match c.request(&request, self.config.finalize_timeout, &self.abort).await? {
                    Frame::Finalized(r) => Ok(r),
                    other => Err(unexpected("Finalized", &other)),
                }
            }
            .await;

            let err = match result {
                Ok(r) if r.success || r.error_kind != Some(ErrorKind::Transient) => return Ok(r),
                Ok(r) => DataChannelError::rejected(
                    ErrorKind::Transient,
                    r.error.unwrap_or_else(|| "finalization failed".into()),
                ),
                Err(e) => e,
            };
            backoff(&self.config.retry, &self.abort, attempt, err, "finalize").await?;
        }
    }
}

// ---------------------------------------------------------------------------
// TransferHandle
// ---------------------------------------------------------------------------

/// A running transfer.
pub struct TransferHandle {
    transfer_id: String,
    resume_token: String,
    progress: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<CompletedTransfer, TransferFailed>>,
}

impl TransferHandle {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Token to pass to [`TransferClient::resume_transfer`] after an interruption.
    pub fn resume_token(&self) -> &str {
        &self.resume_token
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> TransferProgress {
        self.progress.borrow().clone()
    }

    /// A receiver that observes every progress update.
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    /// Stops sending. Chunks already acknowledged stay recorded by the receiver.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the transfer to complete or stop.
    pub async fn wait(self) -> Result<CompletedTransfer, TransferFailed> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferFailed {
                transfer_id: self.transfer_id,
                resume_token: self.resume_token,
                last_confirmed_chunk: None,
                state: TransferState::Failed,
                source: std::io::Error::other(e).into(),
            }),
        }
    }
}
