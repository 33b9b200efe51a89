use std::fmt;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use buildlog_docker::{ByteStream, ContainerRuntime, RuntimeError};
use buildlog_sinks::SinkAdapter;
use buildlog_types::{LogRecord, LoggerStrategy, StreamKind, TransportMode};

use crate::{ByteBudget, MultiplexedCodec, decode_raw_chunk};

/// Line pushed once when a session stops delivering because of a size limit
pub const LIMIT_NOTICE: &str =
    "Log size limit exceeded; further logs of this step will not be stored\n";

type RecordStream = BoxStream<'static, Result<LogRecord, io::Error>>;

// ============================================================================
// Public types
// ============================================================================

/// Lifecycle of a capture session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Inspecting,
    Streaming,
    Finished,
}

/// Output stream a session consumes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStream {
    /// Attached stdout
    Stdout,
    /// Attached stderr
    Stderr,
    /// Followed log endpoint, stdout and stderr merged
    Logs,
}

impl SessionStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Logs => "logs",
        }
    }

    /// Whether records of a raw stream belong to stderr
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Stderr)
    }

    /// The end of a primary stream finishes the session
    pub fn is_primary(&self) -> bool {
        !self.is_error()
    }
}

impl fmt::Display for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications a session sends to its owner
#[derive(Debug)]
pub enum SessionEvent {
    /// Streams acquired and being consumed
    Started { container_id: String },
    /// Start failed; the session will not produce output
    Failed {
        container_id: String,
        error: SessionError,
    },
    /// The session's byte count changed
    LogSizeChanged { container_id: String, log_size: u64 },
    /// One output stream ended
    StreamEnded {
        container_id: String,
        stream: SessionStream,
    },
}

/// Errors starting a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to inspect container {container_id}: {source}")]
    Inspect {
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to acquire {stream} stream of container {container_id}: {source}")]
    Acquire {
        container_id: String,
        stream: &'static str,
        #[source]
        source: RuntimeError,
    },
}

/// What a session captures
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub container_id: String,
    pub strategy: LoggerStrategy,
    /// Per-container byte limit
    pub log_size_limit: Option<u64>,
}

// ============================================================================
// Emission
// ============================================================================

#[derive(Debug)]
struct Progress {
    state: SessionState,
    log_size: u64,
    limit_notified: bool,
}

/// State shared by the stream tasks of one session
struct Capture {
    container_id: String,
    log_size_limit: Option<u64>,
    adapter: Arc<dyn SinkAdapter>,
    budget: Arc<ByteBudget>,
    events: mpsc::UnboundedSender<SessionEvent>,
    progress: Mutex<Progress>,
}

impl Capture {
    fn is_over_limit(&self, log_size: u64) -> bool {
        self.budget.is_exceeded() || self.log_size_limit.is_some_and(|limit| log_size >= limit)
    }

    /// Deliver one record, or drop it once a limit is reached
    fn emit(&self, record: LogRecord) {
        let mut progress = self.progress.lock();

        if progress.state == SessionState::Finished {
            debug!(
                container_id = %self.container_id,
                "Dropping record of finished session"
            );
            return;
        }

        if self.is_over_limit(progress.log_size) {
            if !progress.limit_notified {
                progress.limit_notified = true;
                warn!(
                    container_id = %self.container_id,
                    log_size = progress.log_size,
                    total = self.budget.total(),
                    "Log size limit reached, suppressing further output"
                );
                if let Err(e) = self.adapter.push(LIMIT_NOTICE) {
                    warn!(container_id = %self.container_id, error = %e, "Failed to push limit notice");
                }
            }
            return;
        }

        if let Err(e) = self.adapter.push(&record.text) {
            warn!(container_id = %self.container_id, error = %e, "Failed to push log line");
        }
        progress.log_size += record.byte_len();

        if let Err(e) = self.adapter.set_last_update(Utc::now()) {
            warn!(container_id = %self.container_id, error = %e, "Failed to set last update");
        }

        self.budget.report(&self.container_id, progress.log_size);
        let _ = self.events.send(SessionEvent::LogSizeChanged {
            container_id: self.container_id.clone(),
            log_size: progress.log_size,
        });
    }

    fn stream_ended(&self, stream: SessionStream) {
        if stream.is_primary() {
            self.progress.lock().state = SessionState::Finished;
        }
        info!(
            container_id = %self.container_id,
            stream = %stream,
            "Container stream ended"
        );
        let _ = self.events.send(SessionEvent::StreamEnded {
            container_id: self.container_id.clone(),
            stream,
        });
    }

    async fn consume(self: Arc<Self>, stream: SessionStream, mut records: RecordStream) {
        while let Some(result) = records.next().await {
            match result {
                Ok(record) => self.emit(record),
                Err(e) => {
                    warn!(
                        container_id = %self.container_id,
                        stream = %stream,
                        error = %e,
                        "Error reading container stream"
                    );
                    break;
                }
            }
        }
        self.stream_ended(stream);
    }
}

/// Turn raw transport bytes into records
fn decode(stream: ByteStream, kind: SessionStream, mode: TransportMode) -> RecordStream {
    let stream = stream.map_err(io::Error::other);
    match mode {
        TransportMode::Tty => {
            let is_error = kind.is_error();
            stream
                .map_ok(move |chunk| decode_raw_chunk(&chunk, is_error))
                .boxed()
        }
        TransportMode::Multiplexed => {
            FramedRead::new(StreamReader::new(stream), MultiplexedCodec::new()).boxed()
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Captures the output of one container into its sink adapter
pub struct Session {
    config: SessionConfig,
    runtime: Arc<dyn ContainerRuntime>,
    capture: Arc<Capture>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        runtime: Arc<dyn ContainerRuntime>,
        adapter: Arc<dyn SinkAdapter>,
        budget: Arc<ByteBudget>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        budget.track(&config.container_id);

        let capture = Arc::new(Capture {
            container_id: config.container_id.clone(),
            log_size_limit: config.log_size_limit,
            adapter,
            budget,
            events,
            progress: Mutex::new(Progress {
                state: SessionState::Inspecting,
                log_size: 0,
                limit_notified: false,
            }),
        });

        Self {
            config,
            runtime,
            capture,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.config.container_id
    }

    pub fn state(&self) -> SessionState {
        self.capture.progress.lock().state
    }

    /// Bytes delivered so far
    pub fn log_size(&self) -> u64 {
        self.capture.progress.lock().log_size
    }

    /// Inspect the container, acquire its streams and start consuming them
    pub async fn start(&self) -> Result<(), SessionError> {
        let result = self.try_start().await;
        if result.is_err() {
            self.capture.progress.lock().state = SessionState::Finished;
        }
        result
    }

    async fn try_start(&self) -> Result<(), SessionError> {
        let container_id = self.container_id();

        let inspection =
            self.runtime
                .inspect(container_id)
                .await
                .map_err(|source| SessionError::Inspect {
                    container_id: container_id.to_string(),
                    source,
                })?;
        let mode = TransportMode::from_tty(inspection.tty);

        let streams = self.acquire().await?;
        self.capture.progress.lock().state = SessionState::Streaming;

        let mut tasks = self.tasks.lock();
        for (kind, stream) in streams {
            let records = decode(stream, kind, mode);
            tasks.push(tokio::spawn(self.capture.clone().consume(kind, records)));
        }

        info!(
            container_id,
            strategy = %self.config.strategy,
            tty = inspection.tty,
            "Capturing container output"
        );
        Ok(())
    }

    async fn acquire(&self) -> Result<Vec<(SessionStream, ByteStream)>, SessionError> {
        let container_id = self.container_id();
        let acquire_error = |stream: SessionStream| {
            move |source| SessionError::Acquire {
                container_id: container_id.to_string(),
                stream: stream.as_str(),
                source,
            }
        };

        match self.config.strategy {
            LoggerStrategy::Attach => {
                let (stdout, stderr) = tokio::try_join!(
                    async {
                        self.runtime
                            .attach(container_id, StreamKind::Stdout)
                            .await
                            .map_err(acquire_error(SessionStream::Stdout))
                    },
                    async {
                        self.runtime
                            .attach(container_id, StreamKind::Stderr)
                            .await
                            .map_err(acquire_error(SessionStream::Stderr))
                    },
                )?;
                Ok(vec![
                    (SessionStream::Stdout, stdout),
                    (SessionStream::Stderr, stderr),
                ])
            }
            LoggerStrategy::Logs => {
                let logs = self
                    .runtime
                    .logs(container_id)
                    .await
                    .map_err(acquire_error(SessionStream::Logs))?;
                Ok(vec![(SessionStream::Logs, logs)])
            }
        }
    }

    /// Start in the background and report the outcome as a [`SessionEvent`]
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let container_id = session.container_id().to_string();
            let event = match session.start().await {
                Ok(()) => SessionEvent::Started { container_id },
                Err(error) => SessionEvent::Failed {
                    container_id,
                    error,
                },
            };
            let _ = session.capture.events.send(event);
        })
    }

    /// Whether any stream task is still running
    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    /// Abort every stream task
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildlog_docker::testing::{FakeContainer, FakeRuntime, frame};
    use buildlog_sinks::Sink;
    use buildlog_sinks::testing::{RecordedCall, RecordingSink};
    use buildlog_types::{ContainerDescriptor, ContainerLabels, ContainerStatus};
    use std::time::Duration;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        sink: RecordingSink,
        budget: Arc<ByteBudget>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Harness {
        fn new(runtime: FakeRuntime, ceiling: Option<u64>) -> Self {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                runtime: Arc::new(runtime),
                sink: RecordingSink::new(),
                budget: Arc::new(ByteBudget::new(ceiling)),
                events_tx,
                events_rx,
            }
        }

        fn session(&self, id: &str, strategy: LoggerStrategy, limit: Option<u64>) -> Arc<Session> {
            let descriptor =
                ContainerDescriptor::new(id, ContainerStatus::Started, ContainerLabels::default());
            Arc::new(Session::new(
                SessionConfig {
                    container_id: id.to_string(),
                    strategy,
                    log_size_limit: limit,
                },
                self.runtime.clone(),
                self.sink.attach(&descriptor),
                self.budget.clone(),
                self.events_tx.clone(),
            ))
        }

        /// Wait until the session stream tasks have drained
        async fn settle(&self, session: &Session) {
            for _ in 0..200 {
                if !session.is_running() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("session did not settle");
        }
    }

    async fn wait_for_size(session: &Session, size: u64) {
        for _ in 0..200 {
            if session.log_size() >= size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session reached {} bytes, expected {}", session.log_size(), size);
    }

    #[tokio::test]
    async fn test_attach_multiplexed_counts_both_streams() {
        let runtime = FakeRuntime::new().with_container(
            "abc",
            FakeContainer::multiplexed()
                .with_stdout(frame(false, b"hello\n"))
                .with_stderr(frame(true, b"err\n"))
                .held_open(),
        );
        let harness = Harness::new(runtime, None);
        let session = harness.session("abc", LoggerStrategy::Attach, None);

        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        wait_for_size(&session, 10).await;

        assert_eq!(session.log_size(), 10);
        assert_eq!(harness.budget.total(), 10);
        let mut lines = harness.sink.pushed_lines();
        lines.sort();
        assert_eq!(lines, vec!["err\n".to_string(), "hello\n".to_string()]);
        assert!(
            harness
                .sink
                .calls()
                .iter()
                .any(|call| matches!(call, RecordedCall::LastUpdate(_)))
        );
    }

    #[tokio::test]
    async fn test_attach_requests_both_streams() {
        let runtime = FakeRuntime::new()
            .with_container("abc", FakeContainer::multiplexed().held_open());
        let harness = Harness::new(runtime, None);
        let session = harness.session("abc", LoggerStrategy::Attach, None);

        session.start().await.unwrap();

        let calls = harness.runtime.calls();
        assert_eq!(calls[0], "inspect:abc");
        assert!(calls.contains(&"attach:abc:stdout".to_string()));
        assert!(calls.contains(&"attach:abc:stderr".to_string()));
        assert!(!calls.iter().any(|call| call.starts_with("logs:")));
    }

    #[tokio::test]
    async fn test_tty_chunks_forwarded_verbatim() {
        let runtime = FakeRuntime::new().with_container(
            "abc",
            FakeContainer::tty().with_logs(&b"building...\n"[..]),
        );
        let harness = Harness::new(runtime, None);
        let session = harness.session("abc", LoggerStrategy::Logs, None);

        session.start().await.unwrap();
        harness.settle(&session).await;

        assert_eq!(harness.sink.pushed_lines(), vec!["building...\n".to_string()]);
        assert_eq!(session.log_size(), 12);
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(harness.runtime.calls(), vec!["inspect:abc", "logs:abc"]);
    }

    #[tokio::test]
    async fn test_logs_stream_demultiplexed_across_chunks() {
        let mut bytes = frame(false, b"step 1\n").to_vec();
        bytes.extend_from_slice(&frame(true, b"warn\n"));
        let (first, second) = bytes.split_at(5);

        let runtime = FakeRuntime::new().with_container(
            "abc",
            FakeContainer::multiplexed()
                .with_logs(first.to_vec())
                .with_logs(second.to_vec()),
        );
        let harness = Harness::new(runtime, None);
        let session = harness.session("abc", LoggerStrategy::Logs, None);

        session.start().await.unwrap();
        harness.settle(&session).await;

        assert_eq!(
            harness.sink.pushed_lines(),
            vec!["step 1\n".to_string(), "warn\n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_inspect_failure() {
        let harness = Harness::new(FakeRuntime::new(), None);
        let session = harness.session("missing", LoggerStrategy::Attach, None);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Inspect { ref container_id, .. } if container_id == "missing"));
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(harness.runtime.calls(), vec!["inspect:missing"]);
        assert!(harness.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_container_limit_suppresses_with_single_notice() {
        let runtime = FakeRuntime::new().with_container(
            "abc",
            FakeContainer::tty()
                .with_logs(&b"12345"[..])
                .with_logs(&b"67890"[..])
                .with_logs(&b"dropped"[..])
                .with_logs(&b"dropped too"[..]),
        );
        let harness = Harness::new(runtime, None);
        let session = harness.session("abc", LoggerStrategy::Logs, Some(8));

        session.start().await.unwrap();
        harness.settle(&session).await;

        assert_eq!(
            harness.sink.pushed_lines(),
            vec![
                "12345".to_string(),
                "67890".to_string(),
                LIMIT_NOTICE.to_string()
            ]
        );
        assert_eq!(session.log_size(), 10);
    }

    #[tokio::test]
    async fn test_global_budget_suppresses_other_sessions() {
        let runtime = FakeRuntime::new()
            .with_container("a", FakeContainer::tty().with_logs(&b"0123456789"[..]))
            .with_container("b", FakeContainer::tty().with_logs(&b"late"[..]));
        let harness = Harness::new(runtime, Some(10));

        let first = harness.session("a", LoggerStrategy::Logs, None);
        first.start().await.unwrap();
        harness.settle(&first).await;
        assert!(harness.budget.is_exceeded());

        let second = harness.session("b", LoggerStrategy::Logs, None);
        second.start().await.unwrap();
        harness.settle(&second).await;

        assert_eq!(second.log_size(), 0);
        assert_eq!(harness.sink.calls_for("b"), vec![RecordedCall::Push(LIMIT_NOTICE.to_string())]);
        assert_eq!(harness.budget.total(), 10);
    }

    #[tokio::test]
    async fn test_spawn_reports_outcome() {
        let runtime = FakeRuntime::new()
            .with_container("ok", FakeContainer::multiplexed().held_open());
        let mut harness = Harness::new(runtime, None);

        harness.session("ok", LoggerStrategy::Attach, None).spawn().await.unwrap();
        harness.session("gone", LoggerStrategy::Attach, None).spawn().await.unwrap();

        let mut outcomes = Vec::new();
        while let Ok(event) = harness.events_rx.try_recv() {
            match event {
                SessionEvent::Started { container_id } => outcomes.push(format!("started:{container_id}")),
                SessionEvent::Failed { container_id, .. } => outcomes.push(format!("failed:{container_id}")),
                _ => {}
            }
        }
        assert_eq!(outcomes, vec!["started:ok", "failed:gone"]);
    }

    #[tokio::test]
    async fn test_stderr_end_does_not_finish() {
        let runtime = FakeRuntime::new()
            .with_container("abc", FakeContainer::multiplexed());
        let harness = Harness::new(runtime, None);
        let session = harness.session("abc", LoggerStrategy::Attach, None);

        let capture = session.capture.clone();
        capture.stream_ended(SessionStream::Stderr);
        assert_eq!(session.state(), SessionState::Inspecting);
        capture.stream_ended(SessionStream::Stdout);
        assert_eq!(session.state(), SessionState::Finished);

        capture.emit(LogRecord::stdout("after end"));
        assert!(harness.sink.calls().is_empty());
    }
}
