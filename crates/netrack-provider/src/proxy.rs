//! Proxy Flow Reader
//!
//! Owns the lifecycle of proxied flows: open the flow, read it chunk by
//! chunk, classify every chunk and record matches, until the flow closes.
//!
//! # Per-flow state
//!
//! ```text
//! Opening ──open ok──▶ Reading ──closed / stop──▶ Closed
//!    │                    │
//!    └──open failed──▶ Failed ◀──read error──┘
//! ```
//!
//! - Chunk N is classified and committed before chunk N+1 is read
//! - A failure ends its own flow only; there are no retries
//! - Datagram flows are drained but never classified

use crate::error::ProviderError;
use crate::lifecycle::{Lifecycle, ProviderState};
use chrono::Utc;
use netrack_filter::{FlowClassifier, Verdict};
use netrack_store::RequestStore;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Transport of a proxied flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

/// Result of one read on a proxied flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// Bytes from the client
    Chunk(Vec<u8>),
    /// Nothing this time; the flow is still open
    Empty,
    /// The client closed the flow
    Closed,
}

/// A flow routed through the user-space proxy.
pub trait ProxyFlow: Send + 'static {
    fn transport(&self) -> Transport;

    /// Short label for logs
    fn describe(&self) -> String;

    /// Open the flow for reading.
    fn open(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Read the next chunk.
    fn read(&mut self) -> impl Future<Output = io::Result<ReadEvent>> + Send;
}

/// State of one proxied flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Opening,
    Reading,
    Closed,
    Failed,
}

impl FlowState {
    /// Check if the flow has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Closed | FlowState::Failed)
    }
}

/// Outcome of a finished flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSummary {
    pub state: FlowState,
    /// Chunks received
    pub chunks: u64,
    /// Records committed
    pub logged: u64,
}

/// Cancellation for everything started during one provider run.
///
/// The provider publishes a run generation that is odd while running and
/// bumped on every start and stop. A signal captures the generation it was
/// created in and is cancelled once that generation is over, so a stop
/// followed by a start never revives an older flow.
#[derive(Debug, Clone)]
pub struct RunSignal {
    rx: watch::Receiver<u64>,
    generation: u64,
}

impl RunSignal {
    pub fn new(mut rx: watch::Receiver<u64>) -> Self {
        let generation = *rx.borrow_and_update();
        Self { rx, generation }
    }

    /// Generation this signal belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.generation % 2 == 0
            || self.rx.has_changed().is_err()
            || *self.rx.borrow() != self.generation
    }

    /// Resolve once the run is over or the provider is gone.
    pub async fn cancelled(&mut self) {
        while !self.is_cancelled() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Read loop for a single proxied flow
pub struct ProxyFlowReader<F: ProxyFlow> {
    flow: F,
    classifier: Arc<FlowClassifier>,
    store: RequestStore,
    signal: RunSignal,
    summary: FlowSummary,
}

impl<F: ProxyFlow> ProxyFlowReader<F> {
    pub fn new(flow: F, classifier: Arc<FlowClassifier>, store: RequestStore, signal: RunSignal) -> Self {
        Self {
            flow,
            classifier,
            store,
            signal,
            summary: FlowSummary {
                state: FlowState::Opening,
                chunks: 0,
                logged: 0,
            },
        }
    }

    /// Drive the flow to a terminal state.
    pub async fn run(mut self) -> FlowSummary {
        let label = self.flow.describe();

        if let Err(e) = self.flow.open().await {
            warn!("Failed to open flow {}: {}", label, e);
            self.summary.state = FlowState::Failed;
            return self.summary;
        }
        debug!("Flow {} opened", label);
        self.summary.state = FlowState::Reading;

        loop {
            if self.signal.is_cancelled() {
                debug!("Flow {} stopped", label);
                self.summary.state = FlowState::Closed;
                break;
            }

            let event = tokio::select! {
                biased;
                _ = self.signal.cancelled() => continue,
                event = self.flow.read() => event,
            };

            match event {
                Ok(ReadEvent::Chunk(bytes)) => self.handle_chunk(bytes).await,
                Ok(ReadEvent::Empty) => trace!("Flow {} empty read", label),
                Ok(ReadEvent::Closed) => {
                    debug!("Flow {} closed", label);
                    self.summary.state = FlowState::Closed;
                    break;
                }
                Err(e) => {
                    warn!("Failed to read flow {}: {}", label, e);
                    self.summary.state = FlowState::Failed;
                    break;
                }
            }
        }

        self.summary
    }

    async fn handle_chunk(&mut self, bytes: Vec<u8>) {
        self.summary.chunks += 1;

        if self.flow.transport() == Transport::Datagram {
            trace!("Skipping {} byte datagram", bytes.len());
            return;
        }

        let Ok(text) = String::from_utf8(bytes) else {
            trace!("Ignoring non-UTF-8 chunk");
            return;
        };

        let (text, link) = match self.classifier.classify_payload(&text) {
            Verdict::Loggable { text, link } => (text, link),
            Verdict::NotLoggable => return,
        };

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.append(text, Utc::now(), link)).await {
            Ok(Ok(id)) => {
                debug!("Logged proxied request as {}", id);
                self.summary.logged += 1;
            }
            Ok(Err(e)) => warn!("Failed to log proxied request: {}", e),
            Err(e) => warn!("Store task failed: {}", e),
        }
    }
}

/// Proxy provider configuration
#[derive(Debug, Clone)]
pub struct ProxyProviderConfig {
    /// Maximum flows read concurrently
    pub max_flows: usize,
}

impl Default for ProxyProviderConfig {
    fn default() -> Self {
        Self { max_flows: 256 }
    }
}

/// Owner of all proxied flows
pub struct ProxyProvider {
    lifecycle: Lifecycle,
    classifier: Arc<FlowClassifier>,
    store: RequestStore,
    /// Run generation, odd while running
    run_tx: watch::Sender<u64>,
    /// Limits concurrently read flows
    flow_slots: Arc<Semaphore>,
    active_flows: Arc<AtomicU64>,
    total_flows: AtomicU64,
}

impl ProxyProvider {
    pub fn new(config: ProxyProviderConfig, classifier: FlowClassifier, store: RequestStore) -> Self {
        let (run_tx, _) = watch::channel(0);

        Self {
            lifecycle: Lifecycle::new("proxy"),
            classifier: Arc::new(classifier),
            store,
            run_tx,
            flow_slots: Arc::new(Semaphore::new(config.max_flows.max(1))),
            active_flows: Arc::new(AtomicU64::new(0)),
            total_flows: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    /// Start accepting flows once the store is reachable.
    pub fn start<C>(&self, completion: C)
    where
        C: FnOnce(Result<(), ProviderError>),
    {
        self.lifecycle.start(
            || {
                self.store.count()?;
                self.run_tx.send_modify(|generation| *generation = (*generation + 1) | 1);
                Ok(())
            },
            completion,
        );
    }

    /// Stop every flow. No read is issued after this returns.
    pub fn stop<C: FnOnce()>(&self, completion: C) {
        self.lifecycle.stop(
            || {
                self.run_tx.send_modify(|generation| {
                    if *generation % 2 == 1 {
                        *generation += 1;
                    }
                });
                info!(
                    "Proxy stopped ({} active flow(s) cancelled)",
                    self.active_flows()
                );
            },
            completion,
        );
    }

    /// Signal for the current run, cancelled when the provider stops.
    /// Taken while stopped, it is cancelled already.
    pub fn run_signal(&self) -> RunSignal {
        RunSignal::new(self.run_tx.subscribe())
    }

    /// Take ownership of a new flow and read it on its own task.
    ///
    /// Waits for a free slot when `max_flows` flows are already being read.
    pub async fn handle_new_flow<F: ProxyFlow>(
        &self,
        flow: F,
    ) -> Result<JoinHandle<FlowSummary>, ProviderError> {
        if !self.lifecycle.is_running() {
            return Err(ProviderError::NotRunning(self.lifecycle.name()));
        }

        let permit = self
            .flow_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::NotRunning(self.lifecycle.name()))?;

        debug!("New proxied flow {}", flow.describe());
        let reader = ProxyFlowReader::new(
            flow,
            self.classifier.clone(),
            self.store.clone(),
            self.run_signal(),
        );

        let active = self.active_flows.clone();
        active.fetch_add(1, Ordering::Relaxed);
        self.total_flows.fetch_add(1, Ordering::Relaxed);

        Ok(tokio::spawn(async move {
            let summary = reader.run().await;
            active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
            summary
        }))
    }

    /// Flows currently being read
    pub fn active_flows(&self) -> u64 {
        self.active_flows.load(Ordering::Relaxed)
    }

    /// Flows handled since creation
    pub fn total_flows(&self) -> u64 {
        self.total_flows.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netrack_store::StoreConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    enum Step {
        Event(ReadEvent),
        Error,
    }

    /// Flow that replays a fixed script of reads
    struct ScriptedFlow {
        transport: Transport,
        fail_open: bool,
        script: VecDeque<Step>,
        reads: Arc<AtomicUsize>,
    }

    impl ScriptedFlow {
        fn new(script: Vec<Step>) -> (Self, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let flow = Self {
                transport: Transport::Stream,
                fail_open: false,
                script: script.into(),
                reads: reads.clone(),
            };
            (flow, reads)
        }
    }

    impl ProxyFlow for ScriptedFlow {
        fn transport(&self) -> Transport {
            self.transport
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn open(&mut self) -> io::Result<()> {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(())
        }

        async fn read(&mut self) -> io::Result<ReadEvent> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(Step::Event(event)) => Ok(event),
                Some(Step::Error) => Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
                None => Ok(ReadEvent::Closed),
            }
        }
    }

    /// Flow whose reads never complete
    struct StalledFlow;

    impl ProxyFlow for StalledFlow {
        fn transport(&self) -> Transport {
            Transport::Stream
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }

        async fn open(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn read(&mut self) -> impl Future<Output = io::Result<ReadEvent>> + Send {
            std::future::pending()
        }
    }

    /// Flow that yields an empty read every few milliseconds
    struct TrickleFlow {
        reads: Arc<AtomicUsize>,
    }

    impl ProxyFlow for TrickleFlow {
        fn transport(&self) -> Transport {
            Transport::Stream
        }

        fn describe(&self) -> String {
            "trickle".to_string()
        }

        async fn open(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn read(&mut self) -> io::Result<ReadEvent> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(ReadEvent::Empty)
        }
    }

    const GOOGLE_GET: &str = "GET /search?q=rust HTTP/1.1\r\nHost: www.google.com\r\n\r\n";

    fn chunk(text: &str) -> Step {
        Step::Event(ReadEvent::Chunk(text.as_bytes().to_vec()))
    }

    fn open_store() -> (tempfile::TempDir, RequestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RequestStore::open(StoreConfig::new(dir.path())).unwrap();
        (dir, store)
    }

    /// Drop the table behind the store's back so every append fails
    fn break_store(store: &RequestStore) {
        let conn = rusqlite::Connection::open(store.path()).unwrap();
        conn.execute_batch("DROP TABLE requests").unwrap();
    }

    fn reader<F: ProxyFlow>(flow: F, store: &RequestStore) -> (ProxyFlowReader<F>, watch::Sender<u64>) {
        let (tx, rx) = watch::channel(1);
        let signal = RunSignal::new(rx);
        let reader = ProxyFlowReader::new(flow, Arc::new(FlowClassifier::default()), store.clone(), signal);
        (reader, tx)
    }

    #[tokio::test]
    async fn test_two_chunks_one_record() {
        let (_dir, store) = open_store();
        let (flow, reads) = ScriptedFlow::new(vec![
            chunk("GET /search?q=rust HTTP/1.1\r\nHost: www.google.com\r\n\r\n"),
            Step::Event(ReadEvent::Empty),
            chunk("GET / HTTP/1.1\r\nHost: example.org\r\n\r\n"),
            Step::Event(ReadEvent::Closed),
        ]);

        let (reader, _shutdown) = reader(flow, &store);
        let summary = reader.run().await;

        assert_eq!(
            summary,
            FlowSummary {
                state: FlowState::Closed,
                chunks: 2,
                logged: 1,
            }
        );
        assert_eq!(reads.load(Ordering::SeqCst), 4);

        let records = store.fetch_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].link, "www.google.com");
        assert!(records[0].text.contains("q=rust"));
    }

    #[tokio::test]
    async fn test_open_failure() {
        let (_dir, store) = open_store();
        let (mut flow, reads) = ScriptedFlow::new(vec![chunk("google.com")]);
        flow.fail_open = true;

        let (reader, _shutdown) = reader(flow, &store);
        let summary = reader.run().await;

        assert_eq!(summary.state, FlowState::Failed);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_error_fails_flow() {
        let (_dir, store) = open_store();
        let (flow, reads) = ScriptedFlow::new(vec![
            chunk("google.com"),
            Step::Error,
            chunk("google.com again"),
        ]);

        let (reader, _shutdown) = reader(flow, &store);
        let summary = reader.run().await;

        assert_eq!(summary.state, FlowState::Failed);
        assert_eq!(summary.logged, 1);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_datagrams_are_not_logged() {
        let (_dir, store) = open_store();
        let (mut flow, _reads) = ScriptedFlow::new(vec![chunk("google.com"), chunk("google.com")]);
        flow.transport = Transport::Datagram;

        let (reader, _shutdown) = reader(flow, &store);
        let summary = reader.run().await;

        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.logged, 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_utf8_chunk_is_ignored() {
        let (_dir, store) = open_store();
        let mut bytes = b"google.com ".to_vec();
        bytes.push(0xff);
        let (flow, _reads) = ScriptedFlow::new(vec![
            Step::Event(ReadEvent::Chunk(bytes)),
            chunk("google.com"),
        ]);

        let (reader, _shutdown) = reader(flow, &store);
        let summary = reader.run().await;

        assert_eq!(summary.state, FlowState::Closed);
        assert_eq!(summary.logged, 1);
    }

    #[tokio::test]
    async fn test_provider_rejects_flows_before_start() {
        let (_dir, store) = open_store();
        let provider = ProxyProvider::new(ProxyProviderConfig::default(), FlowClassifier::default(), store);
        let (flow, _reads) = ScriptedFlow::new(vec![]);

        assert!(matches!(
            provider.handle_new_flow(flow).await,
            Err(ProviderError::NotRunning("proxy"))
        ));
    }

    #[tokio::test]
    async fn test_provider_runs_flow_to_completion() {
        let (_dir, store) = open_store();
        let provider = ProxyProvider::new(ProxyProviderConfig::default(), FlowClassifier::default(), store.clone());
        provider.start(|result| assert!(result.is_ok()));

        let (flow, _reads) = ScriptedFlow::new(vec![chunk("GET / HTTP/1.1\r\nHost: google.com\r\n\r\n")]);
        let handle = provider.handle_new_flow(flow).await.unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.state, FlowState::Closed);
        assert_eq!(summary.logged, 1);
        assert_eq!(provider.active_flows(), 0);
        assert_eq!(provider.total_flows(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reads() {
        let (_dir, store) = open_store();
        let provider = ProxyProvider::new(ProxyProviderConfig::default(), FlowClassifier::default(), store);
        provider.start(|result| assert!(result.is_ok()));

        let handle = provider.handle_new_flow(StalledFlow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(provider.active_flows(), 1);

        provider.stop(|| {});
        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.state, FlowState::Closed);
        assert_eq!(provider.state(), ProviderState::Stopped);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_reading() {
        let (_dir, store) = open_store();
        break_store(&store);

        let (flow, reads) = ScriptedFlow::new(vec![
            chunk(GOOGLE_GET),
            chunk(GOOGLE_GET),
            Step::Event(ReadEvent::Closed),
        ]);

        let (reader, _shutdown) = reader(flow, &store);
        let summary = reader.run().await;

        assert_eq!(
            summary,
            FlowSummary {
                state: FlowState::Closed,
                chunks: 2,
                logged: 0,
            }
        );
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_signal_generations() {
        let (tx, rx) = watch::channel(0);
        assert!(RunSignal::new(rx.clone()).is_cancelled());

        tx.send_replace(1);
        let mut signal = RunSignal::new(rx.clone());
        assert_eq!(signal.generation(), 1);
        assert!(!signal.is_cancelled());

        // Stop then start: the old run stays over
        tx.send_replace(2);
        tx.send_replace(3);
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
        assert!(!RunSignal::new(rx.clone()).is_cancelled());

        // Provider gone
        let live = RunSignal::new(rx);
        drop(tx);
        assert!(live.is_cancelled());
    }

    #[tokio::test]
    async fn test_restart_does_not_revive_old_flows() {
        let (_dir, store) = open_store();
        let provider = ProxyProvider::new(ProxyProviderConfig::default(), FlowClassifier::default(), store.clone());
        provider.start(|result| assert!(result.is_ok()));

        let reads = Arc::new(AtomicUsize::new(0));
        let handle = provider
            .handle_new_flow(TrickleFlow { reads: reads.clone() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        provider.stop(|| {});
        provider.start(|result| assert!(result.is_ok()));
        assert!(provider.state().is_running());

        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.state, FlowState::Closed);

        let reads_at_close = reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reads.load(Ordering::SeqCst), reads_at_close);
        assert_eq!(provider.active_flows(), 0);

        // Flows of the new run are read as usual
        let (flow, _reads) = ScriptedFlow::new(vec![chunk(GOOGLE_GET)]);
        let summary = provider.handle_new_flow(flow).await.unwrap().await.unwrap();
        assert_eq!(summary.state, FlowState::Closed);
        assert_eq!(summary.logged, 1);
        assert_eq!(store.count().unwrap(), 1);
    }
}
