//! Chain scanner
//!
//! Turns an [`ExplorerClient`] into an ordered, lazy, cancellable stream of
//! blocks starting at a given height.
//!
//! ```text
//!            ┌──────────────── ok ─────────────────┐
//!            ▼                                     │
//!   ┌─────────────────┐  block   ┌──────────┐  accepted
//!   │ Fetching(h)     │────────▶│ Emitting │──────────▶ Fetching(h+1)
//!   └─────────────────┘          └──────────┘
//!     │          ▲                    │
//!     │ not yet  │ wait elapsed       │ cancelled / receiver gone
//!     ▼          │                    ▼
//!   ┌─────────────────┐          ┌────────────┐
//!   │ Backoff(h)      │────────▶│ Terminated │◀── any other error
//!   └─────────────────┘ cancelled└────────────┘
//! ```
//!
//! The producer runs on its own task and hands blocks over a channel of
//! capacity one, so it never runs more than a block ahead of its consumer.
//! The terminal error is read once, after the stream is exhausted, through
//! [`BlockStream::finish`].

use crate::{explorer::ExplorerClient, metrics::Metrics, types::Block, Error, Result};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Default wait before retrying a height that is not produced yet
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// Suspension used between retries
#[async_trait]
pub trait Timer: Send + Sync {
    /// Complete after `duration`
    async fn sleep(&self, duration: Duration);
}

/// Timer backed by the tokio clock
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Scanner state
#[derive(Debug)]
pub enum ScanState {
    /// Requesting `height`; `attempt` counts previous not-yet-produced answers
    Fetching {
        /// Height being requested
        height: u64,
        /// Consecutive not-yet-produced answers for this height
        attempt: u32,
    },
    /// Waiting for the consumer to accept a block
    Emitting(Block),
    /// Waiting before asking for `height` again
    Backoff {
        /// Height to retry
        height: u64,
        /// Consecutive not-yet-produced answers for this height
        attempt: u32,
    },
    /// Scan finished with this error
    Terminated(Error),
}

/// Block scanner over an explorer
pub struct ChainScanner {
    explorer: Arc<dyn ExplorerClient>,
    timer: Arc<dyn Timer>,
    backoff: Duration,
    metrics: Option<Metrics>,
}

impl ChainScanner {
    /// Create scanner with the default backoff and the tokio timer
    pub fn new(explorer: Arc<dyn ExplorerClient>) -> Self {
        Self {
            explorer,
            timer: Arc::new(TokioTimer),
            backoff: DEFAULT_BACKOFF,
            metrics: None,
        }
    }

    /// Set the wait between retries of a not-yet-produced height
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the timer
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start scanning at `start`. The scan stops when `cancel` fires.
    pub fn scan(&self, start: u64, cancel: CancellationToken) -> BlockStream {
        let (tx, rx) = mpsc::channel(1);
        let cancel = cancel.child_token();

        let machine = ScanMachine {
            explorer: self.explorer.clone(),
            timer: self.timer.clone(),
            backoff: self.backoff,
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
            tx,
        };

        let task = tokio::spawn(machine.run(start));

        BlockStream {
            blocks: ReceiverStream::new(rx),
            task: Some(task),
            cancel,
        }
    }
}

struct ScanMachine {
    explorer: Arc<dyn ExplorerClient>,
    timer: Arc<dyn Timer>,
    backoff: Duration,
    metrics: Option<Metrics>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Block>,
}

impl ScanMachine {
    async fn run(self, start: u64) -> Error {
        tracing::info!(height = start, "Scanning block chain");

        let mut state = ScanState::Fetching {
            height: start,
            attempt: 0,
        };
        loop {
            state = match state {
                ScanState::Terminated(err) => {
                    if err.is_cancelled() {
                        tracing::info!("Scan cancelled");
                    } else {
                        tracing::error!(error = %err, "Scan terminated");
                    }
                    return err;
                }
                state => self.step(state).await,
            };
        }
    }

    async fn step(&self, state: ScanState) -> ScanState {
        match state {
            ScanState::Fetching { height, attempt } => self.fetch(height, attempt).await,
            ScanState::Emitting(block) => self.emit(block).await,
            ScanState::Backoff { height, attempt } => self.wait(height, attempt).await,
            terminated @ ScanState::Terminated(_) => terminated,
        }
    }

    async fn fetch(&self, height: u64, attempt: u32) -> ScanState {
        let result: Result<Block> = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.explorer.get_block(height) => result,
        };

        match result {
            Ok(block) if block.height != height => ScanState::Terminated(Error::UnexpectedHeight {
                expected: height,
                actual: block.height,
            }),
            Ok(block) => ScanState::Emitting(block),
            Err(err) if err.is_not_yet_produced() => ScanState::Backoff {
                height,
                attempt: attempt + 1,
            },
            Err(err) => ScanState::Terminated(err),
        }
    }

    async fn emit(&self, block: Block) -> ScanState {
        let height = block.height;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ScanState::Terminated(Error::Cancelled),
            sent = self.tx.send(block) => match sent {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_block_scanned(height);
                    }
                    tracing::debug!(height, "Block emitted");
                    ScanState::Fetching { height: height + 1, attempt: 0 }
                }
                // Nobody is listening anymore
                Err(_) => ScanState::Terminated(Error::Cancelled),
            },
        }
    }

    async fn wait(&self, height: u64, attempt: u32) -> ScanState {
        if let Some(metrics) = &self.metrics {
            metrics.record_backoff();
        }
        tracing::debug!(
            height,
            attempt,
            backoff_secs = self.backoff.as_secs(),
            "Block not produced yet, backing off"
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ScanState::Terminated(Error::Cancelled),
            _ = self.timer.sleep(self.backoff) => ScanState::Fetching { height, attempt },
        }
    }
}

/// Ordered stream of scanned blocks
pub struct BlockStream {
    blocks: ReceiverStream<Block>,
    task: Option<JoinHandle<Error>>,
    cancel: CancellationToken,
}

impl BlockStream {
    /// Stop the producer without waiting for the stream to drain
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Terminal error of the scan.
    ///
    /// Stops the producer if it is still running, then waits for it.
    /// [`Error::Cancelled`] means the scan was stopped on purpose.
    pub async fn finish(mut self) -> Error {
        self.cancel.cancel();
        self.blocks.close();

        match self.task.take() {
            Some(task) => match task.await {
                Ok(err) => err,
                Err(e) => Error::Concurrency(format!("Scanner task failed: {}", e)),
            },
            None => Error::Concurrency("Scanner already finished".to_string()),
        }
    }
}

impl Stream for BlockStream {
    type Item = Block;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Block>> {
        Pin::new(&mut self.blocks).poll_next(cx)
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
