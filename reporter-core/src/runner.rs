//! Ingestion pipeline
//!
//! The runner scans the chain once and dispatches every block to its
//! recorders, sequentially and in registration order. A slow recorder
//! therefore holds back the scanner and every recorder after it.
//!
//! # Resume heights
//!
//! Each recorder reports the first height it still needs
//! ([`Recorder::next_height`], `None` counting as 0). The scan starts at the
//! lowest of these unless a start height is forced, and a recorder never
//! sees a block below its own watermark, so restarting never applies a
//! settled block twice.

use crate::{recorder::Recorder, scanner::ChainScanner, types::Block, Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// First scanned height
    pub start_height: u64,
    /// Blocks dispatched
    pub blocks: u64,
    /// Height of the last dispatched block
    pub last_height: Option<u64>,
}

/// Scanner plus the recorders it feeds
pub struct Runner {
    scanner: ChainScanner,
    recorders: Vec<Arc<dyn Recorder>>,
    start_height: Option<u64>,
    cancel: CancellationToken,
}

impl Runner {
    /// Create runner around `scanner`
    pub fn new(scanner: ChainScanner) -> Self {
        Self {
            scanner,
            recorders: Vec::new(),
            start_height: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Append a recorder; recorders receive blocks in the order added
    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    /// Force the first scanned height
    pub fn with_start_height(mut self, height: Option<u64>) -> Self {
        self.start_height = height;
        self
    }

    /// Token stopping the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the run. The block being dispatched is finished first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Scan and dispatch until stopped or until the first error.
    ///
    /// A stop returns `Ok`. Every recorder is closed before returning.
    pub async fn run(&self) -> Result<RunSummary> {
        let result = match self.watermarks().await {
            Ok(watermarks) => self.ingest(&watermarks).await,
            Err(e) => Err(e),
        };

        for recorder in &self.recorders {
            if let Err(e) = recorder.close().await {
                tracing::error!(recorder = recorder.name(), error = %e, "Failed to close recorder");
            }
        }

        match &result {
            Ok(summary) => tracing::info!(
                blocks = summary.blocks,
                last_height = ?summary.last_height,
                "Ingestion stopped"
            ),
            Err(e) => tracing::error!(error = %e, "Ingestion halted"),
        }

        result
    }

    async fn watermarks(&self) -> Result<Vec<u64>> {
        let mut watermarks = Vec::with_capacity(self.recorders.len());
        for recorder in &self.recorders {
            let next = recorder.next_height().await?.unwrap_or(0);
            tracing::info!(recorder = recorder.name(), next_height = next, "Recorder resume height");
            watermarks.push(next);
        }
        Ok(watermarks)
    }

    async fn ingest(&self, watermarks: &[u64]) -> Result<RunSummary> {
        let start_height = self
            .start_height
            .or_else(|| watermarks.iter().copied().min())
            .unwrap_or(0);

        let mut summary = RunSummary {
            start_height,
            ..Default::default()
        };

        tracing::info!(height = start_height, recorders = self.recorders.len(), "Starting scan");

        let mut blocks = self.scanner.scan(start_height, self.cancel.clone());

        while let Some(block) = blocks.next().await {
            // A stop takes effect before the next block, never inside one
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.dispatch(&block, watermarks).await {
                // Terminal scanner state is irrelevant once a recorder failed
                let _ = blocks.finish().await;
                return Err(e);
            }

            summary.blocks += 1;
            summary.last_height = Some(block.height);
        }

        match blocks.finish().await {
            Error::Cancelled => Ok(summary),
            e => Err(e),
        }
    }

    async fn dispatch(&self, block: &Block, watermarks: &[u64]) -> Result<()> {
        for (recorder, watermark) in self.recorders.iter().zip(watermarks) {
            if block.height < *watermark {
                tracing::trace!(
                    recorder = recorder.name(),
                    height = block.height,
                    "Skipping settled block"
                );
                continue;
            }

            if let Err(e) = recorder.record(block).await {
                tracing::error!(
                    recorder = recorder.name(),
                    height = block.height,
                    error = %e,
                    "Recorder failed"
                );
                return Err(e);
            }
        }

        tracing::debug!(height = block.height, "Block dispatched");
        Ok(())
    }
}
