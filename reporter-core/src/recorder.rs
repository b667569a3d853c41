//! Block consumers driven by the [`Runner`](crate::runner::Runner)

use crate::{types::Block, Result};
use async_trait::async_trait;

/// Consumer of the scanned block sequence.
///
/// Blocks arrive one at a time in strictly increasing height order. An
/// error from [`record`](Recorder::record) halts ingestion.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Consume one block
    async fn record(&self, block: &Block) -> Result<()>;

    /// First height this recorder still needs, `None` when it has no
    /// persisted progress
    async fn next_height(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Flush and release resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
