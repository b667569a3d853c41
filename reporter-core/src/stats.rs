//! Transaction statistics exporter
//!
//! [`StatsRecorder`] turns every transaction into a [`TransactionPoint`]
//! and buffers the points until one of three triggers flushes them to a
//! [`StatsSink`]:
//!
//! - the buffer reaches `batch_size` points
//! - the periodic flusher fires (every `flush_interval`)
//! - the recorder is closed
//!
//! The buffer has its own lock and never touches the balance ledger.

use crate::{
    recorder::Recorder,
    types::{Amount, Block, Transaction},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref PERIOD_PATTERN: Regex = Regex::new(r"^(\d+)(\w{1,2})$").unwrap();
}

/// Look-back period unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodUnit {
    /// `u`
    Micros,
    /// `ms`
    Millis,
    /// `s`
    Seconds,
    /// `m`
    Minutes,
    /// `h`
    Hours,
    /// `d`
    Days,
    /// `w`
    Weeks,
}

impl PeriodUnit {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "u" => Some(Self::Micros),
            "ms" => Some(Self::Millis),
            "s" => Some(Self::Seconds),
            "m" => Some(Self::Minutes),
            "h" => Some(Self::Hours),
            "d" => Some(Self::Days),
            "w" => Some(Self::Weeks),
            _ => None,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::Micros => "u",
            Self::Millis => "ms",
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
            Self::Days => "d",
            Self::Weeks => "w",
        }
    }

    fn micros(&self) -> i64 {
        match self {
            Self::Micros => 1,
            Self::Millis => 1_000,
            Self::Seconds => 1_000_000,
            Self::Minutes => 60 * 1_000_000,
            Self::Hours => 3_600 * 1_000_000,
            Self::Days => 86_400 * 1_000_000,
            Self::Weeks => 7 * 86_400 * 1_000_000,
        }
    }
}

/// Look-back period, written `<number><suffix>` (e.g. `1h`, `4w`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    count: u64,
    unit: PeriodUnit,
}

/// Last hour
pub const LAST_HOUR: Period = Period::new(1, PeriodUnit::Hours);
/// Last day
pub const LAST_DAY: Period = Period::new(1, PeriodUnit::Days);
/// Last week
pub const LAST_WEEK: Period = Period::new(1, PeriodUnit::Weeks);
/// Last month (four weeks)
pub const LAST_MONTH: Period = Period::new(4, PeriodUnit::Weeks);

impl Period {
    /// Create period of `count` units
    pub const fn new(count: u64, unit: PeriodUnit) -> Self {
        Self { count, unit }
    }

    /// Length of the period, `None` if it does not fit a duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        let micros = i64::try_from(self.count)
            .ok()?
            .checked_mul(self.unit.micros())?;
        Some(chrono::Duration::microseconds(micros))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let captures = PERIOD_PATTERN.captures(s).ok_or_else(|| {
            Error::InvalidPeriod("invalid period format, expecting <number><suffix>".to_string())
        })?;

        let unit = PeriodUnit::from_suffix(&captures[2]).ok_or_else(|| {
            Error::InvalidPeriod(
                "invalid period suffix, where suffix is one of (u, ms, s, m, h, d, w)".to_string(),
            )
        })?;
        let count = captures[1]
            .parse()
            .map_err(|_| Error::InvalidPeriod(format!("period '{}' out of range", s)))?;

        let period = Period::new(count, unit);
        if period.duration().is_none() {
            return Err(Error::InvalidPeriod(format!("period '{}' out of range", s)));
        }
        Ok(period)
    }
}

/// Aggregated values of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPoint {
    /// Height of the containing block
    pub height: u64,
    /// Block time
    pub timestamp: DateTime<Utc>,
    /// Sum of spent input values
    pub input: Decimal,
    /// Sum of created output values
    pub output: Decimal,
    /// Sum of miner fees
    pub fees: Decimal,
    /// Number of coin inputs
    pub input_addresses: usize,
    /// Number of coin outputs
    pub output_addresses: usize,
}

fn sum<'a>(mut values: impl Iterator<Item = &'a Amount>) -> Result<Decimal> {
    values.try_fold(Decimal::ZERO, |total, amount| {
        let value = amount.parse()?;
        total.checked_add(value).ok_or_else(|| Error::ValueParse {
            value: amount.to_string(),
            reason: "sum out of range".to_string(),
        })
    })
}

/// Aggregate one transaction of `block`
pub fn aggregate(block: &Block, tx: &Transaction) -> Result<TransactionPoint> {
    Ok(TransactionPoint {
        height: block.height,
        timestamp: block.time(),
        input: sum(tx.coin_inputs.iter().map(|o| &o.value))?,
        output: sum(tx.coin_outputs.iter().map(|o| &o.value))?,
        fees: sum(tx.miner_fees.iter())?,
        input_addresses: tx.coin_inputs.len(),
        output_addresses: tx.coin_outputs.len(),
    })
}

/// Points for every transaction of `block`, in block order
pub fn points(block: &Block) -> Result<Vec<TransactionPoint>> {
    block
        .transactions
        .iter()
        .map(|tx| aggregate(block, tx))
        .collect()
}

/// Destination of flushed points
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Persist a batch of points
    async fn write(&self, points: &[TransactionPoint]) -> Result<()>;

    /// Highest height written so far
    async fn last_height(&self) -> Result<Option<u64>>;
}

/// In-memory sink with look-back queries
#[derive(Default)]
pub struct MemorySink {
    points: parking_lot::RwLock<Vec<TransactionPoint>>,
}

impl MemorySink {
    /// Create empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All written points
    pub fn points(&self) -> Vec<TransactionPoint> {
        self.points.read().clone()
    }

    /// Sum of inputs of transactions no older than `period` before `now`
    pub fn transacted(&self, period: Period, now: DateTime<Utc>) -> Result<Decimal> {
        let span = period
            .duration()
            .ok_or_else(|| Error::InvalidPeriod(format!("period '{}' out of range", period)))?;
        let since = now.checked_sub_signed(span);

        let points = self.points.read();
        sum_inputs(
            points
                .iter()
                .filter(|p| since.map_or(true, |since| p.timestamp >= since)),
        )
    }
}

fn sum_inputs<'a>(mut points: impl Iterator<Item = &'a TransactionPoint>) -> Result<Decimal> {
    points.try_fold(Decimal::ZERO, |total, point| {
        total.checked_add(point.input).ok_or_else(|| Error::Overflow {
            address: "transacted".to_string(),
        })
    })
}

#[async_trait]
impl StatsSink for MemorySink {
    async fn write(&self, points: &[TransactionPoint]) -> Result<()> {
        self.points.write().extend_from_slice(points);
        Ok(())
    }

    async fn last_height(&self) -> Result<Option<u64>> {
        Ok(self.points.read().iter().map(|p| p.height).max())
    }
}

/// Sink appending points as JSON lines.
///
/// A failed write truncates the file back to its length before the
/// batch, so a retried batch is never duplicated. A torn last line left
/// by a crash is dropped on [`open`](Self::open).
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    last_height: parking_lot::Mutex<Option<u64>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if missing
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let complete = contents.rfind('\n').map_or(0, |i| i + 1);
        let last_height = last_height_in(&contents[..complete])?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if complete < contents.len() {
            tracing::warn!(
                path = %path.display(),
                dropped = contents.len() - complete,
                "Dropping incomplete trailing stats line"
            );
            file.set_len(complete as u64).await?;
        }

        tracing::info!(path = %path.display(), ?last_height, "Writing transaction stats");

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            last_height: parking_lot::Mutex::new(last_height),
        })
    }

    /// Output file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn append(file: &mut tokio::fs::File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await
}

fn last_height_in(contents: &str) -> Result<Option<u64>> {
    let mut last = None;
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let point: TransactionPoint = serde_json::from_str(line)?;
        last = last.max(Some(point.height));
    }
    Ok(last)
}

#[async_trait]
impl StatsSink for JsonLinesSink {
    async fn write(&self, points: &[TransactionPoint]) -> Result<()> {
        let mut buf = Vec::new();
        for point in points {
            serde_json::to_writer(&mut buf, point)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        let start = file.metadata().await?.len();
        if let Err(e) = append(&mut file, &buf).await {
            if let Err(rollback) = file.set_len(start).await {
                tracing::error!(error = %rollback, "Failed to truncate partial stats write");
            }
            return Err(e.into());
        }

        if let Some(height) = points.iter().map(|p| p.height).max() {
            let mut last = self.last_height.lock();
            *last = (*last).max(Some(height));
        }

        Ok(())
    }

    async fn last_height(&self) -> Result<Option<u64>> {
        Ok(*self.last_height.lock())
    }
}

/// Buffering [`Recorder`] writing transaction points to a [`StatsSink`]
pub struct StatsRecorder {
    sink: Arc<dyn StatsSink>,
    batch_size: usize,
    buffer: parking_lot::Mutex<Vec<TransactionPoint>>,
    /// Serializes flushes so batches reach the sink in order
    flushing: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl StatsRecorder {
    /// Create recorder without a periodic flusher
    pub fn new(sink: Arc<dyn StatsSink>, batch_size: usize) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            buffer: parking_lot::Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Create recorder and start a flusher firing every `flush_interval`.
    ///
    /// The flusher stops on [`close`](Recorder::close) or once the recorder
    /// is dropped.
    pub fn spawn(sink: Arc<dyn StatsSink>, batch_size: usize, flush_interval: Duration) -> Arc<Self> {
        let recorder = Arc::new(Self::new(sink, batch_size));
        let weak = Arc::downgrade(&recorder);
        let cancel = recorder.cancel.clone();
        tokio::spawn(run_flusher(weak, cancel, flush_interval));
        recorder
    }

    /// Points waiting for a flush
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Write buffered points to the sink, returning how many were written.
    ///
    /// On failure the points stay buffered for the next attempt.
    pub async fn flush(&self) -> Result<usize> {
        let _flushing = self.flushing.lock().await;

        let points = std::mem::take(&mut *self.buffer.lock());
        if points.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.sink.write(&points).await {
            let mut buffer = self.buffer.lock();
            let newer = std::mem::replace(&mut *buffer, points);
            buffer.extend(newer);
            return Err(e);
        }

        tracing::debug!(points = points.len(), "Flushed transaction stats");
        Ok(points.len())
    }
}

async fn run_flusher(weak: Weak<StatsRecorder>, cancel: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(recorder) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = recorder.flush().await {
                    tracing::warn!(error = %e, "Timed stats flush failed");
                }
            }
        }
    }
}

#[async_trait]
impl Recorder for StatsRecorder {
    fn name(&self) -> &str {
        "stats"
    }

    async fn record(&self, block: &Block) -> Result<()> {
        let points = points(block)?;
        if points.is_empty() {
            return Ok(());
        }

        let full = {
            let mut buffer = self.buffer.lock();
            buffer.extend(points);
            buffer.len() >= self.batch_size
        };

        if full {
            self.flush().await?;
        }
        Ok(())
    }

    async fn next_height(&self) -> Result<Option<u64>> {
        Ok(self.sink.last_height().await?.map(|h| h + 1))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.flush().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Output;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn block(height: u64, timestamp: i64, transactions: usize) -> Block {
        let mut block = Block::new(height, timestamp);
        for _ in 0..transactions {
            block.transactions.push(Transaction {
                coin_inputs: vec![Output::to_address("40", "x")],
                coin_outputs: vec![Output::to_address("30", "y"), Output::to_address("9", "x")],
                miner_fees: vec![Amount::new("1")],
                ..Default::default()
            });
        }
        block
    }

    struct FailingSink;

    #[async_trait]
    impl StatsSink for FailingSink {
        async fn write(&self, _points: &[TransactionPoint]) -> Result<()> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sink down",
            )))
        }

        async fn last_height(&self) -> Result<Option<u64>> {
            Ok(None)
        }
    }

    #[test]
    fn test_period_parse() {
        assert_eq!("1h".parse::<Period>().unwrap(), LAST_HOUR);
        assert_eq!("4w".parse::<Period>().unwrap(), LAST_MONTH);
        assert_eq!("250ms".parse::<Period>().unwrap().to_string(), "250ms");
        assert_eq!(
            LAST_DAY.duration(),
            Some(chrono::Duration::hours(24))
        );

        let format = "h".parse::<Period>().unwrap_err().to_string();
        assert!(format.contains("expecting <number><suffix>"));
        let suffix = "3y".parse::<Period>().unwrap_err().to_string();
        assert!(suffix.contains("invalid period suffix"));
        assert!("99999999999999999w".parse::<Period>().is_err());
    }

    #[test]
    fn test_aggregate() {
        let block = block(7, 1_500_000_000, 1);
        let point = aggregate(&block, &block.transactions[0]).unwrap();
        assert_eq!(point.height, 7);
        assert_eq!(point.input, dec!(40));
        assert_eq!(point.output, dec!(39));
        assert_eq!(point.fees, dec!(1));
        assert_eq!(point.input_addresses, 1);
        assert_eq!(point.output_addresses, 2);
        assert_eq!(point.timestamp, Utc.timestamp_opt(1_500_000_000, 0).unwrap());
    }

    #[tokio::test]
    async fn test_memory_sink_queries() {
        let sink = MemorySink::new();
        let now = Utc.timestamp_opt(10 * 86_400, 0).unwrap();
        let old = points(&block(1, 0, 1)).unwrap();
        let recent = points(&block(2, 10 * 86_400 - 60, 2)).unwrap();
        sink.write(&old).await.unwrap();
        sink.write(&recent).await.unwrap();

        assert_eq!(sink.last_height().await.unwrap(), Some(2));
        assert_eq!(sink.transacted(LAST_HOUR, now).unwrap(), dec!(80));
        assert_eq!(sink.transacted(LAST_MONTH, now).unwrap(), dec!(120));
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let sink = Arc::new(MemorySink::new());
        let recorder = StatsRecorder::new(sink.clone(), 3);

        recorder.record(&block(0, 0, 2)).await.unwrap();
        assert_eq!(recorder.buffered(), 2);
        assert!(sink.points().is_empty());

        recorder.record(&block(1, 0, 1)).await.unwrap();
        assert_eq!(recorder.buffered(), 0);
        assert_eq!(sink.points().len(), 3);
        assert_eq!(recorder.next_height().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_close_flushes() {
        let sink = Arc::new(MemorySink::new());
        let recorder = StatsRecorder::new(sink.clone(), 100);

        recorder.record(&block(0, 0, 1)).await.unwrap();
        recorder.record(&block(1, 0, 0)).await.unwrap();
        recorder.close().await.unwrap();

        assert_eq!(sink.points().len(), 1);
        assert_eq!(recorder.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let sink = Arc::new(MemorySink::new());
        let recorder = StatsRecorder::spawn(sink.clone(), 100, Duration::from_secs(10));

        recorder.record(&block(0, 0, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.points().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.points().len(), 1);

        recorder.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_points() {
        let recorder = StatsRecorder::new(Arc::new(FailingSink), 1);

        assert!(recorder.record(&block(0, 0, 2)).await.is_err());
        assert_eq!(recorder.buffered(), 2);
        assert!(recorder.flush().await.is_err());
        assert_eq!(recorder.buffered(), 2);
    }

    #[tokio::test]
    async fn test_json_lines_sink_resumes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats").join("transactions.jsonl");

        {
            let sink = JsonLinesSink::open(&path).await.unwrap();
            assert_eq!(sink.last_height().await.unwrap(), None);
            sink.write(&points(&block(4, 0, 2)).unwrap()).await.unwrap();
            sink.write(&points(&block(9, 0, 1)).unwrap()).await.unwrap();
            assert_eq!(sink.last_height().await.unwrap(), Some(9));
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let sink = JsonLinesSink::open(&path).await.unwrap();
        assert_eq!(sink.last_height().await.unwrap(), Some(9));
        let recorder = StatsRecorder::new(Arc::new(sink), 10);
        assert_eq!(recorder.next_height().await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_json_lines_sink_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transactions.jsonl");

        {
            let sink = JsonLinesSink::open(&path).await.unwrap();
            sink.write(&points(&block(4, 0, 1)).unwrap()).await.unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.clone();
        contents.push_str(&line[..line.len() / 2]);
        std::fs::write(&path, &contents).unwrap();

        let sink = JsonLinesSink::open(&path).await.unwrap();
        assert_eq!(sink.last_height().await.unwrap(), Some(4));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), line);

        sink.write(&points(&block(5, 0, 1)).unwrap()).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let heights: Vec<u64> = contents
            .lines()
            .map(|l| serde_json::from_str::<TransactionPoint>(l).unwrap().height)
            .collect();
        assert_eq!(heights, vec![4, 5]);
    }
}
