//! Dictionary Trainer (spec §4.6): samples eligible payloads into a
//! spill-to-disk collector and triggers background training at the low
//! and (repeatedly) high watermark.

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::BroadcasterConfig;
use crate::error::SessionResult;

/// Appends `length:u32 BE || payload` records to a tempfile and tracks
/// total bytes accumulated.
pub struct Collector {
    file: tokio::fs::File,
    bytes_accumulated: u64,
    dirty: bool,
}

impl Collector {
    pub async fn new(spool_dir: Option<&std::path::Path>) -> SessionResult<Self> {
        let builder = tempfile::Builder::new().prefix("broadcaster-collector-");
        let named = match spool_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }?;
        let (std_file, path) = named.keep().map_err(|e| e.error)?;
        drop(std_file);
        let file = tokio::fs::File::options().read(true).write(true).open(&path).await?;
        Ok(Self { file, bytes_accumulated: 0, dirty: false })
    }

    pub async fn feed(&mut self, payload: &[u8]) -> SessionResult<()> {
        let len = payload.len() as u32;
        self.file.write_all(&len.to_be_bytes()).await?;
        self.file.write_all(payload).await?;
        self.bytes_accumulated += payload.len() as u64;
        self.dirty = true;
        Ok(())
    }

    pub fn bytes_accumulated(&self) -> u64 {
        self.bytes_accumulated
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Reads every sample back out, in the order they were fed.
    pub async fn read_samples(&mut self) -> SessionResult<Vec<Vec<u8>>> {
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        let mut samples = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match self.file.read_exact(&mut len_buf).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            self.file.read_exact(&mut payload).await?;
            samples.push(payload);
        }
        Ok(samples)
    }
}

/// Whether a payload of this length is eligible for sampling
/// (spec §4.6: `compression_min_size ≤ length ≤ compression_trained_max_size`).
pub fn is_eligible(len: usize, config: &BroadcasterConfig) -> bool {
    let len = len as u32;
    len >= config.compression_min_size && len <= config.compression_trained_max_size
}

/// Trainer state machine (spec §4.6).
pub enum TrainerState {
    BeforeLowWatermark { collector: Collector },
    BeforeHighWatermark { collector: Collector },
    WaitingToRefresh { last_refreshed_at: Instant },
}

impl TrainerState {
    pub async fn new(spool_dir: Option<&std::path::Path>) -> SessionResult<Self> {
        Ok(TrainerState::BeforeLowWatermark { collector: Collector::new(spool_dir).await? })
    }

    pub fn feed(&mut self) -> Option<&mut Collector> {
        match self {
            TrainerState::BeforeLowWatermark { collector } | TrainerState::BeforeHighWatermark { collector } => {
                Some(collector)
            }
            TrainerState::WaitingToRefresh { .. } => None,
        }
    }

    /// Re-evaluates watermarks after a feed marked the active collector
    /// dirty. Returns the samples to hand to the training provider if a
    /// watermark fired, along with which watermark it was.
    pub async fn poll_watermark(
        &mut self,
        config: &BroadcasterConfig,
        spool_dir: Option<&std::path::Path>,
    ) -> SessionResult<Option<(WatermarkKind, Vec<Vec<u8>>)>> {
        match self {
            TrainerState::BeforeLowWatermark { collector } => {
                if !collector.take_dirty() {
                    return Ok(None);
                }
                let accumulated = collector.bytes_accumulated();
                if accumulated >= config.compression_training_high_watermark {
                    let samples = collector.read_samples().await?;
                    *self = TrainerState::BeforeHighWatermark { collector: Collector::new(spool_dir).await? };
                    return Ok(Some((WatermarkKind::Low, samples)));
                }
                if accumulated >= config.compression_training_low_watermark {
                    let samples = collector.read_samples().await?;
                    *self = TrainerState::BeforeHighWatermark { collector: Collector::new(spool_dir).await? };
                    return Ok(Some((WatermarkKind::Low, samples)));
                }
                Ok(None)
            }
            TrainerState::BeforeHighWatermark { collector } => {
                if !collector.take_dirty() {
                    return Ok(None);
                }
                if collector.bytes_accumulated() >= config.compression_training_high_watermark {
                    let samples = collector.read_samples().await?;
                    *self = TrainerState::WaitingToRefresh { last_refreshed_at: Instant::now() };
                    return Ok(Some((WatermarkKind::High, samples)));
                }
                Ok(None)
            }
            TrainerState::WaitingToRefresh { .. } => Ok(None),
        }
    }

    /// Transitions `WaitingToRefresh` back to `BeforeHighWatermark` once
    /// the retrain interval has elapsed, starting a fresh collector.
    pub async fn maybe_refresh(&mut self, config: &BroadcasterConfig, spool_dir: Option<&std::path::Path>) -> SessionResult<()> {
        if let TrainerState::WaitingToRefresh { last_refreshed_at } = self {
            let interval = Duration::from_secs_f64(config.compression_retrain_interval_seconds.max(0.0));
            if last_refreshed_at.elapsed() >= interval {
                *self = TrainerState::BeforeHighWatermark { collector: Collector::new(spool_dir).await? };
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Low,
    High,
}
