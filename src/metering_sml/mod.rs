use crate::storage::StorageError;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod structs;
pub mod parser;
pub mod reader;
pub mod utils;
pub mod meter_definitions;

use structs::*;
use parser::ObisExtractor;
use reader::{FrameError, FrameReader};

/// Accepted telegrams between two statistics log lines
const STATS_INTERVAL: u64 = 100;

#[derive(Error, Debug, PartialEq)]
pub enum SmlError {
    #[error("Telegram too short ({0} bytes)")]
    TelegramTooShort(usize),
    #[error("CRC mismatch: calculated 0x{calculated:04X}, transmitted 0x{transmitted:04X}")]
    ChecksumMismatch { calculated: u16, transmitted: u16 },
    #[error("Invalid hex field '{0}'")]
    InvalidHex(String),
    #[error("Unsupported field width of {0} hex digits")]
    InvalidFieldWidth(usize),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("MQTT queue is full")]
    QueueFull,
    #[error("MQTT manager is gone")]
    Disconnected,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Receives every decoded measurement set, e.g. MQTT or the local stores.
///
/// Implementations must not block: the next telegram is only read once
/// every sink had its turn.
pub trait MeasurementSink: Send {
    fn name(&self) -> &str;
    fn deliver(&mut self, set: &MeasurementSet) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub telegrams_read: u64,
    pub accepted: u64,
    pub checksum_errors: u64,
    pub transport_errors: u64,
    pub sink_errors: u64,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Measured(MeasurementSet),
    ChecksumMismatch,
    TransportTransient,
    Closed,
}

pub struct SmlManager<'a> {
    extractor: ObisExtractor<'a>,
    sinks: Vec<Box<dyn MeasurementSink>>,
    stats: PipelineStats,
}

impl<'a> SmlManager<'a> {
    pub fn new(extractor: ObisExtractor<'a>) -> Self {
        Self {
            extractor,
            sinks: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn MeasurementSink>) {
        info!("Delivering measurements to {}", sink.name());
        self.sinks.push(sink);
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Reads and handles telegrams until the transport closes.
    pub async fn start_thread<R: AsyncRead + Unpin>(&mut self, reader: &mut FrameReader<R>) {
        info!("Starting SML reader for {} byte telegrams", reader.total_length());
        loop {
            if let CycleOutcome::Closed = self.process_cycle(reader).await {
                info!("SML transport closed after {} telegrams", self.stats.telegrams_read);
                return;
            }
        }
    }

    /// One read, validate, extract and deliver round.
    pub async fn process_cycle<R: AsyncRead + Unpin>(&mut self, reader: &mut FrameReader<R>) -> CycleOutcome {
        let telegram = match reader.next_telegram().await {
            Ok(telegram) => telegram,
            Err(FrameError::Closed) => return CycleOutcome::Closed,
            Err(e) => {
                debug!("Synchronisation aborted: {}", e);
                self.stats.transport_errors += 1;
                return CycleOutcome::TransportTransient;
            }
        };
        self.stats.telegrams_read += 1;

        let telegram = match utils::validate_telegram(telegram) {
            Ok(telegram) => telegram,
            Err(e) => {
                warn!("Dropping telegram: {}", e);
                self.stats.checksum_errors += 1;
                return CycleOutcome::ChecksumMismatch;
            }
        };

        let set = self.extractor.extract(&telegram);
        debug!("Decoded {} channels, {} missing", set.readings().len(), set.missing_channels().len());
        self.deliver(&set);

        self.stats.accepted += 1;
        if self.stats.accepted % STATS_INTERVAL == 0 {
            info!("SML statistics: {:?}", self.stats);
        }

        CycleOutcome::Measured(set)
    }

    fn deliver(&mut self, set: &MeasurementSet) {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.deliver(set) {
                warn!("Delivery to {} failed: {}", sink.name(), e);
                self.stats.sink_errors += 1;
            }
        }
    }
}
