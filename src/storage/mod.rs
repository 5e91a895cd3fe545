use crate::config::StorageConfig;
use crate::metering_sml::{structs::{ChannelRole, MeasurementSet, OffsetSpec}, MeasurementSink, SinkError};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unable to open {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to write {path}: {source}")]
    Csv { path: String, source: csv::Error },
}

/// Append-only CSV file with one timestamped row per telegram
pub struct TimeSeriesStore {
    path: PathBuf,
    columns: Vec<String>,
}

impl TimeSeriesStore {
    pub fn new(path: impl Into<PathBuf>, columns: Vec<String>) -> Self {
        Self { path: path.into(), columns }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, time: DateTime<Utc>, values: &[f64]) -> Result<(), StorageError> {
        let path = self.path.display().to_string();
        let is_new = std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StorageError::Io { path: path.clone(), source })?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        let csv_error = |source| StorageError::Csv { path: path.clone(), source };

        if is_new {
            let mut header = vec!["timestamp".to_string()];
            header.extend(self.columns.iter().cloned());
            writer.write_record(&header).map_err(csv_error)?;
        }

        let mut record = vec![time.to_rfc3339_opts(SecondsFormat::Secs, true)];
        record.extend(values.iter().map(|v| v.to_string()));
        writer.write_record(&record).map_err(csv_error)?;
        writer.flush().map_err(|e| csv_error(e.into()))?;

        debug!("Appended {} values to {}", values.len(), path);
        Ok(())
    }
}

/* Energy import total followed by the positive half of every power channel */
pub fn consumption_row(set: &MeasurementSet) -> Vec<f64> {
    set.by_role(ChannelRole::Consumption).map(|r| r.value)
        .chain(set.by_role(ChannelRole::Power).map(|r| r.value.max(0.0)))
        .collect()
}

/* Energy export total followed by the magnitude of the negative half of every power channel */
pub fn feed_in_row(set: &MeasurementSet) -> Vec<f64> {
    set.by_role(ChannelRole::FeedIn).map(|r| r.value)
        .chain(set.by_role(ChannelRole::Power).map(|r| r.value.min(0.0).abs()))
        .collect()
}

fn columns_for(channels: &[OffsetSpec], energy_role: ChannelRole) -> Vec<String> {
    let energy = channels.iter().filter(|c| c.role == energy_role);
    let power = channels.iter().filter(|c| c.role == ChannelRole::Power);
    energy.chain(power).map(|c| c.channel.clone()).collect()
}

/// Consumption and feed-in series, written independently of each other
pub struct SplitStorage {
    consumption: TimeSeriesStore,
    feed_in: TimeSeriesStore,
}

impl SplitStorage {
    pub fn new(config: &StorageConfig, channels: &[OffsetSpec]) -> Self {
        Self {
            consumption: TimeSeriesStore::new(&config.consumption_path, columns_for(channels, ChannelRole::Consumption)),
            feed_in: TimeSeriesStore::new(&config.feed_in_path, columns_for(channels, ChannelRole::FeedIn)),
        }
    }
}

impl MeasurementSink for SplitStorage {
    fn name(&self) -> &str {
        "time-series storage"
    }

    fn deliver(&mut self, set: &MeasurementSet) -> Result<(), SinkError> {
        let time = set.metered_time();
        let consumption = self.consumption.append(time, &consumption_row(set));
        let feed_in = self.feed_in.append(time, &feed_in_row(set));

        match (consumption, feed_in) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e.into()),
            (Err(first), Err(second)) => {
                warn!("{}", second);
                Err(first.into())
            }
        }
    }
}
