//! # SML frame synchronisation
//!
//! The meter pushes telegrams without being asked. Each one starts with the
//! escape sequence `1B 1B 1B 1B 01 01 01 01` and, for a given meter model,
//! always has the same length. The reader slides an eight byte window over
//! the stream until it holds the start sequence and then reads the rest of
//! the telegram in one go.

use super::structs::{RawTelegram, SML_START_SEQUENCE};
use log::debug;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("No data received within {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(std::io::Error),
    #[error("No start sequence within {0} bytes")]
    NoSync(usize),
    #[error("Transport closed")]
    Closed,
}

pub struct FrameReader<R> {
    port: BufReader<R>,
    total_length: usize,
    read_timeout: Duration,
    max_sync_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(port: R, total_length: usize, read_timeout: Duration, max_sync_bytes: usize) -> Self {
        Self {
            port: BufReader::new(port),
            total_length,
            read_timeout,
            // a limit below the start sequence could never succeed
            max_sync_bytes: max_sync_bytes.max(SML_START_SEQUENCE.len()),
        }
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Waits for the next start sequence and returns the complete telegram.
    ///
    /// Any error abandons the telegram in progress; the next call starts
    /// synchronising from the current stream position.
    pub async fn next_telegram(&mut self) -> Result<RawTelegram, FrameError> {
        let skipped = self.synchronize().await?;
        if skipped > 0 {
            debug!("Skipped {} bytes before the start sequence", skipped);
        }

        let mut data = vec![0u8; self.total_length.max(SML_START_SEQUENCE.len())];
        data[..SML_START_SEQUENCE.len()].copy_from_slice(&SML_START_SEQUENCE);
        self.read_exact(&mut data[SML_START_SEQUENCE.len()..]).await?;

        Ok(RawTelegram::new(data))
    }

    /* Returns the number of bytes in front of the start sequence */
    async fn synchronize(&mut self) -> Result<usize, FrameError> {
        let mut window = [0u8; 8];
        let mut byte = [0u8; 1];
        let mut inspected = 0usize;

        loop {
            if inspected >= self.max_sync_bytes {
                return Err(FrameError::NoSync(inspected));
            }

            self.read_exact(&mut byte).await?;
            inspected += 1;

            window.copy_within(1.., 0);
            window[7] = byte[0];

            if inspected >= window.len() && window == SML_START_SEQUENCE {
                return Ok(inspected - window.len());
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match timeout(self.read_timeout, self.port.read_exact(buf)).await {
            Err(_) => Err(FrameError::Timeout(self.read_timeout)),
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Closed),
            Ok(Err(e)) => Err(FrameError::Transport(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Opens the optical head with 8N1 at the configured baud rate.
#[cfg(feature = "serial")]
pub fn open_serial_port(config: &crate::config::SerialConfig) -> Result<tokio_serial::SerialStream, tokio_serial::Error> {
    use tokio_serial::{SerialPort, SerialPortBuilderExt};

    let port = tokio_serial::new(&config.device, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(config.read_timeout())
        .open_native_async()?;

    // stale bytes would only delay the first synchronisation
    if let Err(e) = port.clear(tokio_serial::ClearBuffer::All) {
        debug!("Unable to flush {}: {}", config.device, e);
    }

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn telegram(len: usize, fill: u8) -> Vec<u8> {
        let mut data = SML_START_SEQUENCE.to_vec();
        data.resize(len, fill);
        data
    }

    /// Fails the first read, then serves the wrapped bytes
    struct FlakyPort<'a> {
        failed: bool,
        data: &'a [u8],
    }

    impl AsyncRead for FlakyPort<'_> {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            if !self.failed {
                self.failed = true;
                return Poll::Ready(Err(std::io::Error::other("device reports readiness but returned no data")));
            }
            Pin::new(&mut self.data).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn test_skips_noise_before_start_sequence() {
        let mut stream = vec![0x00, 0x76, 0x1B, 0x1B, 0x01, 0xFF, 0x63];
        stream.extend(telegram(32, 0x42));

        let mut reader = FrameReader::new(&stream[..], 32, TIMEOUT, 1000);
        let raw = reader.next_telegram().await.unwrap();
        assert_eq!(raw.as_bytes(), &telegram(32, 0x42)[..]);
    }

    #[tokio::test]
    async fn test_start_sequence_after_partial_match() {
        // five escape bytes: the first one must not hide the real start
        let mut stream = vec![0x1B];
        stream.extend(telegram(24, 0x10));

        let mut reader = FrameReader::new(&stream[..], 24, TIMEOUT, 1000);
        let raw = reader.next_telegram().await.unwrap();
        assert_eq!(raw.as_bytes(), &telegram(24, 0x10)[..]);
    }

    #[tokio::test]
    async fn test_end_sequence_of_previous_telegram_is_ignored() {
        let mut stream = vec![0x00, 0x1B, 0x1B, 0x1B, 0x1B, 0x1A, 0x00, 0x12, 0x34];
        stream.extend(telegram(20, 0x55));

        let mut reader = FrameReader::new(&stream[..], 20, TIMEOUT, 1000);
        assert_eq!(reader.next_telegram().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_consecutive_telegrams() {
        let mut stream = telegram(16, 0x01);
        stream.extend(telegram(16, 0x02));

        let mut reader = FrameReader::new(&stream[..], 16, TIMEOUT, 1000);
        assert_eq!(reader.next_telegram().await.unwrap().as_bytes()[15], 0x01);
        assert_eq!(reader.next_telegram().await.unwrap().as_bytes()[15], 0x02);
        assert!(matches!(reader.next_telegram().await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_telegram_is_not_returned() {
        let stream = telegram(30, 0x07);
        let mut reader = FrameReader::new(&stream[..], 64, TIMEOUT, 1000);
        assert!(matches!(reader.next_telegram().await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_sync_bytes() {
        let mut stream = vec![0xAA; 40];
        stream.extend(telegram(16, 0x03));

        let mut reader = FrameReader::new(&stream[..], 16, TIMEOUT, 32);
        assert!(matches!(reader.next_telegram().await, Err(FrameError::NoSync(32))));
        // the next attempt continues from where the last one stopped
        assert_eq!(reader.next_telegram().await.unwrap().as_bytes()[15], 0x03);
    }

    #[tokio::test]
    async fn test_tiny_sync_limit_still_reads() {
        let mut stream = telegram(16, 0x06);
        stream.extend(telegram(16, 0x07));

        // zero must not fail without reading a byte
        let mut reader = FrameReader::new(&stream[..], 16, TIMEOUT, 0);
        assert_eq!(reader.next_telegram().await.unwrap().as_bytes()[15], 0x06);
        assert_eq!(reader.next_telegram().await.unwrap().as_bytes()[15], 0x07);
    }

    #[tokio::test]
    async fn test_timeout_restarts_synchronisation() {
        let (port, mut meter) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(port, 16, Duration::from_millis(50), 1000);

        // meter stops sending in the middle of a telegram
        meter.write_all(&telegram(10, 0x09)).await.unwrap();
        assert!(matches!(reader.next_telegram().await, Err(FrameError::Timeout(_))));

        meter.write_all(&telegram(16, 0x04)).await.unwrap();
        let raw = reader.next_telegram().await.unwrap();
        assert_eq!(raw.as_bytes(), &telegram(16, 0x04)[..]);
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let stream = telegram(16, 0x05);
        let port = FlakyPort { failed: false, data: &stream[..] };
        let mut reader = FrameReader::new(port, 16, TIMEOUT, 1000);

        assert!(matches!(reader.next_telegram().await, Err(FrameError::Transport(_))));
        assert_eq!(reader.next_telegram().await.unwrap().as_bytes()[15], 0x05);
    }
}
