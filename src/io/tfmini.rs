//! Benewake TF-Mini LiDAR over UART
//!
//! Protocol:
//! - Baud: 115200, 8N1, sensor pushes frames continuously (100 Hz)
//! - Frame: 9 bytes, starts with 0x59 0x59
//!   `59 59 Dist_L Dist_H Str_L Str_H Temp_L Temp_H Checksum`
//! - Checksum: low byte of the sum of the first 8 bytes
//! - Temperature: raw / 8 - 256 °C

use crate::domain::types::Reading;
use crate::infra::config::Config;
use crate::io::sampler::DistanceSampler;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

pub const FRAME_HEADER: u8 = 0x59;
pub const FRAME_LEN: usize = 9;

/// Strength value the sensor reports when the receiver is saturated
const STRENGTH_SATURATED: u16 = u16::MAX;
/// Wait between attempts to reopen a lost port
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);
/// Cap on buffered bytes when the sender never produces a header
const MAX_BUFFER: usize = 256;

/// One decoded frame, before plausibility checks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TfMiniFrame {
    pub distance_cm: u16,
    pub strength: u16,
    pub temperature_c: f64,
}

/// Frame decode failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Length(usize),
    Header,
    Checksum { expected: u8, actual: u8 },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Length(len) => write!(f, "frame length {len}, expected {FRAME_LEN}"),
            FrameError::Header => write!(f, "missing 0x59 0x59 header"),
            FrameError::Checksum { expected, actual } => {
                write!(f, "checksum {actual:#04x}, expected {expected:#04x}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode one 9-byte frame
pub fn parse_frame(data: &[u8]) -> Result<TfMiniFrame, FrameError> {
    if data.len() != FRAME_LEN {
        return Err(FrameError::Length(data.len()));
    }
    if data[0] != FRAME_HEADER || data[1] != FRAME_HEADER {
        return Err(FrameError::Header);
    }

    let expected = data[..8].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if expected != data[8] {
        return Err(FrameError::Checksum { expected, actual: data[8] });
    }

    let distance_cm = u16::from_le_bytes([data[2], data[3]]);
    let strength = u16::from_le_bytes([data[4], data[5]]);
    let raw_temp = u16::from_le_bytes([data[6], data[7]]);

    Ok(TfMiniFrame { distance_cm, strength, temperature_c: raw_temp as f64 / 8.0 - 256.0 })
}

/// Plausibility limits applied to decoded frames
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub min_strength: u16,
    pub max_distance_cm: f64,
}

impl FrameLimits {
    /// Turn a frame into a reading; weak, saturated or out-of-range frames are invalid
    pub fn to_reading(&self, frame: &TfMiniFrame, timestamp: Instant) -> Reading {
        let distance = frame.distance_cm as f64;
        if frame.strength < self.min_strength
            || frame.strength == STRENGTH_SATURATED
            || distance > self.max_distance_cm
        {
            trace!(
                distance_cm = frame.distance_cm,
                strength = frame.strength,
                "tfmini_frame_rejected"
            );
            return Reading::invalid(timestamp);
        }
        Reading::valid(distance, timestamp)
            .with_strength(frame.strength)
            .with_temperature(frame.temperature_c)
    }
}

/// Reassembles frames from a byte stream that may split or misalign them
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    checksum_errors: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(64), checksum_errors: 0 }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUFFER {
            let excess = self.buffer.len() - MAX_BUFFER;
            self.buffer.drain(..excess);
        }
    }

    /// Drop bytes until the buffer starts with a frame header (or could)
    fn synchronize(&mut self) {
        let start = self
            .buffer
            .windows(2)
            .position(|w| w[0] == FRAME_HEADER && w[1] == FRAME_HEADER)
            .unwrap_or_else(|| {
                // Keep a trailing 0x59 that may be the first half of a header
                if self.buffer.last() == Some(&FRAME_HEADER) {
                    self.buffer.len() - 1
                } else {
                    self.buffer.len()
                }
            });
        if start > 0 {
            debug!(discarded = start, "tfmini_sync_discarded_bytes");
            self.buffer.drain(..start);
        }
    }

    /// Decode every complete frame in the buffer and return the newest good one.
    /// Partial trailing bytes stay buffered for the next read.
    pub fn latest_frame(&mut self) -> Option<TfMiniFrame> {
        let mut latest = None;
        loop {
            self.synchronize();
            if self.buffer.len() < FRAME_LEN {
                return latest;
            }
            match parse_frame(&self.buffer[..FRAME_LEN]) {
                Ok(frame) => {
                    self.buffer.drain(..FRAME_LEN);
                    latest = Some(frame);
                }
                Err(e) => {
                    self.checksum_errors += 1;
                    warn!(
                        error = %e,
                        raw_bytes = %hex::encode_upper(&self.buffer[..FRAME_LEN]),
                        "tfmini_frame_invalid"
                    );
                    // Skip one byte so the next header candidate is found
                    self.buffer.drain(..1);
                }
            }
        }
    }

    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// TF-Mini sampler
///
/// Each sample does one bounded read, feeds the decoder and reports the
/// newest frame. No fresh frame within the read timeout gives an invalid
/// reading. A port that fails is closed and reopened after a backoff.
pub struct TfMiniSampler {
    device: String,
    baud: u32,
    read_timeout: Duration,
    limits: FrameLimits,
    port: Option<SerialStream>,
    decoder: FrameDecoder,
    last_open_attempt: Option<Instant>,
}

impl TfMiniSampler {
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.sensor_device().to_string(),
            baud: config.sensor_baud(),
            read_timeout: config.sensor_read_timeout(),
            limits: FrameLimits {
                min_strength: config.sensor_min_strength(),
                max_distance_cm: config.sensor_max_distance_cm(),
            },
            port: None,
            decoder: FrameDecoder::new(),
            last_open_attempt: None,
        }
    }

    fn ensure_open(&mut self, now: Instant) {
        if self.port.is_some() {
            return;
        }
        if self.last_open_attempt.is_some_and(|t| now.duration_since(t) < REOPEN_BACKOFF) {
            return;
        }
        self.last_open_attempt = Some(now);

        match tokio_serial::new(&self.device, self.baud)
            .timeout(self.read_timeout)
            .open_native_async()
        {
            Ok(port) => {
                info!(device = %self.device, baud = %self.baud, "tfmini_port_opened");
                self.port = Some(port);
            }
            Err(e) => {
                error!(device = %self.device, error = %e, "tfmini_port_open_failed");
            }
        }
    }

    async fn read_once(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        let mut buf = [0u8; 64];

        match tokio::time::timeout(self.read_timeout, port.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => self.decoder.extend(&buf[..n]),
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {}
            Ok(Err(e)) => {
                warn!(device = %self.device, error = %e, "tfmini_read_error");
                self.port = None;
            }
            Err(_) => {}
        }
    }
}

#[async_trait]
impl DistanceSampler for TfMiniSampler {
    async fn sample(&mut self) -> Reading {
        let now = Instant::now();
        self.ensure_open(now);
        self.read_once().await;

        match self.decoder.latest_frame() {
            Some(frame) => self.limits.to_reading(&frame, now),
            None => Reading::invalid(now),
        }
    }

    async fn release(&mut self) {
        if self.port.take().is_some() {
            info!(
                device = %self.device,
                checksum_errors = self.decoder.checksum_errors(),
                "tfmini_port_closed"
            );
        }
    }

    fn name(&self) -> &'static str {
        "tfmini"
    }
}
