//! PCM audio frames.
//!
//! Frames are interleaved signed 16-bit samples. On the device wire they are
//! raw little-endian bytes with no header; sequencing is arrival order.

use std::time::Duration;
use thiserror::Error;

/// Sample rate and channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// The format devices capture and play: 16 kHz mono.
    pub const DEVICE: AudioFormat = AudioFormat {
        sample_rate: 16_000,
        channels: 1,
    };

    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::DEVICE
    }
}

/// Errors decoding a binary device payload into an [`AudioFrame`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcmError {
    #[error("empty audio payload")]
    Empty,

    /// 16-bit samples need an even number of bytes.
    #[error("audio payload has odd length {0}")]
    OddLength(usize),

    #[error("{samples} samples do not divide into {channels} channels")]
    ChannelMismatch { samples: usize, channels: u16 },

    #[error("invalid audio format: {0}")]
    InvalidFormat(String),
}

/// A fixed-duration chunk of interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(format: AudioFormat, samples: Vec<i16>) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            samples,
        }
    }

    /// Decodes little-endian 16-bit samples from a device payload.
    pub fn from_le_bytes(bytes: &[u8], format: AudioFormat) -> Result<Self, PcmError> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(PcmError::InvalidFormat(format!(
                "{} Hz, {} channels",
                format.sample_rate, format.channels
            )));
        }
        if bytes.is_empty() {
            return Err(PcmError::Empty);
        }
        if bytes.len() % 2 != 0 {
            return Err(PcmError::OddLength(bytes.len()));
        }

        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        if samples.len() % usize::from(format.channels) != 0 {
            return Err(PcmError::ChannelMismatch {
                samples: samples.len(),
                channels: format.channels,
            });
        }

        Ok(Self::new(format, samples))
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.channels)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel() as f64 / f64::from(self.sample_rate))
    }

    /// Reduces a multi-channel frame to mono by keeping the first (left)
    /// channel of every interleaved group. Samples are not averaged.
    pub fn to_mono(self) -> Self {
        if self.channels <= 1 {
            return self;
        }
        let step = usize::from(self.channels);
        let samples = self.samples.iter().step_by(step).copied().collect();
        Self {
            sample_rate: self.sample_rate,
            channels: 1,
            samples,
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }
}
