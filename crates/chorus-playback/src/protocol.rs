//! Typed request/response protocol between the scheduler and the decode worker.
//!
//! Every message carries the [`Epoch`] it was issued under. The scheduler
//! discards any response whose epoch is not the currently live one; the
//! worker applies the symmetric rule to pause/resume requests. This is the
//! sole mechanism keeping audio from a superseded decode stream out of the
//! current timeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chorus_core::{Error, MediaFile};

/// Opaque token identifying one decode generation.
///
/// A new epoch is minted on every `load()` and every `seek()`; exactly one
/// epoch is live per engine at any time. Epochs are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Self = Self(0);

    /// Mint the successor epoch.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Why decode was paused or resumed.
///
/// User intent and backpressure are tracked as independent signals on the
/// worker side and OR-combined, so clearing one can never override the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    User,
    FlowControl,
}

/// Requests sent host → worker.
#[derive(Debug)]
pub enum WorkerRequest {
    /// Open a new decoder session. Destroys any existing session first.
    Init {
        epoch: Epoch,
        file: MediaFile,
        chunk_frames: usize,
    },
    /// Suspend decoding. Honored only if `epoch` matches the session.
    Pause { epoch: Epoch, reason: PauseReason },
    /// Resume decoding. Honored only if `epoch` matches the session.
    Resume { epoch: Epoch, reason: PauseReason },
    /// Seek the codec; on success the session adopts `epoch` as its own.
    Seek { epoch: Epoch, time: f64 },
    /// Tear the worker down. Always honored.
    Shutdown,
}

/// Responses sent worker → host.
#[derive(Debug)]
pub enum WorkerResponse {
    Metadata { epoch: Epoch, metadata: AudioMetadata },
    Chunk { epoch: Epoch, chunk: PcmChunk },
    Eof { epoch: Epoch },
    SeekDone { epoch: Epoch, time: f64 },
    Error { epoch: Epoch, error: Error },
}

impl WorkerResponse {
    /// The epoch this response was issued under.
    pub const fn epoch(&self) -> Epoch {
        match self {
            Self::Metadata { epoch, .. }
            | Self::Chunk { epoch, .. }
            | Self::Eof { epoch }
            | Self::SeekDone { epoch, .. }
            | Self::Error { epoch, .. } => *epoch,
        }
    }
}

/// Stream metadata produced exactly once per successful load.
#[derive(Debug, Clone)]
pub struct AudioMetadata {
    pub sample_rate: u32,
    pub channels: u16,
    /// Total duration in seconds.
    pub duration: f64,
    /// String-keyed container tags (title, artist, ...).
    pub tags: HashMap<String, String>,
    /// Codec/encoding label, e.g. "flac".
    pub encoding: String,
    /// Embedded cover art, released when the metadata is replaced.
    pub cover: Option<Arc<CoverArt>>,
    pub bits_per_sample: u32,
}

/// Embedded cover image owned by its metadata.
///
/// The bytes are freed when the last reference drops; the scheduler drops
/// its reference whenever metadata is replaced or the engine is destroyed.
#[derive(Debug, Clone)]
pub struct CoverArt {
    data: Bytes,
    media_type: Option<String>,
}

impl CoverArt {
    pub fn new(data: Bytes, media_type: Option<String>) -> Self {
        Self { data, media_type }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }
}

/// One decoded chunk of planar PCM.
///
/// Samples are stored per-channel contiguously: all of channel 0's frames,
/// then all of channel 1's, and so on. Ownership moves host-ward exactly
/// once; the scheduler converts it into a playable buffer immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Stream-relative start position in seconds (absolute, not
    /// session-relative).
    pub start_time: f64,
}

impl PcmChunk {
    /// Frames per channel.
    pub fn frames(&self) -> usize {
        let channels = usize::from(self.channels.max(1));
        self.samples.len() / channels
    }

    /// Playable duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// One channel's contiguous samples.
    pub fn channel(&self, ch: usize) -> &[f32] {
        let frames = self.frames();
        &self.samples[ch * frames..(ch + 1) * frames]
    }
}
