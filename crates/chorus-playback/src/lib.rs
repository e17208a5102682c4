//! # chorus-playback
//!
//! Streaming decode-and-playback engine for Chorus.
//!
//! A decode worker thread pulls PCM out of a codec one chunk at a time while
//! the host-side scheduler places those chunks onto an output graph, keeping
//! roughly [`engine::HIGH_WATER_MARK`] seconds of audio resident via
//! backpressure. Every message between the two sides carries an epoch token
//! so responses from a superseded load or seek are provably unobservable.

pub mod backend;
pub mod codec;
pub mod engine;
pub mod fetch;
pub mod graph;
pub mod output;
pub mod protocol;
pub mod resample;
pub mod session;
pub mod vfs;

pub use backend::PlaybackBackend;
pub use engine::{AudioEngine, LoadRequest, PlaybackState, PlayerEvent};
pub use protocol::{AudioMetadata, CoverArt, Epoch, PcmChunk};
