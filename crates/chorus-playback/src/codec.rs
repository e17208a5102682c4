//! Codec capability boundary and the symphonia-backed implementation.
//!
//! A [`CodecFactory`] opens a mounted file by path and yields one
//! [`AudioCodec`] instance plus the stream's [`CodecProperties`]. Any `Err`
//! from a codec is fatal to its session; there is no partial-failure retry
//! at this layer.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chorus_core::{Error, Result};
use once_cell::sync::OnceCell;
use symphonia::core::{
    audio::{AudioBufferRef, Signal},
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::{Time, TimeBase},
};
use tracing::{debug, warn};

use crate::vfs;

/// Properties extracted when a codec opens a stream.
#[derive(Debug, Clone)]
pub struct CodecProperties {
    pub sample_rate: u32,
    pub channels: u16,
    /// Total duration in seconds (0.0 when unknown).
    pub duration: f64,
    pub tags: HashMap<String, String>,
    /// Short codec name, e.g. "flac".
    pub encoding: String,
    pub cover: Option<Bytes>,
    pub cover_media_type: Option<String>,
    pub bits_per_sample: u32,
}

/// One decoded read.
#[derive(Debug)]
pub struct ChunkRead {
    /// Planar samples (may be empty on the final read).
    pub samples: Vec<f32>,
    /// Stream position of the first frame, in seconds.
    pub start_time: f64,
    /// True once the codec has produced all available samples.
    pub eof: bool,
}

/// An open decode stream. All errors are fatal to the owning session.
pub trait AudioCodec: Send {
    /// Decode up to `max_frames` frames of planar PCM.
    fn read_chunk(&mut self, max_frames: usize) -> Result<ChunkRead>;

    /// Seek to `time` seconds; returns the actual landed position.
    fn seek(&mut self, time: f64) -> Result<f64>;

    /// Release codec resources. Safe to call more than once.
    fn close(&mut self);
}

/// Opens codec instances over the virtual filesystem.
pub trait CodecFactory: Send + Sync {
    fn open(&self, path: &str) -> Result<(Box<dyn AudioCodec>, CodecProperties)>;
}

/// Process-wide codec factory, initialized once and reused by every session.
pub fn default_factory() -> Arc<dyn CodecFactory> {
    static INSTANCE: OnceCell<Arc<SymphoniaFactory>> = OnceCell::new();
    let factory: Arc<dyn CodecFactory> = INSTANCE.get_or_init(|| Arc::new(SymphoniaFactory)).clone();
    factory
}

/// Symphonia-backed codec factory.
pub struct SymphoniaFactory;

impl CodecFactory for SymphoniaFactory {
    fn open(&self, path: &str) -> Result<(Box<dyn AudioCodec>, CodecProperties)> {
        let data = vfs::open(path)
            .ok_or_else(|| Error::CodecInit(format!("no mounted file at {path}")))?;

        let cursor = Cursor::new(data.to_vec());
        let mss = MediaSourceStream::new(Box::new(cursor), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| Error::CodecInit(format!("failed to probe format: {e}")))?;

        let mut format = probed.format;
        let mut probe_meta = probed.metadata;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::CodecInit("no audio tracks found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(48000);
        let channels = track.codec_params.channels.map_or(2, |c| c.count() as u16);
        let bits_per_sample = track.codec_params.bits_per_sample.unwrap_or(0);
        let time_base = track.codec_params.time_base;

        let duration = time_base
            .zip(track.codec_params.n_frames)
            .map_or(0.0, |(tb, frames)| {
                let time = tb.calc_time(frames);
                time.seconds as f64 + time.frac
            });

        let encoding = symphonia::default::get_codecs()
            .get_codec(track.codec_params.codec)
            .map_or_else(|| "unknown".to_string(), |d| d.short_name.to_string());

        let decoder_opts = DecoderOptions::default();
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &decoder_opts)
            .map_err(|e| Error::CodecInit(format!("failed to create decoder: {e}")))?;

        let mut tags = HashMap::new();
        let mut cover = None;
        let mut cover_media_type = None;
        {
            // Container-level metadata takes precedence over probe-level
            // metadata when both are present.
            let container_meta = format.metadata();
            if let Some(rev) = container_meta.current() {
                harvest_revision(rev, &mut tags, &mut cover, &mut cover_media_type);
            } else {
                drop(container_meta);
                if let Some(probe_rev) = probe_meta.get().as_ref().and_then(|m| m.current()) {
                    harvest_revision(probe_rev, &mut tags, &mut cover, &mut cover_media_type);
                }
            }
        }

        debug!(
            "opened {encoding} stream: {sample_rate} Hz, {channels} ch, {duration:.2}s, {} tags",
            tags.len()
        );

        let properties = CodecProperties {
            sample_rate,
            channels,
            duration,
            tags,
            encoding,
            cover,
            cover_media_type,
            bits_per_sample,
        };

        let codec = SymphoniaCodec {
            format,
            decoder,
            track_id,
            time_base,
            sample_rate,
            channels: usize::from(channels.max(1)),
            position: 0.0,
            closed: false,
        };

        Ok((Box::new(codec), properties))
    }
}

/// Decode stream wrapping symphonia.
struct SymphoniaCodec {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_rate: u32,
    channels: usize,
    /// Best-effort stream position for packets without timestamps.
    position: f64,
    closed: bool,
}

impl SymphoniaCodec {
    fn packet_time(&self, ts: u64) -> Option<f64> {
        self.time_base.map(|tb| {
            let time = tb.calc_time(ts);
            time.seconds as f64 + time.frac
        })
    }
}

impl AudioCodec for SymphoniaCodec {
    fn read_chunk(&mut self, max_frames: usize) -> Result<ChunkRead> {
        if self.closed {
            return Ok(ChunkRead {
                samples: Vec::new(),
                start_time: self.position,
                eof: true,
            });
        }

        let mut planes: Vec<Vec<f32>> = vec![Vec::new(); self.channels];
        let mut start_time: Option<f64> = None;
        let mut eof = false;

        while planes[0].len() < max_frames {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    eof = true;
                    break;
                }
                Err(e) => {
                    return Err(Error::Decode(format!("failed to read packet: {e}")));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let packet_time = self.packet_time(packet.ts());

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if start_time.is_none() {
                        start_time = packet_time.or(Some(self.position));
                    }
                    extend_planar(&decoded, &mut planes);
                }
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    // Corrupt frame; skip it and keep going.
                    warn!("decode error (skipping): {e}");
                }
                Err(e) => {
                    return Err(Error::Decode(format!("decode failed: {e}")));
                }
            }
        }

        let frames = planes[0].len();
        let start = start_time.unwrap_or(self.position);
        self.position = start + frames as f64 / f64::from(self.sample_rate);

        let mut samples = Vec::with_capacity(frames * self.channels);
        for plane in &planes {
            samples.extend_from_slice(plane);
        }

        Ok(ChunkRead {
            samples,
            start_time: start,
            eof,
        })
    }

    fn seek(&mut self, time: f64) -> Result<f64> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(time.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Seek(e.to_string()))?;

        self.decoder.reset();

        let actual = self
            .packet_time(seeked.actual_ts)
            .unwrap_or(time);
        self.position = actual;
        Ok(actual)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Pull tags and the first embedded visual out of a metadata revision.
fn harvest_revision(
    rev: &symphonia::core::meta::MetadataRevision,
    tags: &mut HashMap<String, String>,
    cover: &mut Option<Bytes>,
    cover_media_type: &mut Option<String>,
) {
    for tag in rev.tags() {
        let key = tag
            .std_key
            .map_or_else(|| tag.key.clone(), |k| format!("{k:?}"));
        tags.insert(key, tag.value.to_string());
    }
    if let Some(visual) = rev.visuals().first() {
        *cover = Some(Bytes::copy_from_slice(&visual.data));
        *cover_media_type = Some(visual.media_type.clone());
    }
}

/// Append a decoded buffer's samples to per-channel planes as f32.
fn extend_planar(buffer: &AudioBufferRef<'_>, planes: &mut [Vec<f32>]) {
    match buffer {
        AudioBufferRef::F32(buf) => {
            for (ch, plane) in buf.planes().planes().iter().enumerate() {
                if let Some(out) = planes.get_mut(ch) {
                    out.extend_from_slice(plane);
                }
            }
        }
        AudioBufferRef::F64(buf) => {
            for (ch, plane) in buf.planes().planes().iter().enumerate() {
                if let Some(out) = planes.get_mut(ch) {
                    out.extend(plane.iter().map(|s| *s as f32));
                }
            }
        }
        AudioBufferRef::S32(buf) => {
            for (ch, plane) in buf.planes().planes().iter().enumerate() {
                if let Some(out) = planes.get_mut(ch) {
                    out.extend(plane.iter().map(|s| *s as f32 / i32::MAX as f32));
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            for (ch, plane) in buf.planes().planes().iter().enumerate() {
                if let Some(out) = planes.get_mut(ch) {
                    out.extend(plane.iter().map(|s| f32::from(*s) / f32::from(i16::MAX)));
                }
            }
        }
        AudioBufferRef::U8(buf) => {
            for (ch, plane) in buf.planes().planes().iter().enumerate() {
                if let Some(out) = planes.get_mut(ch) {
                    out.extend(plane.iter().map(|s| (f32::from(*s) - 128.0) / 128.0));
                }
            }
        }
        _ => {}
    }
}
