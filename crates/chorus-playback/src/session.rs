//! Decode worker and decoder session.
//!
//! One worker thread is spawned per load. It owns exactly one
//! [`DecoderSession`] at a time; a new `Init` destroys any existing session
//! first. The decode loop is cooperative: the request channel is polled at
//! every chunk boundary, and blocked on outright while the session is
//! paused or finished, so control requests are never starved.

use std::sync::Arc;
use std::thread::JoinHandle;

use chorus_core::{MediaFile, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use crate::codec::{AudioCodec, CodecFactory};
use crate::protocol::{
    AudioMetadata, CoverArt, Epoch, PauseReason, PcmChunk, WorkerRequest, WorkerResponse,
};
use crate::vfs::{self, MountGuard};

/// Handle to a spawned decode worker thread.
pub struct WorkerHandle {
    request_tx: Sender<WorkerRequest>,
    _join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Send a request; logs and drops it if the worker has exited.
    pub fn send(&self, request: WorkerRequest) {
        if self.request_tx.send(request).is_err() {
            warn!("decode worker is gone; request dropped");
        }
    }

    /// Ask the worker to tear down. The thread exits at the next chunk
    /// boundary.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(WorkerRequest::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn stub() -> (Self, Receiver<WorkerRequest>) {
        let (request_tx, request_rx) = unbounded();
        (
            Self {
                request_tx,
                _join: None,
            },
            request_rx,
        )
    }
}

/// Spawn a decode worker feeding `response_tx`.
pub fn spawn_worker(
    factory: Arc<dyn CodecFactory>,
    response_tx: Sender<WorkerResponse>,
) -> Result<WorkerHandle> {
    let (request_tx, request_rx) = unbounded();
    let worker = DecodeWorker {
        factory,
        request_rx,
        response_tx,
        session: None,
    };

    let join = std::thread::Builder::new()
        .name("decode-worker".to_string())
        .spawn(move || worker.run())
        .map_err(|e| chorus_core::Error::Output(format!("failed to spawn decode worker: {e}")))?;

    Ok(WorkerHandle {
        request_tx,
        _join: Some(join),
    })
}

struct DecodeWorker {
    factory: Arc<dyn CodecFactory>,
    request_rx: Receiver<WorkerRequest>,
    response_tx: Sender<WorkerResponse>,
    session: Option<DecoderSession>,
}

impl DecodeWorker {
    fn run(mut self) {
        debug!("decode worker started");
        loop {
            let active = self.session.as_ref().is_some_and(DecoderSession::wants_decode);

            let request = if active {
                match self.request_rx.try_recv() {
                    Ok(request) => Some(request),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                // Nothing to decode; block until told otherwise.
                match self.request_rx.recv() {
                    Ok(request) => Some(request),
                    Err(_) => break,
                }
            };

            if let Some(request) = request {
                if matches!(request, WorkerRequest::Shutdown) {
                    debug!("decode worker shutting down");
                    break;
                }
                self.handle_request(request);
                continue;
            }

            self.decode_tick();
        }

        if let Some(mut session) = self.session.take() {
            session.destroy();
        }
    }

    fn handle_request(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Init {
                epoch,
                file,
                chunk_frames,
            } => {
                // Exactly one live session per worker.
                if let Some(mut old) = self.session.take() {
                    old.destroy();
                }
                match DecoderSession::open(
                    self.factory.as_ref(),
                    epoch,
                    &file,
                    chunk_frames,
                    self.response_tx.clone(),
                ) {
                    Ok(session) => self.session = Some(session),
                    Err(error) => {
                        let _ = self
                            .response_tx
                            .send(WorkerResponse::Error { epoch, error });
                    }
                }
            }
            WorkerRequest::Pause { epoch, reason } => {
                if let Some(session) = self.session.as_mut() {
                    if session.epoch == epoch {
                        session.pause(reason);
                    } else {
                        trace!("ignoring pause for stale epoch {epoch}");
                    }
                }
            }
            WorkerRequest::Resume { epoch, reason } => {
                if let Some(session) = self.session.as_mut() {
                    if session.epoch == epoch {
                        session.resume(reason);
                    } else {
                        trace!("ignoring resume for stale epoch {epoch}");
                    }
                }
            }
            WorkerRequest::Seek { epoch, time } => {
                if let Some(session) = self.session.as_mut() {
                    if session.seek(time, epoch).is_err() {
                        if let Some(mut dead) = self.session.take() {
                            dead.destroy();
                        }
                    }
                }
            }
            WorkerRequest::Shutdown => {}
        }
    }

    /// One decode iteration, if the session wants it.
    fn decode_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.wants_decode() {
            return;
        }
        if session.decode_step().is_err() {
            if let Some(mut dead) = self.session.take() {
                dead.destroy();
            }
        }
    }
}

/// One codec instance plus its decode-loop state.
struct DecoderSession {
    epoch: Epoch,
    codec: Box<dyn AudioCodec>,
    chunk_frames: usize,
    sample_rate: u32,
    channels: u16,
    running: bool,
    user_paused: bool,
    flow_paused: bool,
    destroyed: bool,
    _mount: MountGuard,
    response_tx: Sender<WorkerResponse>,
}

impl DecoderSession {
    fn open(
        factory: &dyn CodecFactory,
        epoch: Epoch,
        file: &MediaFile,
        chunk_frames: usize,
        response_tx: Sender<WorkerResponse>,
    ) -> Result<Self> {
        let mount = vfs::mount(&format!("/session_{epoch}"), file);
        let (codec, properties) = factory.open(mount.path())?;

        let cover = properties.cover.clone().map(|data| {
            Arc::new(CoverArt::new(data, properties.cover_media_type.clone()))
        });
        let metadata = AudioMetadata {
            sample_rate: properties.sample_rate,
            channels: properties.channels,
            duration: properties.duration,
            tags: properties.tags.clone(),
            encoding: properties.encoding.clone(),
            cover,
            bits_per_sample: properties.bits_per_sample,
        };

        let _ = response_tx.send(WorkerResponse::Metadata { epoch, metadata });

        debug!("decoder session {epoch} opened ({})", properties.encoding);

        Ok(Self {
            epoch,
            codec,
            chunk_frames,
            sample_rate: properties.sample_rate,
            channels: properties.channels,
            running: true,
            user_paused: false,
            flow_paused: false,
            destroyed: false,
            _mount: mount,
            response_tx,
        })
    }

    fn wants_decode(&self) -> bool {
        self.running && !self.user_paused && !self.flow_paused
    }

    fn pause(&mut self, reason: PauseReason) {
        match reason {
            PauseReason::User => self.user_paused = true,
            PauseReason::FlowControl => self.flow_paused = true,
        }
    }

    fn resume(&mut self, reason: PauseReason) {
        match reason {
            PauseReason::User => self.user_paused = false,
            PauseReason::FlowControl => self.flow_paused = false,
        }
    }

    /// Decode one chunk. An error here is fatal: the error is posted and
    /// the caller must destroy the session.
    fn decode_step(&mut self) -> Result<()> {
        let read = match self.codec.read_chunk(self.chunk_frames) {
            Ok(read) => read,
            Err(error) => {
                let _ = self.response_tx.send(WorkerResponse::Error {
                    epoch: self.epoch,
                    error: error.clone(),
                });
                return Err(error);
            }
        };

        if !read.samples.is_empty() {
            let chunk = PcmChunk {
                samples: read.samples,
                channels: self.channels,
                sample_rate: self.sample_rate,
                start_time: read.start_time,
            };
            let _ = self.response_tx.send(WorkerResponse::Chunk {
                epoch: self.epoch,
                chunk,
            });
        }

        if read.eof {
            trace!("decoder session {} reached EOF", self.epoch);
            let _ = self
                .response_tx
                .send(WorkerResponse::Eof { epoch: self.epoch });
            self.running = false;
        }

        Ok(())
    }

    /// Seek the codec and rebind the session to `new_epoch`.
    ///
    /// Failure is fatal; the error is posted under the new epoch and the
    /// caller must destroy the session.
    fn seek(&mut self, time: f64, new_epoch: Epoch) -> Result<()> {
        match self.codec.seek(time) {
            Ok(actual) => {
                self.epoch = new_epoch;
                let _ = self.response_tx.send(WorkerResponse::SeekDone {
                    epoch: new_epoch,
                    time: actual,
                });
                self.running = true;
                self.user_paused = false;
                self.flow_paused = false;
                Ok(())
            }
            Err(error) => {
                let _ = self.response_tx.send(WorkerResponse::Error {
                    epoch: new_epoch,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Idempotent teardown. The mount is released when the session drops.
    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.running = false;
        self.codec.close();
        debug!("decoder session {} destroyed", self.epoch);
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
