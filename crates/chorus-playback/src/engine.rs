//! Playback scheduler and public engine handle.
//!
//! [`AudioEngine`] is a cheap handle; the real work happens on a dedicated
//! scheduler thread that multiplexes engine commands, decode-worker
//! responses, and a periodic tick. Time is derived from the output graph's
//! clock: `current_time = clock_now - offset`, where the offset is
//! recomputed from each chunk's absolute start time as it is scheduled, and
//! pinned to the seek target while a seek is in flight.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;

use chorus_core::{Error, MediaFile, Resource, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, CodecFactory};
use crate::fetch;
use crate::graph::{OutputGraph, SourceId};
use crate::protocol::{AudioMetadata, Epoch, PauseReason, WorkerRequest, WorkerResponse};
use crate::session::{self, WorkerHandle};

/// Pause decode once this much audio is scheduled ahead of the clock.
pub const HIGH_WATER_MARK: f64 = 30.0;
/// Resume decode once the scheduled-ahead audio drains below this.
pub const LOW_WATER_MARK: f64 = 10.0;
/// Frames requested per decoded chunk.
pub const DEFAULT_CHUNK_FRAMES: usize = 32 * 1024;

/// Gain ramp for play/pause transitions.
const FADE_SECS: f64 = 0.15;
/// Shorter ramp around seeks, where latency matters more than smoothness.
const SEEK_FADE_SECS: f64 = 0.05;
/// Scheduler housekeeping interval.
const TICK: Duration = Duration::from_millis(100);

/// Externally observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Error,
}

/// Events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChanged(PlaybackState),
    /// Total duration became known, in seconds.
    DurationChanged(f64),
    /// Periodic position report while playing, plus one immediate report
    /// per seek.
    TimeUpdate(f64),
    /// The stream played to its natural end.
    Ended,
    Error(Error),
}

enum EngineCommand {
    Load {
        resource: Resource,
        reply: oneshot::Sender<Result<AudioMetadata>>,
    },
    /// Result of an off-thread fetch, tagged with the epoch it was
    /// started under.
    FetchDone {
        epoch: Epoch,
        result: Result<MediaFile>,
    },
    Play,
    Pause,
    Seek(f64),
    SetVolume(f32),
    SourceEnded { epoch: Epoch, id: SourceId },
    Destroy,
}

/// In-flight load. Resolves with the stream metadata once the decoder has
/// opened the resource, or with [`Error::Aborted`] if a newer load
/// supersedes this one.
pub struct LoadRequest {
    rx: oneshot::Receiver<Result<AudioMetadata>>,
}

impl LoadRequest {
    /// Block until the load settles.
    pub fn wait(self) -> Result<AudioMetadata> {
        self.rx.blocking_recv().unwrap_or(Err(Error::EngineClosed))
    }
}

impl Future for LoadRequest {
    type Output = Result<AudioMetadata>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::EngineClosed)))
    }
}

#[derive(Default)]
struct Clock {
    /// Graph-clock value corresponding to stream position zero.
    offset: f64,
    /// While set, reported time is frozen at this value (seek in flight,
    /// stream ended, or fatal error).
    pinned: Option<f64>,
}

#[derive(Default)]
struct EngineShared {
    state: RwLock<PlaybackState>,
    duration: RwLock<f64>,
    metadata: RwLock<Option<AudioMetadata>>,
    source: RwLock<Option<String>>,
    clock: Mutex<Clock>,
}

impl EngineShared {
    fn current_time(&self, graph_now: f64) -> f64 {
        let clock = self.clock.lock();
        clock
            .pinned
            .unwrap_or_else(|| (graph_now - clock.offset).max(0.0))
    }
}

/// Handle to a running playback engine.
///
/// Cheap to use from any thread; dropping it tears the engine down.
pub struct AudioEngine {
    command_tx: Sender<EngineCommand>,
    event_rx: Receiver<PlayerEvent>,
    shared: Arc<EngineShared>,
    graph: Arc<dyn OutputGraph>,
    join: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Start an engine on `graph` with the process-wide codec factory.
    pub fn new(graph: Arc<dyn OutputGraph>) -> Result<Self> {
        Self::with_factory(graph, codec::default_factory())
    }

    /// Start an engine with an explicit codec factory.
    pub fn with_factory(
        graph: Arc<dyn OutputGraph>,
        factory: Arc<dyn CodecFactory>,
    ) -> Result<Self> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let shared = Arc::new(EngineShared::default());

        // The graph starts suspended so the clock does not advance before
        // the first play().
        graph.suspend();
        graph.set_gain(1.0, 0.0);

        let worker = SchedulerWorker {
            graph: Arc::clone(&graph),
            factory,
            shared: Arc::clone(&shared),
            command_tx: command_tx.clone(),
            command_rx,
            response_tx,
            response_rx,
            event_tx,
            worker: None,
            epoch: Epoch::ZERO,
            next_start: 0.0,
            active: HashSet::new(),
            decoding_finished: false,
            flow_paused: false,
            pending_load: None,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            volume: 1.0,
        };

        let join = std::thread::Builder::new()
            .name("playback-scheduler".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::Output(format!("failed to spawn scheduler: {e}")))?;

        Ok(Self {
            command_tx,
            event_rx,
            shared,
            graph,
            join: Some(join),
        })
    }

    /// Begin loading a resource, superseding any load in progress.
    ///
    /// The engine does not start playing on its own once the load settles;
    /// call [`AudioEngine::play`].
    pub fn load(&self, resource: Resource) -> LoadRequest {
        let (reply, rx) = oneshot::channel();
        // A send failure drops `reply`, which settles the request as
        // `EngineClosed`.
        let _ = self
            .command_tx
            .send(EngineCommand::Load { resource, reply });
        LoadRequest { rx }
    }

    pub fn play(&self) {
        let _ = self.command_tx.send(EngineCommand::Play);
    }

    pub fn pause(&self) {
        let _ = self.command_tx.send(EngineCommand::Pause);
    }

    /// Seek to `time` seconds. Reported time jumps to the target
    /// immediately; audio follows when the decoder catches up.
    pub fn seek(&self, time: f64) {
        let _ = self.command_tx.send(EngineCommand::Seek(time));
    }

    /// Set output volume in `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        let _ = self.command_tx.send(EngineCommand::SetVolume(volume));
    }

    /// Current stream position in seconds.
    pub fn current_time(&self) -> f64 {
        self.shared.current_time(self.graph.now())
    }

    /// Total duration of the loaded stream, 0.0 when nothing is loaded.
    pub fn duration(&self) -> f64 {
        *self.shared.duration.read()
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.read()
    }

    /// True unless audio is actively playing.
    pub fn paused(&self) -> bool {
        *self.shared.state.read() != PlaybackState::Playing
    }

    /// Description of the loaded resource, if any.
    pub fn source(&self) -> Option<String> {
        self.shared.source.read().clone()
    }

    /// Metadata of the loaded stream, if any.
    pub fn metadata(&self) -> Option<AudioMetadata> {
        self.shared.metadata.read().clone()
    }

    /// Event stream. Receivers are clonable; each event goes to exactly one
    /// receiver, so clone before splitting consumers deliberately.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.event_rx.clone()
    }

    /// Tear the engine down: abort any pending load, stop all sources, and
    /// close the output graph. Commands sent afterwards are ignored; `Drop`
    /// still joins the scheduler thread.
    pub fn destroy(&self) {
        let _ = self.command_tx.send(EngineCommand::Destroy);
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let _ = self.command_tx.send(EngineCommand::Destroy);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// The scheduler's half of the engine. Single-threaded; owns the decode
/// worker handle and all scheduling state.
struct SchedulerWorker {
    graph: Arc<dyn OutputGraph>,
    factory: Arc<dyn CodecFactory>,
    shared: Arc<EngineShared>,
    command_tx: Sender<EngineCommand>,
    command_rx: Receiver<EngineCommand>,
    response_tx: Sender<WorkerResponse>,
    response_rx: Receiver<WorkerResponse>,
    event_tx: Sender<PlayerEvent>,
    worker: Option<WorkerHandle>,
    /// The live epoch. Responses under any other epoch are discarded.
    epoch: Epoch,
    /// Graph-clock time at which the next chunk should begin.
    next_start: f64,
    /// Sources scheduled under the live epoch and not yet finished.
    active: HashSet<SourceId>,
    decoding_finished: bool,
    flow_paused: bool,
    pending_load: Option<oneshot::Sender<Result<AudioMetadata>>>,
    chunk_frames: usize,
    volume: f32,
}

impl SchedulerWorker {
    fn run(mut self) {
        debug!("playback scheduler started");
        loop {
            crossbeam_channel::select! {
                recv(self.command_rx) -> cmd => match cmd {
                    Ok(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(self.response_rx) -> resp => {
                    if let Ok(resp) = resp {
                        self.handle_response(resp);
                    }
                },
                default(TICK) => self.tick(),
            }
        }
        debug!("playback scheduler exiting");
    }

    /// Returns true when the engine should shut down.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Load { resource, reply } => self.load(resource, reply),
            EngineCommand::FetchDone { epoch, result } => self.fetch_done(epoch, result),
            EngineCommand::Play => self.play(),
            EngineCommand::Pause => self.pause(),
            EngineCommand::Seek(time) => self.seek(time),
            EngineCommand::SetVolume(volume) => {
                self.volume = volume.clamp(0.0, 1.0);
                self.graph.set_gain(self.volume, SEEK_FADE_SECS);
            }
            EngineCommand::SourceEnded { epoch, id } => self.source_ended(epoch, id),
            EngineCommand::Destroy => {
                self.reset();
                self.graph.close();
                return true;
            }
        }
        false
    }

    fn handle_response(&mut self, response: WorkerResponse) {
        if response.epoch() != self.epoch {
            trace!(
                "dropping response from superseded epoch {} (live {})",
                response.epoch(),
                self.epoch
            );
            return;
        }
        match response {
            WorkerResponse::Metadata { metadata, .. } => self.on_metadata(metadata),
            WorkerResponse::Chunk { chunk, .. } => self.on_chunk(chunk),
            WorkerResponse::Eof { .. } => {
                debug!("decode finished under {}", self.epoch);
                self.decoding_finished = true;
                self.check_ended();
            }
            WorkerResponse::SeekDone { time, .. } => self.on_seek_done(time),
            WorkerResponse::Error { error, .. } => self.on_error(error),
        }
    }

    fn load(&mut self, resource: Resource, reply: oneshot::Sender<Result<AudioMetadata>>) {
        info!("loading {resource}");
        // The reset mints a fresh epoch, so everything still in flight
        // from the previous stream goes stale before this load can fail.
        self.reset();
        *self.shared.source.write() = Some(resource.to_string());
        self.pending_load = Some(reply);
        self.set_state(PlaybackState::Loading);

        // Fetch on a helper thread; a slow GET must not stall queued
        // commands.
        let epoch = self.epoch;
        let command_tx = self.command_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("resource-fetch".to_string())
            .spawn(move || {
                let result = fetch::fetch(&resource);
                let _ = command_tx.send(EngineCommand::FetchDone { epoch, result });
            });
        if let Err(e) = spawned {
            self.fail(Error::Fetch(format!("failed to spawn fetch thread: {e}")));
        }
    }

    fn fetch_done(&mut self, epoch: Epoch, result: Result<MediaFile>) {
        if epoch != self.epoch {
            trace!("dropping fetch result from superseded epoch {epoch}");
            return;
        }
        let file = match result {
            Ok(file) => file,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        match session::spawn_worker(Arc::clone(&self.factory), self.response_tx.clone()) {
            Ok(handle) => {
                handle.send(WorkerRequest::Init {
                    epoch: self.epoch,
                    file,
                    chunk_frames: self.chunk_frames,
                });
                self.worker = Some(handle);
            }
            Err(e) => self.fail(e),
        }
    }

    fn play(&mut self) {
        let state = *self.shared.state.read();
        if !matches!(state, PlaybackState::Ready | PlaybackState::Paused) {
            trace!("ignoring play in state {state:?}");
            return;
        }
        self.graph.resume();
        self.graph.set_gain(self.volume, FADE_SECS);
        self.send_to_worker(WorkerRequest::Resume {
            epoch: self.epoch,
            reason: PauseReason::User,
        });
        self.set_state(PlaybackState::Playing);
    }

    fn pause(&mut self) {
        if *self.shared.state.read() != PlaybackState::Playing {
            return;
        }
        self.send_to_worker(WorkerRequest::Pause {
            epoch: self.epoch,
            reason: PauseReason::User,
        });
        self.graph.set_gain(0.0, FADE_SECS);
        // Suspending freezes the graph clock, so reported time holds still
        // without any extra bookkeeping.
        self.graph.suspend();
        self.set_state(PlaybackState::Paused);
    }

    fn seek(&mut self, time: f64) {
        if self.worker.is_none() {
            return;
        }
        let state = *self.shared.state.read();
        if !matches!(
            state,
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused
        ) {
            return;
        }

        let duration = *self.shared.duration.read();
        let target = time.clamp(0.0, duration.max(0.0));
        debug!("seeking to {target:.2}s");

        // Pin reported time to the target until the decoder confirms.
        self.shared.clock.lock().pinned = Some(target);
        let _ = self.event_tx.send(PlayerEvent::TimeUpdate(target));

        if state == PlaybackState::Playing {
            self.graph.set_gain(0.0, SEEK_FADE_SECS);
        }
        self.clear_sources();

        self.epoch = self.epoch.next();
        self.decoding_finished = false;
        self.flow_paused = false;
        self.send_to_worker(WorkerRequest::Seek {
            epoch: self.epoch,
            time: target,
        });
    }

    fn source_ended(&mut self, epoch: Epoch, id: SourceId) {
        if epoch != self.epoch {
            return;
        }
        self.active.remove(&id);
        self.update_flow_control();
        self.check_ended();
    }

    fn on_metadata(&mut self, metadata: AudioMetadata) {
        info!(
            "stream ready: {} Hz, {} ch, {:.1}s, {}",
            metadata.sample_rate, metadata.channels, metadata.duration, metadata.encoding
        );
        let now = self.graph.now();
        {
            let mut clock = self.shared.clock.lock();
            clock.offset = now;
            clock.pinned = None;
        }
        self.next_start = now;

        *self.shared.duration.write() = metadata.duration;
        let _ = self
            .event_tx
            .send(PlayerEvent::DurationChanged(metadata.duration));
        *self.shared.metadata.write() = Some(metadata.clone());

        self.set_state(PlaybackState::Ready);
        if let Some(reply) = self.pending_load.take() {
            let _ = reply.send(Ok(metadata));
        }
    }

    fn on_chunk(&mut self, chunk: crate::protocol::PcmChunk) {
        let now = self.graph.now();
        let when = if self.next_start > now {
            self.next_start
        } else {
            now
        };
        // Keep the clock honest against the chunk's absolute position; this
        // absorbs scheduling gaps instead of letting them skew the timeline.
        self.shared.clock.lock().offset = when - chunk.start_time;

        let duration = chunk.duration();
        let epoch = self.epoch;
        let command_tx = self.command_tx.clone();
        let id = self.graph.schedule(
            chunk.into(),
            when,
            Box::new(move |id| {
                let _ = command_tx.send(EngineCommand::SourceEnded { epoch, id });
            }),
        );
        self.active.insert(id);
        self.next_start = when + duration;
        self.update_flow_control();
    }

    fn on_seek_done(&mut self, time: f64) {
        debug!("seek landed at {time:.2}s");
        let now = self.graph.now();
        self.next_start = now;
        {
            let mut clock = self.shared.clock.lock();
            clock.offset = now - time;
            clock.pinned = None;
        }
        self.flow_paused = false;
        let _ = self.event_tx.send(PlayerEvent::TimeUpdate(time));
        if *self.shared.state.read() == PlaybackState::Playing {
            self.graph.set_gain(self.volume, SEEK_FADE_SECS);
        }
    }

    fn on_error(&mut self, error: Error) {
        error!("decode failed under {}: {error}", self.epoch);
        // Freeze reported time where it was.
        {
            let now = self.graph.now();
            let mut clock = self.shared.clock.lock();
            if clock.pinned.is_none() {
                clock.pinned = Some((now - clock.offset).max(0.0));
            }
        }
        self.fail(error);
    }

    /// Settle the pending load (if any) with `error`, stop everything, and
    /// enter the error state.
    fn fail(&mut self, error: Error) {
        if let Some(reply) = self.pending_load.take() {
            let _ = reply.send(Err(error.clone()));
        }
        self.clear_sources();
        self.shutdown_worker();
        self.graph.suspend();
        self.set_state(PlaybackState::Error);
        let _ = self.event_tx.send(PlayerEvent::Error(error));
    }

    fn tick(&mut self) {
        if *self.shared.state.read() != PlaybackState::Playing {
            return;
        }
        // No periodic reports while time is pinned to a seek target; the
        // seek itself already reported the target once.
        if self.shared.clock.lock().pinned.is_none() {
            let t = self.shared.current_time(self.graph.now());
            let _ = self.event_tx.send(PlayerEvent::TimeUpdate(t));
        }
        self.update_flow_control();
    }

    fn update_flow_control(&mut self) {
        let buffered = (self.next_start - self.graph.now()).max(0.0);
        if !self.flow_paused && buffered > HIGH_WATER_MARK {
            debug!("{buffered:.1}s buffered, pausing decode");
            self.flow_paused = true;
            self.send_to_worker(WorkerRequest::Pause {
                epoch: self.epoch,
                reason: PauseReason::FlowControl,
            });
        } else if self.flow_paused && !self.decoding_finished && buffered < LOW_WATER_MARK {
            debug!("{buffered:.1}s buffered, resuming decode");
            self.flow_paused = false;
            self.send_to_worker(WorkerRequest::Resume {
                epoch: self.epoch,
                reason: PauseReason::FlowControl,
            });
        }
    }

    /// The stream has ended only when decode hit EOF, every scheduled
    /// source has finished, and we were actually playing.
    fn check_ended(&mut self) {
        if !self.decoding_finished || !self.active.is_empty() {
            return;
        }
        if *self.shared.state.read() != PlaybackState::Playing {
            return;
        }
        info!("playback complete");
        let duration = *self.shared.duration.read();
        self.shared.clock.lock().pinned = Some(duration);
        self.graph.suspend();
        self.set_state(PlaybackState::Idle);
        let _ = self.event_tx.send(PlayerEvent::Ended);
    }

    /// Tear down the current stream: abort any pending load, stop all
    /// sources, shut down the decode worker, and clear stream state.
    fn reset(&mut self) {
        // Minting here invalidates every response the outgoing worker may
        // still have in flight, before anything else can observe them.
        self.epoch = self.epoch.next();
        if let Some(reply) = self.pending_load.take() {
            let _ = reply.send(Err(Error::Aborted));
        }
        self.clear_sources();
        self.shutdown_worker();
        self.decoding_finished = false;
        self.flow_paused = false;
        *self.shared.metadata.write() = None;
        *self.shared.source.write() = None;
        *self.shared.duration.write() = 0.0;
        {
            let mut clock = self.shared.clock.lock();
            clock.offset = self.graph.now();
            clock.pinned = None;
        }
        self.next_start = self.graph.now();
        self.graph.suspend();
    }

    fn clear_sources(&mut self) {
        for id in self.active.drain() {
            self.graph.stop(id);
        }
    }

    fn shutdown_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }

    fn send_to_worker(&self, request: WorkerRequest) {
        if let Some(worker) = &self.worker {
            worker.send(request);
        } else {
            warn!("no decode worker for request {request:?}");
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        let changed = {
            let mut current = self.shared.state.write();
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        };
        if changed {
            debug!("state -> {state:?}");
            let _ = self.event_tx.send(PlayerEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fake::FakeFactory;
    use crate::graph::testing::ManualGraph;
    use crate::protocol::PcmChunk;
    use bytes::Bytes;
    use std::time::Instant;

    struct Rig {
        worker: SchedulerWorker,
        graph: Arc<ManualGraph>,
        events: Receiver<PlayerEvent>,
        commands: Receiver<EngineCommand>,
        responses: Receiver<WorkerResponse>,
    }

    fn rig(factory: FakeFactory) -> Rig {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let graph = Arc::new(ManualGraph::new());
        graph.suspend();

        let worker = SchedulerWorker {
            graph: Arc::clone(&graph) as Arc<dyn OutputGraph>,
            factory: Arc::new(factory),
            shared: Arc::new(EngineShared::default()),
            command_tx,
            command_rx: command_rx.clone(),
            response_tx,
            response_rx: response_rx.clone(),
            event_tx,
            worker: None,
            epoch: Epoch::ZERO,
            next_start: 0.0,
            active: HashSet::new(),
            decoding_finished: false,
            flow_paused: false,
            pending_load: None,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            volume: 1.0,
        };

        Rig {
            worker,
            graph,
            events: event_rx,
            commands: command_rx,
            responses: response_rx,
        }
    }

    impl Rig {
        /// Drive queued commands (fetch results, source-ended callbacks)
        /// and worker responses into the scheduler until both channels
        /// stay quiet.
        fn settle(&mut self) {
            loop {
                crossbeam_channel::select! {
                    recv(self.commands) -> cmd => {
                        if let Ok(cmd) = cmd {
                            let _ = self.worker.handle_command(cmd);
                        }
                    }
                    recv(self.responses) -> resp => {
                        if let Ok(resp) = resp {
                            self.worker.handle_response(resp);
                        }
                    }
                    default(Duration::from_millis(300)) => break,
                }
            }
        }

        /// Feed queued engine commands (source-ended callbacks) into the
        /// scheduler.
        fn pump_commands(&mut self) {
            while let Ok(cmd) = self.commands.try_recv() {
                let _ = self.worker.handle_command(cmd);
            }
        }

        fn drain_events(&self) -> Vec<PlayerEvent> {
            self.events.try_iter().collect()
        }

        fn current_time(&self) -> f64 {
            self.worker.shared.current_time(self.graph.now())
        }

        /// Install a stub decode worker and a live epoch, bypassing load.
        fn install_stub(&mut self) -> (Epoch, Receiver<WorkerRequest>) {
            let (handle, requests) = WorkerHandle::stub();
            self.worker.worker = Some(handle);
            self.worker.epoch = self.worker.epoch.next();
            (self.worker.epoch, requests)
        }
    }

    fn test_resource() -> Resource {
        Resource::Bytes {
            name: "track.fake".into(),
            data: Bytes::from_static(b"pcm"),
        }
    }

    fn silence_chunk(epoch: Epoch, start_time: f64, secs: f64) -> WorkerResponse {
        let frames = (secs * 44100.0) as usize;
        WorkerResponse::Chunk {
            epoch,
            chunk: PcmChunk {
                samples: vec![0.0; frames],
                channels: 1,
                sample_rate: 44100,
                start_time,
            },
        }
    }

    #[test]
    fn test_load_resolves_with_metadata_and_does_not_autoplay() {
        let mut rig = rig(FakeFactory::default());
        let (reply, rx) = oneshot::channel();
        rig.worker.load(test_resource(), reply);
        rig.settle();

        let metadata = rx.blocking_recv().unwrap().unwrap();
        assert!((metadata.duration - 10.0).abs() < f64::EPSILON);
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Ready);
        assert!(rig.current_time().abs() < f64::EPSILON);

        let events = rig.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::StateChanged(PlaybackState::Loading))));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::DurationChanged(d) if (d - 10.0).abs() < 1e-9)));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::StateChanged(PlaybackState::Ready))));
    }

    #[test]
    fn test_chunks_scheduled_contiguously() {
        let mut rig = rig(FakeFactory {
            total_secs: 5.0,
            ..FakeFactory::default()
        });
        let (reply, _rx) = oneshot::channel();
        rig.worker.load(test_resource(), reply);
        rig.settle();

        let starts = rig.graph.scheduled_starts();
        assert_eq!(starts.len(), 5);
        for (i, pair) in starts.windows(2).enumerate() {
            assert!(
                (pair[1] - pair[0] - 1.0).abs() < 1e-9,
                "gap between chunks {i} and {}",
                i + 1
            );
        }
        // Offset math leaves reported time at zero before playback starts.
        assert!(rig.current_time().abs() < f64::EPSILON);
    }

    #[test]
    fn test_stale_epoch_responses_are_dropped() {
        let mut rig = rig(FakeFactory::default());
        let (live, _requests) = rig.install_stub();
        let stale = Epoch::ZERO;

        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: live,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 10.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });

        rig.worker.handle_response(silence_chunk(stale, 0.0, 1.0));
        assert_eq!(rig.graph.active_count(), 0);

        rig.worker.handle_response(silence_chunk(live, 0.0, 1.0));
        assert_eq!(rig.graph.active_count(), 1);

        // A stale EOF must not mark decode finished.
        rig.worker.handle_response(WorkerResponse::Eof { epoch: stale });
        assert!(!rig.worker.decoding_finished);

        // A stale error must not disturb the live stream.
        rig.worker.handle_response(WorkerResponse::Error {
            epoch: stale,
            error: Error::Decode("old stream".into()),
        });
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Ready);
    }

    #[test]
    fn test_seek_pins_time_and_supersedes_old_sources() {
        let mut rig = rig(FakeFactory::default());
        let (first, requests) = rig.install_stub();

        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: first,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 10.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });
        rig.worker.handle_response(silence_chunk(first, 0.0, 1.0));
        rig.worker.handle_response(silence_chunk(first, 1.0, 1.0));
        let _ = rig.worker.handle_command(EngineCommand::Play);
        assert_eq!(rig.graph.active_count(), 2);

        let _ = rig.worker.handle_command(EngineCommand::Seek(5.0));

        // Old sources are stopped, and time reports the target while the
        // seek is in flight, no matter how the clock moves.
        assert_eq!(rig.graph.active_count(), 0);
        rig.graph.advance(1.0);
        assert!((rig.current_time() - 5.0).abs() < f64::EPSILON);

        // A chunk from before the seek is unobservable.
        rig.worker.handle_response(silence_chunk(first, 2.0, 1.0));
        assert_eq!(rig.graph.active_count(), 0);

        let second = first.next();
        let seek_req = requests
            .try_iter()
            .find(|r| matches!(r, WorkerRequest::Seek { .. }));
        match seek_req {
            Some(WorkerRequest::Seek { epoch, time }) => {
                assert_eq!(epoch, second);
                assert!((time - 5.0).abs() < f64::EPSILON);
            }
            other => panic!("expected seek request, got {other:?}"),
        }

        rig.worker
            .handle_response(WorkerResponse::SeekDone { epoch: second, time: 5.0 });
        assert!((rig.current_time() - 5.0).abs() < f64::EPSILON);

        // Post-seek audio runs on the rebased timeline.
        rig.worker.handle_response(silence_chunk(second, 5.0, 1.0));
        assert_eq!(rig.graph.active_count(), 1);
        rig.graph.advance(0.5);
        assert!((rig.current_time() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_seek_clamps_to_duration() {
        let mut rig = rig(FakeFactory::default());
        let (live, requests) = rig.install_stub();
        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: live,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 10.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });

        let _ = rig.worker.handle_command(EngineCommand::Seek(99.0));
        match requests.try_iter().last() {
            Some(WorkerRequest::Seek { time, .. }) => {
                assert!((time - 10.0).abs() < f64::EPSILON);
            }
            other => panic!("expected seek request, got {other:?}"),
        }
    }

    #[test]
    fn test_high_water_pauses_and_low_water_resumes_decode() {
        let mut rig = rig(FakeFactory::default());
        let (live, requests) = rig.install_stub();
        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: live,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 120.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });

        // 50 seconds of audio in 10s chunks crosses the high-water mark on
        // the fourth chunk; the fifth arrives with decode already paused.
        for i in 0..5 {
            rig.worker
                .handle_response(silence_chunk(live, f64::from(i) * 10.0, 10.0));
        }
        assert!(rig.worker.flow_paused);
        let pauses = requests
            .try_iter()
            .filter(|r| {
                matches!(
                    r,
                    WorkerRequest::Pause {
                        reason: PauseReason::FlowControl,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(pauses, 1, "one pause per high-water crossing");

        let _ = rig.worker.handle_command(EngineCommand::Play);
        let _ = requests.try_iter().count(); // discard the user resume

        // Drain below the low-water mark: 41s played leaves 9s buffered,
        // with several sources ending along the way.
        rig.graph.advance(41.0);
        rig.pump_commands();

        assert!(!rig.worker.flow_paused);
        let resumes = requests
            .try_iter()
            .filter(|r| {
                matches!(
                    r,
                    WorkerRequest::Resume {
                        reason: PauseReason::FlowControl,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(resumes, 1, "one resume per low-water crossing");
    }

    #[test]
    fn test_ended_requires_eof_drain_and_playing() {
        let mut rig = rig(FakeFactory::default());
        let (live, _requests) = rig.install_stub();
        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: live,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 1.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });
        rig.worker.handle_response(silence_chunk(live, 0.0, 1.0));
        let _ = rig.worker.handle_command(EngineCommand::Play);

        // EOF alone is not the end; a source is still playing.
        rig.worker.handle_response(WorkerResponse::Eof { epoch: live });
        assert!(!rig
            .drain_events()
            .iter()
            .any(|e| matches!(e, PlayerEvent::Ended)));

        rig.graph.advance(1.5);
        rig.pump_commands();

        let events = rig.drain_events();
        assert!(events.iter().any(|e| matches!(e, PlayerEvent::Ended)));
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Idle);
        // Reported time rests at the duration.
        assert!((rig.current_time() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pause_freezes_clock_and_resume_continues() {
        let mut rig = rig(FakeFactory::default());
        let (live, requests) = rig.install_stub();
        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: live,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 10.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });
        rig.worker.handle_response(silence_chunk(live, 0.0, 5.0));

        let _ = rig.worker.handle_command(EngineCommand::Play);
        rig.graph.advance(2.0);
        assert!((rig.current_time() - 2.0).abs() < 1e-9);

        let _ = rig.worker.handle_command(EngineCommand::Pause);
        assert!(rig.graph.is_suspended());
        rig.graph.advance(60.0);
        assert!((rig.current_time() - 2.0).abs() < 1e-9);
        assert!(requests.try_iter().any(|r| matches!(
            r,
            WorkerRequest::Pause {
                reason: PauseReason::User,
                ..
            }
        )));

        let _ = rig.worker.handle_command(EngineCommand::Play);
        rig.graph.advance(1.0);
        assert!((rig.current_time() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_new_load_aborts_pending_load() {
        let mut rig = rig(FakeFactory::default());

        let (first_reply, first_rx) = oneshot::channel();
        rig.worker.load(test_resource(), first_reply);
        // Do not pump: the first load is still pending when the second
        // arrives.
        let (second_reply, second_rx) = oneshot::channel();
        rig.worker.load(test_resource(), second_reply);
        rig.settle();

        assert!(matches!(
            first_rx.blocking_recv().unwrap(),
            Err(Error::Aborted)
        ));
        let metadata = second_rx.blocking_recv().unwrap().unwrap();
        assert!((metadata.duration - 10.0).abs() < f64::EPSILON);
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Ready);
    }

    #[test]
    fn test_failed_open_rejects_load() {
        let mut rig = rig(FakeFactory {
            fail_init: true,
            ..FakeFactory::default()
        });
        let (reply, rx) = oneshot::channel();
        rig.worker.load(test_resource(), reply);
        rig.settle();

        let err = rx.blocking_recv().unwrap().unwrap_err();
        assert!(matches!(err, Error::CodecInit(_)));
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Error);
        assert!(rig
            .drain_events()
            .iter()
            .any(|e| matches!(e, PlayerEvent::Error(_))));
    }

    #[test]
    fn test_failed_load_invalidates_previous_stream() {
        let mut rig = rig(FakeFactory::default());
        let (old, _requests) = rig.install_stub();
        rig.worker.handle_response(WorkerResponse::Metadata {
            epoch: old,
            metadata: AudioMetadata {
                sample_rate: 44100,
                channels: 1,
                duration: 10.0,
                tags: Default::default(),
                encoding: "fake".into(),
                cover: None,
                bits_per_sample: 16,
            },
        });

        // A chunk from the old stream is still in flight when a new load
        // arrives and its fetch fails.
        let late = silence_chunk(old, 0.0, 1.0);

        let (reply, rx) = oneshot::channel();
        rig.worker
            .load(Resource::Path("/definitely/not/here.mp3".into()), reply);
        rig.settle();

        assert!(matches!(
            rx.blocking_recv().unwrap(),
            Err(Error::Fetch(_))
        ));
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Error);

        // The failed load superseded the old stream even though it never
        // reached a new decoder; the late chunk must not touch the graph.
        rig.worker.handle_response(late);
        assert_eq!(rig.graph.active_count(), 0);
    }

    #[test]
    fn test_midstream_decode_error_stops_playback() {
        let mut rig = rig(FakeFactory {
            fail_after_reads: Some(2),
            ..FakeFactory::default()
        });
        let (reply, rx) = oneshot::channel();
        rig.worker.load(test_resource(), reply);
        rig.settle();

        assert!(rx.blocking_recv().unwrap().is_ok());
        assert_eq!(*rig.worker.shared.state.read(), PlaybackState::Error);
        assert_eq!(rig.graph.active_count(), 0);
        assert!(rig.worker.worker.is_none());
        assert!(rig.drain_events().iter().any(
            |e| matches!(e, PlayerEvent::Error(err) if matches!(err, Error::Decode(_)))
        ));
    }

    #[test]
    fn test_destroy_closes_graph() {
        let mut rig = rig(FakeFactory::default());
        let (reply, _rx) = oneshot::channel();
        rig.worker.load(test_resource(), reply);
        rig.settle();

        assert!(rig.worker.handle_command(EngineCommand::Destroy));
        assert!(rig.graph.is_closed());
    }

    #[test]
    fn test_engine_plays_to_completion() {
        let graph = Arc::new(ManualGraph::new());
        let engine = AudioEngine::with_factory(
            Arc::clone(&graph) as Arc<dyn OutputGraph>,
            Arc::new(FakeFactory {
                total_secs: 2.0,
                ..FakeFactory::default()
            }),
        )
        .unwrap();
        let events = engine.events();

        let metadata = engine.load(test_resource()).wait().unwrap();
        assert!((metadata.duration - 2.0).abs() < f64::EPSILON);
        assert_eq!(engine.state(), PlaybackState::Ready);

        engine.play();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ended = false;
        while Instant::now() < deadline && !ended {
            graph.advance(0.5);
            for event in events.try_iter() {
                if matches!(event, PlayerEvent::Ended) {
                    ended = true;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(ended, "stream never reported ended");
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert!((engine.current_time() - 2.0).abs() < f64::EPSILON);
    }
}
