//! Player-facing backend abstraction.
//!
//! The player UI drives whatever backend is active through this trait, so
//! the streaming engine and any future backend (gapless pipeline, remote
//! renderer) stay interchangeable.

use chorus_core::{Error, Resource, Result};
use crossbeam_channel::Receiver;

use crate::engine::{AudioEngine, LoadRequest, PlaybackState, PlayerEvent};

/// A playback backend the player can drive.
pub trait PlaybackBackend: Send + Sync {
    /// Begin loading a resource, superseding any load in progress.
    fn load(&self, resource: Resource) -> LoadRequest;

    fn play(&self);

    fn pause(&self);

    /// Seek to an absolute stream position in seconds.
    fn seek(&self, time: f64);

    /// Set output volume in `0.0..=1.0`.
    fn set_volume(&self, volume: f32);

    /// Set the playback rate. Backends that cannot time-stretch return
    /// [`Error::RateControlUnsupported`] for any rate other than 1.0.
    fn set_rate(&self, rate: f64) -> Result<()>;

    /// Current stream position in seconds.
    fn current_time(&self) -> f64;

    /// Duration of the loaded stream, 0.0 when nothing is loaded.
    fn duration(&self) -> f64;

    /// True unless audio is actively playing.
    fn paused(&self) -> bool;

    /// Description of the loaded resource, if any.
    fn source(&self) -> Option<String>;

    fn state(&self) -> PlaybackState;

    /// Event stream for the backend.
    fn events(&self) -> Receiver<PlayerEvent>;

    /// Tear the backend down: abort any in-flight load, stop all audio,
    /// release the output device. Further calls are no-ops.
    fn destroy(&self);
}

impl PlaybackBackend for AudioEngine {
    fn load(&self, resource: Resource) -> LoadRequest {
        Self::load(self, resource)
    }

    fn play(&self) {
        Self::play(self);
    }

    fn pause(&self) {
        Self::pause(self);
    }

    fn seek(&self, time: f64) {
        Self::seek(self, time);
    }

    fn set_volume(&self, volume: f32) {
        Self::set_volume(self, volume);
    }

    /// The scheduler resamples once at schedule time and has no
    /// time-stretch stage, so only the native rate is accepted.
    fn set_rate(&self, rate: f64) -> Result<()> {
        if (rate - 1.0).abs() < f64::EPSILON {
            Ok(())
        } else {
            Err(Error::RateControlUnsupported)
        }
    }

    fn current_time(&self) -> f64 {
        Self::current_time(self)
    }

    fn duration(&self) -> f64 {
        Self::duration(self)
    }

    fn paused(&self) -> bool {
        Self::paused(self)
    }

    fn source(&self) -> Option<String> {
        Self::source(self)
    }

    fn state(&self) -> PlaybackState {
        Self::state(self)
    }

    fn events(&self) -> Receiver<PlayerEvent> {
        Self::events(self)
    }

    fn destroy(&self) {
        Self::destroy(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fake::FakeFactory;
    use crate::graph::testing::ManualGraph;
    use crate::graph::OutputGraph;
    use std::sync::Arc;

    #[test]
    fn test_engine_rejects_non_unit_rate() {
        let graph = Arc::new(ManualGraph::new());
        let engine = AudioEngine::with_factory(
            graph as Arc<dyn OutputGraph>,
            Arc::new(FakeFactory::default()),
        )
        .unwrap();

        let backend: &dyn PlaybackBackend = &engine;
        assert!(backend.set_rate(1.0).is_ok());
        assert!(matches!(
            backend.set_rate(1.5),
            Err(Error::RateControlUnsupported)
        ));
    }

    #[test]
    fn test_destroy_through_trait_closes_graph() {
        let graph = Arc::new(ManualGraph::new());
        let engine = AudioEngine::with_factory(
            Arc::clone(&graph) as Arc<dyn OutputGraph>,
            Arc::new(FakeFactory::default()),
        )
        .unwrap();

        let backend: &dyn PlaybackBackend = &engine;
        backend.destroy();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !graph.is_closed() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(graph.is_closed());
    }
}
