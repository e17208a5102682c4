//! Output graph capability.
//!
//! The scheduler does not talk to an audio device directly; it schedules PCM
//! sources onto an [`OutputGraph`] supplied by the caller. The graph owns a
//! clock that advances in wall time while running and freezes while
//! suspended, which is what keeps pause from skewing the clock-offset math.

use crate::protocol::PcmChunk;

/// Identifier for a scheduled source within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// A playable buffer handed to the graph. Samples are planar.
#[derive(Debug)]
pub struct PcmSource {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmSource {
    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Playable duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

impl From<PcmChunk> for PcmSource {
    fn from(chunk: PcmChunk) -> Self {
        Self {
            samples: chunk.samples,
            channels: chunk.channels,
            sample_rate: chunk.sample_rate,
        }
    }
}

/// Callback invoked when a source finishes playing naturally.
///
/// Not invoked for sources removed via [`OutputGraph::stop`].
pub type EndedCallback = Box<dyn FnOnce(SourceId) + Send>;

/// Real-time audio output capability.
pub trait OutputGraph: Send + Sync {
    /// Current clock position in seconds. Monotone while running, frozen
    /// while suspended.
    fn now(&self) -> f64;

    /// Queue `source` to start playing at clock time `when`.
    fn schedule(&self, source: PcmSource, when: f64, on_ended: EndedCallback) -> SourceId;

    /// Remove a queued or playing source without firing its callback.
    fn stop(&self, id: SourceId);

    /// Halt output and freeze the clock.
    fn suspend(&self);

    /// Resume output and the clock.
    fn resume(&self);

    /// Ramp the master gain to `target` over `ramp_secs`.
    fn set_gain(&self, target: f32, ramp_secs: f64);

    /// Release the device. The graph is unusable afterwards.
    fn close(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    //! Graph with a manually driven clock for deterministic tests.

    use parking_lot::Mutex;

    use super::*;

    struct FakeSource {
        id: SourceId,
        start: f64,
        end: f64,
        on_ended: Option<EndedCallback>,
    }

    #[derive(Default)]
    struct Inner {
        now: f64,
        next_id: u64,
        sources: Vec<FakeSource>,
        suspended: bool,
        gain: f32,
        closed: bool,
    }

    /// Test double for [`OutputGraph`]. The clock only moves when a test
    /// calls [`ManualGraph::advance`].
    #[derive(Default)]
    pub struct ManualGraph {
        inner: Mutex<Inner>,
    }

    impl ManualGraph {
        pub fn new() -> Self {
            Self::default()
        }

        /// Advance the clock and fire callbacks of sources that finished.
        pub fn advance(&self, dt: f64) {
            let finished = {
                let mut inner = self.inner.lock();
                if !inner.suspended {
                    inner.now += dt;
                }
                let now = inner.now;
                let mut done = Vec::new();
                inner.sources.retain_mut(|s| {
                    if s.end <= now {
                        if let Some(cb) = s.on_ended.take() {
                            done.push((s.id, cb));
                        }
                        false
                    } else {
                        true
                    }
                });
                done
            };
            for (id, cb) in finished {
                cb(id);
            }
        }

        pub fn active_count(&self) -> usize {
            self.inner.lock().sources.len()
        }

        /// Start times of currently queued sources, in schedule order.
        pub fn scheduled_starts(&self) -> Vec<f64> {
            self.inner.lock().sources.iter().map(|s| s.start).collect()
        }

        pub fn gain(&self) -> f32 {
            self.inner.lock().gain
        }

        pub fn is_suspended(&self) -> bool {
            self.inner.lock().suspended
        }

        pub fn is_closed(&self) -> bool {
            self.inner.lock().closed
        }
    }

    impl OutputGraph for ManualGraph {
        fn now(&self) -> f64 {
            self.inner.lock().now
        }

        fn schedule(&self, source: PcmSource, when: f64, on_ended: EndedCallback) -> SourceId {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = SourceId(inner.next_id);
            let duration = source.duration();
            inner.sources.push(FakeSource {
                id,
                start: when,
                end: when + duration,
                on_ended: Some(on_ended),
            });
            id
        }

        fn stop(&self, id: SourceId) {
            self.inner.lock().sources.retain(|s| s.id != id);
        }

        fn suspend(&self) {
            self.inner.lock().suspended = true;
        }

        fn resume(&self) {
            self.inner.lock().suspended = false;
        }

        fn set_gain(&self, target: f32, _ramp_secs: f64) {
            self.inner.lock().gain = target;
        }

        fn close(&self) {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.sources.clear();
        }
    }

    #[test]
    fn test_manual_graph_fires_ended_on_completion() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let graph = ManualGraph::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let source = PcmSource {
            samples: vec![0.0; 4410],
            channels: 1,
            sample_rate: 44100,
        };
        graph.schedule(
            source,
            0.0,
            Box::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        graph.advance(0.05);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        graph.advance(0.1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(graph.active_count(), 0);
    }

    #[test]
    fn test_manual_graph_stop_suppresses_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let graph = ManualGraph::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let source = PcmSource {
            samples: vec![0.0; 441],
            channels: 1,
            sample_rate: 44100,
        };
        let id = graph.schedule(
            source,
            0.0,
            Box::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        graph.stop(id);
        graph.advance(1.0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_graph_clock_freezes_while_suspended() {
        let graph = ManualGraph::new();
        graph.advance(1.0);
        graph.suspend();
        graph.advance(5.0);
        assert!((graph.now() - 1.0).abs() < f64::EPSILON);
        graph.resume();
        graph.advance(0.5);
        assert!((graph.now() - 1.5).abs() < f64::EPSILON);
    }
}
