//! Live runner: the audio side pushes samples without blocking and a
//! background thread owns the [`VoiceAnalyzer`].

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::{
    capability::{Capabilities, Subscription, SubscriptionHub},
    AnalysisConfig, FeatureStore, Result, SharedConfig, VocalScopeError, VoiceAnalyzer,
};

/// Queue length in seconds of audio.
const QUEUE_SECONDS: usize = 1;
const IDLE_SLEEP: Duration = Duration::from_millis(5);
const DRAIN_CHUNK: usize = 1024;

/// Flags shared between the audio side and the analysis thread.
#[derive(Debug)]
struct LiveState {
    running: AtomicBool,
    reset_requested: AtomicBool,
    dropped: AtomicU64,
}

impl LiveState {
    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Owns the producer thread of a live analysis session.
pub struct LiveAnalyzer {
    producer: HeapProd<f32>,
    state: Arc<LiveState>,
    thread: Option<JoinHandle<Result<()>>>,
    store: FeatureStore,
    hub: SubscriptionHub,
    config: SharedConfig,
}

impl LiveAnalyzer {
    /// Starts the analysis thread with a queue holding one second of audio.
    pub fn start(config: AnalysisConfig) -> Result<Self> {
        let capacity = config.sample_rate as usize * QUEUE_SECONDS;
        Self::with_queue_capacity(config, capacity)
    }

    pub fn with_queue_capacity(config: AnalysisConfig, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(VocalScopeError::InvalidInput(
                "sample queue needs a positive capacity",
            ));
        }
        let analyzer = VoiceAnalyzer::new(config)?;
        let store = analyzer.store();
        let hub = analyzer.hub();
        let shared_config = analyzer.config();

        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        let state = Arc::new(LiveState {
            running: AtomicBool::new(true),
            reset_requested: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let thread_state = state.clone();
        let thread = std::thread::Builder::new()
            .name("vocal-scope-analysis".into())
            .spawn(move || run_analysis_thread(analyzer, consumer, thread_state))?;
        tracing::debug!(capacity, "live analysis started");

        Ok(Self {
            producer,
            state,
            thread: Some(thread),
            store,
            hub,
            config: shared_config,
        })
    }

    /// Queues samples for analysis and returns how many were accepted. Never
    /// blocks; samples that do not fit are dropped and counted.
    pub fn push_samples(&mut self, samples: &[f32]) -> usize {
        let pushed = self.producer.push_slice(samples);
        let dropped = samples.len() - pushed;
        if dropped > 0 {
            self.state.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        pushed
    }

    /// Samples discarded because the queue was full.
    pub fn dropped_samples(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Asks the analysis thread to clear the store before its next hop.
    pub fn request_reset(&self) {
        self.state.reset_requested.store(true, Ordering::Release);
    }

    pub fn store(&self) -> FeatureStore {
        self.store.clone()
    }

    pub fn hub(&self) -> SubscriptionHub {
        self.hub.clone()
    }

    pub fn subscribe(&self, caps: Capabilities) -> Subscription {
        self.hub.subscribe(caps)
    }

    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stops the analysis thread and reports how it ended.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.state.stop();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| VocalScopeError::msg("analysis thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for LiveAnalyzer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(%err, "analysis thread ended with an error");
        }
    }
}

impl std::fmt::Debug for LiveAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveAnalyzer")
            .field("running", &self.state.is_running())
            .field("dropped", &self.dropped_samples())
            .finish()
    }
}

/// Drains the queue into `analyzer` until the state is stopped.
fn run_analysis_thread(
    mut analyzer: VoiceAnalyzer,
    mut consumer: HeapCons<f32>,
    state: Arc<LiveState>,
) -> Result<()> {
    let mut drain = [0.0f32; DRAIN_CHUNK];
    while state.is_running() {
        if state.reset_requested.swap(false, Ordering::AcqRel) {
            analyzer.reset();
        }
        if consumer.occupied_len() == 0 {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }
        let read = consumer.pop_slice(&mut drain);
        if let Err(err) = analyzer.push_samples(&drain[..read]) {
            tracing::error!(%err, "analysis hop failed, stopping");
            state.stop();
            return Err(err);
        }
    }
    tracing::debug!("live analysis stopped");
    Ok(())
}
