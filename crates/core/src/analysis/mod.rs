//! Per-hop analysis driven by the capability scheduler.
//!
//! [`VoiceAnalyzer`] is the single producer of a feature store. It frames the
//! incoming samples into hops, asks the scheduler which stages are wanted,
//! runs only those, and publishes one frame per hop.

mod clarity;
mod features;
mod filter;
mod formant;
mod harmonics;
mod pitch;
mod reassign;
mod speech;
mod transform;
mod window;

use std::fmt;

use tracing::{info, warn};

use crate::{
    capability::{Capabilities, CapabilityScheduler, HopPlan, Subscription, SubscriptionHub},
    display::{grid_for_config, BinMapping},
    store::{feature_store, FeatureStore, FeatureWriter, FrameRecord},
    AnalysisConfig, FormantSample, HarmonicSample, PitchSample, Result, SharedConfig,
    SpectralFeatures, SpeechMetrics, VoicingState, WaveformSample,
};

pub use clarity::ClarityProcessor;
pub use features::{centroid, cepstral_peak_prominence, slope, FeatureExtractor};
pub use filter::{pre_emphasize, Biquad, InputConditioner};
pub use formant::{burg, formants_from_lpc, polynomial_roots, FormantTracker};
pub use harmonics::track_harmonics;
pub use pitch::{PitchEstimate, PitchTracker, PITCH_MAX_HZ, PITCH_MIN_HZ};
pub use reassign::Reassigner;
pub use speech::{intonation_score, SpeechCoach, SpeechFrame};
pub use transform::SpectralTransform;
pub use window::WindowSet;

/// Hops quieter than this are classified as silence.
const SILENCE_DB: f32 = -60.0;
const VOICED_CONFIDENCE: f32 = 0.5;

/// Stages that read the windowed FFT of the newest frame.
const FFT_CONSUMERS: Capabilities = Capabilities::SPECTROGRAM
    .union(Capabilities::LINEAR_MAGNITUDES)
    .union(Capabilities::PITCH)
    .union(Capabilities::HARMONICS)
    .union(Capabilities::SPECTRAL_FEATURES);

/// Everything rebuilt when a new configuration is applied.
struct Stages {
    conditioner: InputConditioner,
    transform: SpectralTransform,
    mapping: BinMapping,
    reassigner: Option<Reassigner>,
    clarity: ClarityProcessor,
    pitch: PitchTracker,
    formants: FormantTracker,
    features: FeatureExtractor,
    speech: SpeechCoach,
    native: Vec<f32>,
}

impl Stages {
    fn new(config: &AnalysisConfig) -> Result<Self> {
        let sample_rate = config.sample_rate as f32;
        let transform = SpectralTransform::new(config)?;
        let mapping = BinMapping::build(
            &grid_for_config(config),
            config.display_bins,
            config.min_hz,
            config.max_hz,
            config.frequency_scale,
        )?;
        let reassigner = (config.reassign != crate::ReassignMode::Off)
            .then(|| Reassigner::new(config.reassign, config.fft_size, config.hop_size()));
        Ok(Self {
            conditioner: InputConditioner::new(
                sample_rate,
                config.high_pass_enabled.then_some(config.high_pass_hz),
                config.pre_emphasis_enabled,
            ),
            native: vec![0.0; transform.analysis_bins()],
            transform,
            mapping,
            reassigner,
            clarity: ClarityProcessor::new(config.clarity),
            pitch: PitchTracker::new(config.pitch_algorithm, sample_rate, config.fft_size),
            formants: FormantTracker::new(sample_rate, config.fft_size),
            features: FeatureExtractor::new(sample_rate, config.fft_size),
            speech: SpeechCoach::new(config.hop_size() as f32 / sample_rate),
        })
    }

    fn reset(&mut self) {
        self.conditioner.reset();
        self.clarity.reset();
        self.pitch.reset();
        self.features.reset();
        self.speech.reset();
    }

    fn rearm(&mut self, plan: &HopPlan) {
        if plan.activated(Capabilities::SPECTROGRAM) {
            self.clarity.reset();
        }
        if plan.activated(Capabilities::PITCH) {
            self.pitch.reset();
        }
        if plan.activated(Capabilities::SPECTRAL_FEATURES) {
            self.features.reset();
        }
        if plan.activated(Capabilities::SPEECH_METRICS) {
            self.speech.reset();
        }
    }
}

/// Single producer of a [`FeatureStore`].
pub struct VoiceAnalyzer {
    config: SharedConfig,
    revision: u64,
    current: AnalysisConfig,
    scheduler: CapabilityScheduler,
    writer: FeatureWriter,
    store: FeatureStore,
    stages: Stages,
    /// Conditioned samples, newest last, exactly as long as the transform needs.
    history: Vec<f32>,
    /// Raw samples of the hop being collected.
    hop: Vec<f32>,
    record: FrameRecord,
}

impl VoiceAnalyzer {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        Self::with_shared_config(SharedConfig::new(config)?)
    }

    /// Analyzer that follows edits made through `config` (or its clones).
    pub fn with_shared_config(config: SharedConfig) -> Result<Self> {
        let revision = config.revision();
        let current = config.snapshot()?;
        current.validate()?;
        let stages = Stages::new(&current)?;
        let shape = current.store_shape();
        let (writer, store) = feature_store(shape);
        Ok(Self {
            history: vec![0.0; stages.transform.required_samples()],
            hop: Vec::with_capacity(current.hop_size()),
            record: FrameRecord::new(&shape),
            config,
            revision,
            current,
            scheduler: CapabilityScheduler::new(),
            writer,
            store,
            stages,
        })
    }

    /// Read handle for consumers.
    pub fn store(&self) -> FeatureStore {
        self.store.clone()
    }

    /// Handle consumers on other threads use to subscribe.
    pub fn hub(&self) -> SubscriptionHub {
        self.scheduler.hub()
    }

    pub fn subscribe(&self, caps: Capabilities) -> Subscription {
        self.scheduler.subscribe(caps)
    }

    /// The live configuration shared with consumers.
    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    /// Configuration the stages are currently built for.
    pub fn current_config(&self) -> &AnalysisConfig {
        &self.current
    }

    pub fn active_capabilities(&self) -> Capabilities {
        self.scheduler.active()
    }

    /// Commits `config` to the shared config and applies it immediately.
    /// Nothing changes if it does not validate.
    pub fn apply_config(&mut self, config: AnalysisConfig) -> Result<()> {
        config.validate()?;
        self.config.replace(config.clone())?;
        self.revision = self.config.revision();
        self.apply(config)
    }

    /// Feeds samples and returns how many frames were published.
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<usize> {
        let mut published = 0;
        for &sample in samples {
            if self.hop.is_empty() {
                self.pick_up_config();
            }
            self.hop.push(sample);
            if self.hop.len() >= self.current.hop_size() {
                self.run_hop()?;
                self.hop.clear();
                published += 1;
            }
        }
        Ok(published)
    }

    /// Clears the store and every stage's history, as on pause.
    pub fn reset(&mut self) {
        self.writer.reset();
        self.history.fill(0.0);
        self.hop.clear();
        self.stages.reset();
        self.record = FrameRecord::new(&self.writer.shape());
        self.scheduler.rearm();
    }

    fn pick_up_config(&mut self) {
        let Some((revision, config)) = self.config.try_newer(self.revision) else {
            return;
        };
        self.revision = revision;
        if config == self.current {
            return;
        }
        if let Err(err) = self.apply(config) {
            warn!(%err, "keeping previous analysis configuration");
        }
    }

    fn apply(&mut self, config: AnalysisConfig) -> Result<()> {
        config.validate()?;
        let stages = Stages::new(&config)?;
        let shape = config.store_shape();
        if self.writer.resize(shape) {
            self.record = FrameRecord::new(&shape);
        }
        let required = stages.transform.required_samples();
        if required != self.history.len() || config.hop_size() != self.current.hop_size() {
            self.history = vec![0.0; required];
            self.hop.clear();
        }
        info!(
            fft_size = config.fft_size,
            hop = config.hop_size(),
            transform = ?config.transform,
            display_bins = config.display_bins,
            "applied analysis configuration"
        );
        self.stages = stages;
        self.current = config;
        self.scheduler.rearm();
        Ok(())
    }

    fn run_hop(&mut self) -> Result<i64> {
        let Self {
            scheduler,
            writer,
            stages,
            history,
            hop,
            record,
            ..
        } = self;

        let advance = hop.len().min(history.len());
        history.copy_within(advance.., 0);
        let tail = history.len() - advance;
        for (slot, sample) in history[tail..].iter_mut().zip(&hop[hop.len() - advance..]) {
            *slot = stages.conditioner.process(*sample);
        }
        let history: &[f32] = history;
        let hop: &[f32] = hop;

        let plan = scheduler.begin_hop();
        stages.rearm(&plan);
        if !plan.activated.is_empty() {
            writer.mark_activated(plan.activated);
        }
        clear_deactivated(record, plan.deactivated);

        let frame = &history[history.len() - stages.transform.fft_size()..];
        if plan.runs(FFT_CONSUMERS) {
            stages.transform.analyze(history)?;
        }

        let rms_db = 20.0 * rms(hop).max(1e-10).log10();
        let wants_pitch = plan.runs(Capabilities::PITCH)
            || (plan.runs(Capabilities::SPECTROGRAM) && stages.clarity.mode().enhances_harmonics());
        let mut pitch = if wants_pitch {
            stages.pitch.detect(frame, &mut stages.transform)?
        } else {
            PitchEstimate::default()
        };
        let voicing = if rms_db < SILENCE_DB {
            pitch = PitchEstimate::default();
            VoicingState::Silence
        } else if pitch.is_voiced() && pitch.confidence >= VOICED_CONFIDENCE {
            VoicingState::Voiced
        } else {
            VoicingState::Unvoiced
        };

        if plan.runs(Capabilities::SPECTROGRAM | Capabilities::LINEAR_MAGNITUDES) {
            stages.transform.native(history, &mut stages.native)?;
        }
        if plan.runs(Capabilities::LINEAR_MAGNITUDES) {
            copy_padded(&stages.native, &mut record.linear_magnitudes);
        }
        if plan.runs(Capabilities::SPECTROGRAM) {
            match stages.reassigner.as_mut() {
                Some(reassigner) => reassigner.accumulate(
                    frame,
                    &stages.transform,
                    &stages.mapping,
                    &mut record.spectrogram,
                )?,
                None => stages.mapping.reduce(&stages.native, &mut record.spectrogram),
            }
            stages.clarity.apply(
                &mut record.spectrogram,
                stages.mapping.center_frequencies(),
                pitch.hz,
            );
        }
        if plan.runs(Capabilities::PITCH) {
            record.pitch = PitchSample {
                hz: pitch.hz,
                confidence: pitch.confidence,
                voicing,
            };
        }
        if plan.runs(Capabilities::FORMANTS) {
            if voicing == VoicingState::Silence {
                record.formants.fill(FormantSample::default());
            } else {
                stages.formants.analyze(frame, &mut record.formants);
            }
        }
        if plan.runs(Capabilities::HARMONICS) {
            let f0 = if voicing.is_voiced() { pitch.hz } else { 0.0 };
            track_harmonics(
                stages.transform.magnitudes(),
                stages.transform.bin_hz(),
                f0,
                &mut record.harmonics,
            );
        }
        if plan.runs(Capabilities::WAVEFORM) {
            record.waveform = hop.iter().fold(
                WaveformSample {
                    min: f32::MAX,
                    max: f32::MIN,
                },
                |envelope, sample| WaveformSample {
                    min: envelope.min.min(*sample),
                    max: envelope.max.max(*sample),
                },
            );
        }
        if plan.runs(Capabilities::SPECTRAL_FEATURES) {
            record.spectral = stages.features.analyze(frame, &pitch, &mut stages.transform)?;
        }
        if plan.runs(Capabilities::SPEECH_METRICS) {
            record.speech = stages.speech.update(SpeechFrame {
                rms_db,
                voicing,
                pitch_hz: pitch.hz,
                confidence: pitch.confidence,
            });
        }

        Ok(writer.publish(record))
    }
}

impl fmt::Debug for VoiceAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceAnalyzer")
            .field("revision", &self.revision)
            .field("transform", &self.stages.transform)
            .field("scheduler", &self.scheduler)
            .field("writer", &self.writer)
            .finish()
    }
}

/// Resets the record slots of stages that just went idle so their stored
/// values stop changing.
fn clear_deactivated(record: &mut FrameRecord, deactivated: Capabilities) {
    if deactivated.is_empty() {
        return;
    }
    if deactivated.intersects(Capabilities::SPECTROGRAM) {
        record.spectrogram.fill(0.0);
    }
    if deactivated.intersects(Capabilities::LINEAR_MAGNITUDES) {
        record.linear_magnitudes.fill(0.0);
    }
    if deactivated.intersects(Capabilities::PITCH) {
        record.pitch = PitchSample::default();
    }
    if deactivated.intersects(Capabilities::FORMANTS) {
        record.formants.fill(FormantSample::default());
    }
    if deactivated.intersects(Capabilities::HARMONICS) {
        record.harmonics.fill(HarmonicSample::default());
    }
    if deactivated.intersects(Capabilities::WAVEFORM) {
        record.waveform = WaveformSample::default();
    }
    if deactivated.intersects(Capabilities::SPECTRAL_FEATURES) {
        record.spectral = SpectralFeatures::default();
    }
    if deactivated.intersects(Capabilities::SPEECH_METRICS) {
        record.speech = SpeechMetrics::default();
    }
}

fn copy_padded(source: &[f32], dest: &mut [f32]) {
    let len = source.len().min(dest.len());
    dest[..len].copy_from_slice(&source[..len]);
    dest[len..].fill(0.0);
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;
    use crate::{
        display::DisplayPipeline,
        store::{family, FeatureCursor},
        FrequencyScale, PitchAlgorithm,
    };

    fn voice(f0: f32, start: usize, len: usize) -> Vec<f32> {
        (start..start + len)
            .map(|index| {
                let t = index as f32 / 48_000.0;
                (1..=12)
                    .map(|h| (2.0 * PI * f0 * h as f32 * t).sin() / h as f32)
                    .sum::<f32>()
                    * 0.3
            })
            .collect()
    }

    fn latest<F: crate::store::FeatureFamily>(
        cursor: &mut FeatureCursor<F>,
        store: &FeatureStore,
    ) -> Vec<F::Item> {
        let update = cursor.poll(store).unwrap();
        cursor.frame(update.latest_frame_id).unwrap().to_vec()
    }

    #[test]
    fn publishes_one_frame_per_hop() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        assert_eq!(store.latest_frame_id(), -1);

        let published = analyzer.push_samples(&vec![0.0; 512 * 4 + 100]).unwrap();
        assert_eq!(published, 4);
        assert_eq!(store.latest_frame_id(), 3);
        assert_eq!(store.available_frames(), 4);
    }

    #[test]
    fn pitch_stops_changing_after_unsubscribe() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        let mut cursor = FeatureCursor::<family::Pitch>::new();

        let subscription = analyzer.subscribe(Capabilities::PITCH);
        analyzer.push_samples(&voice(200.0, 0, 48_000 / 4)).unwrap();
        let voiced = latest(&mut cursor, &store)[0];
        assert!((voiced.hz - 200.0).abs() < 4.0, "{voiced:?}");
        assert_eq!(voiced.voicing, VoicingState::Voiced);

        drop(subscription);
        analyzer.push_samples(&voice(300.0, 12_000, 4_096)).unwrap();
        let first = cursor.poll(&store).unwrap();
        let frozen: Vec<PitchSample> = (first.latest_frame_id - 6..=first.latest_frame_id)
            .map(|id| cursor.frame(id).unwrap()[0])
            .collect();
        assert!(frozen.iter().all(|sample| *sample == PitchSample::default()));

        analyzer.push_samples(&voice(300.0, 16_096, 4_096)).unwrap();
        assert_eq!(latest(&mut cursor, &store)[0], PitchSample::default());
    }

    #[test]
    fn idle_stages_leave_slots_empty() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        let _waveform = analyzer.subscribe(Capabilities::WAVEFORM);
        analyzer.push_samples(&voice(200.0, 0, 4_096)).unwrap();

        let mut waveform = FeatureCursor::<family::Waveform>::new();
        let envelope = latest(&mut waveform, &store)[0];
        assert!(envelope.max > 0.1 && envelope.min < -0.1, "{envelope:?}");

        let mut formants = FeatureCursor::<family::Formants>::new();
        assert!(latest(&mut formants, &store)
            .iter()
            .all(|sample| *sample == FormantSample::default()));
    }

    #[test]
    fn spectrogram_column_peaks_at_tone() {
        let config = AnalysisConfig {
            frequency_scale: FrequencyScale::Log,
            display_bins: 256,
            ..AnalysisConfig::default()
        };
        let mut analyzer = VoiceAnalyzer::new(config.clone()).unwrap();
        let store = analyzer.store();
        let _spectrogram = analyzer.subscribe(Capabilities::SPECTROGRAM);
        let tone: Vec<f32> = (0..8_192)
            .map(|index| 0.5 * (2.0 * PI * 1_000.0 * index as f32 / 48_000.0).sin())
            .collect();
        analyzer.push_samples(&tone).unwrap();

        let mut cursor = FeatureCursor::<family::Spectrogram>::new();
        let column = latest(&mut cursor, &store);
        let loudest = column
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin)
            .unwrap();
        let pipeline = DisplayPipeline::from_config(&config).unwrap();
        let center = pipeline.center_frequencies()[loudest];
        assert!((center - 1_000.0).abs() < 40.0, "peak at {center} Hz");
    }

    #[test]
    fn picks_up_shared_config_at_hop_start() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        let version = store.data_version();
        analyzer.push_samples(&vec![0.0; 1_024]).unwrap();
        assert_eq!(store.latest_frame_id(), 1);

        let shared = analyzer.config();
        shared.update(|config| config.display_bins = 256).unwrap();
        assert!(shared.update(|config| config.fft_size = 3_000).is_err());

        analyzer.push_samples(&vec![0.0; 512]).unwrap();
        assert_eq!(store.display_bins(), 256);
        assert!(store.data_version() > version);
        assert_eq!(store.latest_frame_id(), 0);
        assert_eq!(analyzer.current_config().display_bins, 256);
    }

    #[test]
    fn apply_config_rejects_invalid_settings() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let invalid = AnalysisConfig {
            min_hz: 5_000.0,
            max_hz: 100.0,
            ..AnalysisConfig::default()
        };
        assert!(analyzer.apply_config(invalid).is_err());
        assert_eq!(analyzer.current_config(), &AnalysisConfig::default());
        assert_eq!(analyzer.config().snapshot().unwrap(), AnalysisConfig::default());
    }

    #[test]
    fn speech_metrics_pull_in_their_dependencies() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        let _speech = analyzer.subscribe(Capabilities::SPEECH_METRICS);
        analyzer.push_samples(&voice(180.0, 0, 48_000)).unwrap();
        assert!(analyzer
            .active_capabilities()
            .contains(Capabilities::PITCH | Capabilities::VOICING | Capabilities::WAVEFORM));

        let mut speech = FeatureCursor::<family::Speech>::new();
        let metrics = latest(&mut speech, &store)[0];
        assert_eq!(metrics.speaking, 1.0);
        assert!(metrics.clarity_score > 0.5, "{metrics:?}");
    }

    #[test]
    fn reset_rewinds_the_store() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        analyzer.push_samples(&vec![0.1; 4_096]).unwrap();
        assert_eq!(store.latest_frame_id(), 7);
        analyzer.reset();
        assert_eq!(store.latest_frame_id(), -1);
        assert_eq!(store.available_frames(), 0);
        analyzer.push_samples(&vec![0.1; 512]).unwrap();
        assert_eq!(store.latest_frame_id(), 0);
    }

    #[test]
    fn resubscribing_marks_a_discontinuity() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        let mut cursor = FeatureCursor::<family::Pitch>::new();
        let hop = analyzer.current_config().hop_size();

        let pitch = analyzer.subscribe(Capabilities::PITCH);
        analyzer.push_samples(&voice(200.0, 0, hop * 4)).unwrap();
        cursor.poll(&store).unwrap();
        analyzer.push_samples(&voice(200.0, hop * 4, hop)).unwrap();
        assert!(!cursor.poll(&store).unwrap().discontinuity);

        drop(pitch);
        analyzer.push_samples(&voice(200.0, hop * 5, hop)).unwrap();
        assert!(!cursor.poll(&store).unwrap().discontinuity);

        let _pitch = analyzer.subscribe(Capabilities::PITCH);
        analyzer.push_samples(&voice(200.0, hop * 6, hop)).unwrap();
        assert!(cursor.poll(&store).unwrap().discontinuity);
    }

    #[test]
    fn config_change_without_resize_marks_a_discontinuity() {
        let mut analyzer = VoiceAnalyzer::new(AnalysisConfig::default()).unwrap();
        let store = analyzer.store();
        let mut cursor = FeatureCursor::<family::Pitch>::new();
        let _pitch = analyzer.subscribe(Capabilities::PITCH);
        analyzer.push_samples(&voice(200.0, 0, 2_048)).unwrap();
        cursor.poll(&store).unwrap();

        let version = store.data_version();
        let config = AnalysisConfig {
            pitch_algorithm: PitchAlgorithm::Autocorrelation,
            ..AnalysisConfig::default()
        };
        analyzer.apply_config(config).unwrap();
        analyzer.push_samples(&voice(200.0, 2_048, 512)).unwrap();
        assert_eq!(store.data_version(), version);
        assert!(cursor.poll(&store).unwrap().discontinuity);
    }
}
