use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, TryLockError,
};

use serde::{Deserialize, Serialize};

use crate::{store::StoreShape, Result, VocalScopeError};

pub const SUPPORTED_FFT_SIZES: [usize; 4] = [1024, 2048, 4096, 8192];
pub const SUPPORTED_OVERLAPS: [f32; 5] = [0.5, 0.75, 0.875, 0.9375, 0.96875];
pub const SUPPORTED_ZOOM_FACTORS: [usize; 4] = [2, 4, 8, 16];

const MAX_DISPLAY_BINS: usize = 8192;
const MAX_FORMANTS: usize = 8;
const MAX_HARMONICS: usize = 64;
const MAX_TIME_WINDOW_SECONDS: f32 = 120.0;
/// Upper bound on the feature store size, in `f32` cells (512 MiB).
const MAX_STORE_CELLS: usize = 128 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowFunction {
    Hann,
    Hamming,
    BlackmanHarris,
    Gaussian,
    Kaiser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrequencyScale {
    Linear,
    Log,
    Mel,
    Erb,
    Bark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformType {
    Fft,
    ZoomFft,
    Cqt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReassignMode {
    Off,
    Frequency,
    Time,
    TimeFrequency,
}

impl ReassignMode {
    pub fn reassigns_frequency(self) -> bool {
        matches!(self, Self::Frequency | Self::TimeFrequency)
    }

    pub fn reassigns_time(self) -> bool {
        matches!(self, Self::Time | Self::TimeFrequency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClarityMode {
    None,
    Noise,
    Harmonic,
    Full,
}

impl ClarityMode {
    pub fn removes_noise(self) -> bool {
        matches!(self, Self::Noise | Self::Full)
    }

    pub fn enhances_harmonics(self) -> bool {
        matches!(self, Self::Harmonic | Self::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PitchAlgorithm {
    Yin,
    Pyin,
    Autocorrelation,
    Cepstral,
    Swipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DynamicRangeMode {
    Custom,
    VoiceOptimized,
    Full,
    Compressed,
    NoiseFloor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormalizationMode {
    None,
    Peak,
    Rms,
    AWeighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmoothingMode {
    Off,
    Ema,
    Bilateral,
}

/// Full analysis configuration.
///
/// Any change to a field that feeds [`AnalysisConfig::store_shape`] resizes the
/// feature store; everything else is applied in place on the next hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    pub window: WindowFunction,
    pub overlap: f32,
    pub frequency_scale: FrequencyScale,
    pub transform: TransformType,
    pub reassign: ReassignMode,
    pub clarity: ClarityMode,
    pub pitch_algorithm: PitchAlgorithm,
    pub dynamic_range: DynamicRangeMode,
    pub normalization: NormalizationMode,
    pub smoothing: SmoothingMode,
    pub min_hz: f32,
    pub max_hz: f32,
    pub min_db: f32,
    pub max_db: f32,
    pub time_window_seconds: f32,
    pub high_pass_enabled: bool,
    pub high_pass_hz: f32,
    pub pre_emphasis_enabled: bool,
    pub cqt_bins_per_octave: usize,
    pub zoom_factor: usize,
    pub display_bins: usize,
    pub max_formants: usize,
    pub max_harmonics: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            fft_size: 2048,
            window: WindowFunction::Hann,
            overlap: 0.75,
            frequency_scale: FrequencyScale::Mel,
            transform: TransformType::Fft,
            reassign: ReassignMode::Off,
            clarity: ClarityMode::None,
            pitch_algorithm: PitchAlgorithm::Yin,
            dynamic_range: DynamicRangeMode::Custom,
            normalization: NormalizationMode::None,
            smoothing: SmoothingMode::Ema,
            min_hz: 60.0,
            max_hz: 8_000.0,
            min_db: -90.0,
            max_db: 0.0,
            time_window_seconds: 5.0,
            high_pass_enabled: true,
            high_pass_hz: 60.0,
            pre_emphasis_enabled: false,
            cqt_bins_per_octave: 24,
            zoom_factor: 4,
            display_bins: 512,
            max_formants: 4,
            max_harmonics: 16,
        }
    }
}

impl AnalysisConfig {
    /// Checks every field without touching any analysis state.
    pub fn validate(&self) -> Result<()> {
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(VocalScopeError::config(format!(
                "sample rate {} Hz is outside 8000..=192000",
                self.sample_rate
            )));
        }
        if !SUPPORTED_FFT_SIZES.contains(&self.fft_size) {
            return Err(VocalScopeError::config(format!(
                "unsupported fft size {} (expected one of {SUPPORTED_FFT_SIZES:?})",
                self.fft_size
            )));
        }
        if !SUPPORTED_OVERLAPS
            .iter()
            .any(|overlap| (overlap - self.overlap).abs() < 1e-6)
        {
            return Err(VocalScopeError::config(format!(
                "unsupported overlap {} (expected one of {SUPPORTED_OVERLAPS:?})",
                self.overlap
            )));
        }
        if self.display_bins == 0 || self.display_bins > MAX_DISPLAY_BINS {
            return Err(VocalScopeError::config(format!(
                "display bin count {} must be within 1..={MAX_DISPLAY_BINS}",
                self.display_bins
            )));
        }
        if self.max_formants == 0 || self.max_formants > MAX_FORMANTS {
            return Err(VocalScopeError::config(format!(
                "max formants {} must be within 1..={MAX_FORMANTS}",
                self.max_formants
            )));
        }
        if self.max_harmonics == 0 || self.max_harmonics > MAX_HARMONICS {
            return Err(VocalScopeError::config(format!(
                "max harmonics {} must be within 1..={MAX_HARMONICS}",
                self.max_harmonics
            )));
        }
        if !self.min_hz.is_finite() || !self.max_hz.is_finite() || self.min_hz < 0.0 {
            return Err(VocalScopeError::config("frequency range must be finite and non-negative"));
        }
        if self.max_hz <= self.min_hz {
            return Err(VocalScopeError::config(format!(
                "max frequency {} Hz must exceed min frequency {} Hz",
                self.max_hz, self.min_hz
            )));
        }
        if self.max_hz > self.nyquist() {
            return Err(VocalScopeError::config(format!(
                "max frequency {} Hz exceeds the Nyquist frequency {} Hz",
                self.max_hz,
                self.nyquist()
            )));
        }
        if self.min_hz <= 0.0
            && (self.frequency_scale == FrequencyScale::Log
                || self.transform != TransformType::Fft)
        {
            return Err(VocalScopeError::config(
                "log scale, CQT and zoom FFT need a positive minimum frequency",
            ));
        }
        if !(self.min_db < self.max_db) {
            return Err(VocalScopeError::config(format!(
                "min dB {} must be below max dB {}",
                self.min_db, self.max_db
            )));
        }
        if !(self.time_window_seconds > 0.0 && self.time_window_seconds <= MAX_TIME_WINDOW_SECONDS)
        {
            return Err(VocalScopeError::config(format!(
                "time window {} s must be within (0, {MAX_TIME_WINDOW_SECONDS}]",
                self.time_window_seconds
            )));
        }
        if self.high_pass_enabled && !(10.0..=1_000.0).contains(&self.high_pass_hz) {
            return Err(VocalScopeError::config(format!(
                "high-pass cutoff {} Hz must be within 10..=1000",
                self.high_pass_hz
            )));
        }
        match self.transform {
            TransformType::Cqt => {
                if !(12..=96).contains(&self.cqt_bins_per_octave) {
                    return Err(VocalScopeError::config(format!(
                        "CQT bins per octave {} must be within 12..=96",
                        self.cqt_bins_per_octave
                    )));
                }
                if matches!(
                    self.pitch_algorithm,
                    PitchAlgorithm::Cepstral | PitchAlgorithm::Swipe
                ) {
                    return Err(VocalScopeError::config(format!(
                        "{:?} pitch tracking needs a linear-frequency transform, not CQT",
                        self.pitch_algorithm
                    )));
                }
            }
            TransformType::ZoomFft => {
                if !SUPPORTED_ZOOM_FACTORS.contains(&self.zoom_factor) {
                    return Err(VocalScopeError::config(format!(
                        "zoom factor {} (expected one of {SUPPORTED_ZOOM_FACTORS:?})",
                        self.zoom_factor
                    )));
                }
            }
            TransformType::Fft => {}
        }
        if self.reassign != ReassignMode::Off && self.transform != TransformType::Fft {
            return Err(VocalScopeError::config(
                "reassignment is only available for the plain FFT transform",
            ));
        }
        let cells = self.store_shape().cells();
        if cells > MAX_STORE_CELLS {
            return Err(VocalScopeError::config(format!(
                "feature store would need {cells} cells (limit {MAX_STORE_CELLS}); \
                 shorten the time window or reduce overlap or display bins"
            )));
        }
        Ok(())
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 * 0.5
    }

    /// Samples between consecutive analysis frames.
    pub fn hop_size(&self) -> usize {
        ((self.fft_size as f32 * (1.0 - self.overlap)).round() as usize).max(1)
    }

    /// Number of frames that cover [`AnalysisConfig::time_window_seconds`].
    pub fn frame_capacity(&self) -> usize {
        let hops = self.time_window_seconds * self.sample_rate as f32 / self.hop_size() as f32;
        (hops.ceil() as usize).max(1)
    }

    /// Frequency step of the zoom FFT grid.
    pub fn zoom_resolution_hz(&self) -> f32 {
        self.sample_rate as f32 / (self.zoom_factor * self.fft_size) as f32
    }

    /// Native bin count of the configured transform.
    pub fn analysis_bins(&self) -> usize {
        match self.transform {
            TransformType::Fft => self.fft_size / 2 + 1,
            TransformType::Cqt => {
                let octaves = (self.max_hz / self.min_hz.max(f32::EPSILON)).log2().max(0.0);
                (octaves * self.cqt_bins_per_octave as f32).floor() as usize + 1
            }
            TransformType::ZoomFft => {
                let band = (self.max_hz - self.min_hz).min(self.sample_rate as f32 / self.zoom_factor as f32);
                ((band / self.zoom_resolution_hz()).ceil() as usize + 1).min(self.fft_size)
            }
        }
    }

    pub fn store_shape(&self) -> StoreShape {
        StoreShape {
            capacity: self.frame_capacity(),
            display_bins: self.display_bins,
            analysis_bins: self.analysis_bins(),
            max_formants: self.max_formants,
            max_harmonics: self.max_harmonics,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

/// Live, shared configuration object.
///
/// Consumers edit it through [`SharedConfig::update`]; the producer picks up
/// new revisions without ever waiting on the lock.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<Mutex<AnalysisConfig>>,
    revision: Arc<AtomicU64>,
}

impl SharedConfig {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(config)),
            revision: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Monotonic counter bumped on every accepted update.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Result<AnalysisConfig> {
        Ok(self.lock()?.clone())
    }

    /// Applies `edit` to a copy of the current config and commits it only if
    /// the result validates. A rejected edit leaves the previous config live.
    pub fn update<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut AnalysisConfig),
    {
        let mut guard = self.lock()?;
        let mut candidate = guard.clone();
        edit(&mut candidate);
        if let Err(err) = candidate.validate() {
            tracing::warn!(%err, "rejected configuration update");
            return Err(err);
        }
        if candidate != *guard {
            *guard = candidate;
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Replaces the whole config, with the same validation as [`Self::update`].
    pub fn replace(&self, config: AnalysisConfig) -> Result<()> {
        self.update(|current| *current = config)
    }

    /// Returns the config if its revision is newer than `seen` and the lock is
    /// free right now. Never blocks.
    pub fn try_newer(&self, seen: u64) -> Option<(u64, AnalysisConfig)> {
        if self.revision() == seen {
            return None;
        }
        match self.inner.try_lock() {
            Ok(guard) => Some((self.revision(), guard.clone())),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => {
                Some((self.revision(), poisoned.into_inner().clone()))
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, AnalysisConfig>> {
        self.inner
            .lock()
            .map_err(|_| VocalScopeError::msg("shared configuration has been poisoned"))
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("revision", &self.revision())
            .finish()
    }
}
