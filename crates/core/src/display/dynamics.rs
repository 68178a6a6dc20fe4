use crate::{DynamicRangeMode, SmoothingMode, VoicingState};

/// Smallest visible range the adaptive modes will produce.
const MIN_SPAN_DB: f32 = 6.0;
/// Speech band used to locate voice energy.
const SPEECH_BAND_HZ: (f32, f32) = (80.0, 5_000.0);
const VOICE_HEADROOM_DB: f32 = 6.0;
const VOICE_TRACK_RATE: f32 = 0.2;
/// Share of the configured span added below the floor in compressed mode.
const COMPRESSED_EXTENSION: f32 = 0.5;
const COMPRESSED_KNEE: f32 = 9.0;
const NOISE_PERCENTILE: f32 = 0.2;
const NOISE_ATTACK: f32 = 0.5;
const NOISE_RELEASE: f32 = 0.02;
const NOISE_MARGIN_DB: f32 = 3.0;

const DEFAULT_EMA_ALPHA: f32 = 0.35;
const BILATERAL_RANGE_SIGMA: f32 = 0.1;
const BILATERAL_TIME_SIGMA: f32 = 0.15;

/// Resolves the visible dB window for each frame and maps dB onto `[0, 1]`.
#[derive(Debug, Clone)]
pub struct RangePolicy {
    mode: DynamicRangeMode,
    min_db: f32,
    max_db: f32,
    voice_top_db: Option<f32>,
    noise_floor_db: Option<f32>,
    scratch: Vec<f32>,
}

impl RangePolicy {
    pub fn new(mode: DynamicRangeMode, min_db: f32, max_db: f32) -> Self {
        Self {
            mode,
            min_db,
            max_db,
            voice_top_db: None,
            noise_floor_db: None,
            scratch: Vec::new(),
        }
    }

    pub fn update(&mut self, mode: DynamicRangeMode, min_db: f32, max_db: f32) {
        if mode != self.mode {
            self.reset();
        }
        self.mode = mode;
        self.min_db = min_db;
        self.max_db = max_db;
    }

    pub fn mode(&self) -> DynamicRangeMode {
        self.mode
    }

    /// Configured `(min_db, max_db)`.
    pub fn bounds(&self) -> (f32, f32) {
        (self.min_db, self.max_db)
    }

    pub fn reset(&mut self) {
        self.voice_top_db = None;
        self.noise_floor_db = None;
    }

    /// Visible `(floor, ceiling)` in dB for this frame.
    pub fn resolve(&mut self, db: &[f32], centers: &[f32], voicing: VoicingState) -> (f32, f32) {
        let span = self.max_db - self.min_db;
        match self.mode {
            DynamicRangeMode::Custom => (self.min_db, self.max_db),
            DynamicRangeMode::Full => {
                let (low, high) = db
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(low, high), value| {
                        (low.min(*value), high.max(*value))
                    });
                if !low.is_finite() || !high.is_finite() {
                    return (self.min_db, self.max_db);
                }
                (low, high.max(low + 1.0))
            }
            DynamicRangeMode::Compressed => {
                (self.min_db - span * COMPRESSED_EXTENSION, self.max_db)
            }
            DynamicRangeMode::VoiceOptimized => {
                let band_peak = db
                    .iter()
                    .zip(centers)
                    .filter(|(_, hz)| (SPEECH_BAND_HZ.0..=SPEECH_BAND_HZ.1).contains(*hz))
                    .map(|(value, _)| *value)
                    .fold(f32::NEG_INFINITY, f32::max);
                let top = self.voice_top_db.get_or_insert(self.max_db);
                if voicing.is_voiced() && band_peak.is_finite() {
                    let target = band_peak + VOICE_HEADROOM_DB;
                    *top += (target - *top) * VOICE_TRACK_RATE;
                }
                (*top - span.max(MIN_SPAN_DB), *top)
            }
            DynamicRangeMode::NoiseFloor => {
                self.scratch.clear();
                self.scratch.extend_from_slice(db);
                let estimate = percentile(&mut self.scratch, NOISE_PERCENTILE)
                    .unwrap_or(self.min_db);
                let floor = self.noise_floor_db.get_or_insert(estimate);
                let rate = if estimate < *floor {
                    NOISE_ATTACK
                } else {
                    NOISE_RELEASE
                };
                *floor += (estimate - *floor) * rate;
                let low = (*floor + NOISE_MARGIN_DB).max(self.min_db);
                (low, self.max_db.max(low + MIN_SPAN_DB))
            }
        }
    }

    /// Maps a dB value into `[0, 1]` for the resolved window.
    pub fn normalize(&self, value_db: f32, floor_db: f32, ceiling_db: f32) -> f32 {
        let span = (ceiling_db - floor_db).max(f32::EPSILON);
        let linear = ((value_db - floor_db) / span).clamp(0.0, 1.0);
        match self.mode {
            DynamicRangeMode::Compressed => {
                (1.0 + COMPRESSED_KNEE * linear).ln() / (1.0 + COMPRESSED_KNEE).ln()
            }
            _ => linear,
        }
    }
}

fn percentile(values: &mut [f32], fraction: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let index = ((values.len() - 1) as f32 * fraction).round() as usize;
    let (_, value, _) = values.select_nth_unstable_by(index, f32::total_cmp);
    Some(*value)
}

/// Frame-to-frame smoothing of normalised display values.
#[derive(Debug, Clone)]
pub struct Smoother {
    mode: SmoothingMode,
    alpha: f32,
    previous: Vec<f32>,
    primed: bool,
    spatial: Vec<f32>,
}

impl Smoother {
    pub fn new(mode: SmoothingMode) -> Self {
        Self {
            mode,
            alpha: DEFAULT_EMA_ALPHA,
            previous: Vec::new(),
            primed: false,
            spatial: Vec::new(),
        }
    }

    pub fn mode(&self) -> SmoothingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SmoothingMode) {
        if mode != self.mode {
            self.mode = mode;
            self.reset();
        }
    }

    /// Weight given to the newest frame, clamped to `(0, 1]`.
    pub fn set_alpha(&mut self, alpha: f32) {
        self.alpha = alpha.clamp(0.01, 1.0);
    }

    pub fn reset(&mut self) {
        self.primed = false;
    }

    pub fn apply(&mut self, values: &mut [f32]) {
        if self.mode == SmoothingMode::Off {
            return;
        }
        if !self.primed || self.previous.len() != values.len() {
            self.previous.clear();
            self.previous.extend_from_slice(values);
            self.primed = true;
            if self.mode == SmoothingMode::Ema {
                return;
            }
        }

        match self.mode {
            SmoothingMode::Off => {}
            SmoothingMode::Ema => {
                for (value, previous) in values.iter_mut().zip(self.previous.iter_mut()) {
                    *previous += (*value - *previous) * self.alpha;
                    *value = *previous;
                }
            }
            SmoothingMode::Bilateral => {
                self.spatial.clear();
                self.spatial.extend(values.iter().enumerate().map(|(index, center)| {
                    let mut sum = *center;
                    let mut weight_sum = 1.0;
                    for neighbor in [index.checked_sub(1), Some(index + 1)]
                        .into_iter()
                        .flatten()
                        .filter_map(|neighbor| values.get(neighbor))
                    {
                        let delta = neighbor - center;
                        let weight = (-(delta * delta)
                            / (2.0 * BILATERAL_RANGE_SIGMA * BILATERAL_RANGE_SIGMA))
                            .exp();
                        sum += weight * neighbor;
                        weight_sum += weight;
                    }
                    sum / weight_sum
                }));

                for ((value, previous), spatial) in values
                    .iter_mut()
                    .zip(self.previous.iter_mut())
                    .zip(&self.spatial)
                {
                    let delta = spatial - *previous;
                    let similarity = (-(delta * delta)
                        / (2.0 * BILATERAL_TIME_SIGMA * BILATERAL_TIME_SIGMA))
                        .exp();
                    // Large jumps pass through quickly, small flicker is damped.
                    let rate = self.alpha + (1.0 - self.alpha) * (1.0 - similarity);
                    *previous += delta * rate;
                    *value = *previous;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_range_is_fixed() {
        let mut policy = RangePolicy::new(DynamicRangeMode::Custom, -80.0, -20.0);
        let (low, high) = policy.resolve(&[-50.0], &[1_000.0], VoicingState::Voiced);
        assert_eq!((low, high), (-80.0, -20.0));
        assert_eq!(policy.normalize(-50.0, low, high), 0.5);
        assert_eq!(policy.normalize(0.0, low, high), 1.0);
    }

    #[test]
    fn full_range_spans_frame() {
        let mut policy = RangePolicy::new(DynamicRangeMode::Full, -80.0, 0.0);
        let (low, high) = policy.resolve(&[-70.0, -30.0, -40.0], &[100.0, 200.0, 300.0], VoicingState::Silence);
        assert_eq!((low, high), (-70.0, -30.0));
    }

    #[test]
    fn voice_optimized_follows_voiced_energy_only() {
        let mut policy = RangePolicy::new(DynamicRangeMode::VoiceOptimized, -90.0, 0.0);
        let centers = [200.0, 1_000.0, 10_000.0];
        let loud_high = [-60.0, -40.0, 0.0];
        for _ in 0..50 {
            policy.resolve(&loud_high, &centers, VoicingState::Voiced);
        }
        let (_, top) = policy.resolve(&loud_high, &centers, VoicingState::Voiced);
        assert!((top - -34.0).abs() < 0.5, "top was {top}");

        let (_, held) = policy.resolve(&[-10.0, -10.0, -10.0], &centers, VoicingState::Unvoiced);
        assert_eq!(held, top);
    }

    #[test]
    fn noise_floor_tracks_quiet_bins() {
        let mut policy = RangePolicy::new(DynamicRangeMode::NoiseFloor, -120.0, 0.0);
        let mut frame = vec![-70.0; 20];
        frame[3] = -10.0;
        let centers: Vec<f32> = (0..20).map(|index| index as f32 * 100.0).collect();
        let (low, high) = policy.resolve(&frame, &centers, VoicingState::Voiced);
        assert!((low - -67.0).abs() < 1e-3);
        assert_eq!(high, 0.0);
    }

    #[test]
    fn compressed_curve_lifts_quiet_values() {
        let mut policy = RangePolicy::new(DynamicRangeMode::Compressed, -80.0, 0.0);
        let (low, high) = policy.resolve(&[], &[], VoicingState::Silence);
        assert_eq!(low, -120.0);
        let quiet = policy.normalize(-100.0, low, high);
        assert!(quiet > 0.25);
        assert!((policy.normalize(0.0, low, high) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ema_converges_and_resets() {
        let mut smoother = Smoother::new(SmoothingMode::Ema);
        let mut frame = vec![0.0; 4];
        smoother.apply(&mut frame);
        for _ in 0..40 {
            frame.fill(1.0);
            smoother.apply(&mut frame);
        }
        assert!(frame.iter().all(|value| (value - 1.0).abs() < 1e-3));

        smoother.reset();
        frame.fill(0.0);
        smoother.apply(&mut frame);
        assert!(frame.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn bilateral_damps_flicker_but_follows_steps() {
        let mut smoother = Smoother::new(SmoothingMode::Bilateral);
        let mut frame = vec![0.5; 8];
        smoother.apply(&mut frame);

        let mut flicker = vec![0.52; 8];
        smoother.apply(&mut flicker);
        assert!(flicker[4] < 0.52);

        let mut step = vec![1.0; 8];
        smoother.apply(&mut step);
        assert!(step[4] > 0.9);
    }
}
