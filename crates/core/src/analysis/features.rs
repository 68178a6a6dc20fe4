//! Per-frame spectral descriptors.

use crate::{Result, SpectralFeatures};

use super::{
    pitch::{Autocorrelator, PitchEstimate, PITCH_MAX_HZ, PITCH_MIN_HZ},
    transform::SpectralTransform,
};

const SLOPE_MIN_HZ: f32 = 50.0;
const SLOPE_MAX_HZ: f32 = 5_000.0;
const PERIODICITY_CLAMP: (f32, f32) = (0.001, 0.999);

#[derive(Debug)]
pub struct FeatureExtractor {
    sample_rate: f32,
    acf: Autocorrelator,
    previous: Vec<f32>,
    primed: bool,
}

impl FeatureExtractor {
    pub fn new(sample_rate: f32, frame_len: usize) -> Self {
        Self {
            sample_rate,
            acf: Autocorrelator::new(frame_len),
            previous: Vec::new(),
            primed: false,
        }
    }

    /// Drops the previous spectrum so the next flux reads zero.
    pub fn reset(&mut self) {
        self.primed = false;
    }

    pub fn analyze(
        &mut self,
        frame: &[f32],
        pitch: &PitchEstimate,
        transform: &mut SpectralTransform,
    ) -> Result<SpectralFeatures> {
        let bin_hz = transform.bin_hz();
        let magnitudes = transform.magnitudes();
        let centroid_hz = centroid(magnitudes, bin_hz);
        let slope_db_per_khz = slope(magnitudes, bin_hz);
        let flux = self.flux(magnitudes);

        let hnr_db = if pitch.is_voiced() {
            self.acf.compute(frame)?;
            self.harmonic_to_noise(pitch.hz)
        } else {
            0.0
        };
        let cpp_db = cepstral_peak_prominence(transform.cepstrum()?, self.sample_rate);

        Ok(SpectralFeatures {
            centroid_hz,
            slope_db_per_khz,
            flux,
            hnr_db,
            cpp_db,
        })
    }

    fn flux(&mut self, magnitudes: &[f32]) -> f32 {
        if !self.primed || self.previous.len() != magnitudes.len() {
            self.previous.clear();
            self.previous.extend_from_slice(magnitudes);
            self.primed = true;
            return 0.0;
        }
        let mut rise = 0.0;
        let mut total = 0.0;
        for (previous, current) in self.previous.iter_mut().zip(magnitudes) {
            rise += (current - *previous).max(0.0);
            total += current;
            *previous = *current;
        }
        if total <= f32::EPSILON {
            0.0
        } else {
            rise / total
        }
    }

    fn harmonic_to_noise(&self, f0_hz: f32) -> f32 {
        let period = (self.sample_rate / f0_hz).round() as usize;
        let last = self.acf.len().saturating_sub(2);
        if period < 2 || period > last {
            return 0.0;
        }
        let r = (period - 1..=period + 1)
            .map(|lag| self.acf.normalized(lag))
            .fold(f32::MIN, f32::max)
            .clamp(PERIODICITY_CLAMP.0, PERIODICITY_CLAMP.1);
        10.0 * (r / (1.0 - r)).log10()
    }
}

pub fn centroid(magnitudes: &[f32], bin_hz: f32) -> f32 {
    let (weighted, total) = magnitudes
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(weighted, total), (bin, magnitude)| {
            (weighted + bin as f32 * bin_hz * magnitude, total + magnitude)
        });
    if total <= f32::EPSILON {
        0.0
    } else {
        weighted / total
    }
}

/// Least-squares slope of the dB spectrum across the speech band.
pub fn slope(magnitudes: &[f32], bin_hz: f32) -> f32 {
    let first = ((SLOPE_MIN_HZ / bin_hz).ceil() as usize).max(1);
    let last = ((SLOPE_MAX_HZ / bin_hz).floor() as usize).min(magnitudes.len().saturating_sub(1));
    if last <= first + 1 {
        return 0.0;
    }
    let points = magnitudes[first..=last].iter().enumerate().map(|(offset, magnitude)| {
        let khz = (first + offset) as f32 * bin_hz / 1_000.0;
        (khz, 20.0 * magnitude.max(1e-10).log10())
    });
    regression(points).0
}

/// Height of the cepstral peak in the pitch quefrency range above the
/// regression line through that range.
pub fn cepstral_peak_prominence(cepstrum: &[f32], sample_rate: f32) -> f32 {
    let low = ((sample_rate / PITCH_MAX_HZ) as usize).max(2);
    let high = ((sample_rate / PITCH_MIN_HZ) as usize).min(cepstrum.len() / 2);
    if high <= low + 2 {
        return 0.0;
    }
    let (slope, intercept) =
        regression((low..=high).map(|quefrency| (quefrency as f32, cepstrum[quefrency])));
    let Some(peak) = (low..=high).max_by(|a, b| cepstrum[*a].total_cmp(&cepstrum[*b])) else {
        return 0.0;
    };
    (cepstrum[peak] - (slope * peak as f32 + intercept)).max(0.0)
}

/// `(slope, intercept)` of the least-squares line through `points`.
fn regression(points: impl Iterator<Item = (f32, f32)>) -> (f32, f32) {
    let (mut n, mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (x, y) in points {
        let (x, y) = (x as f64, y as f64);
        n += 1.0;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if n < 2.0 || denom.abs() < 1e-12 {
        return (0.0, if n > 0.0 { (sy / n) as f32 } else { 0.0 });
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    (slope as f32, intercept as f32)
}
