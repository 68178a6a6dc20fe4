//! Monophonic pitch tracking.
//!
//! Every algorithm works on the newest FFT frame. The time-domain ones share
//! an FFT-based autocorrelation, so the YIN difference function is
//! `d(τ) = e_head(τ) + e_tail(τ) - 2·r(τ)` rather than a direct double loop.

use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex32, ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{PitchAlgorithm, Result};

use super::transform::SpectralTransform;

pub const PITCH_MIN_HZ: f32 = 50.0;
pub const PITCH_MAX_HZ: f32 = 1_000.0;
const YIN_THRESHOLD: f32 = 0.15;
const ACF_PEAK_RATIO: f32 = 0.9;
const PYIN_THRESHOLDS: usize = 20;
const SWIPE_STEPS_PER_OCTAVE: f32 = 48.0;
/// First harmonic and the prime harmonics up to 20.
const SWIPE_HARMONICS: [usize; 9] = [1, 2, 3, 5, 7, 11, 13, 17, 19];
const MEDIAN_HISTORY: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PitchEstimate {
    /// `0.0` when no periodicity was found.
    pub hz: f32,
    pub confidence: f32,
}

impl PitchEstimate {
    pub fn is_voiced(&self) -> bool {
        self.hz > 0.0
    }
}

/// Linear autocorrelation through a zero-padded real FFT.
pub(crate) struct Autocorrelator {
    len: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    forward_scratch: Vec<Complex32>,
    inverse_scratch: Vec<Complex32>,
    output: Vec<f32>,
    /// `prefix[j]` is the energy of `frame[..j]`.
    prefix: Vec<f32>,
}

impl Autocorrelator {
    pub(crate) fn new(len: usize) -> Self {
        let size = (2 * len).next_power_of_two();
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        Self {
            len,
            input: forward.make_input_vec(),
            spectrum: forward.make_output_vec(),
            forward_scratch: forward.make_scratch_vec(),
            inverse_scratch: inverse.make_scratch_vec(),
            output: inverse.make_output_vec(),
            prefix: vec![0.0; len + 1],
            forward,
            inverse,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Computes `r(τ)` for the newest `len` samples of `frame`.
    pub(crate) fn compute(&mut self, frame: &[f32]) -> Result<()> {
        let frame = &frame[frame.len().saturating_sub(self.len)..];
        self.input.fill(0.0);
        self.input[..frame.len()].copy_from_slice(frame);
        self.prefix[0] = 0.0;
        for index in 0..self.len {
            let sample = frame.get(index).copied().unwrap_or(0.0);
            self.prefix[index + 1] = self.prefix[index] + sample * sample;
        }

        self.forward
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.forward_scratch)?;
        for bin in self.spectrum.iter_mut() {
            *bin = Complex32::new(bin.norm_sqr(), 0.0);
        }
        self.inverse
            .process_with_scratch(&mut self.spectrum, &mut self.output, &mut self.inverse_scratch)?;
        let scale = 1.0 / self.output.len() as f32;
        self.output.iter_mut().for_each(|value| *value *= scale);
        Ok(())
    }

    pub(crate) fn r(&self, lag: usize) -> f32 {
        self.output[lag]
    }

    /// Energy of the first and last `len - lag` samples.
    pub(crate) fn energies(&self, lag: usize) -> (f32, f32) {
        let n = self.len;
        let head = self.prefix[n - lag];
        let tail = self.prefix[n] - self.prefix[lag];
        (head, tail)
    }

    /// Autocorrelation at `lag` normalised to `[-1, 1]`.
    pub(crate) fn normalized(&self, lag: usize) -> f32 {
        let (head, tail) = self.energies(lag);
        let denom = (head * tail).sqrt();
        if denom <= f32::EPSILON {
            0.0
        } else {
            (self.r(lag) / denom).clamp(-1.0, 1.0)
        }
    }
}

impl fmt::Debug for Autocorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autocorrelator")
            .field("len", &self.len)
            .finish()
    }
}

pub struct PitchTracker {
    algorithm: PitchAlgorithm,
    sample_rate: f32,
    min_hz: f32,
    max_hz: f32,
    acf: Autocorrelator,
    cmnd: Vec<f32>,
    pyin_votes: Vec<f32>,
    swipe_scores: Vec<f32>,
    history: [f32; MEDIAN_HISTORY],
    history_len: usize,
}

impl PitchTracker {
    pub fn new(algorithm: PitchAlgorithm, sample_rate: f32, frame_len: usize) -> Self {
        Self::with_range(algorithm, sample_rate, frame_len, PITCH_MIN_HZ, PITCH_MAX_HZ)
    }

    pub fn with_range(
        algorithm: PitchAlgorithm,
        sample_rate: f32,
        frame_len: usize,
        min_hz: f32,
        max_hz: f32,
    ) -> Self {
        Self {
            algorithm,
            sample_rate,
            min_hz,
            max_hz: max_hz.min(sample_rate * 0.45),
            acf: Autocorrelator::new(frame_len),
            cmnd: vec![0.0; frame_len],
            pyin_votes: vec![0.0; frame_len],
            swipe_scores: Vec::new(),
            history: [0.0; MEDIAN_HISTORY],
            history_len: 0,
        }
    }

    pub fn algorithm(&self) -> PitchAlgorithm {
        self.algorithm
    }

    /// Forgets the median history so a fresh activation starts clean.
    pub fn reset(&mut self) {
        self.history = [0.0; MEDIAN_HISTORY];
        self.history_len = 0;
    }

    /// Estimates the pitch of the newest frame. `transform` must already hold
    /// the FFT of the same frame.
    pub fn detect(&mut self, frame: &[f32], transform: &mut SpectralTransform) -> Result<PitchEstimate> {
        let raw = match self.algorithm {
            PitchAlgorithm::Yin => self.yin(frame)?,
            PitchAlgorithm::Pyin => self.pyin(frame)?,
            PitchAlgorithm::Autocorrelation => self.autocorrelation(frame)?,
            PitchAlgorithm::Cepstral => {
                let sample_rate = self.sample_rate;
                let (min_hz, max_hz) = (self.min_hz, self.max_hz);
                cepstral(transform.cepstrum()?, sample_rate, min_hz, max_hz)
            }
            PitchAlgorithm::Swipe => swipe(
                transform.magnitudes(),
                transform.bin_hz(),
                self.min_hz,
                self.max_hz,
                &mut self.swipe_scores,
            ),
        };
        Ok(self.guard(raw))
    }

    /// Replaces an estimate that disagrees with both neighbours by the median
    /// of the last three voiced frames.
    fn guard(&mut self, raw: PitchEstimate) -> PitchEstimate {
        self.history.rotate_left(1);
        self.history[MEDIAN_HISTORY - 1] = raw.hz;
        self.history_len = (self.history_len + 1).min(MEDIAN_HISTORY);
        if !raw.is_voiced()
            || self.history_len < MEDIAN_HISTORY
            || self.history.iter().any(|hz| *hz <= 0.0)
        {
            return raw;
        }
        let mut sorted = self.history;
        sorted.sort_by(f32::total_cmp);
        PitchEstimate {
            hz: sorted[MEDIAN_HISTORY / 2],
            confidence: raw.confidence,
        }
    }

    fn lag_range(&self) -> Option<(usize, usize)> {
        let len = self.acf.len();
        let tau_min = ((self.sample_rate / self.max_hz) as usize).max(1);
        let tau_max = ((self.sample_rate / self.min_hz) as usize).min(len - 1);
        (tau_max > tau_min + 1).then_some((tau_min, tau_max))
    }

    /// Fills `cmnd[..=tau_max]` with the cumulative mean normalised difference.
    fn fill_cmnd(&mut self, frame: &[f32], tau_max: usize) -> Result<()> {
        self.acf.compute(frame)?;
        self.cmnd[0] = 1.0;
        let mut running = 0.0;
        for tau in 1..=tau_max {
            let (head, tail) = self.acf.energies(tau);
            let difference = (head + tail - 2.0 * self.acf.r(tau)).max(0.0);
            running += difference;
            self.cmnd[tau] = if running > 0.0 {
                difference * tau as f32 / running
            } else {
                1.0
            };
        }
        Ok(())
    }

    fn to_estimate(&self, tau: usize, tau_max: usize, confidence: f32) -> PitchEstimate {
        let refined = if tau > 1 && tau < tau_max {
            tau as f32 + parabolic_offset(self.cmnd[tau - 1], self.cmnd[tau], self.cmnd[tau + 1])
        } else {
            tau as f32
        };
        PitchEstimate {
            hz: self.sample_rate / refined,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// First dip below `threshold`, followed down to its local minimum.
    fn first_dip(&self, tau_min: usize, tau_max: usize, threshold: f32) -> Option<usize> {
        let mut tau = (tau_min..=tau_max).find(|tau| self.cmnd[*tau] < threshold)?;
        while tau < tau_max && self.cmnd[tau + 1] < self.cmnd[tau] {
            tau += 1;
        }
        Some(tau)
    }

    fn yin(&mut self, frame: &[f32]) -> Result<PitchEstimate> {
        let Some((tau_min, tau_max)) = self.lag_range() else {
            return Ok(PitchEstimate::default());
        };
        self.fill_cmnd(frame, tau_max)?;
        Ok(match self.first_dip(tau_min, tau_max, YIN_THRESHOLD) {
            Some(tau) => self.to_estimate(tau, tau_max, 1.0 - self.cmnd[tau]),
            None => PitchEstimate::default(),
        })
    }

    /// Probabilistic YIN: each threshold drawn from a Beta(2, 18) prior votes
    /// for its first dip; the most voted lag wins.
    fn pyin(&mut self, frame: &[f32]) -> Result<PitchEstimate> {
        let Some((tau_min, tau_max)) = self.lag_range() else {
            return Ok(PitchEstimate::default());
        };
        self.fill_cmnd(frame, tau_max)?;
        self.pyin_votes[..=tau_max].fill(0.0);

        let mut total = 0.0;
        for step in 1..=PYIN_THRESHOLDS {
            let threshold = step as f32 / (2 * PYIN_THRESHOLDS) as f32;
            let weight = threshold * (1.0 - threshold).powi(17);
            total += weight;
            if let Some(tau) = self.first_dip(tau_min, tau_max, threshold) {
                self.pyin_votes[tau] += weight;
            }
        }

        let best = (tau_min..=tau_max)
            .max_by(|a, b| self.pyin_votes[*a].total_cmp(&self.pyin_votes[*b]))
            .filter(|tau| self.pyin_votes[*tau] > 0.0);
        Ok(match best {
            Some(tau) => {
                let probability = self.pyin_votes[tau] / total.max(f32::EPSILON);
                let periodicity = 1.0 - self.cmnd[tau];
                self.to_estimate(tau, tau_max, probability.max(periodicity * probability.sqrt()))
            }
            None => PitchEstimate::default(),
        })
    }

    fn autocorrelation(&mut self, frame: &[f32]) -> Result<PitchEstimate> {
        let Some((tau_min, tau_max)) = self.lag_range() else {
            return Ok(PitchEstimate::default());
        };
        self.acf.compute(frame)?;
        let acf = &self.acf;
        let peaks = || {
            (tau_min.max(1)..tau_max).filter_map(|tau| {
                let value = acf.normalized(tau);
                (value > acf.normalized(tau - 1) && value >= acf.normalized(tau + 1))
                    .then_some((tau, value))
            })
        };
        let best = peaks().map(|(_, value)| value).fold(0.0f32, f32::max);
        if best <= 0.0 {
            return Ok(PitchEstimate::default());
        }
        let Some((tau, value)) = peaks().find(|(_, value)| *value >= best * ACF_PEAK_RATIO) else {
            return Ok(PitchEstimate::default());
        };
        let offset = parabolic_offset(
            -acf.normalized(tau - 1),
            -value,
            -acf.normalized(tau + 1),
        );
        Ok(PitchEstimate {
            hz: self.sample_rate / (tau as f32 + offset),
            confidence: value.clamp(0.0, 1.0),
        })
    }
}

impl fmt::Debug for PitchTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PitchTracker")
            .field("algorithm", &self.algorithm)
            .field("sample_rate", &self.sample_rate)
            .field("range", &(self.min_hz..self.max_hz))
            .field("history", &self.history)
            .finish()
    }
}

/// Offset of the vertex of the parabola through three points around a
/// minimum, in `[-0.5, 0.5]`.
pub(crate) fn parabolic_offset(left: f32, center: f32, right: f32) -> f32 {
    let denom = 2.0 * (2.0 * center - right - left);
    if denom.abs() <= f32::EPSILON {
        0.0
    } else {
        ((right - left) / denom).clamp(-0.5, 0.5)
    }
}

fn cepstral(cepstrum: &[f32], sample_rate: f32, min_hz: f32, max_hz: f32) -> PitchEstimate {
    let half = cepstrum.len() / 2;
    let low = ((sample_rate / max_hz) as usize).max(2);
    let high = ((sample_rate / min_hz) as usize).min(half.saturating_sub(1));
    if high <= low + 2 {
        return PitchEstimate::default();
    }
    let range = &cepstrum[low..=high];
    let count = range.len() as f32;
    let mean = range.iter().sum::<f32>() / count;
    let deviation = (range.iter().map(|value| (value - mean).powi(2)).sum::<f32>() / count).sqrt();
    let (offset, peak) = range
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |best, (index, value)| {
            if value > best.1 {
                (index, value)
            } else {
                best
            }
        });
    if deviation <= f32::EPSILON {
        return PitchEstimate::default();
    }
    let prominence = (peak - mean) / deviation;
    let confidence = ((prominence - 3.0) / 5.0).clamp(0.0, 1.0);
    if confidence <= 0.0 {
        return PitchEstimate::default();
    }
    let quefrency = low + offset;
    let refined = quefrency as f32
        + parabolic_offset(
            -cepstrum[quefrency - 1],
            -cepstrum[quefrency],
            -cepstrum[quefrency + 1],
        );
    PitchEstimate {
        hz: sample_rate / refined,
        confidence,
    }
}

fn interpolated(magnitudes: &[f32], bin: f32) -> f32 {
    let index = bin.floor() as usize;
    if index + 1 >= magnitudes.len() {
        return 0.0;
    }
    let frac = bin - index as f32;
    magnitudes[index] * (1.0 - frac) + magnitudes[index + 1] * frac
}

/// SWIPE'-style harmonic sieve: positive lobes at the first and prime
/// harmonics, negative lobes half way between them, all on the square root
/// of the magnitude spectrum.
fn swipe(
    magnitudes: &[f32],
    bin_hz: f32,
    min_hz: f32,
    max_hz: f32,
    scores: &mut Vec<f32>,
) -> PitchEstimate {
    let peak = magnitudes.iter().copied().fold(0.0f32, f32::max);
    if peak <= 1e-6 {
        return PitchEstimate::default();
    }
    let nyquist = bin_hz * (magnitudes.len() - 1) as f32;
    let sqrt_peak = peak.sqrt();
    let score = |f0: f32| -> f32 {
        let mut total = 0.0;
        let mut norm = 0.0;
        for k in SWIPE_HARMONICS {
            let hz = k as f32 * f0;
            if hz + 0.5 * f0 >= nyquist {
                break;
            }
            let weight = 1.0 / (k as f32).sqrt();
            let at = |hz: f32| interpolated(magnitudes, hz / bin_hz).sqrt();
            total += weight * (at(hz) - 0.5 * (at(hz - 0.5 * f0) + at(hz + 0.5 * f0)));
            norm += weight * sqrt_peak;
        }
        if norm > 0.0 {
            total / norm
        } else {
            0.0
        }
    };

    let steps = ((max_hz / min_hz).log2() * SWIPE_STEPS_PER_OCTAVE) as usize;
    let candidate = |step: usize| min_hz * 2f32.powf(step as f32 / SWIPE_STEPS_PER_OCTAVE);
    scores.clear();
    scores.extend((0..=steps).map(|step| score(candidate(step))));
    let Some((best, value)) = scores
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
    else {
        return PitchEstimate::default();
    };
    if value <= 0.0 {
        return PitchEstimate::default();
    }
    let offset = if best > 0 && best < steps {
        parabolic_offset(-scores[best - 1], -value, -scores[best + 1])
    } else {
        0.0
    };
    PitchEstimate {
        hz: min_hz * 2f32.powf((best as f32 + offset) / SWIPE_STEPS_PER_OCTAVE),
        confidence: value.clamp(0.0, 1.0),
    }
}
