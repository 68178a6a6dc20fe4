//! LPC formant estimation.

use std::f64::consts::PI;

use realfft::num_complex::Complex64;

use crate::{FormantSample, WindowFunction};

use super::filter::pre_emphasize;

/// Target rate after decimation; formants above ~5 kHz are not tracked.
const TARGET_RATE_HZ: f32 = 11_025.0;
const MAX_LPC_ORDER: usize = 16;
const PRE_EMPHASIS: f32 = 0.97;
const MIN_FORMANT_HZ: f64 = 90.0;
const MAX_FORMANT_HZ: f64 = 5_500.0;
const MAX_BANDWIDTH_HZ: f64 = 3_500.0;
const MIN_POLE_RADIUS: f64 = 0.80;
const MAX_POLE_RADIUS: f64 = 0.9995;
const MIN_POLE_IMAG: f64 = 0.001;
const ROOT_ITERATIONS: usize = 100;
const ROOT_TOLERANCE: f64 = 1e-10;
const SILENCE_RMS: f64 = 1e-5;

/// Burg-method LPC coefficients `[1, a1, …, ap]`.
pub fn burg(signal: &[f64], order: usize) -> Vec<f64> {
    let mut lpc = LpcScratch::default();
    lpc.burg(signal, order);
    lpc.coeffs
}

/// All roots of the monic polynomial `coeffs[0]·z^p + … + coeffs[p]`
/// by Durand–Kerner iteration.
pub fn polynomial_roots(coeffs: &[f64]) -> Vec<Complex64> {
    let mut lpc = LpcScratch::default();
    lpc.coeffs.extend_from_slice(coeffs);
    lpc.solve_roots();
    lpc.roots
}

/// Formants from LPC poles, ascending by frequency.
pub fn formants_from_lpc(
    coeffs: &[f64],
    sample_rate: f64,
    min_hz: f64,
    max_hz: f64,
) -> Vec<FormantSample> {
    let mut lpc = LpcScratch::default();
    lpc.coeffs.extend_from_slice(coeffs);
    lpc.solve_roots();
    lpc.collect_formants(sample_rate, min_hz, max_hz);
    lpc.formants
}

/// Buffers reused from one LPC analysis to the next.
#[derive(Debug, Clone, Default)]
struct LpcScratch {
    coeffs: Vec<f64>,
    previous: Vec<f64>,
    forward: Vec<f64>,
    backward: Vec<f64>,
    monic: Vec<f64>,
    roots: Vec<Complex64>,
    formants: Vec<FormantSample>,
}

impl LpcScratch {
    /// Fills `coeffs` with the Burg LPC fit of `signal`.
    fn burg(&mut self, signal: &[f64], order: usize) {
        let Self {
            coeffs,
            previous,
            forward,
            backward,
            ..
        } = self;
        let n = signal.len();
        coeffs.clear();
        coeffs.resize(order + 1, 0.0);
        coeffs[0] = 1.0;
        previous.clear();
        previous.resize(order + 1, 0.0);
        forward.clear();
        forward.extend_from_slice(signal);
        backward.clear();
        backward.extend_from_slice(signal);

        for m in 1..=order.min(n.saturating_sub(1)) {
            let (num, den) = (m..n).fold((0.0, 0.0), |(num, den), j| {
                (
                    num + forward[j] * backward[j - 1],
                    den + forward[j] * forward[j] + backward[j - 1] * backward[j - 1],
                )
            });
            if den <= 1e-12 {
                break;
            }
            let k = -2.0 * num / den;

            previous.copy_from_slice(coeffs);
            coeffs[m] = k;
            for i in 1..m {
                coeffs[i] = previous[i] + k * previous[m - i];
            }
            for j in m..n {
                let f = forward[j];
                let b = backward[j - 1];
                forward[j] = f + k * b;
                backward[j - 1] = b + k * f;
            }
        }
    }

    /// Fills `roots` with the roots of the polynomial in `coeffs`.
    fn solve_roots(&mut self) {
        let Self {
            coeffs,
            monic,
            roots,
            ..
        } = self;
        roots.clear();
        let degree = coeffs.len().saturating_sub(1);
        if degree == 0 || coeffs[0].abs() < 1e-12 {
            return;
        }
        let lead = coeffs[0];
        monic.clear();
        monic.extend(coeffs.iter().map(|c| c / lead));

        roots.extend(
            (0..degree)
                .map(|k| Complex64::from_polar(0.9, 2.0 * PI * k as f64 / degree as f64 + 0.4)),
        );
        for _ in 0..ROOT_ITERATIONS {
            let mut converged = true;
            for i in 0..degree {
                let current = roots[i];
                let denom = roots
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .fold(Complex64::new(1.0, 0.0), |acc, (_, other)| acc * (current - other));
                let value = monic
                    .iter()
                    .fold(Complex64::new(0.0, 0.0), |acc, c| acc * current + c);
                let delta = if denom.norm() < 1e-14 {
                    Complex64::new(1e-6, 1e-6)
                } else {
                    value / denom
                };
                roots[i] = current - delta;
                if delta.norm() > ROOT_TOLERANCE {
                    converged = false;
                }
            }
            if converged {
                break;
            }
        }
    }

    /// Keeps the resonant poles of `roots` as formants, ascending.
    fn collect_formants(&mut self, sample_rate: f64, min_hz: f64, max_hz: f64) {
        let max_hz = max_hz.min(sample_rate * 0.5 * 0.9);
        let min_hz = min_hz.max(0.0);
        let Self {
            roots, formants, ..
        } = self;
        formants.clear();
        formants.extend(roots.iter().filter(|root| root.im > MIN_POLE_IMAG).filter_map(|root| {
            let radius = root.norm();
            if radius <= MIN_POLE_RADIUS || radius >= MAX_POLE_RADIUS {
                return None;
            }
            let frequency = root.arg() * sample_rate / (2.0 * PI);
            let bandwidth = -sample_rate / PI * radius.ln();
            let in_range = (min_hz..=max_hz).contains(&frequency)
                && bandwidth > 0.0
                && bandwidth <= MAX_BANDWIDTH_HZ;
            in_range.then_some(FormantSample {
                frequency_hz: frequency as f32,
                bandwidth_hz: bandwidth as f32,
            })
        }));
        formants.sort_unstable_by(|a, b| a.frequency_hz.total_cmp(&b.frequency_hz));
    }
}

/// Per-frame formant tracker with fixed decimation and LPC order.
#[derive(Debug, Clone)]
pub struct FormantTracker {
    decimation: usize,
    rate: f64,
    order: usize,
    window: Vec<f32>,
    decimated: Vec<f32>,
    signal: Vec<f64>,
    lpc: LpcScratch,
}

impl FormantTracker {
    pub fn new(sample_rate: f32, frame_len: usize) -> Self {
        let decimation = ((sample_rate / TARGET_RATE_HZ).round() as usize).max(1);
        let rate = sample_rate as f64 / decimation as f64;
        let order = (2 + (rate / 1_000.0) as usize).min(MAX_LPC_ORDER);
        let len = frame_len / decimation;
        Self {
            decimation,
            rate,
            order,
            window: WindowFunction::Hamming.coefficients(len),
            decimated: vec![0.0; len],
            signal: vec![0.0; len],
            lpc: LpcScratch::default(),
        }
    }

    pub fn lpc_order(&self) -> usize {
        self.order
    }

    /// Writes formants into `out`, zero-filling unused slots, and returns how
    /// many were found.
    pub fn analyze(&mut self, frame: &[f32], out: &mut [FormantSample]) -> usize {
        out.fill(FormantSample::default());
        let len = self.decimated.len();
        let needed = len * self.decimation;
        if frame.len() < needed || len <= self.order {
            return 0;
        }
        let frame = &frame[frame.len() - needed..];
        for (slot, chunk) in self.decimated.iter_mut().zip(frame.chunks_exact(self.decimation)) {
            *slot = chunk.iter().sum::<f32>() / self.decimation as f32;
        }
        let mean = self.decimated.iter().sum::<f32>() / len as f32;
        self.decimated.iter_mut().for_each(|value| *value -= mean);
        pre_emphasize(&mut self.decimated, PRE_EMPHASIS);

        let mut energy = 0.0;
        for ((slot, value), tap) in self.signal.iter_mut().zip(&self.decimated).zip(&self.window) {
            *slot = (*value * *tap) as f64;
            energy += *slot * *slot;
        }
        if (energy / len as f64).sqrt() < SILENCE_RMS {
            return 0;
        }

        self.lpc.burg(&self.signal, self.order);
        self.lpc.solve_roots();
        self.lpc
            .collect_formants(self.rate, MIN_FORMANT_HZ, MAX_FORMANT_HZ);
        let formants = &self.lpc.formants;
        let count = formants.len().min(out.len());
        out[..count].copy_from_slice(&formants[..count]);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resonance(freq_hz: f64, bw_hz: f64, rate: f64) -> [f64; 3] {
        let theta = 2.0 * PI * freq_hz / rate;
        let r = (-PI * bw_hz / rate).exp();
        [1.0, -2.0 * r * theta.cos(), r * r]
    }

    fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; a.len() + b.len() - 1];
        for (i, x) in a.iter().enumerate() {
            for (j, y) in b.iter().enumerate() {
                out[i + j] += x * y;
            }
        }
        out
    }

    /// Runs `input` through the all-pole filter `1 / A(z)`.
    fn all_pole(coeffs: &[f64], input: &[f64]) -> Vec<f64> {
        let mut output = vec![0.0; input.len()];
        for n in 0..input.len() {
            let feedback: f64 = coeffs[1..]
                .iter()
                .enumerate()
                .filter(|(k, _)| n > *k)
                .map(|(k, c)| c * output[n - k - 1])
                .sum();
            output[n] = input[n] - feedback;
        }
        output
    }

    fn lcg_gaussian(seed: u32, len: usize) -> Vec<f64> {
        let mut state = seed;
        let mut uniform = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state as f64 + 1.0) / 4_294_967_296.0
        };
        (0..len)
            .map(|_| {
                let u1 = uniform();
                let u2 = uniform();
                (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).sin()
            })
            .collect()
    }

    #[test]
    fn single_resonance_round_trips() {
        let coeffs = resonance(500.0, 80.0, 16_000.0);
        let formants = formants_from_lpc(&coeffs, 16_000.0, 0.0, 8_000.0);
        assert_eq!(formants.len(), 1);
        assert!((formants[0].frequency_hz - 500.0).abs() < 0.5);
        assert!((formants[0].bandwidth_hz - 80.0).abs() < 0.5);
    }

    #[test]
    fn two_resonances_are_sorted() {
        let coeffs = convolve(
            &resonance(2_000.0, 300.0, 16_000.0),
            &resonance(500.0, 100.0, 16_000.0),
        );
        let formants = formants_from_lpc(&coeffs, 16_000.0, 0.0, 8_000.0);
        assert_eq!(formants.len(), 2);
        assert!((formants[0].frequency_hz - 500.0).abs() < 1.0);
        assert!((formants[1].frequency_hz - 2_000.0).abs() < 1.0);
        assert!((formants[1].bandwidth_hz - 300.0).abs() < 1.0);
    }

    #[test]
    fn narrow_poles_are_rejected() {
        let coeffs = resonance(2_500.0, 5.0, 12_000.0);
        assert!(formants_from_lpc(&coeffs, 12_000.0, 100.0, 5_500.0).is_empty());
    }

    #[test]
    fn burg_recovers_autoregressive_formants() {
        let rate = 12_000.0;
        let coeffs = convolve(
            &convolve(&resonance(700.0, 80.0, rate), &resonance(1_200.0, 100.0, rate)),
            &resonance(2_500.0, 150.0, rate),
        );
        let signal = all_pole(&coeffs, &lcg_gaussian(9_012, 4_096));
        let estimated = burg(&signal, 6);
        let formants = formants_from_lpc(&estimated, rate, 100.0, 5_500.0);
        assert_eq!(formants.len(), 3, "{formants:?}");
        for (found, expected) in formants.iter().zip([700.0f32, 1_200.0, 2_500.0]) {
            assert!(
                (found.frequency_hz - expected).abs() / expected < 0.05,
                "{found:?} vs {expected}"
            );
        }
    }

    #[test]
    fn tracker_finds_vowel_formants() {
        let rate = 48_000.0;
        let coeffs = convolve(
            &convolve(&resonance(700.0, 90.0, rate), &resonance(1_200.0, 110.0, rate)),
            &resonance(2_600.0, 160.0, rate),
        );
        let pulses: Vec<f64> = (0..4_096)
            .map(|index| if index % 400 == 0 { 1.0 } else { 0.0 })
            .collect();
        let voiced: Vec<f32> = all_pole(&coeffs, &pulses)
            .into_iter()
            .map(|value| value as f32)
            .collect();

        let mut tracker = FormantTracker::new(rate as f32, 2_048);
        let mut out = [FormantSample::default(); 4];
        let count = tracker.analyze(&voiced, &mut out);
        assert!(count >= 2, "{out:?}");
        assert!((out[0].frequency_hz - 700.0).abs() / 700.0 < 0.15, "{out:?}");
        assert!((out[1].frequency_hz - 1_200.0).abs() / 1_200.0 < 0.15, "{out:?}");
    }

    #[test]
    fn tracker_reuses_its_buffers_between_frames() {
        let rate = 48_000.0;
        let coeffs = convolve(&resonance(800.0, 100.0, rate), &resonance(1_500.0, 120.0, rate));
        let pulses: Vec<f64> = (0..2_048)
            .map(|index| if index % 320 == 0 { 1.0 } else { 0.0 })
            .collect();
        let voiced: Vec<f32> = all_pole(&coeffs, &pulses)
            .into_iter()
            .map(|value| value as f32)
            .collect();

        let mut tracker = FormantTracker::new(rate as f32, 2_048);
        let mut first = [FormantSample::default(); 4];
        let count = tracker.analyze(&voiced, &mut first);
        let roots = tracker.lpc.roots.as_ptr();
        let forward = tracker.lpc.forward.as_ptr();

        let mut second = [FormantSample::default(); 4];
        assert_eq!(tracker.analyze(&voiced, &mut second), count);
        assert_eq!(first, second);
        assert_eq!(tracker.lpc.roots.as_ptr(), roots);
        assert_eq!(tracker.lpc.forward.as_ptr(), forward);
    }

    #[test]
    fn silence_yields_no_formants() {
        let mut tracker = FormantTracker::new(48_000.0, 2_048);
        let mut out = [FormantSample {
            frequency_hz: 1.0,
            bandwidth_hz: 1.0,
        }; 4];
        assert_eq!(tracker.analyze(&[0.0; 2_048], &mut out), 0);
        assert!(out.iter().all(|sample| *sample == FormantSample::default()));
    }
}
