use crate::HarmonicSample;

use super::pitch::parabolic_offset;

/// Highest harmonic frequency tracked, as a fraction of Nyquist.
const NYQUIST_FRACTION: f32 = 0.95;

/// Locates the peaks near `h · f0` in an FFT magnitude spectrum.
///
/// Each harmonic is searched within half a harmonic spacing of its nominal
/// frequency and refined with a parabola through the log magnitudes. Slots
/// past the last harmonic below Nyquist are zeroed. Returns the number of
/// harmonics written.
pub fn track_harmonics(
    magnitudes: &[f32],
    bin_hz: f32,
    f0_hz: f32,
    out: &mut [HarmonicSample],
) -> usize {
    out.fill(HarmonicSample::default());
    if f0_hz <= 0.0 || bin_hz <= 0.0 || magnitudes.len() < 3 {
        return 0;
    }
    let nyquist = bin_hz * (magnitudes.len() - 1) as f32;
    let last_bin = magnitudes.len() - 1;

    let mut count = 0;
    for (slot, harmonic) in out.iter_mut().zip(1usize..) {
        let target = f0_hz * harmonic as f32;
        if target > nyquist * NYQUIST_FRACTION {
            break;
        }
        let lo = (((target - f0_hz * 0.5) / bin_hz).ceil().max(1.0) as usize).min(last_bin - 1);
        let hi = (((target + f0_hz * 0.5) / bin_hz).floor() as usize).clamp(lo, last_bin - 1);
        let Some(peak) = (lo..=hi).max_by(|a, b| magnitudes[*a].total_cmp(&magnitudes[*b])) else {
            break;
        };

        let log = |bin: usize| magnitudes[bin].max(1e-12).ln();
        let (left, center, right) = (log(peak - 1), log(peak), log(peak + 1));
        let offset = parabolic_offset(left, center, right);
        let peak_log = center - 0.25 * (left - right) * offset;
        *slot = HarmonicSample {
            frequency_hz: (peak as f32 + offset) * bin_hz,
            magnitude: peak_log.exp(),
        };
        count += 1;
    }
    count
}
