//! Perceptual frequency warps and weighting curves.

use crate::FrequencyScale;

/// Lowest frequency the log warp accepts.
const LOG_FLOOR_HZ: f32 = 1.0;

impl FrequencyScale {
    /// Maps Hz onto the scale's perceptual axis.
    pub fn warp(self, hz: f32) -> f32 {
        let hz = hz.max(0.0);
        match self {
            Self::Linear => hz,
            Self::Log => hz.max(LOG_FLOOR_HZ).ln(),
            Self::Mel => 2595.0 * (1.0 + hz / 700.0).log10(),
            Self::Erb => 21.4 * (1.0 + 0.004_37 * hz).log10(),
            // Traunmüller's Bark approximation.
            Self::Bark => 26.81 * hz / (1960.0 + hz) - 0.53,
        }
    }

    /// Inverse of [`FrequencyScale::warp`].
    pub fn unwarp(self, value: f32) -> f32 {
        match self {
            Self::Linear => value,
            Self::Log => value.exp(),
            Self::Mel => 700.0 * (10f32.powf(value / 2595.0) - 1.0),
            Self::Erb => (10f32.powf(value / 21.4) - 1.0) / 0.004_37,
            Self::Bark => 1960.0 * (value + 0.53) / (26.28 - value),
        }
    }
}

/// `count + 1` band edges evenly spaced on the warped axis.
pub fn band_edges(scale: FrequencyScale, min_hz: f32, max_hz: f32, count: usize) -> Vec<f32> {
    let low = scale.warp(min_hz);
    let high = scale.warp(max_hz);
    let mut edges: Vec<f32> = (0..=count)
        .map(|index| {
            let t = index as f32 / count as f32;
            scale.unwarp(low + (high - low) * t)
        })
        .collect();
    if let Some(last) = edges.last_mut() {
        *last = max_hz;
    }
    if let Some(first) = edges.first_mut() {
        *first = min_hz;
    }
    // Guard against float noise breaking monotonicity.
    for index in 1..edges.len() {
        if edges[index] < edges[index - 1] {
            edges[index] = edges[index - 1];
        }
    }
    edges
}

/// Band centres taken at the warped midpoint of each band.
pub fn band_centers(scale: FrequencyScale, edges: &[f32]) -> Vec<f32> {
    edges
        .windows(2)
        .map(|pair| {
            let mid = 0.5 * (scale.warp(pair[0]) + scale.warp(pair[1]));
            scale.unwarp(mid).clamp(pair[0], pair[1])
        })
        .collect()
}

/// IEC 61672 A-weighting gain in dB.
pub fn a_weighting_db(hz: f32) -> f32 {
    if hz <= 0.0 {
        return -200.0;
    }
    let f2 = (hz as f64).powi(2);
    let numerator = 12_194f64.powi(2) * f2 * f2;
    let denominator = (f2 + 20.6f64.powi(2))
        * ((f2 + 107.7f64.powi(2)) * (f2 + 737.9f64.powi(2))).sqrt()
        * (f2 + 12_194f64.powi(2));
    (20.0 * (numerator / denominator).log10() + 2.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALES: [FrequencyScale; 5] = [
        FrequencyScale::Linear,
        FrequencyScale::Log,
        FrequencyScale::Mel,
        FrequencyScale::Erb,
        FrequencyScale::Bark,
    ];

    #[test]
    fn warp_and_unwarp_agree() {
        for scale in SCALES {
            for hz in [50.0f32, 440.0, 1_000.0, 8_000.0] {
                let back = scale.unwarp(scale.warp(hz));
                assert!((back - hz).abs() / hz < 1e-3, "{scale:?} {hz} -> {back}");
            }
        }
    }

    #[test]
    fn edges_are_monotonic_and_pinned() {
        for scale in SCALES {
            let edges = band_edges(scale, 40.0, 12_000.0, 64);
            assert_eq!(edges.len(), 65);
            assert_eq!(edges[0], 40.0);
            assert_eq!(edges[64], 12_000.0);
            assert!(edges.windows(2).all(|pair| pair[1] >= pair[0]));
        }
    }

    #[test]
    fn a_weighting_is_zero_near_one_kilohertz() {
        assert!(a_weighting_db(1_000.0).abs() < 0.1);
        assert!(a_weighting_db(100.0) < -15.0);
    }
}
