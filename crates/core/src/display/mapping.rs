//! Static analysis-bin → display-bin mapping tables.
//!
//! Reduction rule, used for every transform: a display bin at least as wide as
//! the analysis bins under it takes the weighted maximum of the analysis bins
//! it overlaps, each weighted by its overlap fraction; a display bin narrower
//! than the analysis resolution interpolates linearly between the two nearest
//! analysis bins.

use crate::{FrequencyScale, Result, VocalScopeError};

use super::scale::{band_centers, band_edges};

/// Native frequency grid of the transform feeding the display.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisGrid {
    /// Uniform bins `k · sample_rate / fft_size` for `k in 0..=fft_size / 2`.
    Fft { sample_rate: f32, fft_size: usize },
    /// Log-spaced bins with an explicit centre frequency per bin.
    Cqt {
        frequencies: Vec<f32>,
        bins_per_octave: usize,
    },
    /// Uniform bins `start_hz + k · resolution_hz`.
    ZoomFft {
        start_hz: f32,
        resolution_hz: f32,
        bins: usize,
    },
}

impl AnalysisGrid {
    pub fn bins(&self) -> usize {
        match self {
            Self::Fft { fft_size, .. } => fft_size / 2 + 1,
            Self::Cqt { frequencies, .. } => frequencies.len(),
            Self::ZoomFft { bins, .. } => *bins,
        }
    }

    pub fn center_hz(&self, bin: usize) -> f32 {
        match self {
            Self::Fft {
                sample_rate,
                fft_size,
            } => bin as f32 * sample_rate / *fft_size as f32,
            Self::Cqt { frequencies, .. } => frequencies[bin],
            Self::ZoomFft {
                start_hz,
                resolution_hz,
                ..
            } => start_hz + bin as f32 * resolution_hz,
        }
    }

    fn bin_edges(&self, bin: usize) -> (f32, f32) {
        match self {
            Self::Fft { .. } | Self::ZoomFft { .. } => {
                let half = 0.5 * self.uniform_step();
                let center = self.center_hz(bin);
                ((center - half).max(0.0), center + half)
            }
            Self::Cqt {
                frequencies,
                bins_per_octave,
            } => {
                let half_step = 2f32.powf(0.5 / *bins_per_octave as f32);
                let center = frequencies[bin];
                let lower = if bin == 0 {
                    center / half_step
                } else {
                    (frequencies[bin - 1] * center).sqrt()
                };
                let upper = if bin + 1 == frequencies.len() {
                    center * half_step
                } else {
                    (frequencies[bin + 1] * center).sqrt()
                };
                (lower, upper)
            }
        }
    }

    fn uniform_step(&self) -> f32 {
        match self {
            Self::Fft {
                sample_rate,
                fft_size,
            } => sample_rate / *fft_size as f32,
            Self::ZoomFft { resolution_hz, .. } => *resolution_hz,
            Self::Cqt { .. } => 0.0,
        }
    }

    /// Fractional bin index of `hz`, clamped to the grid.
    fn position(&self, hz: f32) -> f32 {
        let last = (self.bins() - 1) as f32;
        let position = match self {
            Self::Fft { .. } => hz / self.uniform_step(),
            Self::ZoomFft { start_hz, .. } => (hz - start_hz) / self.uniform_step(),
            Self::Cqt { frequencies, .. } => {
                let upper = frequencies.partition_point(|&freq| freq < hz);
                if upper == 0 {
                    0.0
                } else if upper >= frequencies.len() {
                    last
                } else {
                    let low = frequencies[upper - 1].max(f32::MIN_POSITIVE);
                    let high = frequencies[upper];
                    let t = (hz / low).ln() / (high / low).ln();
                    (upper - 1) as f32 + t
                }
            }
        };
        position.clamp(0.0, last)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Fft {
                sample_rate,
                fft_size,
            } => {
                if *fft_size < 2 || *sample_rate <= 0.0 {
                    return Err(VocalScopeError::config("FFT grid needs a size ≥ 2 and a positive rate"));
                }
            }
            Self::Cqt {
                frequencies,
                bins_per_octave,
            } => {
                if frequencies.is_empty() || *bins_per_octave == 0 {
                    return Err(VocalScopeError::config("CQT grid needs at least one bin"));
                }
                if frequencies.windows(2).any(|pair| pair[1] <= pair[0])
                    || frequencies[0] <= 0.0
                {
                    return Err(VocalScopeError::config(
                        "CQT frequencies must be positive and strictly increasing",
                    ));
                }
            }
            Self::ZoomFft {
                resolution_hz,
                bins,
                ..
            } => {
                if *bins == 0 || *resolution_hz <= 0.0 {
                    return Err(VocalScopeError::config(
                        "zoom FFT grid needs bins and a positive resolution",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Contribution {
    /// Weighted maximum over `weights[start..start + len]` for analysis bins
    /// `first..first + len`.
    Span { first: usize, start: usize, len: usize },
    Interpolate { lower: usize, upper: usize, frac: f32 },
}

/// Display-bin lookup table built once per configuration.
#[derive(Debug, Clone)]
pub struct BinMapping {
    contributions: Vec<Contribution>,
    weights: Vec<f32>,
    edges: Vec<f32>,
    centers: Vec<f32>,
    analysis_bins: usize,
}

impl BinMapping {
    pub fn build(
        grid: &AnalysisGrid,
        display_bins: usize,
        min_hz: f32,
        max_hz: f32,
        scale: FrequencyScale,
    ) -> Result<Self> {
        grid.validate()?;
        if display_bins == 0 {
            return Err(VocalScopeError::config("display bin count must be positive"));
        }
        if !(min_hz >= 0.0 && max_hz > min_hz) {
            return Err(VocalScopeError::config(format!(
                "invalid display range {min_hz}..{max_hz} Hz"
            )));
        }
        if scale == FrequencyScale::Log && min_hz <= 0.0 {
            return Err(VocalScopeError::config("log scale needs a positive minimum frequency"));
        }

        let edges = band_edges(scale, min_hz, max_hz, display_bins);
        let centers = band_centers(scale, &edges);
        let analysis_bins = grid.bins();
        let mut contributions = Vec::with_capacity(display_bins);
        let mut weights = Vec::new();

        for (index, center) in centers.iter().enumerate() {
            let (low, high) = (edges[index], edges[index + 1]);
            let nearest = grid.position(*center).round() as usize;
            let (nearest_low, nearest_high) = grid.bin_edges(nearest);
            let analysis_width = nearest_high - nearest_low;

            let span = if high - low >= analysis_width {
                let first = grid.position(low).round() as usize;
                let last = grid.position(high).round() as usize;
                let start = weights.len();
                let mut first_used = None;
                for bin in first..=last {
                    let (bin_low, bin_high) = grid.bin_edges(bin);
                    let overlap = high.min(bin_high) - low.max(bin_low);
                    if overlap <= 0.0 {
                        if first_used.is_some() {
                            weights.push(0.0);
                        }
                        continue;
                    }
                    first_used.get_or_insert(bin);
                    let narrower = (high - low).min(bin_high - bin_low).max(f32::EPSILON);
                    weights.push((overlap / narrower).min(1.0));
                }
                first_used.map(|first| Contribution::Span {
                    first,
                    start,
                    len: weights.len() - start,
                })
            } else {
                None
            };

            let contribution = span.unwrap_or_else(|| {
                let position = grid.position(*center);
                let lower = position.floor() as usize;
                let upper = (lower + 1).min(analysis_bins - 1);
                Contribution::Interpolate {
                    lower,
                    upper,
                    frac: position - lower as f32,
                }
            });
            contributions.push(contribution);
        }

        Ok(Self {
            contributions,
            weights,
            edges,
            centers,
            analysis_bins,
        })
    }

    pub fn display_bins(&self) -> usize {
        self.centers.len()
    }

    pub fn analysis_bins(&self) -> usize {
        self.analysis_bins
    }

    pub fn center_frequencies(&self) -> &[f32] {
        &self.centers
    }

    pub fn edges(&self) -> &[f32] {
        &self.edges
    }

    /// Display bin whose band contains `hz`.
    pub fn bin_for_frequency(&self, hz: f32) -> Option<usize> {
        let first = *self.edges.first()?;
        let last = *self.edges.last()?;
        if !(first..=last).contains(&hz) {
            return None;
        }
        let upper = self.edges.partition_point(|&edge| edge <= hz);
        Some(upper.saturating_sub(1).min(self.display_bins() - 1))
    }

    /// Reduces analysis magnitudes onto the display grid.
    pub fn reduce(&self, source: &[f32], dest: &mut [f32]) {
        for (out, contribution) in dest.iter_mut().zip(&self.contributions) {
            *out = match *contribution {
                Contribution::Span { first, start, len } => self.weights[start..start + len]
                    .iter()
                    .zip(&source[first..first + len])
                    .fold(0.0f32, |peak, (weight, value)| peak.max(weight * value)),
                Contribution::Interpolate { lower, upper, frac } => {
                    source[lower] * (1.0 - frac) + source[upper] * frac
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fft_grid() -> AnalysisGrid {
        AnalysisGrid::Fft {
            sample_rate: 48_000.0,
            fft_size: 4096,
        }
    }

    #[test]
    fn linear_full_band_centers_are_monotonic() {
        let mapping =
            BinMapping::build(&fft_grid(), 512, 0.0, 24_000.0, FrequencyScale::Linear).unwrap();
        let centers = mapping.center_frequencies();
        assert_eq!(centers.len(), 512);
        assert!(centers.windows(2).all(|pair| pair[1] >= pair[0]));
    }

    #[test]
    fn tone_lands_in_matching_display_bin() {
        for scale in [FrequencyScale::Linear, FrequencyScale::Mel, FrequencyScale::Log] {
            let grid = fft_grid();
            let mapping = BinMapping::build(&grid, 256, 50.0, 20_000.0, scale).unwrap();
            let bin = 171;
            let tone_hz = grid.center_hz(bin);
            let mut source = vec![0.0; grid.bins()];
            source[bin] = 1.0;
            let mut dest = vec![0.0; 256];
            mapping.reduce(&source, &mut dest);

            let peak = dest
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(index, _)| index)
                .unwrap();
            let width = mapping.edges()[peak + 1] - mapping.edges()[peak];
            let center = mapping.center_frequencies()[peak];
            assert!(
                (center - tone_hz).abs() <= width.max(grid.center_hz(1)),
                "{scale:?}: centre {center} vs tone {tone_hz}"
            );
        }
    }

    #[test]
    fn narrow_display_bins_interpolate() {
        let grid = AnalysisGrid::Fft {
            sample_rate: 8_000.0,
            fft_size: 8,
        };
        let mapping = BinMapping::build(&grid, 40, 0.0, 4_000.0, FrequencyScale::Linear).unwrap();
        let source = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut dest = vec![0.0; 40];
        mapping.reduce(&source, &mut dest);
        assert!(dest.windows(2).all(|pair| pair[1] >= pair[0] - 1e-6));
        assert!((dest[5] - mapping.center_frequencies()[5] / 1_000.0).abs() < 1e-3);
    }

    #[test]
    fn cqt_grid_maps_octaves() {
        let frequencies: Vec<f32> = (0..48).map(|k| 110.0 * 2f32.powf(k as f32 / 12.0)).collect();
        let grid = AnalysisGrid::Cqt {
            frequencies,
            bins_per_octave: 12,
        };
        let mapping = BinMapping::build(&grid, 24, 110.0, 1_760.0, FrequencyScale::Log).unwrap();
        let mut source = vec![0.0; 48];
        source[24] = 1.0; // 440 Hz
        let mut dest = vec![0.0; 24];
        mapping.reduce(&source, &mut dest);
        let bin = mapping.bin_for_frequency(440.0).unwrap();
        assert!(dest[bin] > 0.0);
    }

    #[test]
    fn zoom_grid_starts_at_offset() {
        let grid = AnalysisGrid::ZoomFft {
            start_hz: 100.0,
            resolution_hz: 2.0,
            bins: 500,
        };
        assert_eq!(grid.center_hz(0), 100.0);
        let mapping =
            BinMapping::build(&grid, 100, 100.0, 1_098.0, FrequencyScale::Linear).unwrap();
        let mut source = vec![0.0; 500];
        source[200] = 1.0; // 500 Hz
        let mut dest = vec![0.0; 100];
        mapping.reduce(&source, &mut dest);
        let bin = mapping.bin_for_frequency(500.0).unwrap();
        assert!(dest[bin] > 0.4);
    }

    #[test]
    fn rejects_bad_tables() {
        let grid = AnalysisGrid::Cqt {
            frequencies: vec![200.0, 100.0],
            bins_per_octave: 12,
        };
        assert!(BinMapping::build(&grid, 8, 50.0, 400.0, FrequencyScale::Linear).is_err());
        assert!(BinMapping::build(&fft_grid(), 0, 0.0, 100.0, FrequencyScale::Linear).is_err());
    }
}
