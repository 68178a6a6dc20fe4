//! Consumer-side conversion of stored magnitudes into renderable columns.
//!
//! A [`DisplayPipeline`] is owned by one consumer. It holds a static
//! [`BinMapping`] that is rebuilt only when a mapping-affecting parameter
//! changes, plus the per-frame range, normalisation and smoothing state.

mod dynamics;
mod mapping;
mod scale;

use tracing::debug;

use crate::{
    AnalysisConfig, DynamicRangeMode, FrequencyScale, NormalizationMode, Result, SmoothingMode,
    TransformType, VocalScopeError, VoicingState,
};

pub use dynamics::{RangePolicy, Smoother};
pub use mapping::{AnalysisGrid, BinMapping};
pub use scale::{a_weighting_db, band_centers, band_edges};

/// Smallest magnitude converted to dB; anything quieter reads as -200 dB.
const MAGNITUDE_FLOOR: f32 = 1e-10;
/// Level below the ceiling where the frame RMS is placed in `Rms` mode.
const RMS_HEADROOM_DB: f32 = 18.0;

/// Display-side parameters shared by every `configure_for_*` entry point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplaySettings {
    pub display_bins: usize,
    pub min_hz: f32,
    pub max_hz: f32,
    pub scale: FrequencyScale,
    pub min_db: f32,
    pub max_db: f32,
    pub dynamic_range: DynamicRangeMode,
}

impl DisplaySettings {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            display_bins: config.display_bins,
            min_hz: config.min_hz,
            max_hz: config.max_hz,
            scale: config.frequency_scale,
            min_db: config.min_db,
            max_db: config.max_db,
            dynamic_range: config.dynamic_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct MappingKey {
    grid: AnalysisGrid,
    display_bins: usize,
    min_hz: f32,
    max_hz: f32,
    scale: FrequencyScale,
}

pub struct DisplayPipeline {
    key: Option<MappingKey>,
    mapping: Option<BinMapping>,
    a_weights: Vec<f32>,
    range: RangePolicy,
    smoother: Smoother,
    normalization: NormalizationMode,
    db: Vec<f32>,
}

impl Default for DisplayPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayPipeline {
    pub fn new() -> Self {
        Self {
            key: None,
            mapping: None,
            a_weights: Vec::new(),
            range: RangePolicy::new(DynamicRangeMode::Custom, -90.0, 0.0),
            smoother: Smoother::new(SmoothingMode::Off),
            normalization: NormalizationMode::None,
            db: Vec::new(),
        }
    }

    /// Pipeline configured for whatever transform `config` selects. CQT and
    /// ZoomFFT grids are derived from the config the same way the analyzer
    /// derives them.
    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        let mut pipeline = Self::new();
        pipeline.configure(grid_for_config(config), DisplaySettings::from_config(config))?;
        pipeline.set_smoothing(config.smoothing);
        pipeline.set_normalization(config.normalization);
        Ok(pipeline)
    }

    /// Returns `true` when the mapping was rebuilt.
    pub fn configure_for_fft(
        &mut self,
        sample_rate: f32,
        fft_size: usize,
        settings: DisplaySettings,
    ) -> Result<bool> {
        self.configure(
            AnalysisGrid::Fft {
                sample_rate,
                fft_size,
            },
            settings,
        )
    }

    /// `frequencies` is the transform's centre frequency per analysis bin.
    pub fn configure_for_cqt(
        &mut self,
        frequencies: &[f32],
        bins_per_octave: usize,
        settings: DisplaySettings,
    ) -> Result<bool> {
        self.configure(
            AnalysisGrid::Cqt {
                frequencies: frequencies.to_vec(),
                bins_per_octave,
            },
            settings,
        )
    }

    pub fn configure_for_zoom_fft(
        &mut self,
        start_hz: f32,
        resolution_hz: f32,
        bins: usize,
        settings: DisplaySettings,
    ) -> Result<bool> {
        self.configure(
            AnalysisGrid::ZoomFft {
                start_hz,
                resolution_hz,
                bins,
            },
            settings,
        )
    }

    pub fn configure(&mut self, grid: AnalysisGrid, settings: DisplaySettings) -> Result<bool> {
        if settings.min_db >= settings.max_db {
            return Err(VocalScopeError::config(format!(
                "display range {}..{} dB is empty",
                settings.min_db, settings.max_db
            )));
        }

        let key = MappingKey {
            grid,
            display_bins: settings.display_bins,
            min_hz: settings.min_hz,
            max_hz: settings.max_hz,
            scale: settings.scale,
        };
        let rebuild = self.key.as_ref() != Some(&key);
        if rebuild {
            let mapping = BinMapping::build(
                &key.grid,
                key.display_bins,
                key.min_hz,
                key.max_hz,
                key.scale,
            )?;
            debug!(
                display_bins = key.display_bins,
                analysis_bins = mapping.analysis_bins(),
                scale = ?key.scale,
                min_hz = key.min_hz,
                max_hz = key.max_hz,
                "rebuilt display mapping"
            );
            self.a_weights = mapping
                .center_frequencies()
                .iter()
                .map(|hz| a_weighting_db(*hz))
                .collect();
            self.mapping = Some(mapping);
            self.key = Some(key);
            self.reset_history();
        }

        self.update_processing(settings.min_db, settings.max_db, settings.dynamic_range);
        Ok(rebuild)
    }

    /// Adjusts the visible dB window without touching the mapping.
    pub fn update_processing(&mut self, min_db: f32, max_db: f32, mode: DynamicRangeMode) {
        self.range.update(mode, min_db, max_db);
    }

    pub fn set_smoothing(&mut self, mode: SmoothingMode) {
        self.smoother.set_mode(mode);
    }

    pub fn set_smoothing_alpha(&mut self, alpha: f32) {
        self.smoother.set_alpha(alpha);
    }

    pub fn set_normalization(&mut self, mode: NormalizationMode) {
        self.normalization = mode;
    }

    pub fn is_configured(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn display_bins(&self) -> usize {
        self.mapping.as_ref().map_or(0, BinMapping::display_bins)
    }

    pub fn analysis_bins(&self) -> usize {
        self.mapping.as_ref().map_or(0, BinMapping::analysis_bins)
    }

    pub fn center_frequencies(&self) -> &[f32] {
        self.mapping
            .as_ref()
            .map_or(&[][..], BinMapping::center_frequencies)
    }

    pub fn bin_for_frequency(&self, hz: f32) -> Option<usize> {
        self.mapping.as_ref()?.bin_for_frequency(hz)
    }

    /// Drops smoothing and adaptive-range history after a discontinuity.
    pub fn reset_history(&mut self) {
        self.smoother.reset();
        self.range.reset();
    }

    /// Maps analysis magnitudes onto the display grid and post-processes them
    /// into `[0, 1]`.
    pub fn process_frame(
        &mut self,
        source: &[f32],
        dest: &mut [f32],
        voicing: VoicingState,
    ) -> Result<()> {
        let mapping = self.mapping.as_ref().ok_or(VocalScopeError::InvalidInput(
            "display pipeline is not configured",
        ))?;
        if source.len() < mapping.analysis_bins() {
            return Err(VocalScopeError::InvalidInput(
                "source is shorter than the analysis grid",
            ));
        }
        if dest.len() != mapping.display_bins() {
            return Err(VocalScopeError::InvalidInput(
                "destination does not match the display bin count",
            ));
        }
        mapping.reduce(source, dest);
        self.post_process(dest, voicing);
        Ok(())
    }

    /// Same post-processing as [`DisplayPipeline::process_frame`] for input
    /// already at display resolution.
    pub fn process_display_frame(
        &mut self,
        source: &[f32],
        dest: &mut [f32],
        voicing: VoicingState,
    ) -> Result<()> {
        let bins = self.display_bins();
        if bins == 0 {
            return Err(VocalScopeError::InvalidInput(
                "display pipeline is not configured",
            ));
        }
        if source.len() != bins || dest.len() != bins {
            return Err(VocalScopeError::InvalidInput(
                "display frame does not match the display bin count",
            ));
        }
        dest.copy_from_slice(source);
        self.post_process(dest, voicing);
        Ok(())
    }

    fn post_process(&mut self, values: &mut [f32], voicing: VoicingState) {
        self.db.clear();
        self.db
            .extend(values.iter().map(|value| 20.0 * value.max(MAGNITUDE_FLOOR).log10()));
        self.apply_normalization();

        let centers = self
            .mapping
            .as_ref()
            .map_or(&[][..], BinMapping::center_frequencies);
        let (floor, ceiling) = self.range.resolve(&self.db, centers, voicing);
        for (value, db) in values.iter_mut().zip(&self.db) {
            *value = self.range.normalize(*db, floor, ceiling);
        }
        self.smoother.apply(values);
    }

    fn apply_normalization(&mut self) {
        let (_, ceiling) = self.range.bounds();
        match self.normalization {
            NormalizationMode::None => {}
            NormalizationMode::Peak => {
                let peak = self.db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                if peak.is_finite() {
                    let offset = ceiling - peak;
                    self.db.iter_mut().for_each(|value| *value += offset);
                }
            }
            NormalizationMode::Rms => {
                if self.db.is_empty() {
                    return;
                }
                let power = self
                    .db
                    .iter()
                    .map(|value| 10f32.powf(value / 10.0))
                    .sum::<f32>()
                    / self.db.len() as f32;
                let rms_db = 10.0 * power.max(MAGNITUDE_FLOOR * MAGNITUDE_FLOOR).log10();
                let offset = ceiling - RMS_HEADROOM_DB - rms_db;
                self.db.iter_mut().for_each(|value| *value += offset);
            }
            NormalizationMode::AWeighted => {
                for (value, weight) in self.db.iter_mut().zip(&self.a_weights) {
                    *value += weight;
                }
            }
        }
    }
}

impl std::fmt::Debug for DisplayPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayPipeline")
            .field("display_bins", &self.display_bins())
            .field("analysis_bins", &self.analysis_bins())
            .field("range", &self.range.mode())
            .field("smoothing", &self.smoother.mode())
            .field("normalization", &self.normalization)
            .finish()
    }
}

/// Analysis grid the analyzer produces for `config`.
pub fn grid_for_config(config: &AnalysisConfig) -> AnalysisGrid {
    match config.transform {
        TransformType::Fft => AnalysisGrid::Fft {
            sample_rate: config.sample_rate as f32,
            fft_size: config.fft_size,
        },
        TransformType::Cqt => {
            let bins_per_octave = config.cqt_bins_per_octave;
            AnalysisGrid::Cqt {
                frequencies: (0..config.analysis_bins())
                    .map(|bin| config.min_hz * 2f32.powf(bin as f32 / bins_per_octave as f32))
                    .collect(),
                bins_per_octave,
            }
        }
        TransformType::ZoomFft => AnalysisGrid::ZoomFft {
            start_hz: config.min_hz,
            resolution_hz: config.zoom_resolution_hz(),
            bins: config.analysis_bins(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(scale: FrequencyScale, min_hz: f32, max_hz: f32, bins: usize) -> DisplaySettings {
        DisplaySettings {
            display_bins: bins,
            min_hz,
            max_hz,
            scale,
            min_db: -90.0,
            max_db: 0.0,
            dynamic_range: DynamicRangeMode::Custom,
        }
    }

    #[test]
    fn linear_full_band_centers_are_monotonic() {
        let mut pipeline = DisplayPipeline::new();
        let rebuilt = pipeline
            .configure_for_fft(48_000.0, 2048, settings(FrequencyScale::Linear, 0.0, 24_000.0, 300))
            .unwrap();
        assert!(rebuilt);
        let centers = pipeline.center_frequencies();
        assert_eq!(centers.len(), 300);
        assert!(centers.windows(2).all(|pair| pair[1] >= pair[0]));
    }

    #[test]
    fn single_tone_lands_in_matching_display_bin() {
        let bin_hz = 48_000.0 / 2048.0;
        for scale in [FrequencyScale::Linear, FrequencyScale::Mel, FrequencyScale::Log] {
            let mut pipeline = DisplayPipeline::new();
            pipeline
                .configure_for_fft(48_000.0, 2048, settings(scale, 60.0, 8_000.0, 512))
                .unwrap();
            let mut source = vec![0.0; 1025];
            source[100] = 1.0;
            let mut dest = vec![0.0; 512];
            pipeline
                .process_frame(&source, &mut dest, VoicingState::Voiced)
                .unwrap();

            let (peak, _) = dest
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .unwrap();
            let edges = pipeline.mapping.as_ref().unwrap().edges();
            let width = edges[peak + 1] - edges[peak];
            let center = pipeline.center_frequencies()[peak];
            let tone = 100.0 * bin_hz;
            assert!(
                (center - tone).abs() <= width.max(bin_hz),
                "{scale:?}: bin {peak} centre {center} vs {tone}"
            );
            assert!(dest[peak] > 0.9);
        }
    }

    #[test]
    fn update_processing_keeps_mapping() {
        let mut pipeline = DisplayPipeline::new();
        let base = settings(FrequencyScale::Mel, 60.0, 8_000.0, 256);
        assert!(pipeline.configure_for_fft(48_000.0, 2048, base).unwrap());
        let before = pipeline.center_frequencies().to_vec();

        pipeline.update_processing(-60.0, -10.0, DynamicRangeMode::Full);
        let retuned = DisplaySettings {
            min_db: -70.0,
            dynamic_range: DynamicRangeMode::NoiseFloor,
            ..base
        };
        assert!(!pipeline.configure_for_fft(48_000.0, 2048, retuned).unwrap());
        assert_eq!(pipeline.center_frequencies(), &before[..]);

        let rescaled = DisplaySettings {
            scale: FrequencyScale::Bark,
            ..base
        };
        assert!(pipeline.configure_for_fft(48_000.0, 2048, rescaled).unwrap());
    }

    #[test]
    fn custom_range_maps_db_linearly() {
        let mut pipeline = DisplayPipeline::new();
        pipeline
            .configure_for_fft(48_000.0, 2048, settings(FrequencyScale::Linear, 0.0, 24_000.0, 8))
            .unwrap();
        // -45 dB sits halfway through -90..0.
        let source = vec![10f32.powf(-45.0 / 20.0); 8];
        let mut dest = vec![0.0; 8];
        pipeline
            .process_display_frame(&source, &mut dest, VoicingState::Silence)
            .unwrap();
        assert!(dest.iter().all(|value| (value - 0.5).abs() < 1e-4));
    }

    #[test]
    fn peak_normalization_lifts_quiet_frames() {
        let mut pipeline = DisplayPipeline::new();
        pipeline
            .configure_for_fft(48_000.0, 2048, settings(FrequencyScale::Linear, 0.0, 24_000.0, 8))
            .unwrap();
        pipeline.set_normalization(NormalizationMode::Peak);
        let mut source = vec![1e-4; 8];
        source[2] = 1e-3;
        let mut dest = vec![0.0; 8];
        pipeline
            .process_display_frame(&source, &mut dest, VoicingState::Voiced)
            .unwrap();
        assert!((dest[2] - 1.0).abs() < 1e-5);
        assert!(dest[0] < dest[2]);
    }

    #[test]
    fn mismatched_buffers_and_unconfigured_use_are_rejected() {
        let mut pipeline = DisplayPipeline::new();
        let mut dest = vec![0.0; 4];
        assert!(pipeline
            .process_frame(&[0.0; 4], &mut dest, VoicingState::Silence)
            .is_err());

        pipeline
            .configure_for_fft(48_000.0, 1024, settings(FrequencyScale::Linear, 0.0, 24_000.0, 4))
            .unwrap();
        assert!(pipeline
            .process_frame(&[0.0; 10], &mut dest, VoicingState::Silence)
            .is_err());
        let mut wrong = vec![0.0; 5];
        assert!(pipeline
            .process_frame(&[0.0; 513], &mut wrong, VoicingState::Silence)
            .is_err());
        assert!(pipeline
            .configure_for_fft(48_000.0, 1024, DisplaySettings {
                min_db: 0.0,
                ..settings(FrequencyScale::Linear, 0.0, 24_000.0, 4)
            })
            .is_err());
    }

    #[test]
    fn cqt_and_zoom_grids_configure_from_config() {
        let config = AnalysisConfig {
            transform: TransformType::Cqt,
            min_hz: 65.0,
            max_hz: 4_000.0,
            frequency_scale: FrequencyScale::Log,
            ..AnalysisConfig::default()
        };
        let pipeline = DisplayPipeline::from_config(&config).unwrap();
        assert_eq!(pipeline.analysis_bins(), config.analysis_bins());

        let zoom = AnalysisConfig {
            transform: TransformType::ZoomFft,
            min_hz: 80.0,
            max_hz: 1_000.0,
            ..AnalysisConfig::default()
        };
        let pipeline = DisplayPipeline::from_config(&zoom).unwrap();
        assert_eq!(pipeline.analysis_bins(), zoom.analysis_bins());
        assert_eq!(pipeline.display_bins(), zoom.display_bins);
    }
}
