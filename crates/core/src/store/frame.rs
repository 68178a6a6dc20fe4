use serde::{Deserialize, Serialize};

use super::StoreShape;

/// Maximum number of `f32` lanes a packed record may occupy.
pub(crate) const MAX_LANES: usize = 8;

/// Fixed-size record that can be flattened into `f32` lanes for storage in
/// the ring's atomic cells.
pub trait Packed: Copy + Default + std::fmt::Debug + Send + Sync + 'static {
    const LANES: usize;

    fn pack(&self, lanes: &mut [f32]);

    fn unpack(lanes: &[f32]) -> Self;
}

impl Packed for f32 {
    const LANES: usize = 1;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = *self;
    }

    fn unpack(lanes: &[f32]) -> Self {
        lanes[0]
    }
}

/// Coarse voicing classification of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoicingState {
    #[default]
    Silence,
    Unvoiced,
    Voiced,
}

impl VoicingState {
    pub fn as_lane(self) -> f32 {
        match self {
            Self::Silence => 0.0,
            Self::Unvoiced => 1.0,
            Self::Voiced => 2.0,
        }
    }

    pub fn from_lane(value: f32) -> Self {
        match value.round() as i32 {
            2 => Self::Voiced,
            1 => Self::Unvoiced,
            _ => Self::Silence,
        }
    }

    pub fn is_voiced(self) -> bool {
        self == Self::Voiced
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PitchSample {
    /// Fundamental frequency, `0.0` when no pitch was found.
    pub hz: f32,
    pub confidence: f32,
    pub voicing: VoicingState,
}

impl Packed for PitchSample {
    const LANES: usize = 3;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = self.hz;
        lanes[1] = self.confidence;
        lanes[2] = self.voicing.as_lane();
    }

    fn unpack(lanes: &[f32]) -> Self {
        Self {
            hz: lanes[0],
            confidence: lanes[1],
            voicing: VoicingState::from_lane(lanes[2]),
        }
    }
}

/// One formant slot. Unused slots hold zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FormantSample {
    pub frequency_hz: f32,
    pub bandwidth_hz: f32,
}

impl Packed for FormantSample {
    const LANES: usize = 2;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = self.frequency_hz;
        lanes[1] = self.bandwidth_hz;
    }

    fn unpack(lanes: &[f32]) -> Self {
        Self {
            frequency_hz: lanes[0],
            bandwidth_hz: lanes[1],
        }
    }
}

/// One harmonic slot. Unused slots hold zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HarmonicSample {
    pub frequency_hz: f32,
    pub magnitude: f32,
}

impl Packed for HarmonicSample {
    const LANES: usize = 2;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = self.frequency_hz;
        lanes[1] = self.magnitude;
    }

    fn unpack(lanes: &[f32]) -> Self {
        Self {
            frequency_hz: lanes[0],
            magnitude: lanes[1],
        }
    }
}

/// Min/max envelope of the samples in one hop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformSample {
    pub min: f32,
    pub max: f32,
}

impl Packed for WaveformSample {
    const LANES: usize = 2;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = self.min;
        lanes[1] = self.max;
    }

    fn unpack(lanes: &[f32]) -> Self {
        Self {
            min: lanes[0],
            max: lanes[1],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralFeatures {
    pub centroid_hz: f32,
    pub slope_db_per_khz: f32,
    pub flux: f32,
    pub hnr_db: f32,
    pub cpp_db: f32,
}

impl Packed for SpectralFeatures {
    const LANES: usize = 5;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = self.centroid_hz;
        lanes[1] = self.slope_db_per_khz;
        lanes[2] = self.flux;
        lanes[3] = self.hnr_db;
        lanes[4] = self.cpp_db;
    }

    fn unpack(lanes: &[f32]) -> Self {
        Self {
            centroid_hz: lanes[0],
            slope_db_per_khz: lanes[1],
            flux: lanes[2],
            hnr_db: lanes[3],
            cpp_db: lanes[4],
        }
    }
}

/// Speech-coach scalars. Flags are stored as `0.0`/`1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechMetrics {
    pub speaking: f32,
    /// `1.0` on the frame a syllable nucleus was detected.
    pub syllable: f32,
    /// Syllables per second over the rolling window.
    pub syllable_rate: f32,
    /// Syllables per second of speaking time.
    pub articulation_rate: f32,
    pub pause_ratio: f32,
    /// Pitch standard deviation in semitones.
    pub pitch_variation: f32,
    pub intonation_score: f32,
    pub clarity_score: f32,
}

impl Packed for SpeechMetrics {
    const LANES: usize = 8;

    fn pack(&self, lanes: &mut [f32]) {
        lanes[0] = self.speaking;
        lanes[1] = self.syllable;
        lanes[2] = self.syllable_rate;
        lanes[3] = self.articulation_rate;
        lanes[4] = self.pause_ratio;
        lanes[5] = self.pitch_variation;
        lanes[6] = self.intonation_score;
        lanes[7] = self.clarity_score;
    }

    fn unpack(lanes: &[f32]) -> Self {
        Self {
            speaking: lanes[0],
            syllable: lanes[1],
            syllable_rate: lanes[2],
            articulation_rate: lanes[3],
            pause_ratio: lanes[4],
            pitch_variation: lanes[5],
            intonation_score: lanes[6],
            clarity_score: lanes[7],
        }
    }
}

/// Producer-owned scratch holding one frame before it is published.
///
/// Allocated once per store shape and reused for every hop.
#[derive(Debug, Clone, Default)]
pub struct FrameRecord {
    pub spectrogram: Vec<f32>,
    pub linear_magnitudes: Vec<f32>,
    pub pitch: PitchSample,
    pub formants: Vec<FormantSample>,
    pub harmonics: Vec<HarmonicSample>,
    pub waveform: WaveformSample,
    pub spectral: SpectralFeatures,
    pub speech: SpeechMetrics,
}

impl FrameRecord {
    pub fn new(shape: &StoreShape) -> Self {
        Self {
            spectrogram: vec![0.0; shape.display_bins],
            linear_magnitudes: vec![0.0; shape.analysis_bins],
            formants: vec![FormantSample::default(); shape.max_formants],
            harmonics: vec![HarmonicSample::default(); shape.max_harmonics],
            ..Default::default()
        }
    }

    pub fn matches(&self, shape: &StoreShape) -> bool {
        self.spectrogram.len() == shape.display_bins
            && self.linear_magnitudes.len() == shape.analysis_bins
            && self.formants.len() == shape.max_formants
            && self.harmonics.len() == shape.max_harmonics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voicing_survives_lane_packing() {
        let sample = PitchSample {
            hz: 220.0,
            confidence: 0.9,
            voicing: VoicingState::Voiced,
        };
        let mut lanes = [0.0; MAX_LANES];
        sample.pack(&mut lanes);
        assert_eq!(PitchSample::unpack(&lanes), sample);
    }

    #[test]
    fn records_fit_lane_budget() {
        assert!(SpeechMetrics::LANES <= MAX_LANES);
        assert!(SpectralFeatures::LANES <= MAX_LANES);
    }
}
