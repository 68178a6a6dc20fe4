use crate::ClarityMode;

/// Rate at which the noise estimate climbs back towards the signal.
const NOISE_RISE: f32 = 0.02;
const OVER_SUBTRACTION: f32 = 1.5;
const SPECTRAL_FLOOR: f32 = 0.05;
const HARMONIC_BOOST: f32 = 2.0;
/// Distance from a harmonic, in units of `f0`, where the boost fades out.
const HARMONIC_WIDTH: f32 = 0.25;

/// Optional enhancement applied to linear magnitudes on the display grid.
#[derive(Debug, Clone)]
pub struct ClarityProcessor {
    mode: ClarityMode,
    noise: Vec<f32>,
    primed: bool,
}

impl ClarityProcessor {
    pub fn new(mode: ClarityMode) -> Self {
        Self {
            mode,
            noise: Vec::new(),
            primed: false,
        }
    }

    pub fn mode(&self) -> ClarityMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ClarityMode) {
        if mode != self.mode {
            self.mode = mode;
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.primed = false;
    }

    /// Enhances `magnitudes` in place. `centers` gives each bin's frequency
    /// and `f0_hz` is `0.0` for unvoiced frames.
    pub fn apply(&mut self, magnitudes: &mut [f32], centers: &[f32], f0_hz: f32) {
        if self.mode.removes_noise() {
            self.subtract_noise(magnitudes);
        }
        if self.mode.enhances_harmonics() && f0_hz > 0.0 {
            for (value, center) in magnitudes.iter_mut().zip(centers) {
                let position = center / f0_hz;
                if position < 0.5 {
                    continue;
                }
                let distance = (position - position.round()).abs();
                let weight = (1.0 - distance / HARMONIC_WIDTH).max(0.0);
                *value *= 1.0 + (HARMONIC_BOOST - 1.0) * weight;
            }
        }
    }

    /// Spectral subtraction against a minimum-tracked noise profile.
    fn subtract_noise(&mut self, magnitudes: &mut [f32]) {
        if !self.primed || self.noise.len() != magnitudes.len() {
            self.noise.clear();
            self.noise.extend_from_slice(magnitudes);
            self.primed = true;
        }
        for (value, floor) in magnitudes.iter_mut().zip(self.noise.iter_mut()) {
            if *value < *floor {
                *floor = *value;
            } else {
                *floor += NOISE_RISE * (*value - *floor);
            }
            *value = (*value - OVER_SUBTRACTION * *floor).max(SPECTRAL_FLOOR * *value);
        }
    }
}
