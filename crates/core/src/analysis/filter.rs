//! Input conditioning applied to every sample before framing.

use std::f32::consts::PI;

const PRE_EMPHASIS: f32 = 0.97;
const BUTTERWORTH_Q: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Second-order IIR section in transposed direct form II.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Default for Biquad {
    fn default() -> Self {
        Self::passthrough()
    }
}

impl Biquad {
    pub fn passthrough() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// RBJ cookbook high-pass.
    pub fn high_pass(cutoff_hz: f32, q: f32, sample_rate: f32) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let alpha = w0.sin() / (2.0 * q.max(1e-6));
        let cos_w0 = w0.cos();
        let inv_a0 = 1.0 / (1.0 + alpha);
        Self {
            b0: (1.0 + cos_w0) * 0.5 * inv_a0,
            b1: -(1.0 + cos_w0) * inv_a0,
            b2: (1.0 + cos_w0) * 0.5 * inv_a0,
            a1: -2.0 * cos_w0 * inv_a0,
            a2: (1.0 - alpha) * inv_a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let out = input * self.b0 + self.z1;
        self.z1 = input * self.b1 + self.z2 - self.a1 * out;
        self.z2 = input * self.b2 - self.a2 * out;
        out
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// High-pass and pre-emphasis chain driven by the live config.
#[derive(Debug, Clone, Default)]
pub struct InputConditioner {
    high_pass: Option<Biquad>,
    pre_emphasis: bool,
    previous: f32,
}

impl InputConditioner {
    pub fn new(
        sample_rate: f32,
        high_pass_hz: Option<f32>,
        pre_emphasis: bool,
    ) -> Self {
        Self {
            high_pass: high_pass_hz
                .map(|cutoff| Biquad::high_pass(cutoff, BUTTERWORTH_Q, sample_rate)),
            pre_emphasis,
            previous: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let filtered = match self.high_pass.as_mut() {
            Some(filter) => filter.process(sample),
            None => sample,
        };
        if !self.pre_emphasis {
            return filtered;
        }
        let out = filtered - PRE_EMPHASIS * self.previous;
        self.previous = filtered;
        out
    }

    pub fn reset(&mut self) {
        if let Some(filter) = self.high_pass.as_mut() {
            filter.reset();
        }
        self.previous = 0.0;
    }
}

/// In-place first-order pre-emphasis over a whole frame.
pub fn pre_emphasize(frame: &mut [f32], coefficient: f32) {
    for index in (1..frame.len()).rev() {
        frame[index] -= coefficient * frame[index - 1];
    }
}
