//! Time-frequency reassignment of the FFT frame onto the display grid.

use std::f32::consts::PI;

use realfft::RealFftPlanner;

use crate::{display::BinMapping, ReassignMode, Result, VocalScopeError};

use super::transform::{FftResources, SpectralTransform};

/// Components more than this far below the frame peak are not reassigned.
const MIN_RELATIVE_POWER: f32 = 1e-8;

#[derive(Debug)]
pub struct Reassigner {
    mode: ReassignMode,
    hop: usize,
    derivative: FftResources,
    ramped: FftResources,
}

impl Reassigner {
    pub fn new(mode: ReassignMode, fft_size: usize, hop: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        Self {
            mode,
            hop,
            derivative: FftResources::new(&mut planner, fft_size),
            ramped: FftResources::new(&mut planner, fft_size),
        }
    }

    pub fn mode(&self) -> ReassignMode {
        self.mode
    }

    /// Moves every FFT component of the newest frame to its reassigned
    /// frequency and keeps the loudest component per display bin. Components
    /// whose energy centre lies outside the current hop are dropped when time
    /// reassignment is on. `transform` must already hold the frame's FFT.
    pub fn accumulate(
        &mut self,
        frame: &[f32],
        transform: &SpectralTransform,
        mapping: &BinMapping,
        out: &mut [f32],
    ) -> Result<()> {
        if out.len() != mapping.display_bins() {
            return Err(VocalScopeError::InvalidInput(
                "reassignment target does not match the display grid",
            ));
        }
        let size = transform.fft_size();
        if frame.len() < size {
            return Err(VocalScopeError::InvalidInput(
                "not enough samples for one FFT frame",
            ));
        }
        let frame = &frame[frame.len() - size..];
        let window = transform.window();
        if self.mode.reassigns_frequency() {
            self.derivative.run(frame, &window.derivative)?;
        }
        if self.mode.reassigns_time() {
            self.ramped.run(frame, &window.time_ramped)?;
        }

        out.fill(0.0);
        let spectrum = transform.spectrum();
        let peak_power = spectrum.iter().map(|bin| bin.norm_sqr()).fold(0.0f32, f32::max);
        if peak_power <= f32::EPSILON {
            return Ok(());
        }
        let scale = 2.0 / window.coherent_gain;
        let bin_hz = transform.bin_hz();
        let half_hop = self.hop as f32 * 0.5;
        let radians_to_bins = size as f32 / (2.0 * PI);

        for (bin, value) in spectrum.iter().enumerate() {
            let power = value.norm_sqr();
            if power < peak_power * MIN_RELATIVE_POWER {
                continue;
            }
            if self.mode.reassigns_time() {
                let offset = (self.ramped.spectrum[bin] * value.conj()).re / power;
                if offset.abs() > half_hop {
                    continue;
                }
            }
            let position = if self.mode.reassigns_frequency() {
                let shift = (self.derivative.spectrum[bin] * value.conj()).im / power;
                bin as f32 - radians_to_bins * shift
            } else {
                bin as f32
            };
            if let Some(target) = mapping.bin_for_frequency(position * bin_hz) {
                let magnitude = power.sqrt() * scale;
                if magnitude > out[target] {
                    out[target] = magnitude;
                }
            }
        }
        Ok(())
    }
}
