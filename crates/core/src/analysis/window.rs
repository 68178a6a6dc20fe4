use std::f32::consts::PI;

use crate::WindowFunction;

const GAUSSIAN_SIGMA: f32 = 0.4;
const KAISER_BETA: f32 = 8.6;

impl WindowFunction {
    /// Symmetric window of `len` taps.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        (0..len).map(|index| self.value(index, len)).collect()
    }

    pub fn value(self, index: usize, len: usize) -> f32 {
        if len <= 1 {
            return 1.0;
        }
        let n = index as f32;
        let denom = (len - 1) as f32;
        let phase = 2.0 * PI * n / denom;
        match self {
            Self::Hann => 0.5 - 0.5 * phase.cos(),
            Self::Hamming => 0.54 - 0.46 * phase.cos(),
            Self::BlackmanHarris => {
                0.358_75 - 0.488_29 * phase.cos() + 0.141_28 * (2.0 * phase).cos()
                    - 0.011_68 * (3.0 * phase).cos()
            }
            Self::Gaussian => {
                let half = denom / 2.0;
                let x = (n - half) / (GAUSSIAN_SIGMA * half);
                (-0.5 * x * x).exp()
            }
            Self::Kaiser => {
                let ratio = 2.0 * n / denom - 1.0;
                bessel_i0(KAISER_BETA * (1.0 - ratio * ratio).max(0.0).sqrt())
                    / bessel_i0(KAISER_BETA)
            }
        }
    }
}

/// Zeroth-order modified Bessel function of the first kind (power series).
fn bessel_i0(x: f32) -> f32 {
    let half = x as f64 / 2.0;
    let mut term = 1.0f64;
    let mut sum = 1.0f64;
    for k in 1..64 {
        term *= (half / k as f64).powi(2);
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum as f32
}

/// Window taps plus the derived windows used by reassignment.
#[derive(Debug, Clone)]
pub struct WindowSet {
    pub kind: WindowFunction,
    pub taps: Vec<f32>,
    /// `dw/dn` in samples, central differences.
    pub derivative: Vec<f32>,
    /// `n · w[n]` with `n` centred on the frame middle.
    pub time_ramped: Vec<f32>,
    /// Sum of taps, used to normalise magnitudes so a full-scale sine reads 1.0.
    pub coherent_gain: f32,
}

impl WindowSet {
    pub fn new(kind: WindowFunction, len: usize) -> Self {
        let taps = kind.coefficients(len);
        let derivative = (0..len)
            .map(|index| {
                let prev = if index == 0 { 0.0 } else { taps[index - 1] };
                let next = taps.get(index + 1).copied().unwrap_or(0.0);
                0.5 * (next - prev)
            })
            .collect();
        let middle = (len as f32 - 1.0) / 2.0;
        let time_ramped = taps
            .iter()
            .enumerate()
            .map(|(index, tap)| (index as f32 - middle) * tap)
            .collect();
        let coherent_gain = taps.iter().sum::<f32>().max(f32::EPSILON);
        Self {
            kind,
            taps,
            derivative,
            time_ramped,
            coherent_gain,
        }
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_peak_in_the_middle() {
        for kind in [
            WindowFunction::Hann,
            WindowFunction::Hamming,
            WindowFunction::BlackmanHarris,
            WindowFunction::Gaussian,
            WindowFunction::Kaiser,
        ] {
            let taps = kind.coefficients(129);
            assert!((taps[64] - 1.0).abs() < 1e-3, "{kind:?} centre {}", taps[64]);
            assert!(taps[0] < 0.1, "{kind:?} edge {}", taps[0]);
            assert!((taps[10] - taps[118]).abs() < 1e-5);
        }
    }

    #[test]
    fn derived_windows_are_antisymmetric() {
        let set = WindowSet::new(WindowFunction::Hann, 64);
        assert_eq!(set.len(), 64);
        assert!((set.derivative[10] + set.derivative[53]).abs() < 1e-5);
        assert!((set.time_ramped[5] + set.time_ramped[58]).abs() < 1e-4);
        assert!((set.coherent_gain - 31.5).abs() < 1e-3);
    }
}
