use std::{fmt, sync::Arc};

use realfft::{num_complex::Complex32, ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};

use crate::{display::AnalysisGrid, AnalysisConfig, Result, TransformType, VocalScopeError};

use super::window::WindowSet;

/// Depth below the spectral peak at which the cepstrum's log spectrum is
/// clipped.
const CEPSTRUM_FLOOR_DB: f32 = 80.0;

/// Forward real FFT plan with its scratch buffers.
pub(crate) struct FftResources {
    pub(crate) size: usize,
    pub(crate) plan: Arc<dyn RealToComplex<f32>>,
    pub(crate) scratch: Vec<Complex32>,
    pub(crate) spectrum: Vec<Complex32>,
    pub(crate) input: Vec<f32>,
}

impl FftResources {
    pub(crate) fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        Self {
            size,
            plan,
            scratch,
            spectrum,
            input,
        }
    }

    /// Transforms `frame · window` into `self.spectrum`.
    pub(crate) fn run(&mut self, frame: &[f32], window: &[f32]) -> Result<()> {
        for ((slot, sample), tap) in self.input.iter_mut().zip(frame).zip(window) {
            *slot = sample * tap;
        }
        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;
        Ok(())
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

/// Inverse FFT of a dB spectrum; cepstral pitch and CPP share it.
struct CepstrumResources {
    plan: Arc<dyn ComplexToReal<f32>>,
    scratch: Vec<Complex32>,
    log_spectrum: Vec<Complex32>,
    output: Vec<f32>,
    fresh: bool,
}

enum CqtKernel {
    Peak { first: usize, weights: Vec<f32> },
    Interpolate { lower: usize, frac: f32 },
}

struct ZoomResources {
    factor: usize,
    shift_hz: f32,
    plan: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
    taps: Vec<f32>,
    gain: f32,
    /// Inverse of the boxcar decimator's response at each output bin.
    droop: Vec<f32>,
}

/// Windowed FFT plus the transform-native magnitude grid selected by the
/// config.
pub struct SpectralTransform {
    kind: TransformType,
    sample_rate: f32,
    fft: FftResources,
    window: WindowSet,
    magnitudes: Vec<f32>,
    cepstrum: CepstrumResources,
    cqt: Vec<CqtKernel>,
    zoom: Option<ZoomResources>,
    grid: AnalysisGrid,
}

impl SpectralTransform {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = FftResources::new(&mut planner, config.fft_size);
        let window = WindowSet::new(config.window, config.fft_size);
        let inverse = planner.plan_fft_inverse(config.fft_size);
        let cepstrum = CepstrumResources {
            scratch: inverse.make_scratch_vec(),
            log_spectrum: inverse.make_input_vec(),
            output: inverse.make_output_vec(),
            plan: inverse,
            fresh: false,
        };

        let sample_rate = config.sample_rate as f32;
        let grid = crate::display::grid_for_config(config);
        let bin_hz = sample_rate / config.fft_size as f32;
        let cqt = match &grid {
            AnalysisGrid::Cqt {
                frequencies,
                bins_per_octave,
            } => cqt_kernels(frequencies, *bins_per_octave, bin_hz, config.fft_size / 2 + 1),
            _ => Vec::new(),
        };
        let zoom = match &grid {
            AnalysisGrid::ZoomFft {
                start_hz,
                resolution_hz,
                bins,
            } => Some(ZoomResources::new(
                config.fft_size,
                config.zoom_factor,
                *start_hz,
                *resolution_hz,
                *bins,
                &window,
            )),
            _ => None,
        };

        Ok(Self {
            kind: config.transform,
            sample_rate,
            magnitudes: vec![0.0; config.fft_size / 2 + 1],
            fft,
            window,
            cepstrum,
            cqt,
            zoom,
            grid,
        })
    }

    pub fn kind(&self) -> TransformType {
        self.kind
    }

    pub fn fft_size(&self) -> usize {
        self.fft.size
    }

    pub fn bin_hz(&self) -> f32 {
        self.sample_rate / self.fft.size as f32
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Samples of history the native transform needs.
    pub fn required_samples(&self) -> usize {
        self.fft.size * self.zoom.as_ref().map_or(1, |zoom| zoom.factor)
    }

    pub fn grid(&self) -> &AnalysisGrid {
        &self.grid
    }

    pub fn analysis_bins(&self) -> usize {
        self.grid.bins()
    }

    pub fn window(&self) -> &WindowSet {
        &self.window
    }

    /// FFT magnitudes of the last analysed frame, a full-scale sine reads 1.0.
    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitudes
    }

    pub fn spectrum(&self) -> &[Complex32] {
        &self.fft.spectrum
    }

    /// Runs the windowed FFT over the newest `fft_size` samples of `history`.
    pub fn analyze(&mut self, history: &[f32]) -> Result<()> {
        let size = self.fft.size;
        if history.len() < size {
            return Err(VocalScopeError::InvalidInput(
                "not enough samples for one FFT frame",
            ));
        }
        let frame = &history[history.len() - size..];
        self.fft.run(frame, &self.window.taps)?;
        let scale = 2.0 / self.window.coherent_gain;
        for (magnitude, bin) in self.magnitudes.iter_mut().zip(&self.fft.spectrum) {
            *magnitude = bin.norm() * scale;
        }
        self.cepstrum.fresh = false;
        Ok(())
    }

    /// Fills `out` with magnitudes on the native grid. `analyze` must have
    /// run on the same history first.
    pub fn native(&mut self, history: &[f32], out: &mut [f32]) -> Result<()> {
        if out.len() < self.analysis_bins() {
            return Err(VocalScopeError::InvalidInput(
                "native magnitude buffer is too small",
            ));
        }
        match self.kind {
            TransformType::Fft => {
                out[..self.magnitudes.len()].copy_from_slice(&self.magnitudes);
            }
            TransformType::Cqt => {
                for (value, kernel) in out.iter_mut().zip(&self.cqt) {
                    *value = match kernel {
                        CqtKernel::Peak { first, weights } => weights
                            .iter()
                            .zip(&self.magnitudes[*first..])
                            .fold(0.0f32, |peak, (weight, magnitude)| {
                                peak.max(weight * magnitude)
                            }),
                        CqtKernel::Interpolate { lower, frac } => {
                            let upper = (lower + 1).min(self.magnitudes.len() - 1);
                            self.magnitudes[*lower] * (1.0 - frac) + self.magnitudes[upper] * frac
                        }
                    };
                }
            }
            TransformType::ZoomFft => {
                let sample_rate = self.sample_rate;
                let zoom = self.zoom.as_mut().ok_or(VocalScopeError::InvalidInput(
                    "zoom resources are missing",
                ))?;
                zoom.process(history, sample_rate, out)?;
            }
        }
        Ok(())
    }

    /// Real cepstrum of the dB spectrum of the last analysed frame, indexed
    /// by quefrency in samples.
    pub fn cepstrum(&mut self) -> Result<&[f32]> {
        let cepstrum = &mut self.cepstrum;
        if !cepstrum.fresh {
            let peak = self
                .fft
                .spectrum
                .iter()
                .map(|bin| bin.norm())
                .fold(1e-9f32, f32::max);
            let floor_db = 20.0 * peak.log10() - CEPSTRUM_FLOOR_DB;
            for (slot, bin) in cepstrum.log_spectrum.iter_mut().zip(&self.fft.spectrum) {
                let db = 20.0 * bin.norm().max(1e-9).log10();
                *slot = Complex32::new(db.max(floor_db), 0.0);
            }
            cepstrum.plan.process_with_scratch(
                &mut cepstrum.log_spectrum,
                &mut cepstrum.output,
                &mut cepstrum.scratch,
            )?;
            let scale = 1.0 / self.fft.size as f32;
            cepstrum.output.iter_mut().for_each(|value| *value *= scale);
            cepstrum.fresh = true;
        }
        Ok(&self.cepstrum.output)
    }
}

impl fmt::Debug for SpectralTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralTransform")
            .field("kind", &self.kind)
            .field("fft", &self.fft)
            .field("window", &self.window.kind)
            .field("analysis_bins", &self.analysis_bins())
            .finish()
    }
}

/// Triangular spectral kernels spanning the neighbouring CQT centres. Bins
/// narrower than two FFT bins fall back to interpolation.
fn cqt_kernels(
    frequencies: &[f32],
    bins_per_octave: usize,
    bin_hz: f32,
    fft_bins: usize,
) -> Vec<CqtKernel> {
    let ratio = 2f32.powf(1.0 / bins_per_octave as f32);
    frequencies
        .iter()
        .map(|&center| {
            let lower = center / ratio;
            let upper = center * ratio;
            if upper - lower < 2.0 * bin_hz {
                let position = (center / bin_hz).min((fft_bins - 1) as f32);
                let index = position.floor() as usize;
                return CqtKernel::Interpolate {
                    lower: index,
                    frac: position - index as f32,
                };
            }
            let first = ((lower / bin_hz).ceil() as usize).min(fft_bins - 1);
            let last = ((upper / bin_hz).floor() as usize).min(fft_bins - 1);
            let weights = (first..=last)
                .map(|bin| {
                    let hz = bin as f32 * bin_hz;
                    if hz <= center {
                        (hz - lower) / (center - lower)
                    } else {
                        (upper - hz) / (upper - center)
                    }
                    .clamp(0.0, 1.0)
                })
                .collect();
            CqtKernel::Peak { first, weights }
        })
        .collect()
}

impl ZoomResources {
    fn new(
        fft_size: usize,
        factor: usize,
        start_hz: f32,
        resolution_hz: f32,
        bins: usize,
        window: &WindowSet,
    ) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex32::default(); plan.get_inplace_scratch_len()];
        let span = resolution_hz * fft_size as f32;
        let sample_rate = span * factor as f32;
        let droop = (0..bins)
            .map(|bin| {
                let offset = bin as f32 * resolution_hz - span / 2.0;
                1.0 / boxcar_response(offset, factor, sample_rate).max(0.1)
            })
            .collect();
        Self {
            factor,
            // Centre of the covered span is moved to DC.
            shift_hz: start_hz + span / 2.0,
            plan,
            buffer: vec![Complex32::default(); fft_size],
            scratch,
            taps: window.taps.clone(),
            gain: window.coherent_gain,
            droop,
        }
    }

    fn process(&mut self, history: &[f32], sample_rate: f32, out: &mut [f32]) -> Result<()> {
        let size = self.buffer.len();
        let needed = size * self.factor;
        if history.len() < needed {
            return Err(VocalScopeError::InvalidInput(
                "not enough samples for the zoom transform",
            ));
        }
        let samples = &history[history.len() - needed..];
        let step = -2.0 * std::f32::consts::PI * self.shift_hz / sample_rate;
        let norm = 1.0 / self.factor as f32;

        for (index, (slot, tap)) in self.buffer.iter_mut().zip(&self.taps).enumerate() {
            let start = index * self.factor;
            let mut acc = Complex32::default();
            for (offset, sample) in samples[start..start + self.factor].iter().enumerate() {
                let phase = step * (start + offset) as f32;
                acc += Complex32::from_polar(*sample, phase);
            }
            *slot = acc * (norm * tap);
        }
        self.plan
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 2.0 / self.gain;
        let half = size / 2;
        for (bin, (value, droop)) in out.iter_mut().zip(&self.droop).enumerate() {
            *value = self.buffer[(bin + half) % size].norm() * scale * droop;
        }
        Ok(())
    }
}

/// Magnitude response of an `factor`-tap moving average at `hz`.
fn boxcar_response(hz: f32, factor: usize, sample_rate: f32) -> f32 {
    let x = std::f32::consts::PI * hz / sample_rate;
    if x.abs() < 1e-6 {
        return 1.0;
    }
    ((x * factor as f32).sin() / (factor as f32 * x.sin())).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrequencyScale, TransformType};

    fn sine(hz: f32, rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|index| (2.0 * std::f32::consts::PI * hz * index as f32 / rate).sin())
            .collect()
    }

    fn peak(values: &[f32]) -> (usize, f32) {
        values
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (index, value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            })
    }

    #[test]
    fn fft_magnitude_of_full_scale_sine_is_one() {
        let config = AnalysisConfig::default();
        let mut transform = SpectralTransform::new(&config).unwrap();
        let bin_hz = transform.bin_hz();
        let signal = sine(100.0 * bin_hz, 48_000.0, 2048);
        transform.analyze(&signal).unwrap();
        let (bin, magnitude) = peak(transform.magnitudes());
        assert_eq!(bin, 100);
        assert!((magnitude - 1.0).abs() < 0.02, "magnitude {magnitude}");
    }

    #[test]
    fn cqt_peaks_at_tone_bin() {
        let config = AnalysisConfig {
            transform: TransformType::Cqt,
            frequency_scale: FrequencyScale::Log,
            min_hz: 110.0,
            max_hz: 7_040.0,
            cqt_bins_per_octave: 12,
            ..AnalysisConfig::default()
        };
        let mut transform = SpectralTransform::new(&config).unwrap();
        let bins = transform.analysis_bins();
        assert_eq!(bins, config.analysis_bins());
        let signal = sine(1_760.0, 48_000.0, 2048);
        transform.analyze(&signal).unwrap();
        let mut out = vec![0.0; bins];
        transform.native(&signal, &mut out).unwrap();
        // 1760 Hz is four octaves above 110 Hz.
        assert_eq!(peak(&out).0, 48);
    }

    #[test]
    fn zoom_resolves_close_tones() {
        let config = AnalysisConfig {
            transform: TransformType::ZoomFft,
            min_hz: 200.0,
            max_hz: 1_200.0,
            zoom_factor: 8,
            ..AnalysisConfig::default()
        };
        let mut transform = SpectralTransform::new(&config).unwrap();
        assert_eq!(transform.required_samples(), 2048 * 8);
        let resolution = config.zoom_resolution_hz();
        let tone = 200.0 + 150.0 * resolution;
        let signal = sine(tone, 48_000.0, transform.required_samples());
        transform.analyze(&signal).unwrap();
        let mut out = vec![0.0; transform.analysis_bins()];
        transform.native(&signal, &mut out).unwrap();
        let (bin, magnitude) = peak(&out);
        assert_eq!(bin, 150);
        assert!((magnitude - 1.0).abs() < 0.15, "magnitude {magnitude}");
    }

    #[test]
    fn cepstrum_peaks_at_pulse_period() {
        let config = AnalysisConfig::default();
        let mut transform = SpectralTransform::new(&config).unwrap();
        let period = 240;
        let signal: Vec<f32> = (0..2048)
            .map(|index| if index % period == 0 { 1.0 } else { 0.0 })
            .collect();
        transform.analyze(&signal).unwrap();
        let cepstrum = transform.cepstrum().unwrap();
        let (quefrency, _) = peak(&cepstrum[100..400]);
        assert!((quefrency + 100).abs_diff(period) <= 2);
    }
}
