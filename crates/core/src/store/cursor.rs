use super::{FeatureStore, Packed, RangeCopy, StoreShape};
use crate::capability::Capabilities;

/// A feature family readable through a [`FeatureCursor`].
pub trait FeatureFamily {
    type Item: Packed;

    /// Stages whose re-arming invalidates history built from this family.
    const CAPABILITY: Capabilities;

    /// Items per frame for the given store shape.
    fn width(shape: &StoreShape) -> usize;

    fn try_copy(
        store: &FeatureStore,
        last_copied: i64,
        seen_version: Option<u64>,
        dest: &mut [Self::Item],
    ) -> Option<RangeCopy>;
}

/// Marker types naming each family of the store.
pub mod family {
    use super::super::{
        FeatureStore, FormantSample, HarmonicSample, PitchSample, RangeCopy, SpectralFeatures,
        SpeechMetrics, StoreShape, WaveformSample,
    };
    use super::FeatureFamily;
    use crate::capability::Capabilities;

    macro_rules! families {
        ($($name:ident => $item:ty, $method:ident, $caps:expr, |$shape:ident| $width:expr;)*) => {
            $(
                #[derive(Debug, Clone, Copy)]
                pub struct $name;

                impl FeatureFamily for $name {
                    type Item = $item;

                    const CAPABILITY: Capabilities = $caps;

                    fn width($shape: &StoreShape) -> usize {
                        $width
                    }

                    fn try_copy(
                        store: &FeatureStore,
                        last_copied: i64,
                        seen_version: Option<u64>,
                        dest: &mut [$item],
                    ) -> Option<RangeCopy> {
                        store.$method(last_copied, seen_version, dest)
                    }
                }
            )*
        };
    }

    families! {
        Spectrogram => f32, try_get_spectrogram_range,
            Capabilities::SPECTROGRAM, |shape| shape.display_bins;
        LinearMagnitudes => f32, try_get_linear_magnitude_range,
            Capabilities::LINEAR_MAGNITUDES, |shape| shape.analysis_bins;
        Pitch => PitchSample, try_get_pitch_range,
            Capabilities::PITCH.union(Capabilities::VOICING), |_shape| 1;
        Formants => FormantSample, try_get_formant_range,
            Capabilities::FORMANTS, |shape| shape.max_formants;
        Harmonics => HarmonicSample, try_get_harmonic_range,
            Capabilities::HARMONICS, |shape| shape.max_harmonics;
        Waveform => WaveformSample, try_get_waveform_range,
            Capabilities::WAVEFORM, |_shape| 1;
        Spectral => SpectralFeatures, try_get_spectral_feature_range,
            Capabilities::SPECTRAL_FEATURES, |_shape| 1;
        Speech => SpeechMetrics, try_get_speech_metric_range,
            Capabilities::SPEECH_METRICS, |_shape| 1;
    }
}

/// Result of a [`FeatureCursor::poll`] that found data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorUpdate {
    pub latest_frame_id: i64,
    pub available_frames: usize,
    pub new_frames: usize,
    /// Frame-to-frame state derived from earlier polls must be discarded.
    pub discontinuity: bool,
}

/// Consumer-side mirror of one feature family.
///
/// Tracks the last copied frame, the store version and epoch it was copied
/// under and the activation generation of the family's stages. Owns a
/// destination buffer that is reallocated whenever the store shape changes.
#[derive(Debug, Clone)]
pub struct FeatureCursor<F: FeatureFamily> {
    buffer: Vec<F::Item>,
    width: usize,
    capacity: usize,
    last_copied: i64,
    available: usize,
    data_version: Option<u64>,
    epoch: u64,
    activation: u64,
    /// A discontinuity seen while the store had nothing to copy.
    pending_discontinuity: bool,
}

impl<F: FeatureFamily> Default for FeatureCursor<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FeatureFamily> FeatureCursor<F> {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            width: 0,
            capacity: 0,
            last_copied: -1,
            available: 0,
            data_version: None,
            epoch: 0,
            activation: 0,
            pending_discontinuity: false,
        }
    }

    /// Pulls any frames published since the previous poll.
    ///
    /// Returns `None` while the store is empty or when a resize raced this
    /// poll; both resolve themselves on a later poll. A discontinuity noticed
    /// during such a poll is reported by the next one that returns data.
    pub fn poll(&mut self, store: &FeatureStore) -> Option<CursorUpdate> {
        let status = store.status();
        let epoch = store.epoch();
        let activation = store.activation_generation(F::CAPABILITY);
        let width = F::width(&status.shape);
        let mut discontinuity = self.pending_discontinuity;

        if self.data_version != Some(status.data_version)
            || self.width != width
            || self.capacity != status.shape.capacity
        {
            self.buffer.clear();
            self.buffer
                .resize(status.shape.capacity * width, F::Item::default());
            self.width = width;
            self.capacity = status.shape.capacity;
            self.data_version = Some(status.data_version);
            self.last_copied = -1;
            self.available = 0;
            discontinuity = true;
        }
        if epoch != self.epoch {
            self.epoch = epoch;
            self.last_copied = -1;
            discontinuity = true;
        }
        if activation != self.activation {
            self.activation = activation;
            discontinuity = true;
        }
        self.pending_discontinuity = discontinuity;

        let copy = F::try_copy(store, self.last_copied, self.data_version, &mut self.buffer)?;
        if copy.data_version != status.data_version {
            self.data_version = None;
            return None;
        }

        self.pending_discontinuity = false;
        self.last_copied = copy.latest_frame_id;
        self.available = copy.available_frames;
        Some(CursorUpdate {
            latest_frame_id: copy.latest_frame_id,
            available_frames: copy.available_frames,
            new_frames: copy.copied_frames,
            discontinuity: discontinuity || copy.full_copy,
        })
    }

    pub fn latest_frame_id(&self) -> i64 {
        self.last_copied
    }

    pub fn available_frames(&self) -> usize {
        self.available
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Ring-ordered mirror of the store column.
    pub fn buffer(&self) -> &[F::Item] {
        &self.buffer
    }

    /// Items of `frame_id`, if it is inside the mirrored window.
    pub fn frame(&self, frame_id: i64) -> Option<&[F::Item]> {
        let oldest = self.last_copied - self.available as i64 + 1;
        if self.capacity == 0 || frame_id < oldest || frame_id > self.last_copied {
            return None;
        }
        let slot = frame_id.rem_euclid(self.capacity as i64) as usize;
        self.buffer.get(slot * self.width..(slot + 1) * self.width)
    }

    /// Items of `frame_id`, or of the newest mirrored frame when this cursor
    /// has not reached `frame_id` yet. Returns the id actually used.
    pub fn frame_at_or_before(&self, frame_id: i64) -> Option<(i64, &[F::Item])> {
        let frame_id = frame_id.min(self.last_copied);
        self.frame(frame_id).map(|items| (frame_id, items))
    }

    /// Items of the newest `count` frames, oldest first.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = (i64, &[F::Item])> + '_ {
        let count = count.min(self.available) as i64;
        let first = self.last_copied - count + 1;
        (first..=self.last_copied)
            .filter_map(move |frame_id| self.frame(frame_id).map(|items| (frame_id, items)))
    }
}
