//! Versioned ring buffer of analysis frames.
//!
//! One [`FeatureWriter`] publishes frames; any number of cloned
//! [`FeatureStore`] readers copy the frames they have not seen yet. There are
//! no locks on either side:
//!
//! * payload values live in atomic cells, so a reader racing the writer can
//!   at worst see a mix of old and new values for a slot, never garbage;
//! * the writer bumps a sequence counter around every slot write and publishes
//!   `latest_frame_id` only after the payload is in place;
//! * readers validate each copy against the sequence counter and retry a few
//!   times if the writer lapped the slots they were copying;
//! * a resize swaps the whole ring at once and bumps `data_version`; a reader
//!   that passes the version it last copied under gets a full copy after it;
//! * every stage activation bumps a per-capability generation so consumers
//!   can drop history that spans an idle gap.
//!
//! Destination buffers mirror the ring: frame `id` of a family with item width
//! `w` is copied to `dest[(id % capacity) * w..][..w]`.

mod cursor;
mod frame;

use std::{
    marker::PhantomData,
    sync::{
        atomic::{fence, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;

use crate::capability::{Capabilities, CAPABILITY_COUNT};

pub use cursor::{family, CursorUpdate, FeatureCursor, FeatureFamily};
pub use frame::{
    FormantSample, FrameRecord, HarmonicSample, Packed, PitchSample, SpectralFeatures,
    SpeechMetrics, VoicingState, WaveformSample,
};

use frame::MAX_LANES;

/// Copy attempts before a reader settles for a possibly torn copy.
const MAX_READ_ATTEMPTS: usize = 3;

/// Everything that determines how much memory the ring needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreShape {
    pub capacity: usize,
    pub display_bins: usize,
    pub analysis_bins: usize,
    pub max_formants: usize,
    pub max_harmonics: usize,
}

impl StoreShape {
    /// Atomic cells a ring of this shape allocates across all families.
    pub fn cells(&self) -> usize {
        let per_frame = (self.display_bins + self.analysis_bins) * f32::LANES
            + PitchSample::LANES
            + self.max_formants * FormantSample::LANES
            + self.max_harmonics * HarmonicSample::LANES
            + WaveformSample::LANES
            + SpectralFeatures::LANES
            + SpeechMetrics::LANES;
        self.capacity.saturating_mul(per_frame)
    }
}

/// Outcome of a successful range copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCopy {
    pub latest_frame_id: i64,
    pub available_frames: usize,
    /// The whole visible window was copied; cached frame-to-frame state is
    /// stale.
    pub full_copy: bool,
    /// Number of frames written into the destination by this call.
    pub copied_frames: usize,
    pub data_version: u64,
    pub capacity: usize,
}

impl RangeCopy {
    pub fn oldest_frame_id(&self) -> i64 {
        self.latest_frame_id - self.available_frames as i64 + 1
    }

    /// Position of `frame_id` inside a ring-mirroring destination.
    pub fn ring_index(&self, frame_id: i64) -> usize {
        frame_id.rem_euclid(self.capacity as i64) as usize
    }

    /// Visible frame ids, oldest first.
    pub fn frame_ids(&self) -> std::ops::RangeInclusive<i64> {
        self.oldest_frame_id()..=self.latest_frame_id
    }
}

/// Point-in-time view of the store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub latest_frame_id: i64,
    pub available_frames: usize,
    pub data_version: u64,
    pub shape: StoreShape,
}

impl StoreStatus {
    pub fn oldest_frame_id(&self) -> i64 {
        self.latest_frame_id - self.available_frames as i64 + 1
    }
}

/// Fixed-width column of packed records backed by atomic `f32` cells.
struct Column<T> {
    cells: Box<[AtomicU32]>,
    width: usize,
    _item: PhantomData<T>,
}

impl<T: Packed> Column<T> {
    fn new(capacity: usize, width: usize) -> Self {
        let cells = (0..capacity * width * T::LANES)
            .map(|_| AtomicU32::new(0))
            .collect();
        Self {
            cells,
            width,
            _item: PhantomData,
        }
    }

    fn frame_cells(&self, slot: usize) -> &[AtomicU32] {
        let stride = self.width * T::LANES;
        &self.cells[slot * stride..(slot + 1) * stride]
    }

    fn write_frame(&self, slot: usize, items: &[T]) {
        let cells = self.frame_cells(slot);
        let mut lanes = [0.0f32; MAX_LANES];
        for index in 0..self.width {
            let item = items.get(index).copied().unwrap_or_default();
            item.pack(&mut lanes[..T::LANES]);
            let base = index * T::LANES;
            for (cell, lane) in cells[base..base + T::LANES].iter().zip(&lanes) {
                cell.store(lane.to_bits(), Ordering::Relaxed);
            }
        }
    }

    fn read_frame(&self, slot: usize, dest: &mut [T]) {
        let cells = self.frame_cells(slot);
        let mut lanes = [0.0f32; MAX_LANES];
        for (index, item) in dest.iter_mut().enumerate().take(self.width) {
            let base = index * T::LANES;
            for (lane, cell) in lanes.iter_mut().zip(&cells[base..base + T::LANES]) {
                *lane = f32::from_bits(cell.load(Ordering::Relaxed));
            }
            *item = T::unpack(&lanes[..T::LANES]);
        }
    }
}

struct FrameRing {
    shape: StoreShape,
    data_version: u64,
    spectrogram: Column<f32>,
    linear_magnitudes: Column<f32>,
    pitch: Column<PitchSample>,
    formants: Column<FormantSample>,
    harmonics: Column<HarmonicSample>,
    waveform: Column<WaveformSample>,
    spectral: Column<SpectralFeatures>,
    speech: Column<SpeechMetrics>,
    latest: AtomicI64,
    /// Odd while the writer is in the middle of a slot update.
    sequence: AtomicU64,
    /// Bumped by every reset so cursors can tell a rewound stream apart.
    epoch: AtomicU64,
}

impl FrameRing {
    fn new(shape: StoreShape, data_version: u64, epoch: u64) -> Self {
        let capacity = shape.capacity;
        Self {
            shape,
            data_version,
            spectrogram: Column::new(capacity, shape.display_bins),
            linear_magnitudes: Column::new(capacity, shape.analysis_bins),
            pitch: Column::new(capacity, 1),
            formants: Column::new(capacity, shape.max_formants),
            harmonics: Column::new(capacity, shape.max_harmonics),
            waveform: Column::new(capacity, 1),
            spectral: Column::new(capacity, 1),
            speech: Column::new(capacity, 1),
            latest: AtomicI64::new(-1),
            sequence: AtomicU64::new(0),
            epoch: AtomicU64::new(epoch),
        }
    }

    fn available(&self, latest: i64) -> usize {
        if latest < 0 {
            0
        } else {
            ((latest + 1) as usize).min(self.shape.capacity)
        }
    }

    fn begin_write(&self) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn end_write(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
    }

    fn copy_column<T: Packed>(
        &self,
        column: &Column<T>,
        last_copied: i64,
        seen_version: Option<u64>,
        dest: &mut [T],
    ) -> Option<RangeCopy> {
        let width = column.width;
        let required = self.shape.capacity * width;
        if dest.len() < required {
            return None;
        }
        let shape_mismatch = dest.len() != required;
        let version_changed = seen_version.is_some_and(|version| version != self.data_version);
        let capacity = self.shape.capacity as i64;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let sequence_before = self.sequence.load(Ordering::Acquire);
            let latest = self.latest.load(Ordering::Acquire);
            if latest < 0 {
                return None;
            }
            let available = self.available(latest);
            let oldest = latest - available as i64 + 1;
            let full_copy = shape_mismatch
                || version_changed
                || last_copied < oldest - 1
                || last_copied > latest;
            let first = if full_copy { oldest } else { last_copied + 1 };

            for frame_id in first..=latest {
                let slot = frame_id.rem_euclid(capacity) as usize;
                column.read_frame(slot, &mut dest[slot * width..(slot + 1) * width]);
            }

            fence(Ordering::Acquire);
            let sequence_after = self.sequence.load(Ordering::Relaxed);
            let latest_after = self.latest.load(Ordering::Relaxed);

            // Slot writes that were in flight at any point during the copy.
            let writes = (sequence_after + 1) / 2 - sequence_before / 2;
            let clobbered_through = latest + writes as i64 - capacity;
            let consistent = latest_after >= latest && first > clobbered_through;

            if consistent || attempt >= MAX_READ_ATTEMPTS {
                return Some(RangeCopy {
                    latest_frame_id: latest,
                    available_frames: available,
                    full_copy,
                    copied_frames: (latest - first + 1).max(0) as usize,
                    data_version: self.data_version,
                    capacity: self.shape.capacity,
                });
            }
        }
    }
}

struct StoreShared {
    ring: ArcSwap<FrameRing>,
    /// Per-capability count of Idle to Active transitions. Outlives resizes.
    activations: [AtomicU64; CAPABILITY_COUNT],
}

impl StoreShared {
    fn activation_generation(&self, caps: Capabilities) -> u64 {
        caps.iter()
            .filter_map(Capabilities::index)
            .map(|index| self.activations[index].load(Ordering::Acquire))
            .sum()
    }
}

/// Creates a store with the given shape, returning its only writer and a
/// cloneable reader.
pub fn feature_store(shape: StoreShape) -> (FeatureWriter, FeatureStore) {
    let ring = Arc::new(FrameRing::new(shape, 0, 0));
    let shared = Arc::new(StoreShared {
        ring: ArcSwap::new(ring.clone()),
        activations: Default::default(),
    });
    let writer = FeatureWriter {
        shared: shared.clone(),
        ring,
    };
    (writer, FeatureStore { shared })
}

/// Single producer side of the store. Not `Clone`.
pub struct FeatureWriter {
    shared: Arc<StoreShared>,
    ring: Arc<FrameRing>,
}

impl FeatureWriter {
    pub fn shape(&self) -> StoreShape {
        self.ring.shape
    }

    pub fn data_version(&self) -> u64 {
        self.ring.data_version
    }

    pub fn latest_frame_id(&self) -> i64 {
        self.ring.latest.load(Ordering::Relaxed)
    }

    /// Writes `frame` into the next slot and then publishes its id.
    ///
    /// Vectors shorter than the store width are zero padded; longer ones are
    /// truncated.
    pub fn publish(&mut self, frame: &FrameRecord) -> i64 {
        let ring = &*self.ring;
        let frame_id = ring.latest.load(Ordering::Relaxed) + 1;
        let slot = frame_id.rem_euclid(ring.shape.capacity as i64) as usize;

        ring.begin_write();
        ring.spectrogram.write_frame(slot, &frame.spectrogram);
        ring.linear_magnitudes
            .write_frame(slot, &frame.linear_magnitudes);
        ring.pitch.write_frame(slot, std::slice::from_ref(&frame.pitch));
        ring.formants.write_frame(slot, &frame.formants);
        ring.harmonics.write_frame(slot, &frame.harmonics);
        ring.waveform
            .write_frame(slot, std::slice::from_ref(&frame.waveform));
        ring.spectral
            .write_frame(slot, std::slice::from_ref(&frame.spectral));
        ring.speech.write_frame(slot, std::slice::from_ref(&frame.speech));
        ring.end_write();

        ring.latest.store(frame_id, Ordering::Release);
        frame_id
    }

    /// Records that the stages behind `caps` restarted from a clean state.
    /// Call before publishing the first frame they produce.
    pub fn mark_activated(&mut self, caps: Capabilities) {
        for index in caps.iter().filter_map(Capabilities::index) {
            self.shared.activations[index].fetch_add(1, Ordering::Release);
        }
    }

    /// Rewinds the store to empty without reallocating.
    pub fn reset(&mut self) {
        let ring = &*self.ring;
        ring.begin_write();
        ring.epoch.fetch_add(1, Ordering::Relaxed);
        ring.latest.store(-1, Ordering::Release);
        ring.end_write();
        tracing::debug!(data_version = ring.data_version, "feature store reset");
    }

    /// Swaps in freshly allocated buffers when `shape` differs from the
    /// current one. Returns whether a resize happened.
    pub fn resize(&mut self, shape: StoreShape) -> bool {
        if shape == self.ring.shape {
            return false;
        }
        let data_version = self.ring.data_version + 1;
        let epoch = self.ring.epoch.load(Ordering::Relaxed) + 1;
        let ring = Arc::new(FrameRing::new(shape, data_version, epoch));
        self.shared.ring.store(ring.clone());
        self.ring = ring;
        tracing::debug!(?shape, data_version, "feature store resized");
        true
    }
}

impl std::fmt::Debug for FeatureWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureWriter")
            .field("shape", &self.ring.shape)
            .field("data_version", &self.ring.data_version)
            .field("latest_frame_id", &self.latest_frame_id())
            .finish()
    }
}

/// Read side of the store. Cheap to clone; every clone polls independently.
#[derive(Clone)]
pub struct FeatureStore {
    shared: Arc<StoreShared>,
}

macro_rules! range_reader {
    ($(#[$doc:meta])* $name:ident, $field:ident, $item:ty) => {
        $(#[$doc])*
        pub fn $name(
            &self,
            last_copied_frame_id: i64,
            seen_version: Option<u64>,
            dest: &mut [$item],
        ) -> Option<RangeCopy> {
            let ring = self.shared.ring.load();
            ring.copy_column(&ring.$field, last_copied_frame_id, seen_version, dest)
        }
    };
}

impl FeatureStore {
    pub fn status(&self) -> StoreStatus {
        let ring = self.shared.ring.load();
        let latest = ring.latest.load(Ordering::Acquire);
        StoreStatus {
            latest_frame_id: latest,
            available_frames: ring.available(latest),
            data_version: ring.data_version,
            shape: ring.shape,
        }
    }

    pub fn latest_frame_id(&self) -> i64 {
        self.shared.ring.load().latest.load(Ordering::Acquire)
    }

    pub fn available_frames(&self) -> usize {
        self.status().available_frames
    }

    pub fn oldest_frame_id(&self) -> i64 {
        self.status().oldest_frame_id()
    }

    pub fn frame_capacity(&self) -> usize {
        self.shape().capacity
    }

    pub fn display_bins(&self) -> usize {
        self.shape().display_bins
    }

    pub fn analysis_bins(&self) -> usize {
        self.shape().analysis_bins
    }

    pub fn max_formants(&self) -> usize {
        self.shape().max_formants
    }

    pub fn max_harmonics(&self) -> usize {
        self.shape().max_harmonics
    }

    pub fn data_version(&self) -> u64 {
        self.shared.ring.load().data_version
    }

    pub fn shape(&self) -> StoreShape {
        self.shared.ring.load().shape
    }

    /// Reset counter; changes whenever the stream is rewound or resized.
    pub fn epoch(&self) -> u64 {
        self.shared.ring.load().epoch.load(Ordering::Acquire)
    }

    /// Sum of the activation generations of `caps`. Changes whenever any of
    /// those stages was re-armed.
    pub fn activation_generation(&self, caps: Capabilities) -> u64 {
        self.shared.activation_generation(caps)
    }

    // Range readers copy frames after `last_copied_frame_id` into a
    // ring-mirroring `dest`. Passing the `data_version` of the previous copy
    // as `seen_version` forces a full copy once the store was resized.
    range_reader!(
        /// Display-resolution spectrogram columns, `display_bins` per frame.
        try_get_spectrogram_range, spectrogram, f32
    );
    range_reader!(
        /// Transform-native magnitudes, `analysis_bins` per frame.
        try_get_linear_magnitude_range, linear_magnitudes, f32
    );
    range_reader!(try_get_pitch_range, pitch, PitchSample);
    range_reader!(
        /// `max_formants` slots per frame.
        try_get_formant_range, formants, FormantSample
    );
    range_reader!(
        /// `max_harmonics` slots per frame.
        try_get_harmonic_range, harmonics, HarmonicSample
    );
    range_reader!(try_get_waveform_range, waveform, WaveformSample);
    range_reader!(try_get_spectral_feature_range, spectral, SpectralFeatures);
    range_reader!(try_get_speech_metric_range, speech, SpeechMetrics);
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(capacity: usize) -> StoreShape {
        StoreShape {
            capacity,
            display_bins: 4,
            analysis_bins: 8,
            max_formants: 3,
            max_harmonics: 5,
        }
    }

    fn frame_with_marker(shape: &StoreShape, marker: f32) -> FrameRecord {
        let mut frame = FrameRecord::new(shape);
        frame.spectrogram.fill(marker);
        frame.linear_magnitudes.fill(marker);
        frame.pitch = PitchSample {
            hz: marker,
            confidence: 1.0,
            voicing: VoicingState::Voiced,
        };
        frame.waveform = WaveformSample {
            min: -marker,
            max: marker,
        };
        frame
    }

    fn write_frames(writer: &mut FeatureWriter, count: usize) {
        let shape = writer.shape();
        for _ in 0..count {
            let next = writer.latest_frame_id() + 1;
            writer.publish(&frame_with_marker(&shape, next as f32));
        }
    }

    #[test]
    fn empty_store_reports_nothing() {
        let (_writer, store) = feature_store(shape(8));
        let mut dest = vec![0.0; 8 * 4];
        assert!(store.try_get_spectrogram_range(-1, None, &mut dest).is_none());
        assert_eq!(store.latest_frame_id(), -1);
        assert_eq!(store.available_frames(), 0);
    }

    #[test]
    fn ring_scenario_with_six_hundred_frames() {
        let (mut writer, store) = feature_store(shape(600));
        write_frames(&mut writer, 600);

        let status = store.status();
        assert_eq!(status.available_frames, 600);
        assert_eq!(status.latest_frame_id, 599);
        assert_eq!(status.oldest_frame_id(), 0);

        write_frames(&mut writer, 1);
        let status = store.status();
        assert_eq!(status.available_frames, 600);
        assert_eq!(status.latest_frame_id, 600);
        assert_eq!(status.oldest_frame_id(), 1);

        let mut pitch = vec![PitchSample::default(); 600];
        let copy = store.try_get_pitch_range(-1, None, &mut pitch).unwrap();
        assert_eq!(pitch[copy.ring_index(600)].hz, 600.0);
        assert_eq!(pitch[copy.ring_index(1)].hz, 1.0);
    }

    #[test]
    fn availability_invariant_holds_for_every_write() {
        let (mut writer, store) = feature_store(shape(7));
        for _ in 0..40 {
            write_frames(&mut writer, 1);
            let status = store.status();
            assert!(status.available_frames <= status.shape.capacity);
            assert_eq!(
                status.oldest_frame_id(),
                status.latest_frame_id - status.available_frames as i64 + 1
            );
        }
    }

    #[test]
    fn incremental_reads_copy_only_new_frames() {
        let (mut writer, store) = feature_store(shape(8));
        let mut dest = vec![0.0; 8 * 8];

        write_frames(&mut writer, 3);
        let copy = store.try_get_linear_magnitude_range(-1, None, &mut dest).unwrap();
        assert!(!copy.full_copy);
        assert_eq!(copy.copied_frames, 3);
        assert_eq!(copy.latest_frame_id, 2);

        let again = store
            .try_get_linear_magnitude_range(copy.latest_frame_id, None, &mut dest)
            .unwrap();
        assert_eq!(again.copied_frames, 0);
        assert_eq!(again.latest_frame_id, 2);
        let third = store
            .try_get_linear_magnitude_range(copy.latest_frame_id, None, &mut dest)
            .unwrap();
        assert_eq!(third.copied_frames, 0);

        write_frames(&mut writer, 2);
        let copy = store
            .try_get_linear_magnitude_range(copy.latest_frame_id, None, &mut dest)
            .unwrap();
        assert_eq!(copy.copied_frames, 2);
        assert_eq!(dest[copy.ring_index(4) * 8], 4.0);
    }

    #[test]
    fn wraparound_copies_across_the_seam() {
        let (mut writer, store) = feature_store(shape(4));
        let mut dest = vec![WaveformSample::default(); 4];
        write_frames(&mut writer, 3);
        let copy = store.try_get_waveform_range(-1, None, &mut dest).unwrap();

        write_frames(&mut writer, 3);
        let copy = store
            .try_get_waveform_range(copy.latest_frame_id, None, &mut dest)
            .unwrap();
        assert!(!copy.full_copy);
        assert_eq!(copy.copied_frames, 3);
        for frame_id in copy.frame_ids() {
            assert_eq!(dest[copy.ring_index(frame_id)].max, frame_id as f32);
        }
    }

    #[test]
    fn overrun_forces_full_copy() {
        let (mut writer, store) = feature_store(shape(4));
        let mut dest = vec![0.0; 4 * 4];
        write_frames(&mut writer, 2);
        let copy = store.try_get_spectrogram_range(-1, None, &mut dest).unwrap();

        write_frames(&mut writer, 10);
        let copy = store
            .try_get_spectrogram_range(copy.latest_frame_id, None, &mut dest)
            .unwrap();
        assert!(copy.full_copy);
        assert_eq!(copy.copied_frames, 4);
        assert_eq!(copy.oldest_frame_id(), 8);
    }

    #[test]
    fn undersized_destination_is_rejected_untouched() {
        let (mut writer, store) = feature_store(shape(4));
        write_frames(&mut writer, 2);
        let mut dest = vec![-7.0; 4 * 4 - 1];
        assert!(store.try_get_spectrogram_range(-1, None, &mut dest).is_none());
        assert!(dest.iter().all(|value| *value == -7.0));
    }

    #[test]
    fn oversized_destination_counts_as_shape_mismatch() {
        let (mut writer, store) = feature_store(shape(4));
        write_frames(&mut writer, 2);
        let mut dest = vec![0.0; 64];
        let copy = store.try_get_spectrogram_range(1, None, &mut dest).unwrap();
        assert!(copy.full_copy);
    }

    #[test]
    fn resize_bumps_version_and_forces_full_copy_for_every_family() {
        let (mut writer, store) = feature_store(shape(16));
        write_frames(&mut writer, 3);
        let mut pitch = vec![PitchSample::default(); 16];
        let before = store.try_get_pitch_range(-1, None, &mut pitch).unwrap();
        assert_eq!(before.data_version, 0);

        // Only the spectrogram width changes; every other destination keeps
        // its length.
        let mut wider = shape(16);
        wider.display_bins = 6;
        assert!(writer.resize(wider));
        assert!(!writer.resize(wider));
        assert_eq!(store.data_version(), 1);
        assert_eq!(store.latest_frame_id(), -1);

        // More frames than the stale cursor, so its id alone looks current.
        write_frames(&mut writer, 6);
        let stale = before.latest_frame_id;
        let seen = Some(before.data_version);
        let mut spectrogram = vec![0.0; 16 * 6];
        let mut linear = vec![0.0; 16 * 8];
        let mut formants = vec![FormantSample::default(); 16 * 3];
        let mut harmonics = vec![HarmonicSample::default(); 16 * 5];
        let mut waveform = vec![WaveformSample::default(); 16];
        let mut spectral = vec![SpectralFeatures::default(); 16];
        let mut speech = vec![SpeechMetrics::default(); 16];

        let copy = store.try_get_pitch_range(stale, seen, &mut pitch).unwrap();
        assert!(copy.full_copy);
        assert_eq!(copy.copied_frames, 6);
        assert_eq!(copy.data_version, 1);
        assert_eq!(pitch[copy.ring_index(0)].hz, 0.0);
        assert_eq!(pitch[copy.ring_index(5)].hz, 5.0);

        let full = |copy: Option<RangeCopy>| copy.is_some_and(|copy| copy.full_copy);
        assert!(full(store.try_get_spectrogram_range(stale, seen, &mut spectrogram)));
        assert!(full(store.try_get_linear_magnitude_range(stale, seen, &mut linear)));
        assert!(full(store.try_get_formant_range(stale, seen, &mut formants)));
        assert!(full(store.try_get_harmonic_range(stale, seen, &mut harmonics)));
        assert!(full(store.try_get_waveform_range(stale, seen, &mut waveform)));
        assert!(full(store.try_get_spectral_feature_range(stale, seen, &mut spectral)));
        assert!(full(store.try_get_speech_metric_range(stale, seen, &mut speech)));

        // Once the reader has caught up with the new version, reads are
        // incremental again.
        write_frames(&mut writer, 1);
        let next = store
            .try_get_pitch_range(copy.latest_frame_id, Some(copy.data_version), &mut pitch)
            .unwrap();
        assert!(!next.full_copy);
        assert_eq!(next.copied_frames, 1);

        // Buffers sized for the old shape are rejected outright.
        let mut old = vec![0.0; 16 * 4];
        assert!(store.try_get_spectrogram_range(stale, seen, &mut old).is_none());
    }

    #[test]
    fn activation_generation_counts_rearms_across_resizes() {
        let (mut writer, store) = feature_store(shape(4));
        assert_eq!(store.activation_generation(Capabilities::PITCH), 0);

        writer.mark_activated(Capabilities::PITCH | Capabilities::FORMANTS);
        assert_eq!(store.activation_generation(Capabilities::PITCH), 1);
        assert_eq!(store.activation_generation(Capabilities::WAVEFORM), 0);
        assert_eq!(
            store.activation_generation(Capabilities::PITCH | Capabilities::FORMANTS),
            2
        );

        writer.resize(shape(8));
        writer.mark_activated(Capabilities::PITCH);
        assert_eq!(store.activation_generation(Capabilities::PITCH), 2);
    }

    #[test]
    fn reset_rewinds_to_empty() {
        let (mut writer, store) = feature_store(shape(4));
        write_frames(&mut writer, 3);
        let epoch = store.epoch();
        writer.reset();
        assert_eq!(store.latest_frame_id(), -1);
        assert_eq!(store.available_frames(), 0);
        assert_ne!(store.epoch(), epoch);

        write_frames(&mut writer, 1);
        let mut dest = vec![0.0; 16];
        let copy = store.try_get_spectrogram_range(2, None, &mut dest).unwrap();
        assert!(copy.full_copy);
        assert_eq!(copy.latest_frame_id, 0);
    }

    #[test]
    fn concurrent_reader_sees_monotonic_ids() {
        let (mut writer, store) = feature_store(shape(16));
        let reader = std::thread::spawn(move || {
            let mut dest = vec![PitchSample::default(); 16];
            let mut last = -1;
            let mut polls = 0;
            while last < 999 {
                if let Some(copy) = store.try_get_pitch_range(last, None, &mut dest) {
                    assert!(copy.latest_frame_id >= last);
                    assert!(copy.available_frames <= 16);
                    last = copy.latest_frame_id;
                }
                polls += 1;
                std::thread::yield_now();
            }
            polls
        });

        write_frames(&mut writer, 1000);
        assert!(reader.join().unwrap() > 0);
    }
}
