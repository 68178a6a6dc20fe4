//! Speech-coach metrics derived from per-hop energy and pitch.

use std::collections::VecDeque;

use crate::{SpeechMetrics, VoicingState};

const SPEAKING_THRESHOLD_DB: f32 = -45.0;
const HANGOVER_SECONDS: f32 = 0.3;
const ENVELOPE_ALPHA: f32 = 0.5;
const SYLLABLE_PROMINENCE_DB: f32 = 2.0;
const MIN_SYLLABLE_GAP_SECONDS: f32 = 0.1;
const WINDOW_SECONDS: f32 = 5.0;
const SEMITONE_REFERENCE_HZ: f32 = 100.0;

/// Inputs of one hop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechFrame {
    pub rms_db: f32,
    pub voicing: VoicingState,
    pub pitch_hz: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    speaking: bool,
    syllable: bool,
    semitones: Option<f32>,
    confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SpeechCoach {
    hop_seconds: f32,
    hangover_frames: usize,
    window_frames: usize,
    min_gap_frames: usize,
    silent_frames: usize,
    speaking: bool,
    envelope: Option<f32>,
    previous_envelope: f32,
    previous_voiced: bool,
    rising: bool,
    valley: f32,
    frames_since_syllable: usize,
    window: VecDeque<WindowEntry>,
}

impl SpeechCoach {
    pub fn new(hop_seconds: f32) -> Self {
        let hop_seconds = hop_seconds.max(1e-4);
        let frames = |seconds: f32| ((seconds / hop_seconds).ceil() as usize).max(1);
        let window_frames = frames(WINDOW_SECONDS);
        Self {
            hop_seconds,
            hangover_frames: frames(HANGOVER_SECONDS),
            window_frames,
            min_gap_frames: frames(MIN_SYLLABLE_GAP_SECONDS),
            silent_frames: 0,
            speaking: false,
            envelope: None,
            previous_envelope: f32::NEG_INFINITY,
            previous_voiced: false,
            rising: false,
            valley: f32::INFINITY,
            frames_since_syllable: usize::MAX,
            window: VecDeque::with_capacity(window_frames),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.hop_seconds);
    }

    pub fn update(&mut self, frame: SpeechFrame) -> SpeechMetrics {
        self.track_speaking(frame.rms_db);
        let syllable = self.detect_syllable(frame);

        let voiced = frame.voicing.is_voiced() && frame.pitch_hz > 0.0;
        if self.window.len() == self.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(WindowEntry {
            speaking: self.speaking,
            syllable,
            semitones: voiced
                .then(|| 12.0 * (frame.pitch_hz / SEMITONE_REFERENCE_HZ).log2()),
            confidence: voiced.then_some(frame.confidence),
        });
        self.summarize(syllable)
    }

    fn track_speaking(&mut self, rms_db: f32) {
        if rms_db >= SPEAKING_THRESHOLD_DB {
            self.speaking = true;
            self.silent_frames = 0;
        } else if self.speaking {
            self.silent_frames += 1;
            if self.silent_frames > self.hangover_frames {
                self.speaking = false;
            }
        }
    }

    /// Marks the hop after a voiced local maximum of the energy envelope that
    /// rises far enough above the preceding valley.
    fn detect_syllable(&mut self, frame: SpeechFrame) -> bool {
        let envelope = match self.envelope {
            Some(previous) => previous + ENVELOPE_ALPHA * (frame.rms_db - previous),
            None => frame.rms_db,
        };
        self.envelope = Some(envelope);
        self.frames_since_syllable = self.frames_since_syllable.saturating_add(1);

        let peak = self.previous_envelope;
        let mut syllable = false;
        if envelope < peak && self.rising {
            if self.previous_voiced
                && peak - self.valley >= SYLLABLE_PROMINENCE_DB
                && self.frames_since_syllable >= self.min_gap_frames
            {
                syllable = true;
                self.frames_since_syllable = 0;
            }
            self.valley = envelope;
        }
        self.rising = envelope > peak;
        self.valley = self.valley.min(envelope);
        self.previous_envelope = envelope;
        self.previous_voiced = frame.voicing.is_voiced();
        syllable
    }

    fn summarize(&self, syllable: bool) -> SpeechMetrics {
        let frames = self.window.len().max(1) as f32;
        let elapsed = frames * self.hop_seconds;
        let syllables = self.window.iter().filter(|entry| entry.syllable).count() as f32;
        let speaking_frames = self.window.iter().filter(|entry| entry.speaking).count() as f32;
        let speaking_seconds = speaking_frames * self.hop_seconds;

        let pitch = Spread::of(self.window.iter().filter_map(|entry| entry.semitones));
        let confidence = Spread::of(self.window.iter().filter_map(|entry| entry.confidence));
        let clarity_score = if confidence.count == 0 {
            0.0
        } else {
            ((confidence.mean - 0.5) / 0.45).clamp(0.0, 1.0)
        };

        SpeechMetrics {
            speaking: if self.speaking { 1.0 } else { 0.0 },
            syllable: if syllable { 1.0 } else { 0.0 },
            syllable_rate: syllables / elapsed,
            articulation_rate: if speaking_seconds > 0.0 {
                syllables / speaking_seconds
            } else {
                0.0
            },
            pause_ratio: 1.0 - speaking_frames / frames,
            pitch_variation: pitch.deviation,
            intonation_score: if pitch.count < 2 {
                0.0
            } else {
                intonation_score(pitch.deviation)
            },
            clarity_score,
        }
    }
}

/// Count, mean and population standard deviation of a window column.
struct Spread {
    count: usize,
    mean: f32,
    deviation: f32,
}

impl Spread {
    fn of(values: impl Iterator<Item = f32> + Clone) -> Self {
        let (count, sum) = values
            .clone()
            .fold((0usize, 0.0f32), |(count, sum), value| (count + 1, sum + value));
        if count == 0 {
            return Self {
                count,
                mean: 0.0,
                deviation: 0.0,
            };
        }
        let mean = sum / count as f32;
        let deviation = if count < 2 {
            0.0
        } else {
            (values.map(|value| (value - mean).powi(2)).sum::<f32>() / count as f32).sqrt()
        };
        Self {
            count,
            mean,
            deviation,
        }
    }
}

/// Score in `[0, 1]` for a pitch spread in semitones: flat delivery scores
/// low, 2 to 6 semitones scores 1, larger swings taper to 0.5.
pub fn intonation_score(variation: f32) -> f32 {
    match variation {
        v if v <= 2.0 => v.max(0.0) / 2.0,
        v if v <= 6.0 => 1.0,
        v if v < 12.0 => 1.0 - 0.5 * (v - 6.0) / 6.0,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    const HOP: f32 = 512.0 / 48_000.0;

    fn syllabic(index: usize, rate_hz: f32) -> SpeechFrame {
        let t = index as f32 * HOP;
        SpeechFrame {
            rms_db: -28.0 + 8.0 * (2.0 * PI * rate_hz * t).sin(),
            voicing: VoicingState::Voiced,
            pitch_hz: 180.0 * 2f32.powf((2.0 * PI * 0.5 * t).sin() * 4.0 / 12.0),
            confidence: 0.9,
        }
    }

    fn silence() -> SpeechFrame {
        SpeechFrame {
            rms_db: -80.0,
            voicing: VoicingState::Silence,
            pitch_hz: 0.0,
            confidence: 0.0,
        }
    }

    #[test]
    fn counts_syllables_at_speaking_rate() {
        let mut coach = SpeechCoach::new(HOP);
        let frames = (6.0 / HOP) as usize;
        let metrics = (0..frames)
            .map(|index| coach.update(syllabic(index, 4.0)))
            .last()
            .unwrap();
        assert_eq!(metrics.speaking, 1.0);
        assert!((metrics.syllable_rate - 4.0).abs() < 0.5, "{metrics:?}");
        assert!((metrics.articulation_rate - metrics.syllable_rate).abs() < 0.1);
        assert!(metrics.pause_ratio < 0.01);
        assert!(metrics.pitch_variation > 2.0 && metrics.pitch_variation < 4.0);
        assert_eq!(metrics.intonation_score, 1.0);
        assert!(metrics.clarity_score > 0.8);
    }

    #[test]
    fn silence_ends_speaking_after_hangover() {
        let mut coach = SpeechCoach::new(HOP);
        for index in 0..100 {
            coach.update(syllabic(index, 4.0));
        }
        let hangover = (HANGOVER_SECONDS / HOP).ceil() as usize;
        for _ in 0..hangover {
            assert_eq!(coach.update(silence()).speaking, 1.0);
        }
        let metrics = coach.update(silence());
        assert_eq!(metrics.speaking, 0.0);
        assert_eq!(metrics.syllable, 0.0);
        assert!(metrics.pause_ratio > 0.0);
    }

    #[test]
    fn monotone_scores_low() {
        assert_eq!(intonation_score(0.0), 0.0);
        assert!(intonation_score(0.5) < 0.3);
        assert_eq!(intonation_score(4.0), 1.0);
        assert_eq!(intonation_score(20.0), 0.5);
    }

    #[test]
    fn spread_matches_population_statistics() {
        let spread = Spread::of([1.0, 3.0, 5.0, 7.0].into_iter());
        assert_eq!(spread.count, 4);
        assert_eq!(spread.mean, 4.0);
        assert!((spread.deviation - 5.0f32.sqrt()).abs() < 1e-6);

        let single = Spread::of(std::iter::once(2.0));
        assert_eq!((single.count, single.mean, single.deviation), (1, 2.0, 0.0));
        assert_eq!(Spread::of(std::iter::empty()).count, 0);
    }

    #[test]
    fn reset_clears_window() {
        let mut coach = SpeechCoach::new(HOP);
        for index in 0..200 {
            coach.update(syllabic(index, 4.0));
        }
        coach.reset();
        let metrics = coach.update(silence());
        assert_eq!(metrics.syllable_rate, 0.0);
        assert_eq!(metrics.speaking, 0.0);
    }
}
