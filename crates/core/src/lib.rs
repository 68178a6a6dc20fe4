//! Core library for Vocal Scope.
//!
//! A single [`VoiceAnalyzer`] turns live audio into per-hop feature frames and
//! publishes them into a versioned [`FeatureStore`]. Any number of consumers
//! poll the store on their own timers and turn spectra into renderable columns
//! with their own [`DisplayPipeline`]. Costly stages run only while some
//! consumer holds a [`Subscription`] that needs them.

pub mod analysis;
pub mod audio;
pub mod capability;
pub mod config;
pub mod display;
pub mod error;
pub mod store;

pub use analysis::{PitchEstimate, SpectralTransform, VoiceAnalyzer};
pub use audio::LiveAnalyzer;
pub use capability::{
    Capabilities, CapabilityScheduler, CapabilityState, HopPlan, Subscription, SubscriptionHub,
};
pub use config::{
    AnalysisConfig, ClarityMode, DynamicRangeMode, FrequencyScale, NormalizationMode,
    PitchAlgorithm, ReassignMode, SharedConfig, SmoothingMode, TransformType, WindowFunction,
};
pub use display::{AnalysisGrid, BinMapping, DisplayPipeline, DisplaySettings};
pub use error::{Result, VocalScopeError};
pub use store::{
    family, feature_store, CursorUpdate, FeatureCursor, FeatureFamily, FeatureStore,
    FeatureWriter, FormantSample, FrameRecord, HarmonicSample, PitchSample, RangeCopy,
    SpectralFeatures, SpeechMetrics, StoreShape, StoreStatus, VoicingState, WaveformSample,
};
