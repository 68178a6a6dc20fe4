use std::{
    f32::consts::PI,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vocal_scope_core::{
    family, AnalysisConfig, Capabilities, DisplayPipeline, FeatureCursor, FeatureStore,
    LiveAnalyzer, SubscriptionHub,
};

fn main() -> vocal_scope_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            seconds,
            consumers,
            f0,
        } => run_demo(seconds, consumers, f0),
        Commands::Config => {
            println!("{}", AnalysisConfig::default().to_json()?);
            Ok(())
        }
        Commands::Validate { path } => run_validate(&path),
    }
}

fn run_demo(seconds: f32, consumers: usize, f0: f32) -> vocal_scope_core::Result<()> {
    let config = AnalysisConfig::default();
    tracing::info!(seconds, consumers, f0, "starting synthetic voice demo");

    let mut live = LiveAnalyzer::start(config.clone())?;
    let running = Arc::new(AtomicBool::new(true));
    let workers: Vec<_> = (0..consumers.max(1))
        .map(|index| {
            let store = live.store();
            let hub = live.hub();
            let running = running.clone();
            let config = config.clone();
            thread::spawn(move || run_consumer(index, store, hub, config, running))
        })
        .collect();

    let rate = config.sample_rate as f32;
    let block = config.hop_size();
    let total = (seconds * rate) as usize;
    let started = Instant::now();
    let mut position = 0;
    while position < total {
        let chunk: Vec<f32> = (position..(position + block).min(total))
            .map(|index| synthetic_vowel(index as f32 / rate, f0))
            .collect();
        live.push_samples(&chunk);
        position += chunk.len();

        // Pace the feed like a real-time input.
        let due = Duration::from_secs_f32(position as f32 / rate);
        if let Some(wait) = due.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
    }

    running.store(false, Ordering::Release);
    for worker in workers {
        if worker.join().is_err() {
            tracing::warn!("consumer thread panicked");
        }
    }
    tracing::info!(dropped = live.dropped_samples(), "demo finished");
    live.stop()
}

/// Polls the store on its own timer and logs a summary every half second.
fn run_consumer(
    index: usize,
    store: FeatureStore,
    hub: SubscriptionHub,
    config: AnalysisConfig,
    running: Arc<AtomicBool>,
) {
    let _subscription =
        hub.subscribe(Capabilities::SPECTROGRAM | Capabilities::PITCH | Capabilities::FORMANTS);
    let mut pipeline = match DisplayPipeline::from_config(&config) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            tracing::error!(%err, "consumer could not configure its display");
            return;
        }
    };
    let mut spectrogram = FeatureCursor::<family::Spectrogram>::new();
    let mut pitch = FeatureCursor::<family::Pitch>::new();
    let mut formants = FeatureCursor::<family::Formants>::new();
    let mut column = vec![0.0; config.display_bins];
    let mut last_report = Instant::now();

    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(16 + 7 * index as u64));
        let Some(update) = spectrogram.poll(&store) else {
            continue;
        };
        if update.discontinuity {
            pipeline.reset_history();
        }
        pitch.poll(&store);
        formants.poll(&store);

        let latest = update.latest_frame_id;
        // The pitch cursor can trail the spectrogram by a frame.
        let sample = pitch
            .frame_at_or_before(latest)
            .map(|(_, sample)| sample[0])
            .unwrap_or_default();
        let voicing = sample.voicing;
        if let Some(source) = spectrogram.frame(latest) {
            if let Err(err) = pipeline.process_display_frame(source, &mut column, voicing) {
                tracing::warn!(%err, "skipping display frame");
                continue;
            }
        }

        if last_report.elapsed() >= Duration::from_millis(500) {
            last_report = Instant::now();
            let peak_bin = column
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(bin, _)| bin);
            let peak_hz = pipeline.center_frequencies().get(peak_bin).copied().unwrap_or(0.0);
            let tracked: Vec<f32> = formants
                .frame_at_or_before(latest)
                .map(|(_, slots)| {
                    slots
                        .iter()
                        .filter(|slot| slot.frequency_hz > 0.0)
                        .map(|slot| slot.frequency_hz.round())
                        .collect()
                })
                .unwrap_or_default();
            tracing::info!(
                consumer = index,
                frame = latest,
                new_frames = update.new_frames,
                pitch_hz = sample.hz.round(),
                voicing = ?sample.voicing,
                formants = ?tracked,
                peak_hz = peak_hz.round(),
                "poll"
            );
        }
    }
}

fn run_validate(path: &PathBuf) -> vocal_scope_core::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let config = AnalysisConfig::from_json(&text)?;
    tracing::info!(
        ?path,
        hop = config.hop_size(),
        frames = config.frame_capacity(),
        analysis_bins = config.analysis_bins(),
        "configuration is valid"
    );
    Ok(())
}

/// Glottal-like harmonic series shaped by three fixed formant resonances.
fn synthetic_vowel(t: f32, f0: f32) -> f32 {
    const FORMANTS: [(f32, f32); 3] = [(700.0, 90.0), (1_200.0, 110.0), (2_600.0, 160.0)];
    let mut sample = 0.0;
    let mut harmonic = 1;
    while harmonic as f32 * f0 < 5_000.0 {
        let hz = harmonic as f32 * f0;
        let gain: f32 = FORMANTS
            .iter()
            .map(|(center, width)| 1.0 / (1.0 + ((hz - center) / width).powi(2)))
            .sum();
        sample += (gain + 0.02) / harmonic as f32 * (2.0 * PI * hz * t).sin();
        harmonic += 1;
    }
    0.2 * sample
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live voice analysis core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a synthetic vowel through the live analyzer while consumers poll.
    Demo {
        /// Length of the synthetic input.
        #[arg(short, long, default_value_t = 3.0)]
        seconds: f32,
        /// Number of independent polling consumers.
        #[arg(short, long, default_value_t = 2)]
        consumers: usize,
        /// Fundamental frequency of the synthetic voice in Hz.
        #[arg(long, default_value_t = 140.0)]
        f0: f32,
    },
    /// Print the default configuration as JSON.
    Config,
    /// Load and validate a configuration JSON file.
    Validate {
        /// Path to the configuration file.
        path: PathBuf,
    },
}
