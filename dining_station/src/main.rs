mod camera;
mod classifier;
mod player;

use anyhow::Context;
use camera::CameraFoodClassifier;
use clap::Parser;
use classifier::DnnImageClassifier;
use pet_dining::core_modules::assets::RandomAssetPicker;
use pet_dining::core_modules::synthesizer::GeneratorSynthesizer;
use pet_dining::{
    shutdown_channel, DiningConfig, PlaybackController, SessionExit, SessionOrchestrator, ShutdownTrigger,
};
use player::HighGuiBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Watches for food on camera and shows the pets eating it.
#[derive(Parser, Debug)]
#[command(name = "dining_station", version, about)]
struct Args {
    /// TOML configuration file. Defaults are used when it does not exist.
    #[arg(long, default_value = "pet_dining.toml")]
    config: PathBuf,

    /// Camera device index.
    #[arg(long)]
    camera: Option<i32>,

    /// ONNX image classification model.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Class label list (JSON array or one label per line).
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Keep generated videos instead of deleting them after playback.
    #[arg(long)]
    keep_videos: bool,

    /// Stop after this many cycles.
    #[arg(long)]
    max_cycles: Option<u32>,
}

impl Args {
    fn apply(&self, config: &mut DiningConfig) {
        if let Some(camera) = self.camera {
            config.detection.camera_index = camera;
        }
        if let Some(model) = &self.model {
            config.detection.model_path = model.clone();
        }
        if let Some(labels) = &self.labels {
            config.detection.labels_path = labels.clone();
        }
        if self.keep_videos {
            config.session.delete_artifacts = false;
        }
        if self.max_cycles.is_some() {
            config.session.max_cycles = self.max_cycles;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pet_dining=info,dining_station=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rule = "=".repeat(50);
    info!("{}", rule);
    info!("Pet Dining AI Video System");
    info!("{}", rule);

    // --- 1. Configuration ---
    let mut config = DiningConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config);
    config.validate()?;
    config.ensure_directories()?;
    info!("Generator: {}", config.synthesis.generator_program.display());
    info!("Output directory: {}", config.output_dir.display());

    // --- 2. Components ---
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(forward_signals(trigger));

    let dnn = DnnImageClassifier::load(&config.detection.model_path, &config.detection.labels_path)
        .context("loading the food classifier")?;
    info!("Classifier ready with {} labels", dnn.label_count());

    let classifier = CameraFoodClassifier::new(config.detection.clone(), Arc::new(dnn), shutdown.clone());
    let synthesizer = GeneratorSynthesizer::new(config.synthesis.clone(), config.output_dir.clone());
    let playback = PlaybackController::new(Arc::new(HighGuiBackend), config.playback.window_name.clone());

    // --- 3. Session ---
    let mut orchestrator = SessionOrchestrator::new(
        config,
        Arc::new(classifier),
        Arc::new(RandomAssetPicker::new()),
        Arc::new(synthesizer),
        playback,
    );
    let report = orchestrator.run(shutdown).await;
    info!(
        "Cycles completed: {}, failed: {}",
        report.cycles_completed, report.cycles_failed
    );

    match report.exit {
        SessionExit::Fatal(message) => Err(anyhow::anyhow!(message)),
        SessionExit::Interrupted | SessionExit::CycleLimitReached => Ok(()),
    }
}

/// Turns Ctrl+C or SIGTERM into a session shutdown.
async fn forward_signals(trigger: ShutdownTrigger) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
    trigger.trigger();
}
