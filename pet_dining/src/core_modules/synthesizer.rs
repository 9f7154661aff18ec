// THEORY:
// The diffusion model lives in a separate generator process (the ML stack it needs
// is not something this crate reimplements). `GeneratorSynthesizer` owns that
// process as a sidecar:
//
// 1.  **Lazy, One-Time Load**: the worker is spawned by the first `ensure_loaded`
//     call, which waits for it to report `ready` (weights loaded). Later calls
//     find the worker in place and return immediately. If the worker dies, the
//     slot is cleared and the next `ensure_loaded` starts a fresh one.
// 2.  **Serialized Use**: the worker sits behind an async mutex, so even if several
//     callers shared one synthesizer only one generation runs at a time.
// 3.  **Line Protocol**: one JSON `GenerationPlan` per line on stdin, one JSON reply
//     per line on stdout. Non-JSON stdout lines are treated as generator chatter.
//
// Reply shapes:
//   {"status":"ready","device":"cuda"}      (device is optional)
//   {"status":"done","output_path":"..."}
//   {"status":"failed","kind":"load"|"generation"|"out_of_memory","message":"..."}

use crate::capabilities::{SynthesisRequest, VideoArtifact, VideoSynthesizer};
use crate::config::SynthesisConfig;
use crate::core_modules::prompt::GenerationPlan;
use crate::error::{DiningError, DiningResult};
use async_trait::async_trait;
use chrono::Local;
use image::ImageFormat;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REFERENCE_PREFIX: &str = ".reference_";

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WorkerReply {
    Ready {
        #[serde(default)]
        device: Option<String>,
    },
    Done {
        output_path: PathBuf,
    },
    Failed {
        #[serde(default)]
        kind: FailureKind,
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    Load,
    #[default]
    Generation,
    OutOfMemory,
}

struct GeneratorWorker {
    device: Option<String>,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl GeneratorWorker {
    async fn spawn(config: &SynthesisConfig) -> DiningResult<Self> {
        std::fs::create_dir_all(&config.model_cache_dir)?;

        let mut command = Command::new(&config.generator_program);
        command
            .args(&config.generator_args)
            .arg("--base-model")
            .arg(&config.base_model)
            .arg("--adapter-model")
            .arg(&config.adapter_model)
            .arg("--cache-dir")
            .arg(&config.model_cache_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            DiningError::ModelLoad(format!(
                "failed to start generator {}: {}",
                config.generator_program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DiningError::ModelLoad("generator stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DiningError::ModelLoad("generator stdout unavailable".into()))?;

        let mut worker = Self {
            device: None,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        match worker.next_reply().await {
            Ok(Some(WorkerReply::Ready { device })) => {
                worker.device = device;
                Ok(worker)
            }
            Ok(Some(WorkerReply::Failed { kind: FailureKind::OutOfMemory, message })) => {
                Err(DiningError::ResourceExhausted(message))
            }
            Ok(Some(WorkerReply::Failed { message, .. })) => Err(DiningError::ModelLoad(message)),
            Ok(Some(WorkerReply::Done { .. })) => Err(DiningError::ModelLoad(
                "generator answered before it was asked anything".into(),
            )),
            Ok(None) => match worker.exit_error("generator exited before becoming ready").await {
                DiningError::Synthesis(message) => Err(DiningError::ModelLoad(message)),
                other => Err(other),
            },
            Err(e) => Err(DiningError::ModelLoad(format!("generator handshake failed: {}", e))),
        }
    }

    /// Next protocol reply, skipping non-JSON output. `None` at end of stream.
    async fn next_reply(&mut self) -> std::io::Result<Option<WorkerReply>> {
        while let Some(line) = self.stdout.next_line().await? {
            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                debug!("generator: {}", trimmed);
                continue;
            }
            match serde_json::from_str::<WorkerReply>(trimmed) {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) => warn!("Ignoring unreadable generator reply {:?}: {}", trimmed, e),
            }
        }
        Ok(None)
    }

    async fn generate(&mut self, plan: &GenerationPlan) -> DiningResult<PathBuf> {
        let mut line = serde_json::to_string(plan)
            .map_err(|e| DiningError::Synthesis(format!("could not encode request: {}", e)))?;
        line.push('\n');

        if let Err(e) = self.send(line.as_bytes()).await {
            return Err(DiningError::Synthesis(format!("generator unreachable: {}", e)));
        }

        match self.next_reply().await {
            Ok(Some(WorkerReply::Done { output_path })) => Ok(output_path),
            Ok(Some(WorkerReply::Failed { kind: FailureKind::OutOfMemory, message })) => {
                Err(DiningError::ResourceExhausted(message))
            }
            Ok(Some(WorkerReply::Failed { kind: FailureKind::Load, message })) => {
                Err(DiningError::ModelLoad(message))
            }
            Ok(Some(WorkerReply::Failed { message, .. })) => Err(DiningError::Synthesis(message)),
            Ok(Some(WorkerReply::Ready { .. })) => Err(DiningError::Synthesis(
                "generator restarted in the middle of a request".into(),
            )),
            Ok(None) => Err(self.exit_error("generator exited mid-generation").await),
            Err(e) => Err(DiningError::Synthesis(format!("generator reply unreadable: {}", e))),
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(bytes).await?;
        self.stdin.flush().await
    }

    /// Classifies a vanished worker. A SIGKILL is almost always the OOM killer.
    async fn exit_error(&mut self, context: &str) -> DiningError {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => return DiningError::Synthesis(format!("{}: {}", context, e)),
        };

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if status.signal() == Some(9) {
                return DiningError::ResourceExhausted(format!("{} (killed by SIGKILL)", context));
            }
        }

        DiningError::Synthesis(format!("{} ({})", context, status))
    }
}

/// Drives an external diffusion generator process.
pub struct GeneratorSynthesizer {
    config: SynthesisConfig,
    output_dir: PathBuf,
    worker: Mutex<Option<GeneratorWorker>>,
}

impl GeneratorSynthesizer {
    pub fn new(config: SynthesisConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
            worker: Mutex::new(None),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Compute device the loaded generator reported, if any.
    pub async fn device(&self) -> Option<String> {
        self.worker.lock().await.as_ref().and_then(|w| w.device.clone())
    }

    async fn run_plan(&self, plan: &GenerationPlan) -> DiningResult<PathBuf> {
        let mut slot = self.worker.lock().await;
        let worker = slot
            .as_mut()
            .ok_or_else(|| DiningError::ModelLoad("generator is not loaded".into()))?;

        let result = worker.generate(plan).await;
        if result.is_err() && worker.child.try_wait().ok().flatten().is_some() {
            *slot = None;
        }
        result
    }
}

#[async_trait]
impl VideoSynthesizer for GeneratorSynthesizer {
    async fn ensure_loaded(&self) -> DiningResult<()> {
        let mut slot = self.worker.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        info!("Loading AnimateDiff model...");
        let started = Instant::now();
        let worker = GeneratorWorker::spawn(&self.config).await?;
        info!("Model loaded in {:.1}s", started.elapsed().as_secs_f64());
        info!("Using device: {}", worker.device.as_deref().unwrap_or("unreported"));
        *slot = Some(worker);
        Ok(())
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> DiningResult<VideoArtifact> {
        self.ensure_loaded().await?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let plan = GenerationPlan::build(request, &self.config, &self.output_dir, Local::now().naive_local());
        let reference = prepare_reference(request.reference_image(), &self.output_dir).await?;
        let plan = plan.with_image(reference.path().to_path_buf());

        info!("Generating video with prompt: {}", plan.prompt);
        let result = self.run_plan(&plan).await;
        if let Err(e) = reference.close() {
            debug!("Could not remove the reference copy: {}", e);
        }

        let output = result?;
        if !output.exists() {
            return Err(DiningError::Synthesis(format!(
                "generator reported {} but wrote nothing",
                output.display()
            )));
        }
        info!("Video saved to: {}", output.display());
        Ok(VideoArtifact::new(output))
    }
}

/// Decodes the reference image and writes an RGB PNG copy next to the outputs.
///
/// The copy is removed when the returned handle drops, so a cancelled
/// synthesis leaves nothing behind.
async fn prepare_reference(image_path: &Path, scratch_dir: &Path) -> DiningResult<NamedTempFile> {
    if !image_path.exists() {
        return Err(DiningError::NotFound(image_path.to_path_buf()));
    }

    let source = image_path.to_path_buf();
    let scratch_dir = scratch_dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> DiningResult<NamedTempFile> {
        let rgb = image::open(&source)?.to_rgb8();
        let mut copy = tempfile::Builder::new()
            .prefix(REFERENCE_PREFIX)
            .suffix(".png")
            .tempfile_in(&scratch_dir)?;
        rgb.write_to(copy.as_file_mut(), ImageFormat::Png)?;
        Ok(copy)
    })
    .await
    .map_err(|e| DiningError::Synthesis(format!("reference preparation panicked: {}", e)))?
}
