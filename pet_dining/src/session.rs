// THEORY:
// The `session` module is the top-level API of the dining loop. A
// `SessionOrchestrator` drives the cycle
//
//     AwaitingDetection -> Synthesizing -> Playing -> Cleanup -> AwaitingDetection
//
// until it is interrupted, reaches an optional cycle limit, or meets an error it
// does not know how to survive.
//
// Key architectural principles:
// 1.  **Failure Isolation**: each cycle runs behind a boundary. Recoverable errors
//     (see `DiningError::is_cycle_recoverable`) are logged and the cycle is
//     abandoned; the next one starts as if nothing happened.
// 2.  **Single Outer Boundary**: an interrupt or an unrecoverable error leaves the
//     loop and is handled in exactly one place, which stops any active playback,
//     waits for it to wind down and prints the closing banner once.
// 3.  **Interruptible Waits**: every blocking point (detection, synthesis, the
//     playback poll, the inter-cycle sleep) races against the `Shutdown` signal.
// 4.  **Artifact Ownership**: the clip of the current cycle is held in `in_flight`
//     until it is discarded, and it is only discarded after its playback session
//     has been reaped.

use crate::capabilities::{AssetPicker, FoodClassifier, SynthesisRequest, VideoArtifact, VideoSynthesizer};
use crate::config::DiningConfig;
use crate::core_modules::playback::{PlaybackController, PlaybackEnd};
use crate::error::DiningError;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const BANNER_WIDTH: usize = 50;
/// Upper bound on how long shutdown waits for a stopped playback task to exit.
const PLAYBACK_WIND_DOWN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingDetection,
    Synthesizing,
    Playing,
    Cleanup,
}

/// Observable milestones, reported on the optional event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    FoodDetected(String),
    ArtifactReady(PathBuf),
    PlaybackStarted(PathBuf),
    PlaybackFinished(PlaybackEnd),
    PlaybackStopRequested,
    ArtifactDeleted(PathBuf),
    CycleFailed(String),
    CycleCompleted(u32),
    ShutdownBanner,
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Interrupted,
    CycleLimitReached,
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub cycles_completed: u32,
    pub cycles_failed: u32,
    pub exit: SessionExit,
}

/// Sending half of the interrupt signal.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiving half of the interrupt signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires. Never resolves if every trigger is dropped unfired.
    pub async fn wait(&mut self) {
        let fired = self.rx.wait_for(|fired| *fired).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}

/// Reason a cycle did not run to completion.
enum Halt {
    Interrupted,
    Fatal(DiningError),
}

enum CycleOutcome {
    Completed,
    Abandoned,
}

pub struct SessionOrchestrator {
    config: DiningConfig,
    classifier: Arc<dyn FoodClassifier>,
    picker: Arc<dyn AssetPicker>,
    synthesizer: Arc<dyn VideoSynthesizer>,
    playback: PlaybackController,
    state: SessionState,
    in_flight: Option<VideoArtifact>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: DiningConfig,
        classifier: Arc<dyn FoodClassifier>,
        picker: Arc<dyn AssetPicker>,
        synthesizer: Arc<dyn VideoSynthesizer>,
        playback: PlaybackController,
    ) -> Self {
        Self {
            config,
            classifier,
            picker,
            synthesizer,
            playback,
            state: SessionState::AwaitingDetection,
            in_flight: None,
            events: None,
        }
    }

    pub fn with_event_channel(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DiningConfig {
        &self.config
    }

    /// Runs cycles until interrupted, the cycle limit is hit, or a fatal error occurs.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> SessionReport {
        let mut completed = 0u32;
        let mut failed = 0u32;

        let exit = loop {
            if let Some(limit) = self.config.session.max_cycles {
                if completed + failed >= limit {
                    break SessionExit::CycleLimitReached;
                }
            }

            match self.run_cycle(&mut shutdown).await {
                Ok(CycleOutcome::Completed) => {
                    completed += 1;
                    self.emit(SessionEvent::CycleCompleted(completed));
                }
                Ok(CycleOutcome::Abandoned) => failed += 1,
                Err(Halt::Interrupted) => {
                    info!("[Interrupted] User stopped the program.");
                    break SessionExit::Interrupted;
                }
                Err(Halt::Fatal(e)) => {
                    error!("[Error] {}", e);
                    break SessionExit::Fatal(e.to_string());
                }
            }

            if self.limit_reached(completed + failed) {
                continue;
            }
            let gap = self.config.session.inter_cycle();
            if !gap.is_zero() {
                info!("[Waiting] Next detection in a few seconds...");
                if interruptible(&mut shutdown, tokio::time::sleep(gap)).await.is_err() {
                    info!("[Interrupted] User stopped the program.");
                    break SessionExit::Interrupted;
                }
            }
        };

        self.shut_down().await;
        SessionReport {
            cycles_completed: completed,
            cycles_failed: failed,
            exit,
        }
    }

    fn limit_reached(&self, cycles: u32) -> bool {
        self.config
            .session
            .max_cycles
            .map(|limit| cycles >= limit)
            .unwrap_or(false)
    }

    async fn run_cycle(&mut self, shutdown: &mut Shutdown) -> Result<CycleOutcome, Halt> {
        self.enter(SessionState::AwaitingDetection);
        info!("[Status] Waiting for food detection...");
        let detected = interruptible(shutdown, self.classifier.detect()).await?;
        let food = match detected {
            Ok(label) => label,
            Err(e) => return self.abandon(e),
        };
        info!("[Detected] Food: {}", food);
        self.emit(SessionEvent::FoodDetected(food.clone()));

        self.enter(SessionState::Synthesizing);
        let image = match self.picker.pick(&self.config.asset_dir) {
            Ok(image) => image,
            Err(e) => return self.abandon(e),
        };
        info!("Selected animal image: {}", image.display());
        let request = SynthesisRequest::new(image, food, self.config.synthesis.duration_secs);

        info!("[Generating] Creating animal eating video...");
        let started = Instant::now();
        if let Err(e) = interruptible(shutdown, self.synthesizer.ensure_loaded()).await? {
            return self.abandon(e);
        }
        let artifact = match interruptible(shutdown, self.synthesizer.synthesize(&request)).await? {
            Ok(artifact) => artifact,
            Err(e) => return self.abandon(e),
        };
        info!("[Done] Video generated in {:.1} seconds", started.elapsed().as_secs_f64());
        self.emit(SessionEvent::ArtifactReady(artifact.path().to_path_buf()));
        let clip = artifact.path().to_path_buf();
        self.in_flight = Some(artifact);

        self.enter(SessionState::Playing);
        info!("[Playing] Launching video player...");
        let played = match self.playback.play(&clip) {
            Ok(()) => {
                self.emit(SessionEvent::PlaybackStarted(clip.clone()));
                Ok(self.await_playback(shutdown).await?)
            }
            Err(e) => {
                error!("[Error] {}", e);
                self.emit(SessionEvent::CycleFailed(e.to_string()));
                Err(e)
            }
        };

        self.enter(SessionState::Cleanup);
        self.release_artifact();

        match played {
            Ok(PlaybackEnd::Crashed) => {
                self.emit(SessionEvent::CycleFailed(format!("playback of {} crashed", clip.display())));
                Ok(CycleOutcome::Abandoned)
            }
            Ok(_) => Ok(CycleOutcome::Completed),
            Err(e) if e.is_cycle_recoverable() => Ok(CycleOutcome::Abandoned),
            Err(e) => Err(Halt::Fatal(e)),
        }
    }

    /// Polls the playback session until it ends, then reaps it.
    async fn await_playback(&mut self, shutdown: &mut Shutdown) -> Result<PlaybackEnd, Halt> {
        let poll = self.config.playback.poll_interval();
        loop {
            if let Some(end) = self.playback.reap().await {
                self.emit(SessionEvent::PlaybackFinished(end));
                return Ok(end);
            }
            interruptible(shutdown, tokio::time::sleep(poll)).await?;
        }
    }

    /// Per-cycle boundary: recoverable errors abandon the cycle, the rest halt the loop.
    fn abandon(&mut self, e: DiningError) -> Result<CycleOutcome, Halt> {
        if !e.is_cycle_recoverable() {
            return Err(Halt::Fatal(e));
        }
        error!("[Error] {}", e);
        self.emit(SessionEvent::CycleFailed(e.to_string()));
        Ok(CycleOutcome::Abandoned)
    }

    fn release_artifact(&mut self) {
        let Some(artifact) = self.in_flight.take() else {
            return;
        };
        if !self.config.session.delete_artifacts {
            artifact.keep();
            return;
        }
        let path = artifact.path().to_path_buf();
        match artifact.discard() {
            Ok(true) => {
                info!("[Cleanup] Deleted temp video: {}", path.display());
                self.emit(SessionEvent::ArtifactDeleted(path));
            }
            Ok(false) => {}
            Err(e) => warn!("[Cleanup] Could not delete {}: {}", path.display(), e),
        }
    }

    /// Outer boundary: stop playback, let it wind down, tidy up, say goodbye. Runs once per `run`.
    async fn shut_down(&mut self) {
        if self.playback.stop() {
            self.emit(SessionEvent::PlaybackStopRequested);
        }

        let deadline = Instant::now() + PLAYBACK_WIND_DOWN;
        while self.playback.session().is_some() {
            if let Some(end) = self.playback.reap().await {
                self.emit(SessionEvent::PlaybackFinished(end));
                break;
            }
            if Instant::now() >= deadline {
                warn!("Playback did not wind down in time; leaving the clip in place");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if self.playback.session().is_none() {
            self.release_artifact();
        }

        let rule = "=".repeat(BANNER_WIDTH);
        info!("{}", rule);
        info!("Thank you for using the Pet Dining AI System!");
        info!("{}", rule);
        self.emit(SessionEvent::ShutdownBanner);
    }

    fn enter(&mut self, state: SessionState) {
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Awaits `fut` unless the shutdown signal fires first.
async fn interruptible<F: Future>(shutdown: &mut Shutdown, fut: F) -> Result<F::Output, Halt> {
    if shutdown.is_triggered() {
        return Err(Halt::Interrupted);
    }
    tokio::select! {
        biased;
        _ = shutdown.wait() => Err(Halt::Interrupted),
        output = fut => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::assets::RandomAssetPicker;
    use crate::core_modules::playback::tests::FakeBackend;
    use crate::core_modules::prompt::GenerationPlan;
    use crate::error::DiningResult;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedClassifier {
        script: Mutex<VecDeque<DiningResult<String>>>,
        calls: AtomicUsize,
        /// Never answer once the script runs out, like a camera nobody stands in front of.
        stall_when_empty: bool,
    }

    impl ScriptedClassifier {
        fn new(script: Vec<DiningResult<String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                stall_when_empty: false,
            }
        }

        fn stalling(mut self) -> Self {
            self.stall_when_empty = true;
            self
        }
    }

    #[async_trait]
    impl FoodClassifier for ScriptedClassifier {
        async fn detect(&self) -> DiningResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None if self.stall_when_empty => std::future::pending().await,
                None => Ok("food".to_string()),
            }
        }
    }

    /// Writes an empty clip named the way the real generator names it.
    struct StubSynthesizer {
        output_dir: PathBuf,
        fail_with: Mutex<Option<DiningError>>,
        stall: AtomicBool,
        loads: AtomicUsize,
        requests: Mutex<Vec<SynthesisRequest>>,
        plans: Mutex<Vec<GenerationPlan>>,
    }

    impl StubSynthesizer {
        fn new(output_dir: &Path) -> Self {
            Self {
                output_dir: output_dir.to_path_buf(),
                fail_with: Mutex::new(None),
                stall: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                plans: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VideoSynthesizer for StubSynthesizer {
        async fn ensure_loaded(&self) -> DiningResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn synthesize(&self, request: &SynthesisRequest) -> DiningResult<VideoArtifact> {
            self.requests.lock().unwrap().push(request.clone());
            let failure = self.fail_with.lock().unwrap().take();
            if let Some(e) = failure {
                return Err(e);
            }
            if self.stall.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            let cycle = self.plans.lock().unwrap().len();
            let now = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, cycle as u32)
                .unwrap();
            let plan = GenerationPlan::build(
                request,
                &crate::config::SynthesisConfig::default(),
                &self.output_dir,
                now,
            );
            std::fs::create_dir_all(&self.output_dir)?;
            std::fs::write(&plan.output_path, b"clip")?;
            let artifact = VideoArtifact::new(&plan.output_path);
            self.plans.lock().unwrap().push(plan);
            Ok(artifact)
        }
    }

    struct Rig {
        dir: tempfile::TempDir,
        config: DiningConfig,
        backend: Arc<FakeBackend>,
    }

    fn rig(frames: usize) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let cat = dir.path().join("animal_images").join("cat");
        std::fs::create_dir_all(&cat).unwrap();
        std::fs::write(cat.join("tabby.png"), b"").unwrap();

        let mut config = DiningConfig::default();
        config.asset_dir = dir.path().join("animal_images");
        config.output_dir = dir.path().join("output_videos");
        config.playback.poll_interval_ms = 5;
        config.session.inter_cycle_secs = 0.0;

        Rig {
            dir,
            config,
            backend: Arc::new(FakeBackend::with_frames(frames, 1000.0)),
        }
    }

    fn orchestrator(
        rig: &Rig,
        config: DiningConfig,
        classifier: Arc<ScriptedClassifier>,
        synth: Arc<StubSynthesizer>,
    ) -> (SessionOrchestrator, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let playback = PlaybackController::new(Arc::new(Arc::clone(&rig.backend)), "Pet Dining Experience");
        let orchestrator = SessionOrchestrator::new(
            config,
            classifier,
            Arc::new(RandomAssetPicker::new()),
            synth,
            playback,
        )
        .with_event_channel(tx);
        (orchestrator, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count(events: &[SessionEvent], wanted: &SessionEvent) -> usize {
        events.iter().filter(|e| *e == wanted).count()
    }

    /// Fires the shutdown trigger shortly after the first event matching `wanted`.
    async fn trigger_after<P: Fn(&SessionEvent) -> bool>(
        mut rx: mpsc::UnboundedReceiver<SessionEvent>,
        trigger: ShutdownTrigger,
        wanted: P,
    ) -> (Vec<SessionEvent>, mpsc::UnboundedReceiver<SessionEvent>) {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let hit = wanted(&event);
            seen.push(event);
            if hit {
                tokio::time::sleep(Duration::from_millis(30)).await;
                trigger.trigger();
                break;
            }
        }
        (seen, rx)
    }

    async fn run_with_deadline(orchestrator: &mut SessionOrchestrator, shutdown: Shutdown) -> SessionReport {
        tokio::time::timeout(Duration::from_secs(5), orchestrator.run(shutdown))
            .await
            .expect("session must return")
    }

    #[tokio::test]
    async fn pizza_flows_into_the_request_and_prompt() {
        let rig = rig(3);
        let mut config = rig.config.clone();
        config.session.max_cycles = Some(1);
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok("pizza".into())]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, _rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (_trigger, shutdown) = shutdown_channel();
        let report = orchestrator.run(shutdown).await;

        assert_eq!(report.exit, SessionExit::CycleLimitReached);
        assert_eq!(report.cycles_completed, 1);
        let requests = synth.requests.lock().unwrap();
        assert_eq!(requests[0].food_label(), "pizza");
        assert_eq!(requests[0].duration_secs(), 5);
        assert!(synth.plans.lock().unwrap()[0].prompt.contains("pizza"));
    }

    #[tokio::test]
    async fn cleanup_deletes_every_played_artifact() {
        let rig = rig(3);
        let mut config = rig.config.clone();
        config.session.max_cycles = Some(3);
        let classifier = Arc::new(ScriptedClassifier::new(vec![
            Ok("pizza".into()),
            Ok("cake".into()),
            Ok("banana".into()),
        ]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, mut rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (_trigger, shutdown) = shutdown_channel();
        let report = orchestrator.run(shutdown).await;
        assert_eq!(report.cycles_completed, 3);

        let events = drain(&mut rx);
        let played: Vec<PathBuf> = synth.plans.lock().unwrap().iter().map(|p| p.output_path.clone()).collect();
        assert_eq!(played.len(), 3);
        for path in &played {
            assert!(!path.exists(), "{} should have been deleted", path.display());
            assert_eq!(count(&events, &SessionEvent::ArtifactDeleted(path.clone())), 1);
        }
        assert_eq!(rig.backend.opened_paths.lock().unwrap().clone(), played);
        assert_eq!(rig.backend.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deletion_happens_only_after_playback_finished() {
        let rig = rig(3);
        let mut config = rig.config.clone();
        config.session.max_cycles = Some(1);
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok("sushi".into())]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, mut rx) = orchestrator(&rig, config, classifier, synth);

        let (_trigger, shutdown) = shutdown_channel();
        orchestrator.run(shutdown).await;

        let events = drain(&mut rx);
        let finished = events
            .iter()
            .position(|e| matches!(e, SessionEvent::PlaybackFinished(PlaybackEnd::EndOfStream)))
            .unwrap();
        let deleted = events
            .iter()
            .position(|e| matches!(e, SessionEvent::ArtifactDeleted(_)))
            .unwrap();
        assert!(finished < deleted);
    }

    #[tokio::test]
    async fn keep_policy_leaves_artifacts_on_disk() {
        let rig = rig(2);
        let mut config = rig.config.clone();
        config.session.max_cycles = Some(2);
        config.session.delete_artifacts = false;
        let classifier = Arc::new(ScriptedClassifier::new(vec![]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, _rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (_trigger, shutdown) = shutdown_channel();
        orchestrator.run(shutdown).await;

        for plan in synth.plans.lock().unwrap().iter() {
            assert!(plan.output_path.exists());
            assert!(plan.prompt.contains("food"));
        }
    }

    #[tokio::test]
    async fn empty_asset_root_skips_the_cycle_and_keeps_going() {
        let rig = rig(2);
        let mut config = rig.config.clone();
        config.asset_dir = rig.dir.path().join("empty_assets");
        std::fs::create_dir_all(&config.asset_dir).unwrap();
        config.session.max_cycles = Some(2);
        let classifier = Arc::new(ScriptedClassifier::new(vec![]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, mut rx) =
            orchestrator(&rig, config, Arc::clone(&classifier), Arc::clone(&synth));

        let (_trigger, shutdown) = shutdown_channel();
        let report = orchestrator.run(shutdown).await;

        assert_eq!(report.cycles_failed, 2);
        assert_eq!(report.cycles_completed, 0);
        assert_eq!(report.exit, SessionExit::CycleLimitReached);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert!(synth.requests.lock().unwrap().is_empty());

        let events = drain(&mut rx);
        let failures = events.iter().filter(|e| matches!(e, SessionEvent::CycleFailed(_))).count();
        assert_eq!(failures, 2);
        let back_to_detection = events
            .iter()
            .filter(|e| **e == SessionEvent::StateChanged(SessionState::AwaitingDetection))
            .count();
        assert_eq!(back_to_detection, 2);
    }

    #[tokio::test]
    async fn classification_and_synthesis_failures_are_isolated() {
        let rig = rig(2);
        let mut config = rig.config.clone();
        config.session.max_cycles = Some(3);
        let classifier = Arc::new(ScriptedClassifier::new(vec![
            Err(DiningError::Classification("camera unplugged".into())),
            Ok("pasta".into()),
            Ok("salad".into()),
        ]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        *synth.fail_with.lock().unwrap() = Some(DiningError::Synthesis("diffusion blew up".into()));
        let (mut orchestrator, _rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (_trigger, shutdown) = shutdown_channel();
        let report = orchestrator.run(shutdown).await;

        assert_eq!(report.cycles_failed, 2);
        assert_eq!(report.cycles_completed, 1);
        assert!(synth.plans.lock().unwrap()[0].prompt.contains("salad"));
    }

    #[tokio::test]
    async fn resource_exhaustion_is_fatal() {
        let rig = rig(2);
        let config = rig.config.clone();
        let classifier = Arc::new(ScriptedClassifier::new(vec![]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        *synth.fail_with.lock().unwrap() = Some(DiningError::ResourceExhausted("CUDA out of memory".into()));
        let (mut orchestrator, mut rx) =
            orchestrator(&rig, config, Arc::clone(&classifier), synth);

        let (_trigger, shutdown) = shutdown_channel();
        let report = orchestrator.run(shutdown).await;

        assert!(matches!(report.exit, SessionExit::Fatal(_)));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(count(&drain(&mut rx), &SessionEvent::ShutdownBanner), 1);
    }

    #[tokio::test]
    async fn interrupt_during_playback_stops_once_and_says_goodbye_once() {
        let rig = rig(1_000_000);
        let config = rig.config.clone();
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok("pizza".into())]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, mut rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (trigger, shutdown) = shutdown_channel();
        let watcher = async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, SessionEvent::PlaybackStarted(_)) {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    trigger.trigger();
                    break;
                }
            }
            rx
        };

        let (report, mut rx) = tokio::join!(orchestrator.run(shutdown), watcher);
        assert_eq!(report.exit, SessionExit::Interrupted);
        assert_eq!(orchestrator.state(), SessionState::Playing);
        drop(orchestrator);

        let events = drain(&mut rx);
        assert_eq!(count(&events, &SessionEvent::PlaybackStopRequested), 1);
        assert_eq!(count(&events, &SessionEvent::ShutdownBanner), 1);
        assert_eq!(count(&events, &SessionEvent::PlaybackFinished(PlaybackEnd::StopRequested)), 1);
        assert_eq!(rig.backend.released.load(Ordering::SeqCst), 1);

        let clip = synth.plans.lock().unwrap()[0].output_path.clone();
        assert!(!clip.exists(), "interrupted clip is still cleaned up once playback ended");
    }

    #[tokio::test]
    async fn interrupt_before_start_runs_no_cycle() {
        let rig = rig(2);
        let config = rig.config.clone();
        let classifier = Arc::new(ScriptedClassifier::new(vec![]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, mut rx) =
            orchestrator(&rig, config, Arc::clone(&classifier), synth);

        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();
        let report = orchestrator.run(shutdown).await;

        assert_eq!(report.exit, SessionExit::Interrupted);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
        let events = drain(&mut rx);
        assert_eq!(count(&events, &SessionEvent::PlaybackStopRequested), 0);
        assert_eq!(count(&events, &SessionEvent::ShutdownBanner), 1);
    }

    #[tokio::test]
    async fn interrupt_during_detection_ends_without_touching_playback() {
        let rig = rig(2);
        let config = rig.config.clone();
        let classifier = Arc::new(ScriptedClassifier::new(vec![]).stalling());
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, rx) =
            orchestrator(&rig, config, Arc::clone(&classifier), Arc::clone(&synth));

        let (trigger, shutdown) = shutdown_channel();
        let watcher = trigger_after(rx, trigger, |e| {
            *e == SessionEvent::StateChanged(SessionState::AwaitingDetection)
        });
        let (report, (mut events, mut rx)) = tokio::join!(run_with_deadline(&mut orchestrator, shutdown), watcher);
        events.extend(drain(&mut rx));

        assert_eq!(report.exit, SessionExit::Interrupted);
        assert_eq!(report.cycles_completed + report.cycles_failed, 0);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(synth.requests.lock().unwrap().is_empty());
        assert_eq!(count(&events, &SessionEvent::PlaybackStopRequested), 0);
        assert_eq!(count(&events, &SessionEvent::ShutdownBanner), 1);
    }

    #[tokio::test]
    async fn interrupt_during_synthesis_ends_without_touching_playback() {
        let rig = rig(2);
        let config = rig.config.clone();
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok("pizza".into())]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        synth.stall.store(true, Ordering::SeqCst);
        let (mut orchestrator, rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (trigger, shutdown) = shutdown_channel();
        let watcher = trigger_after(rx, trigger, |e| {
            *e == SessionEvent::StateChanged(SessionState::Synthesizing)
        });
        let (report, (mut events, mut rx)) = tokio::join!(run_with_deadline(&mut orchestrator, shutdown), watcher);
        events.extend(drain(&mut rx));

        assert_eq!(report.exit, SessionExit::Interrupted);
        assert_eq!(orchestrator.state(), SessionState::Synthesizing);
        assert_eq!(synth.requests.lock().unwrap().len(), 1);
        assert_eq!(rig.backend.opened.load(Ordering::SeqCst), 0);
        assert_eq!(count(&events, &SessionEvent::PlaybackStopRequested), 0);
        assert_eq!(count(&events, &SessionEvent::ShutdownBanner), 1);
    }

    #[tokio::test]
    async fn interrupt_during_inter_cycle_wait_skips_the_rest() {
        let rig = rig(2);
        let mut config = rig.config.clone();
        config.session.inter_cycle_secs = 3600.0;
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok("cake".into())]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, rx) =
            orchestrator(&rig, config, Arc::clone(&classifier), Arc::clone(&synth));

        let (trigger, shutdown) = shutdown_channel();
        let watcher = trigger_after(rx, trigger, |e| *e == SessionEvent::CycleCompleted(1));
        let (report, (mut events, mut rx)) = tokio::join!(run_with_deadline(&mut orchestrator, shutdown), watcher);
        events.extend(drain(&mut rx));

        assert_eq!(report.exit, SessionExit::Interrupted);
        assert_eq!(report.cycles_completed, 1);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(!synth.plans.lock().unwrap()[0].output_path.exists());
        assert_eq!(count(&events, &SessionEvent::PlaybackStopRequested), 0);
        assert_eq!(count(&events, &SessionEvent::ShutdownBanner), 1);
    }

    #[tokio::test]
    async fn crashed_playback_fails_the_cycle_and_the_loop_moves_on() {
        let mut rig = rig(50);
        rig.backend = Arc::new(FakeBackend {
            panic_at_frame: Some(1),
            ..FakeBackend::with_frames(50, 1000.0)
        });
        let mut config = rig.config.clone();
        config.session.max_cycles = Some(2);
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok("pizza".into()), Ok("cake".into())]));
        let synth = Arc::new(StubSynthesizer::new(&config.output_dir));
        let (mut orchestrator, mut rx) = orchestrator(&rig, config, classifier, Arc::clone(&synth));

        let (_trigger, shutdown) = shutdown_channel();
        let report = run_with_deadline(&mut orchestrator, shutdown).await;

        assert_eq!(report.exit, SessionExit::CycleLimitReached);
        assert_eq!(report.cycles_failed, 2);
        assert_eq!(report.cycles_completed, 0);
        let events = drain(&mut rx);
        assert_eq!(count(&events, &SessionEvent::PlaybackFinished(PlaybackEnd::Crashed)), 2);
        assert_eq!(rig.backend.released.load(Ordering::SeqCst), 2);
        for plan in synth.plans.lock().unwrap().iter() {
            assert!(!plan.output_path.exists());
        }
    }
}
