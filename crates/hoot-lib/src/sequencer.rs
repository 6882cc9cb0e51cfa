//! Speech/movement sequencer.
//!
//! ```text
//! text → annotator → parse → [Segment] → run task:
//!     Speech   → buffered until the next invoked gesture (or the end)
//!     Movement → flush buffered speech (awaited) → gesture frame (awaited)
//!                → dwell + reset on its own task, overlapping what follows
//! ```
//!
//! Segments run strictly in list order. A gesture frame is on the wire before
//! the next segment starts, but its dwell is never waited on, so the speech
//! that follows starts while the head is still moving. Speech segments that
//! are not separated by an invoked gesture are spoken as one utterance.
//!
//! Each run gets a [`CancellationToken`], checked between segments. Text
//! already taken from the list is still spoken on cancellation and gestures
//! in flight reset themselves. Separate runs are not ordered against each
//! other; their frames interleave on the link queue, which is fine because
//! every gesture returns to neutral on its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hoot_core::annotate::parse_marked;
use hoot_core::types::{RunReport, RunState, Segment};

use crate::annotator::Annotator;
use crate::motion::{GestureHandle, MotionController};
use crate::speech::SpeechPlayer;

/// Drives segment lists against the motion controller and the speech player.
#[derive(Clone)]
pub struct Sequencer {
    motion: Option<MotionController>,
    player: Arc<dyn SpeechPlayer>,
    annotator: Option<Arc<dyn Annotator>>,
    active: Arc<AtomicUsize>,
    /// Parent of every run token; replaced after `cancel_all`.
    root: Arc<Mutex<CancellationToken>>,
}

/// Handle to one spawned run.
pub struct SequenceRun {
    token: CancellationToken,
    state_rx: watch::Receiver<RunState>,
    task: JoinHandle<RunReport>,
}

impl SequenceRun {
    /// Stop issuing segments. Gestures already started still reset.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    /// A token that cancels this run, for handing to other tasks.
    pub fn canceller(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> RunReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!("sequencer: run supervisor lost: {e}");
                RunReport::new(RunState::Failed)
            }
        }
    }
}

/// Decrements the active-run count however the run ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Sequencer {
    /// `motion: None` runs speech only; movement segments are skipped.
    pub fn new(motion: Option<MotionController>, player: Arc<dyn SpeechPlayer>) -> Self {
        Self {
            motion,
            player,
            annotator: None,
            active: Arc::new(AtomicUsize::new(0)),
            root: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn Annotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn motion(&self) -> Option<&MotionController> {
        self.motion.as_ref()
    }

    pub fn motion_enabled(&self) -> bool {
        self.motion.is_some()
    }

    /// Runs started and not yet finished.
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel every run currently in progress. Later runs are unaffected.
    pub fn cancel_all(&self) {
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        root.cancel();
        *root = CancellationToken::new();
        info!("sequencer: cancelled all runs");
    }

    fn run_token(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token()
    }

    /// Start running a prepared segment list.
    pub fn start(&self, segments: Vec<Segment>) -> SequenceRun {
        let token = self.run_token();
        self.spawn_run(token, async move { segments })
    }

    /// Start a run with a caller-provided token.
    pub fn start_with_token(&self, segments: Vec<Segment>, token: CancellationToken) -> SequenceRun {
        self.spawn_run(token, async move { segments })
    }

    /// Annotate `text`, then run it. Annotation happens inside the run, so
    /// this returns immediately; cancelling while it is pending skips every segment.
    pub fn perform_text(&self, text: impl Into<String>) -> SequenceRun {
        let text = text.into();
        let this = self.clone();
        let token = self.run_token();
        self.spawn_run(token, async move { this.prepare(&text).await })
    }

    /// Start a run and wait for it.
    pub async fn run(&self, segments: Vec<Segment>) -> RunReport {
        self.start(segments).wait().await
    }

    /// Turn raw text into segments. Any annotation failure, and any result
    /// without segments, falls back to speaking the raw text unchanged.
    pub async fn prepare(&self, text: &str) -> Vec<Segment> {
        let segments = match &self.annotator {
            Some(annotator) => match annotator.annotate(text).await {
                Ok(output) => output.segments(),
                Err(e) => {
                    warn!("sequencer: annotation failed, speaking raw text: {e}");
                    Vec::new()
                }
            },
            None => parse_marked(text).segments,
        };

        if segments.is_empty() {
            return Segment::speech(text).into_iter().collect();
        }
        segments
    }

    fn spawn_run<F>(&self, token: CancellationToken, segments: F) -> SequenceRun
    where
        F: Future<Output = Vec<Segment>> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(RunState::Pending);
        let this = self.clone();
        let run_token = token.clone();
        let guard = ActiveGuard::enter(&self.active);

        let task = tokio::spawn(async move {
            let _guard = guard;
            let worker_tx = state_tx.clone();
            let inner = tokio::spawn(async move {
                let segments = segments.await;
                worker_tx.send_replace(RunState::Running);
                this.execute(segments, &run_token).await
            });

            let report = match inner.await {
                Ok(report) => report,
                Err(e) => {
                    error!("sequencer: run aborted: {e}");
                    RunReport::new(RunState::Failed)
                }
            };
            state_tx.send_replace(report.state);
            report
        });

        SequenceRun {
            token,
            state_rx,
            task,
        }
    }

    async fn execute(&self, segments: Vec<Segment>, token: &CancellationToken) -> RunReport {
        let total = segments.len();
        let mut report = RunReport::new(RunState::Running);
        let mut pending: Vec<String> = Vec::new();
        let mut gestures: Vec<GestureHandle> = Vec::new();

        debug!("sequencer: run started with {total} segment(s)");

        for segment in segments {
            if token.is_cancelled() {
                report.state = RunState::Cancelled;
                break;
            }

            match segment {
                Segment::Speech { text } => pending.push(text),
                Segment::Movement { movement, duration } => {
                    let Some(motion) = &self.motion else {
                        debug!("sequencer: motion disabled, skipping {movement}");
                        report.dispatched += 1;
                        continue;
                    };

                    self.flush(&mut pending, &mut report).await;
                    if token.is_cancelled() {
                        report.state = RunState::Cancelled;
                        break;
                    }

                    let handle = motion
                        .begin(movement, Some(motion.dwell_for(duration)))
                        .await;
                    report.gestures += 1;
                    gestures.push(handle);
                }
            }
            report.dispatched += 1;
        }

        self.flush(&mut pending, &mut report).await;

        for handle in gestures {
            if !handle.finish().await {
                report.gesture_failures += 1;
            }
        }

        if report.state == RunState::Running {
            report.state = RunState::Completed;
        }
        info!(
            "sequencer: run {:?} ({}/{total} segments, {} utterance(s), {} gesture(s))",
            report.state, report.dispatched, report.utterances, report.gestures
        );
        report
    }

    /// Speak everything buffered as one utterance.
    async fn flush(&self, pending: &mut Vec<String>, report: &mut RunReport) {
        if pending.is_empty() {
            return;
        }
        let text = pending.join(" ");
        pending.clear();

        report.utterances += 1;
        if let Err(e) = self.player.speak(&text).await {
            warn!("sequencer: speech failed: {e}");
            report.speech_failures += 1;
        }
    }
}
