//! Speech player boundary.
//!
//! The sequencer only needs "speak this text and tell me when you're done".
//! [`HttpSpeechPlayer`] does that against a nayru-compatible TTS server:
//! `POST /speak`, then poll `GET /status` until the queue drains.
//! [`HookedPlayer`] wraps any player with before/after callbacks, used to
//! pause voice capture while the owl talks so it doesn't hear itself. The
//! server wraps its player in [`SpeechHooks::tracking`] to report when the owl
//! is speaking.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use hoot_core::types::SpeechConfig;

use crate::error::SpeechError;

/// Something that can say a line of text. Resolves when playback is over.
pub trait SpeechPlayer: Send + Sync {
    fn speak<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), SpeechError>>;
}

impl<P: SpeechPlayer + ?Sized> SpeechPlayer for Arc<P> {
    fn speak<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), SpeechError>> {
        (**self).speak(text)
    }
}

// ─── Hooks ─────────────────────────────────────────────────────────────────

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks run immediately before and after every utterance.
#[derive(Clone, Default)]
pub struct SpeechHooks {
    before: Option<Hook>,
    after: Option<Hook>,
}

impl SpeechHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn after(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.after = Some(Arc::new(hook));
        self
    }

    /// Count utterances in progress.
    pub fn tracking(speaking: Arc<AtomicUsize>) -> Self {
        let done = speaking.clone();
        Self::new()
            .before(move || {
                speaking.fetch_add(1, Ordering::SeqCst);
            })
            .after(move || {
                done.fetch_sub(1, Ordering::SeqCst);
            })
    }
}

/// Runs the `after` hook on drop, so it fires on errors and cancellation too.
struct AfterGuard(Option<Hook>);

impl Drop for AfterGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

/// A player wrapped in [`SpeechHooks`].
pub struct HookedPlayer<P> {
    inner: P,
    hooks: SpeechHooks,
}

impl<P: SpeechPlayer> HookedPlayer<P> {
    pub fn new(inner: P, hooks: SpeechHooks) -> Self {
        Self { inner, hooks }
    }
}

impl<P: SpeechPlayer> SpeechPlayer for HookedPlayer<P> {
    fn speak<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), SpeechError>> {
        Box::pin(async move {
            if let Some(before) = &self.hooks.before {
                before();
            }
            let _after = AfterGuard(self.hooks.after.clone());
            self.inner.speak(text).await
        })
    }
}

// ─── HTTP player ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SpeakResponse {
    #[serde(default)]
    queued_chunks: usize,
}

#[derive(Deserialize)]
struct StatusResponse {
    state: String,
    #[serde(default)]
    queue_length: usize,
}

/// How long an idle status is trusted before the server has reported any activity.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Speaks through a nayru-compatible TTS server.
#[derive(Clone)]
pub struct HttpSpeechPlayer {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl HttpSpeechPlayer {
    pub fn new(config: SpeechConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn submit(&self, text: &str) -> Result<usize, SpeechError> {
        let resp = self
            .client
            .post(format!("{}/speak", self.config.tts_url))
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SpeechError::Server { status, body });
        }
        Ok(resp.json::<SpeakResponse>().await?.queued_chunks)
    }

    async fn status(&self) -> Result<StatusResponse, SpeechError> {
        let resp = self
            .client
            .get(format!("{}/status", self.config.tts_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn wait_until_idle(&self) -> Result<(), SpeechError> {
        let started = Instant::now();
        let deadline = started + self.config.max_playback;
        let mut seen_activity = false;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            if Instant::now() >= deadline {
                return Err(SpeechError::Timeout(self.config.max_playback));
            }

            let status = match self.status().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("speech: status poll failed: {e}");
                    continue;
                }
            };

            let idle = status.state == "idle" && status.queue_length == 0;
            if !idle {
                seen_activity = true;
            } else if seen_activity || started.elapsed() >= STARTUP_GRACE {
                return Ok(());
            }
        }
    }
}

impl SpeechPlayer for HttpSpeechPlayer {
    fn speak<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), SpeechError>> {
        Box::pin(async move {
            let queued = self.submit(text).await?;
            debug!("speech: {} chars queued as {queued} chunk(s)", text.len());
            if queued == 0 {
                return Ok(());
            }
            self.wait_until_idle().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPlayer;
    use std::sync::Mutex;

    fn journal() -> (Arc<Mutex<Vec<String>>>, SpeechHooks) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (b, a) = (log.clone(), log.clone());
        let hooks = SpeechHooks::new()
            .before(move || b.lock().unwrap().push("pause-mic".into()))
            .after(move || a.lock().unwrap().push("resume-mic".into()));
        (log, hooks)
    }

    #[tokio::test]
    async fn hooks_wrap_each_utterance() {
        let (log, hooks) = journal();
        let recorder = RecordingPlayer::new();
        let player = HookedPlayer::new(recorder.clone(), hooks);

        player.speak("hello").await.unwrap();
        player.speak("again").await.unwrap();

        assert_eq!(recorder.spoken(), vec!["hello", "again"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["pause-mic", "resume-mic", "pause-mic", "resume-mic"]
        );
    }

    #[tokio::test]
    async fn after_hook_runs_when_playback_fails() {
        let (log, hooks) = journal();
        let player = HookedPlayer::new(RecordingPlayer::new().failing(), hooks);

        assert!(player.speak("hello").await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["pause-mic", "resume-mic"]);
    }

    #[tokio::test]
    async fn after_hook_runs_when_playback_is_abandoned() {
        let (log, hooks) = journal();
        let player = HookedPlayer::new(
            RecordingPlayer::new().with_delay(Duration::from_secs(5)),
            hooks,
        );

        let abandoned = tokio::time::timeout(Duration::from_millis(20), player.speak("long")).await;
        assert!(abandoned.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["pause-mic", "resume-mic"]);
    }

    #[tokio::test]
    async fn tracking_counts_utterances_in_progress() {
        let speaking = Arc::new(AtomicUsize::new(0));
        let during = Arc::new(AtomicUsize::new(0));
        let (seen, count) = (speaking.clone(), during.clone());
        let recorder = RecordingPlayer::new()
            .on_speak(move |_| count.store(seen.load(Ordering::SeqCst), Ordering::SeqCst));
        let player = HookedPlayer::new(recorder.clone(), SpeechHooks::tracking(speaking.clone()));

        player.speak("hello").await.unwrap();
        assert_eq!(recorder.spoken(), vec!["hello"]);
        assert_eq!(during.load(Ordering::SeqCst), 1);
        assert_eq!(speaking.load(Ordering::SeqCst), 0);

        let failing = HookedPlayer::new(
            RecordingPlayer::new().failing(),
            SpeechHooks::tracking(speaking.clone()),
        );
        assert!(failing.speak("oops").await.is_err());
        assert_eq!(speaking.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_response_tolerates_missing_fields() {
        let status: StatusResponse = serde_json::from_str(r#"{"state": "playing"}"#).unwrap();
        assert_eq!(status.state, "playing");
        assert_eq!(status.queue_length, 0);
        let speak: SpeakResponse = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert_eq!(speak.queued_chunks, 0);
    }
}
