//! In-memory stand-ins for the serial device, the speech player and the annotator.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use hoot_core::annotate::AnnotatorOutput;
use hoot_core::types::LinkConfig;

use crate::annotator::Annotator;
use crate::error::{AnnotationError, SpeechError};
use crate::serial::{Connector, Transport};
use crate::speech::SpeechPlayer;

/// Link settings with every wait removed.
pub fn test_link_config() -> LinkConfig {
    LinkConfig {
        port: "fake0".into(),
        settle: Duration::ZERO,
        deadline: Duration::from_secs(1),
        reconnect_attempts: 2,
        reconnect_backoff: Duration::ZERO,
        open_grace: Duration::ZERO,
        ..Default::default()
    }
}

// ─── Serial device ─────────────────────────────────────────────────────────

#[derive(Default)]
struct DeviceState {
    bytes: Vec<u8>,
    frames: Vec<String>,
    opens: usize,
    /// Opens left to fail; `usize::MAX` fails forever.
    failing_opens: usize,
    failing_writes: usize,
    reply: Option<Vec<u8>>,
    write_delay: Duration,
}

/// A fake head controller recording every frame written to it.
#[derive(Clone, Default)]
pub struct FakeDevice {
    inner: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose port never opens.
    pub fn unreachable() -> Self {
        let device = Self::default();
        device.fail_next_opens(usize::MAX);
        device
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            device: self.clone(),
        }
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.state().failing_opens = n;
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.state().failing_writes = n;
    }

    pub fn set_reply(&self, line: &[u8]) {
        self.state().reply = Some(line.to_vec());
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state().write_delay = delay;
    }

    pub fn frames(&self) -> Vec<String> {
        self.state().frames.clone()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.state().bytes.clone()
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FakeConnector {
    device: FakeDevice,
}

impl Connector for FakeConnector {
    fn connect(&mut self, _config: &LinkConfig) -> io::Result<Box<dyn Transport>> {
        let mut state = self.device.state();
        state.opens += 1;
        if state.failing_opens > 0 {
            if state.failing_opens != usize::MAX {
                state.failing_opens -= 1;
            }
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        Ok(Box::new(FakePort {
            device: self.device.clone(),
        }))
    }
}

struct FakePort {
    device: FakeDevice,
}

impl Transport for FakePort {
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let delay = {
            let mut state = self.device.state();
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            state.write_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        // Byte by byte, so overlapping writers would show up as garbled frames.
        for &byte in frame {
            self.device.state().bytes.push(byte);
        }
        self.device
            .state()
            .frames
            .push(String::from_utf8_lossy(frame).into_owned());
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.device
            .state()
            .reply
            .clone()
            .ok_or_else(|| io::ErrorKind::TimedOut.into())
    }
}

// ─── Speech player ─────────────────────────────────────────────────────────

type SpeakHook = Box<dyn Fn(&str) + Send + Sync>;

/// Records every utterance. Optionally slow, failing, or running a hook per call.
#[derive(Clone, Default)]
pub struct RecordingPlayer {
    spoken: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    fail: bool,
    hook: Option<Arc<SpeakHook>>,
}

impl RecordingPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn on_speak(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(Box::new(hook)));
        self
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SpeechPlayer for RecordingPlayer {
    fn speak<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<(), SpeechError>> {
        Box::pin(async move {
            self.spoken
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(text.to_string());
            if let Some(hook) = &self.hook {
                hook(text);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(SpeechError::Player("speaker unplugged".into()));
            }
            Ok(())
        })
    }
}

// ─── Annotator ─────────────────────────────────────────────────────────────

/// Returns a fixed answer, or fails when constructed with `None`.
pub struct FixedAnnotator {
    output: Option<AnnotatorOutput>,
}

impl FixedAnnotator {
    pub fn returning(output: AnnotatorOutput) -> Self {
        Self {
            output: Some(output),
        }
    }

    pub fn failing() -> Self {
        Self { output: None }
    }
}

impl Annotator for FixedAnnotator {
    fn annotate<'a>(
        &'a self,
        _text: &'a str,
    ) -> BoxFuture<'a, Result<AnnotatorOutput, AnnotationError>> {
        Box::pin(async move {
            self.output
                .clone()
                .ok_or_else(|| AnnotationError::Unavailable("annotator offline".into()))
        })
    }
}
