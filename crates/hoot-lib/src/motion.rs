//! Gesture primitives built on the serial link.
//!
//! ```text
//! begin(gesture) → link: gesture frame ─┐        (awaited)
//!                                       └ task: dwell → link: neutral frame
//! ```
//!
//! Only the first frame is awaited by [`MotionController::begin`]. The dwell
//! and the return to neutral run on a spawned task, so speech can start while
//! the head is still moving. The dwell happens even when the first frame was
//! not delivered, which keeps timing identical whether or not the head is
//! attached.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hoot_core::protocol::{Command, MotorFrame, parse_positions};
use hoot_core::types::{Macro, MotionConfig, MovementRequest, MovementType};

use crate::error::LinkError;
use crate::link::Link;

/// A gesture that has been started and will reset itself.
pub struct GestureHandle {
    movement: MovementType,
    delivered: bool,
    task: JoinHandle<bool>,
}

impl GestureHandle {
    pub fn movement(&self) -> MovementType {
        self.movement
    }

    /// Whether the gesture frame reached the device.
    pub fn delivered(&self) -> bool {
        self.delivered
    }

    /// Wait for the dwell and reset. `true` when both frames were delivered.
    pub async fn finish(self) -> bool {
        match self.task.await {
            Ok(reset) => self.delivered && reset,
            Err(e) => {
                warn!("motion: {} reset task failed: {e}", self.movement);
                false
            }
        }
    }
}

/// Performs gestures over a shared [`Link`].
#[derive(Clone)]
pub struct MotionController {
    link: Link,
    config: MotionConfig,
}

impl MotionController {
    pub fn new(link: Link, config: MotionConfig) -> Self {
        Self { link, config }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Dwell for a requested duration in seconds. Zero, negative and
    /// non-finite requests use the configured default; long ones are capped,
    /// including values too large to represent as a `Duration`.
    pub fn dwell_for(&self, seconds: f32) -> Duration {
        if !seconds.is_finite() || seconds <= 0.0 {
            return self.config.dwell;
        }
        let max = self.config.max_dwell;
        Duration::try_from_secs_f32(seconds).map_or(max, |d| d.min(max))
    }

    /// Send the gesture frame and schedule the return to neutral.
    pub async fn begin(&self, movement: MovementType, dwell: Option<Duration>) -> GestureHandle {
        let dwell = dwell.unwrap_or(self.config.dwell);
        let delivered = match self.link.set_positions(movement.frame()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("motion: {movement} not delivered: {e}");
                false
            }
        };
        debug!("motion: {movement} started, resetting in {dwell:?}");

        let link = self.link.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            match link.set_positions(MotorFrame::NEUTRAL).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("motion: reset after {movement} failed: {e}");
                    false
                }
            }
        });

        GestureHandle {
            movement,
            delivered,
            task,
        }
    }

    /// Run one gesture to completion: frame, dwell, neutral.
    pub async fn perform(&self, movement: MovementType) -> bool {
        self.begin(movement, None).await.finish().await
    }

    pub async fn tilt_front(&self) -> bool {
        self.perform(MovementType::TiltFront).await
    }

    pub async fn tilt_back(&self) -> bool {
        self.perform(MovementType::TiltBack).await
    }

    pub async fn rotate_right(&self) -> bool {
        self.perform(MovementType::RotateRight).await
    }

    pub async fn rotate_left(&self) -> bool {
        self.perform(MovementType::RotateLeft).await
    }

    pub async fn tilt_right(&self) -> bool {
        self.perform(MovementType::TiltRight).await
    }

    pub async fn tilt_left(&self) -> bool {
        self.perform(MovementType::TiltLeft).await
    }

    /// Perform each gesture in turn, pausing for its duration afterwards.
    /// Returns how many completed cleanly.
    pub async fn run_batch(&self, batch: &[MovementRequest]) -> usize {
        let mut ok = 0;
        for request in batch {
            if self.perform(request.movement).await {
                ok += 1;
            }
            tokio::time::sleep(request.pause()).await;
        }
        debug!("motion: batch finished, {ok}/{} clean", batch.len());
        ok
    }

    pub async fn run_macro(&self, name: Macro) -> usize {
        self.run_batch(&name.batch()).await
    }

    /// Return the head to neutral.
    pub async fn reset_posture(&self) -> Result<(), LinkError> {
        self.link.set_positions(MotorFrame::NEUTRAL).await
    }

    pub async fn set_torque(&self, on: bool) -> Result<(), LinkError> {
        self.link.send(Command::Torque(on)).await
    }

    pub async fn set_speed(&self, speed: u32) -> Result<(), LinkError> {
        self.link.send(Command::Speed(speed)).await
    }

    /// Current servo positions, if the device answers.
    pub async fn positions(&self) -> Option<[u16; 3]> {
        let line = self.link.query_positions().await?;
        match parse_positions(&line) {
            Ok(positions) => Some(positions),
            Err(e) => {
                warn!("motion: unreadable position reply {line:?}: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, test_link_config};
    use std::time::Instant;

    const NEUTRAL_LINE: &str = "[m,1,2045,2,2045,3,2045]\n";

    fn controller(device: &FakeDevice) -> MotionController {
        let link = Link::with_connector(test_link_config(), device.connector()).unwrap();
        let config = MotionConfig {
            dwell: Duration::from_millis(10),
            max_dwell: Duration::from_millis(50),
        };
        MotionController::new(link, config)
    }

    #[tokio::test]
    async fn every_gesture_sends_its_frame_then_neutral() {
        let device = FakeDevice::new();
        let motion = controller(&device);

        for movement in MovementType::ALL {
            assert!(motion.perform(movement).await, "{movement}");
        }

        let frames = device.frames();
        assert_eq!(frames.len(), 12);
        for (pair, movement) in frames.chunks(2).zip(MovementType::ALL) {
            assert_eq!(pair[0], Command::SetPositions(movement.frame()).encode());
            assert_eq!(pair[1], NEUTRAL_LINE);
        }
    }

    #[tokio::test]
    async fn tilt_front_hits_documented_positions() {
        let device = FakeDevice::new();
        let motion = controller(&device);

        assert!(motion.tilt_front().await);
        assert_eq!(device.frames(), vec!["[m,1,2045,2,2135,3,1955]\n", NEUTRAL_LINE]);
    }

    #[tokio::test]
    async fn begin_returns_before_the_dwell() {
        let device = FakeDevice::new();
        let motion = controller(&device);

        let started = Instant::now();
        let handle = motion
            .begin(MovementType::RotateLeft, Some(Duration::from_millis(300)))
            .await;
        assert!(handle.delivered());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(device.frames().len(), 1);

        assert!(handle.finish().await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(device.frames().last().map(String::as_str), Some(NEUTRAL_LINE));
    }

    #[tokio::test]
    async fn unreachable_link_still_dwells_and_reports_failure() {
        let device = FakeDevice::unreachable();
        let motion = controller(&device);

        let started = Instant::now();
        let handle = motion
            .begin(MovementType::TiltBack, Some(Duration::from_millis(40)))
            .await;
        assert!(!handle.delivered());
        assert!(!handle.finish().await);
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(device.frames().is_empty());
    }

    #[test]
    fn dwell_override_is_capped() {
        let device = FakeDevice::new();
        let motion = controller(&device);

        assert_eq!(motion.dwell_for(0.0), Duration::from_millis(10));
        assert_eq!(motion.dwell_for(f32::NAN), Duration::from_millis(10));
        assert_eq!(motion.dwell_for(0.02), Duration::from_secs_f32(0.02));
        assert_eq!(motion.dwell_for(30.0), Duration::from_millis(50));
        assert_eq!(motion.dwell_for(1e23), Duration::from_millis(50));
        assert_eq!(motion.dwell_for(f32::MAX), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn batch_runs_in_order() {
        let device = FakeDevice::new();
        let motion = controller(&device);
        let batch = [
            MovementRequest::new(MovementType::TiltRight, 0.0),
            MovementRequest::new(MovementType::TiltLeft, 0.01),
        ];

        assert_eq!(motion.run_batch(&batch).await, 2);
        assert_eq!(
            device.frames(),
            vec![
                Command::SetPositions(MovementType::TiltRight.frame()).encode(),
                NEUTRAL_LINE.to_string(),
                Command::SetPositions(MovementType::TiltLeft.frame()).encode(),
                NEUTRAL_LINE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn huge_batch_pause_does_not_panic() {
        let device = FakeDevice::new();
        let motion = controller(&device);
        let batch: Vec<MovementRequest> =
            serde_json::from_str(r#"[{"type": 1, "duration": 1e30}]"#).unwrap();

        // The capped pause is still long, so stop waiting once the gesture is done.
        let _ = tokio::time::timeout(Duration::from_millis(200), motion.run_batch(&batch)).await;

        assert_eq!(
            device.frames(),
            vec![
                Command::SetPositions(MovementType::TiltFront.frame()).encode(),
                NEUTRAL_LINE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn torque_speed_and_positions() {
        let device = FakeDevice::new();
        device.set_reply(b"2045,2100,1990\r");
        let motion = controller(&device);

        motion.set_torque(false).await.unwrap();
        motion.set_speed(300).await.unwrap();
        assert_eq!(motion.positions().await, Some([2045, 2100, 1990]));
        assert_eq!(device.frames(), vec!["[f]\n", "[v,300]\n", "[g]\n"]);
    }
}
