//! Voice recording: `Idle → Recording → Idle`, plus the touch-hold trigger.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{
    model::{AudioBlob, Message},
    notify::Toasts,
    sync::MessageSync,
    ChatResult,
};

pub const MIN_HOLD: Duration = Duration::from_millis(300);
pub const MOVE_TOLERANCE: f32 = 10.0;

/// The microphone.
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Acquires the device and starts encoding. Fails with `Permission` when
    /// access is denied and `Device` when there is no microphone.
    async fn open(&self) -> ChatResult<Box<dyn AudioCapture>>;
}

/// A running encoder. Dropping it must release the device.
#[async_trait]
pub trait AudioCapture: Send {
    fn mime_type(&self) -> &str;
    /// Stops encoding, releases the device and hands back what was recorded.
    async fn finish(&mut self) -> ChatResult<Vec<u8>>;
    /// Stops and releases without keeping anything.
    fn cancel(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

pub struct Recorder {
    input: Arc<dyn AudioInput>,
    toasts: Toasts,
    capture: Option<Box<dyn AudioCapture>>,
    started_at: Option<Instant>,
}

impl Recorder {
    pub fn new(input: Arc<dyn AudioInput>, toasts: Toasts) -> Self {
        Self {
            input,
            toasts,
            capture: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        match self.capture {
            Some(_) => RecorderState::Recording,
            None => RecorderState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|at| at.elapsed())
    }

    pub async fn start(&mut self) -> ChatResult<()> {
        if self.is_recording() {
            return Ok(());
        }
        match self.input.open().await {
            Ok(capture) => {
                tracing::debug!("recording {}", capture.mime_type());
                self.capture = Some(capture);
                self.started_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.toasts.error("Failed to start recording", &e);
                Err(e)
            }
        }
    }

    /// `None` when idle or when no audio arrived before the stop.
    pub async fn stop(&mut self) -> ChatResult<Option<AudioBlob>> {
        let Some(mut capture) = self.capture.take() else {
            return Ok(None);
        };
        self.started_at = None;

        let mime_type = capture.mime_type().to_owned();
        let recorded = capture.finish().await;
        drop(capture);

        match recorded {
            Ok(bytes) if bytes.is_empty() => {
                tracing::debug!("recording stopped before any audio arrived");
                Ok(None)
            }
            Ok(bytes) => Ok(Some(AudioBlob::new(bytes, mime_type))),
            Err(e) => {
                self.toasts.error("Failed to record voice message", &e);
                Err(e)
            }
        }
    }

    pub fn cancel(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.cancel();
            tracing::debug!("recording cancelled");
        }
        self.started_at = None;
    }

    /// Press-to-toggle: starts when idle, stops (yielding the blob) when recording.
    pub async fn toggle(&mut self) -> ChatResult<Option<AudioBlob>> {
        if self.is_recording() {
            self.stop().await
        } else {
            self.start().await.map(|_| None)
        }
    }

    pub async fn gesture(&mut self, action: GestureAction) -> ChatResult<Option<AudioBlob>> {
        match action {
            GestureAction::Start => self.start().await.map(|_| None),
            GestureAction::Finish => self.stop().await,
            GestureAction::Cancel => {
                self.cancel();
                Ok(None)
            }
            GestureAction::Nothing => Ok(None),
        }
    }

    /// Stops and, if anything was recorded, posts it as a voice message.
    pub async fn stop_and_send(&mut self, sync: &MessageSync) -> ChatResult<Option<Message>> {
        match self.stop().await? {
            Some(blob) => sync.send_voice(blob).await.map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureAction {
    Start,
    Finish,
    Cancel,
    Nothing,
}

/// Touch-and-hold: press starts, drifting too far cancels, releasing too soon cancels.
#[derive(Debug, Clone)]
pub struct HoldGesture {
    min_hold: Duration,
    move_tolerance: f32,
    pressed: Option<(Instant, (f32, f32))>,
}

impl Default for HoldGesture {
    fn default() -> Self {
        Self::new(MIN_HOLD, MOVE_TOLERANCE)
    }
}

impl HoldGesture {
    pub fn new(min_hold: Duration, move_tolerance: f32) -> Self {
        Self {
            min_hold,
            move_tolerance,
            pressed: None,
        }
    }

    pub fn press(&mut self, at: Instant, position: (f32, f32)) -> GestureAction {
        if self.pressed.is_some() {
            return GestureAction::Nothing;
        }
        self.pressed = Some((at, position));
        GestureAction::Start
    }

    pub fn moved(&mut self, position: (f32, f32)) -> GestureAction {
        let Some((_, (x, y))) = self.pressed else {
            return GestureAction::Nothing;
        };
        let distance = ((position.0 - x).powi(2) + (position.1 - y).powi(2)).sqrt();
        if distance > self.move_tolerance {
            self.pressed = None;
            GestureAction::Cancel
        } else {
            GestureAction::Nothing
        }
    }

    pub fn release(&mut self, at: Instant) -> GestureAction {
        let Some((pressed_at, _)) = self.pressed.take() else {
            return GestureAction::Nothing;
        };
        if at.saturating_duration_since(pressed_at) >= self.min_hold {
            GestureAction::Finish
        } else {
            GestureAction::Cancel
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::{notify::NoticeLevel, ChatError};

    use super::*;

    enum Mic {
        Records(Vec<u8>),
        Denied,
        Missing,
    }

    struct FakeInput {
        mic: Mic,
        opened: AtomicUsize,
        released: Arc<AtomicBool>,
    }

    impl FakeInput {
        fn new(mic: Mic) -> Arc<Self> {
            Arc::new(Self {
                mic,
                opened: AtomicUsize::new(0),
                released: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    struct FakeCapture {
        audio: Vec<u8>,
        released: Arc<AtomicBool>,
    }

    impl Drop for FakeCapture {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioInput for FakeInput {
        async fn open(&self) -> ChatResult<Box<dyn AudioCapture>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            match &self.mic {
                Mic::Records(audio) => Ok(Box::new(FakeCapture {
                    audio: audio.clone(),
                    released: self.released.clone(),
                })),
                Mic::Denied => Err(ChatError::Permission),
                Mic::Missing => Err(ChatError::Device),
            }
        }
    }

    #[async_trait]
    impl AudioCapture for FakeCapture {
        fn mime_type(&self) -> &str {
            "audio/webm;codecs=opus"
        }

        async fn finish(&mut self) -> ChatResult<Vec<u8>> {
            Ok(std::mem::take(&mut self.audio))
        }

        fn cancel(&mut self) {
            self.audio.clear();
        }
    }

    #[tokio::test]
    async fn records_into_a_blob_and_releases_the_mic() {
        let input = FakeInput::new(Mic::Records(vec![1, 2, 3]));
        let mut recorder = Recorder::new(input.clone(), Toasts::new());

        assert_eq!(recorder.toggle().await.unwrap(), None);
        assert!(recorder.is_recording());
        recorder.start().await.unwrap();
        assert_eq!(input.opened.load(Ordering::SeqCst), 1);

        let blob = recorder.toggle().await.unwrap().unwrap();
        assert_eq!(blob.bytes, vec![1, 2, 3]);
        assert_eq!(blob.extension(), "webm");
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(input.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stopping_before_any_audio_yields_nothing() {
        let input = FakeInput::new(Mic::Records(Vec::new()));
        let mut recorder = Recorder::new(input.clone(), Toasts::new());

        recorder.start().await.unwrap();
        assert_eq!(recorder.stop().await.unwrap(), None);
        assert!(input.released.load(Ordering::SeqCst));
        assert_eq!(recorder.stop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn denied_or_missing_microphones_abort_with_a_notice() {
        for (mic, expected) in [(Mic::Denied, "permission denied"), (Mic::Missing, "no microphone found")] {
            let toasts = Toasts::new();
            let mut notices = toasts.subscribe();
            let mut recorder = Recorder::new(FakeInput::new(mic), toasts);

            let err = recorder.start().await.unwrap_err();
            assert_eq!(err.to_string(), expected);
            assert_eq!(recorder.state(), RecorderState::Idle);
            assert_eq!(notices.try_recv().unwrap().level, NoticeLevel::Error);
        }
    }

    #[tokio::test]
    async fn cancel_and_drop_release_the_mic() {
        let input = FakeInput::new(Mic::Records(vec![9]));
        let mut recorder = Recorder::new(input.clone(), Toasts::new());
        recorder.start().await.unwrap();
        recorder.cancel();
        assert!(!recorder.is_recording());
        assert!(input.released.load(Ordering::SeqCst));

        let input = FakeInput::new(Mic::Records(vec![9]));
        let mut recorder = Recorder::new(input.clone(), Toasts::new());
        recorder.start().await.unwrap();
        drop(recorder);
        assert!(input.released.load(Ordering::SeqCst));
    }

    #[test]
    fn hold_gesture_needs_a_long_still_press() {
        let t0 = Instant::now();
        let mut gesture = HoldGesture::default();

        assert_eq!(gesture.press(t0, (0.0, 0.0)), GestureAction::Start);
        assert_eq!(gesture.press(t0, (0.0, 0.0)), GestureAction::Nothing);
        assert_eq!(gesture.moved((3.0, 4.0)), GestureAction::Nothing);
        assert_eq!(gesture.release(t0 + Duration::from_millis(450)), GestureAction::Finish);

        assert_eq!(gesture.press(t0, (0.0, 0.0)), GestureAction::Start);
        assert_eq!(gesture.release(t0 + Duration::from_millis(100)), GestureAction::Cancel);

        assert_eq!(gesture.press(t0, (0.0, 0.0)), GestureAction::Start);
        assert_eq!(gesture.moved((8.0, 8.0)), GestureAction::Cancel);
        assert_eq!(gesture.release(t0 + Duration::from_secs(2)), GestureAction::Nothing);
    }

    #[tokio::test]
    async fn gestures_drive_the_recorder() {
        let input = FakeInput::new(Mic::Records(vec![7, 7]));
        let mut recorder = Recorder::new(input, Toasts::new());
        let mut gesture = HoldGesture::default();
        let t0 = Instant::now();

        recorder.gesture(gesture.press(t0, (10.0, 10.0))).await.unwrap();
        assert!(recorder.is_recording());
        let action = gesture.moved((30.0, 10.0));
        assert_eq!(recorder.gesture(action).await.unwrap(), None);
        assert!(!recorder.is_recording());

        recorder.gesture(gesture.press(t0, (10.0, 10.0))).await.unwrap();
        let blob = recorder
            .gesture(gesture.release(t0 + Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(blob.map(|b| b.bytes), Some(vec![7, 7]));
    }
}
