//! In-process stand-ins for the camera, the detector and the backend.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::{
    backend::{Backend, StatusReply},
    error::{BackendError, CaptureError},
    pipeline::{
        camera::{FrameSource, FrameSourceProvider},
        detector::{DetectorFactory, LandmarkDetector},
    },
    types::{Frame, LandmarkFrame, Prediction, SampleBatch},
};

/// A frame whose width doubles as its id. Width 0 is a frame without a hand.
pub fn test_frame(id: u32) -> Frame {
    Frame {
        rgba: vec![0; id as usize * 4],
        width: id,
        height: 1,
        timestamp: Instant::now(),
    }
}

#[derive(Default)]
struct CameraState {
    gate: Option<(Sender<Result<(), CaptureError>>, Receiver<Result<(), CaptureError>>)>,
    acquisitions: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    releases: AtomicUsize,
    feed: Mutex<Option<Sender<Frame>>>,
}

/// Counts acquisitions and live handles. A gated camera blocks every
/// acquisition until the test calls [`FakeCamera::allow`] or
/// [`FakeCamera::deny`].
#[derive(Clone, Default)]
pub struct FakeCamera {
    state: Arc<CameraState>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            state: Arc::new(CameraState {
                gate: Some(unbounded()),
                ..CameraState::default()
            }),
        }
    }

    pub fn allow(&self) {
        self.open_gate(Ok(()));
    }

    pub fn deny(&self, err: CaptureError) {
        self.open_gate(Err(err));
    }

    fn open_gate(&self, outcome: Result<(), CaptureError>) {
        let (tx, _) = self.state.gate.as_ref().expect("camera is not gated");
        tx.send(outcome).unwrap();
    }

    /// Feeds a frame to the live source. Returns false when no source is live.
    pub fn push(&self, frame: Frame) -> bool {
        let feed = self.state.feed.lock().unwrap();
        feed.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    pub fn acquisitions(&self) -> usize {
        self.state.acquisitions.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }
}

impl FrameSourceProvider for FakeCamera {
    fn acquire(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        if let Some((_, gate)) = &self.state.gate {
            gate.recv()
                .map_err(|_| CaptureError::DeviceUnavailable("gate closed".into()))??;
        }

        self.state.acquisitions.fetch_add(1, Ordering::SeqCst);
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);

        let (tx, rx) = unbounded();
        *self.state.feed.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeSource {
            frames: rx,
            state: self.state.clone(),
            released: false,
        }))
    }
}

struct FakeSource {
    frames: Receiver<Frame>,
    state: Arc<CameraState>,
    released: bool,
}

impl FrameSource for FakeSource {
    fn frames(&self) -> Receiver<Frame> {
        self.frames.clone()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.state.feed.lock().unwrap().take();
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct FakeDetectorFactory {
    points: usize,
    fail: bool,
    broken: Arc<AtomicBool>,
}

impl FakeDetectorFactory {
    pub fn new(points: usize) -> Self {
        Self {
            points,
            fail: false,
            broken: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    /// Every detector made by this factory fails from now on, like a helper
    /// that crashed mid-session.
    pub fn break_detectors(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl DetectorFactory for FakeDetectorFactory {
    fn create(&self) -> anyhow::Result<Box<dyn LandmarkDetector>> {
        if self.fail {
            anyhow::bail!("hand landmark model missing");
        }
        Ok(Box::new(FakeDetector {
            points: self.points,
            broken: self.broken.clone(),
        }))
    }
}

/// Reports a hand on every frame with a non-zero width, carrying the frame id
/// in each point's `y`.
struct FakeDetector {
    points: usize,
    broken: Arc<AtomicBool>,
}

impl LandmarkDetector for FakeDetector {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Option<Vec<[f32; 3]>>> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("helper exited");
        }
        if frame.width == 0 {
            return Ok(None);
        }
        Ok(Some(vec![[0.25, frame.width as f32, 0.0]; self.points]))
    }
}

#[derive(Default)]
struct BackendState {
    gestures: Vec<String>,
    actions: BTreeMap<String, String>,
    predict_script: VecDeque<(Duration, Result<Prediction, BackendError>)>,
    predicted: Vec<LandmarkFrame>,
    submitted: Vec<SampleBatch>,
    failing_uploads: usize,
    upload_attempts: usize,
}

/// Records every call. `/predict` replies follow the script, then fall back
/// to an immediate `palm` at 90%.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gestures(&self, gestures: &[&str]) {
        self.state.lock().unwrap().gestures = gestures.iter().map(|g| g.to_string()).collect();
    }

    pub fn script_prediction(&self, delay: Duration, result: Result<Prediction, BackendError>) {
        self.state
            .lock()
            .unwrap()
            .predict_script
            .push_back((delay, result));
    }

    pub fn fail_uploads(&self, count: usize) {
        self.state.lock().unwrap().failing_uploads = count;
    }

    pub fn predictions(&self) -> usize {
        self.state.lock().unwrap().predicted.len()
    }

    pub fn submitted(&self) -> Vec<SampleBatch> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn upload_attempts(&self) -> usize {
        self.state.lock().unwrap().upload_attempts
    }
}

pub fn prediction(gesture: &str, confidence: f32) -> Prediction {
    Prediction {
        gesture: Some(gesture.to_string()),
        confidence,
    }
}

pub fn unreachable(endpoint: &str) -> BackendError {
    BackendError::Transport {
        endpoint: endpoint.to_string(),
        message: "connection refused".to_string(),
    }
}

impl Backend for FakeBackend {
    fn predict(&self, landmarks: &LandmarkFrame) -> Result<Prediction, BackendError> {
        let (delay, result) = {
            let mut state = self.state.lock().unwrap();
            state.predicted.push(landmarks.clone());
            state
                .predict_script
                .pop_front()
                .unwrap_or((Duration::ZERO, Ok(prediction("palm", 90.0))))
        };
        thread::sleep(delay);
        result
    }

    fn add_landmarks(&self, batch: &SampleBatch) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.upload_attempts += 1;
        if state.failing_uploads > 0 {
            state.failing_uploads -= 1;
            return Err(unreachable("/add_landmarks"));
        }
        state.submitted.push(batch.clone());
        Ok(())
    }

    fn gestures(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state.lock().unwrap().gestures.clone())
    }

    fn actions(&self) -> Result<BTreeMap<String, String>, BackendError> {
        Ok(self.state.lock().unwrap().actions.clone())
    }

    fn update_action(&self, gesture: &str, action: &str) -> Result<(), BackendError> {
        self.state
            .lock()
            .unwrap()
            .actions
            .insert(gesture.to_string(), action.to_string());
        Ok(())
    }

    fn remove_mapping(&self, gesture: &str) -> Result<StatusReply, BackendError> {
        match self.state.lock().unwrap().actions.remove(gesture) {
            Some(_) => Ok(StatusReply {
                status: "success".into(),
                message: Some(format!("Mapping for '{gesture}' removed")),
            }),
            None => Err(BackendError::Rejected {
                endpoint: "/remove_mapping".into(),
                message: format!("No mapping found for '{gesture}'"),
            }),
        }
    }

    fn delete_gesture(&self, gesture: &str) -> Result<StatusReply, BackendError> {
        self.state.lock().unwrap().gestures.retain(|g| g != gesture);
        Ok(StatusReply {
            status: "success".into(),
            message: Some(format!("Gesture '{gesture}' deleted")),
        })
    }

    fn start_system(&self) -> Result<StatusReply, BackendError> {
        Ok(StatusReply {
            status: "system started".into(),
            message: None,
        })
    }

    fn stop_system(&self) -> Result<StatusReply, BackendError> {
        Ok(StatusReply {
            status: "system stopped".into(),
            message: None,
        })
    }

    fn retrain(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_confidence(&self, _threshold: f32) -> Result<(), BackendError> {
        Ok(())
    }

    fn current_gesture(&self) -> Result<Prediction, BackendError> {
        Ok(Prediction {
            gesture: None,
            confidence: 0.0,
        })
    }
}
