//! Landmark detector adapter.
//!
//! One worker thread per capture session pulls frames from the frame source,
//! runs the detector and hands the result to whichever [`ResultHandler`] is
//! installed. The handler slot stays locked for the whole delivery, so a
//! swap lands strictly between two frames and every frame reaches exactly one
//! handler.
//!
//! A detector that keeps failing ends its worker and reports once through the
//! session's failure notice. A detector that blocks is interrupted through its
//! [`Canceller`] before the worker is joined, so detaching never waits on it.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::camera::FrameSource;
use crate::{
    error::CaptureError,
    types::{Frame, LandmarkFrame},
};

const STOP_POLL: Duration = Duration::from_millis(50);
/// Consecutive `detect` errors after which the detector is given up on.
const FAILURE_LIMIT: usize = 3;

/// Makes a blocked [`LandmarkDetector::detect`] return. Called from another
/// thread.
pub type Canceller = Box<dyn Fn() + Send + Sync>;

/// Called at most once, from the worker thread, when the detector stops
/// working.
pub type FailureNotice = Box<dyn FnOnce(String) + Send>;

pub trait LandmarkDetector: Send + 'static {
    /// Sensor-space points of at most one hand, `None` when no hand is seen.
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Option<Vec<[f32; 3]>>>;

    fn canceller(&self) -> Option<Canceller> {
        None
    }
}

pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn LandmarkDetector>>;
}

/// Receives one call per processed frame. `None` means the detector saw no
/// hand in that frame.
pub trait ResultHandler: Send + Sync {
    fn on_result(&self, landmarks: Option<LandmarkFrame>);
}

type HandlerSlot = Arc<Mutex<Option<Arc<dyn ResultHandler>>>>;

fn lock_slot(slot: &HandlerSlot) -> MutexGuard<'_, Option<Arc<dyn ResultHandler>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DetectorHandle {
    handler: HandlerSlot,
    stop: Arc<AtomicBool>,
    cancel: Option<Canceller>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DetectorHandle {
    /// Initializes a detector and subscribes it to `source`. Starts with no
    /// handler installed; results are discarded until one is set.
    pub fn attach(
        factory: &dyn DetectorFactory,
        source: &dyn FrameSource,
        landmark_count: usize,
        on_failure: FailureNotice,
    ) -> Result<Self, CaptureError> {
        let detector = factory
            .create()
            .map_err(|err| CaptureError::DetectorInitFailed(format!("{err:#}")))?;
        let cancel = detector.canceller();

        let handler: HandlerSlot = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let frames = source.frames();

        let worker = {
            let handler = handler.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                run_worker_loop(detector, frames, handler, stop, landmark_count, on_failure)
            })
        };

        Ok(Self {
            handler,
            stop,
            cancel,
            worker: Some(worker),
        })
    }

    /// Replaces the active handler. Takes effect before the next frame is
    /// delivered; the frame source subscription is untouched.
    pub fn set_result_handler(&self, handler: Option<Arc<dyn ResultHandler>>) {
        *lock_slot(&self.handler) = handler;
    }

    /// Stops the worker and drops the detector. Safe to call repeatedly.
    pub fn detach(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        lock_slot(&self.handler).take();
        if let Some(worker) = self.worker.take() {
            if let Some(cancel) = &self.cancel {
                cancel();
            }
            let _ = worker.join();
        }
    }

    #[cfg(test)]
    pub fn is_attached(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

fn run_worker_loop(
    mut detector: Box<dyn LandmarkDetector>,
    frames: Receiver<Frame>,
    handler: HandlerSlot,
    stop: Arc<AtomicBool>,
    landmark_count: usize,
    on_failure: FailureNotice,
) {
    let mut failures = 0;
    while let Some(frame) = recv_latest_frame(&frames, &stop) {
        let landmarks = match detector.detect(&frame) {
            Ok(Some(points)) if points.len() == landmark_count => {
                Some(LandmarkFrame::from_sensor(&points))
            }
            Ok(Some(points)) => {
                log::warn!(
                    "detector returned {} landmarks, expected {landmark_count}; treating as no hand",
                    points.len()
                );
                None
            }
            Ok(None) => None,
            Err(_) if stop.load(Ordering::SeqCst) => break,
            Err(err) => {
                failures += 1;
                log::warn!("landmark detection failed ({failures}/{FAILURE_LIMIT}): {err:#}");
                if failures >= FAILURE_LIMIT {
                    log::error!("giving up on the landmark detector: {err:#}");
                    on_failure(format!("{err:#}"));
                    return;
                }
                continue;
            }
        };
        failures = 0;

        let slot = lock_slot(&handler);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if let Some(handler) = slot.as_ref() {
            handler.on_result(landmarks);
        }
    }
    log::debug!("detector worker exited");
}

fn recv_latest_frame(frames: &Receiver<Frame>, stop: &AtomicBool) -> Option<Frame> {
    let mut frame = loop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        match frames.recv_timeout(STOP_POLL) {
            Ok(frame) => break frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    };
    while let Ok(newer) = frames.try_recv() {
        frame = newer;
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crossbeam_channel::{Sender, bounded, unbounded};

    use super::*;
    use crate::testing::{FakeDetectorFactory, test_frame};

    fn ignore_failure() -> FailureNotice {
        Box::new(|_| {})
    }

    struct ChannelSource {
        frames: Receiver<Frame>,
    }

    impl FrameSource for ChannelSource {
        fn frames(&self) -> Receiver<Frame> {
            self.frames.clone()
        }

        fn release(&mut self) {}
    }

    struct Tagged {
        tag: &'static str,
        out: Sender<(&'static str, Option<LandmarkFrame>)>,
    }

    impl ResultHandler for Tagged {
        fn on_result(&self, landmarks: Option<LandmarkFrame>) {
            let _ = self.out.send((self.tag, landmarks));
        }
    }

    fn tagged(
        tag: &'static str,
        out: &Sender<(&'static str, Option<LandmarkFrame>)>,
    ) -> Option<Arc<dyn ResultHandler>> {
        Some(Arc::new(Tagged {
            tag,
            out: out.clone(),
        }))
    }

    fn attach(landmark_count: usize) -> (DetectorHandle, Sender<Frame>) {
        let (frame_tx, frame_rx) = unbounded();
        let source = ChannelSource { frames: frame_rx };
        let handle =
            DetectorHandle::attach(&FakeDetectorFactory::new(3), &source, landmark_count, ignore_failure())
                .unwrap();
        (handle, frame_tx)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn results_are_mirrored_and_routed_to_the_installed_handler() {
        let (handle, frames) = attach(3);
        let (out_tx, out_rx) = unbounded();
        handle.set_result_handler(tagged("monitor", &out_tx));

        frames.send(test_frame(1)).unwrap();
        let (tag, landmarks) = out_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(tag, "monitor");
        let landmarks = landmarks.unwrap();
        assert_eq!(landmarks.len(), 3);
        assert_eq!(landmarks.points()[0].x, 0.75);

        frames.send(test_frame(0)).unwrap();
        assert_eq!(out_rx.recv_timeout(WAIT).unwrap(), ("monitor", None));
    }

    #[test]
    fn unexpected_landmark_count_is_reported_as_no_hand() {
        let (handle, frames) = attach(21);
        let (out_tx, out_rx) = unbounded();
        handle.set_result_handler(tagged("monitor", &out_tx));

        frames.send(test_frame(4)).unwrap();
        assert_eq!(out_rx.recv_timeout(WAIT).unwrap(), ("monitor", None));
    }

    #[test]
    fn swapping_handlers_never_duplicates_or_loses_frames() {
        let (handle, frames) = attach(3);
        let (out_tx, out_rx) = unbounded();
        handle.set_result_handler(tagged("monitor", &out_tx));

        let mut seen = HashSet::new();
        let mut per_handler = [0usize; 2];
        for id in 1..=40u32 {
            frames.send(test_frame(id)).unwrap();
            if id % 3 == 0 {
                let next = if id % 2 == 0 { "monitor" } else { "record" };
                handle.set_result_handler(tagged(next, &out_tx));
            }
            let (tag, landmarks) = out_rx.recv_timeout(WAIT).unwrap();
            let landmarks = landmarks.unwrap();
            assert!(seen.insert(landmarks.points()[0].y as u32));
            per_handler[usize::from(tag == "record")] += 1;
        }

        assert_eq!(seen.len(), 40);
        assert_eq!(per_handler.iter().sum::<usize>(), 40);
        assert!(per_handler[1] > 0);
        assert!(out_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn no_handler_means_results_are_discarded() {
        let (handle, frames) = attach(3);
        let (out_tx, out_rx) = unbounded();

        frames.send(test_frame(1)).unwrap();
        assert!(out_rx.recv_timeout(Duration::from_millis(200)).is_err());

        handle.set_result_handler(tagged("record", &out_tx));
        frames.send(test_frame(2)).unwrap();
        assert_eq!(out_rx.recv_timeout(WAIT).unwrap().0, "record");
    }

    #[test]
    fn detach_is_idempotent_and_stops_delivery() {
        let (mut handle, frames) = attach(3);
        let (out_tx, out_rx) = unbounded();
        handle.set_result_handler(tagged("monitor", &out_tx));

        handle.detach();
        assert!(!handle.is_attached());
        handle.detach();

        let _ = frames.send(test_frame(1));
        assert!(out_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn detector_init_failure_is_a_capture_error() {
        let (_frame_tx, frame_rx) = unbounded();
        let source = ChannelSource { frames: frame_rx };
        let err = DetectorHandle::attach(&FakeDetectorFactory::failing(), &source, 21, ignore_failure())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::DetectorInitFailed(_)));
    }

    #[test]
    fn repeated_detect_errors_are_reported_once_and_end_the_worker() {
        let (frame_tx, frame_rx) = unbounded();
        let source = ChannelSource { frames: frame_rx };
        let factory = FakeDetectorFactory::new(3);
        let (failed_tx, failed_rx) = unbounded();
        let handle = DetectorHandle::attach(
            &factory,
            &source,
            3,
            Box::new(move |reason| {
                let _ = failed_tx.send(reason);
            }),
        )
        .unwrap();
        let (out_tx, out_rx) = unbounded();
        handle.set_result_handler(tagged("monitor", &out_tx));

        frame_tx.send(test_frame(1)).unwrap();
        assert!(out_rx.recv_timeout(WAIT).unwrap().1.is_some());

        factory.break_detectors();
        // Frames are fed one at a time so none is skipped as stale.
        let mut reason = None;
        for id in 2..20 {
            if frame_tx.send(test_frame(id)).is_err() {
                break;
            }
            if let Ok(r) = failed_rx.recv_timeout(Duration::from_millis(100)) {
                reason = Some(r);
                break;
            }
        }
        assert!(reason.unwrap().contains("helper exited"));

        let _ = frame_tx.send(test_frame(30));
        assert!(out_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(failed_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    /// Blocks in `detect` until its canceller fires.
    struct StuckDetector {
        wake_tx: Sender<()>,
        wake_rx: Receiver<()>,
    }

    impl LandmarkDetector for StuckDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Option<Vec<[f32; 3]>>> {
            self.wake_rx.recv()?;
            anyhow::bail!("detector interrupted")
        }

        fn canceller(&self) -> Option<Canceller> {
            let wake = self.wake_tx.clone();
            Some(Box::new(move || {
                let _ = wake.try_send(());
            }))
        }
    }

    struct StuckFactory;

    impl DetectorFactory for StuckFactory {
        fn create(&self) -> anyhow::Result<Box<dyn LandmarkDetector>> {
            let (wake_tx, wake_rx) = bounded(1);
            Ok(Box::new(StuckDetector { wake_tx, wake_rx }))
        }
    }

    #[test]
    fn detach_interrupts_a_blocked_detector() {
        let (frame_tx, frame_rx) = unbounded();
        let source = ChannelSource { frames: frame_rx };
        let mut handle = DetectorHandle::attach(&StuckFactory, &source, 3, ignore_failure()).unwrap();

        frame_tx.send(test_frame(1)).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let (done_tx, done_rx) = bounded(1);
        std::thread::spawn(move || {
            handle.detach();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(WAIT).is_ok(), "detach waited on a blocked detector");
    }
}
