//! Capture session manager: the only owner of the camera.
//!
//! A session pairs the frame source with its detector and is acquired and
//! released as a unit. At most one acquisition runs at a time and at most
//! one session is held; an acquisition that completes after its requester
//! gave up is released on the spot instead of being adopted.

use std::{
    fmt,
    sync::Arc,
    thread,
};

use crossbeam_channel::Sender;

use super::{
    camera::{FrameSource, FrameSourceProvider},
    detector::{DetectorFactory, DetectorHandle, ResultHandler},
};
use crate::{controller::Event, error::CaptureError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct CaptureSession {
    id: SessionId,
    source: Box<dyn FrameSource>,
    detector: DetectorHandle,
    active: bool,
}

impl CaptureSession {
    /// Acquires the frame source and attaches a detector to it. If the
    /// detector cannot start, the frame source is released before the error
    /// is returned. A detector that later stops working is reported as
    /// [`Event::DetectorFailed`].
    fn open(
        id: SessionId,
        provider: &dyn FrameSourceProvider,
        detectors: &dyn DetectorFactory,
        landmark_count: usize,
        events: Sender<Event>,
    ) -> Result<Self, CaptureError> {
        let mut source = provider.acquire()?;
        let on_failure = Box::new(move |reason| {
            let _ = events.send(Event::DetectorFailed {
                session: id,
                error: CaptureError::DetectorFailed(reason),
            });
        });
        let detector = match DetectorHandle::attach(
            detectors,
            source.as_ref(),
            landmark_count,
            on_failure,
        ) {
            Ok(detector) => detector,
            Err(err) => {
                source.release();
                return Err(err);
            }
        };

        Ok(Self {
            id,
            source,
            detector,
            active: true,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn set_result_handler(&self, handler: Option<Arc<dyn ResultHandler>>) {
        if self.active {
            self.detector.set_result_handler(handler);
        }
    }

    /// Detector first, then the frame source. Idempotent.
    pub fn release(&mut self) {
        if !self.active {
            return;
        }
        self.detector.detach();
        self.source.release();
        self.active = false;
        log::info!("capture session {} released", self.id);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyActive(SessionId),
    Pending(SessionId),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    Adopted(SessionId),
    Failed(CaptureError),
    Stale,
}

pub struct SessionManager {
    provider: Arc<dyn FrameSourceProvider>,
    detectors: Arc<dyn DetectorFactory>,
    landmark_count: usize,
    events: Sender<Event>,
    active: Option<CaptureSession>,
    in_flight: Option<SessionId>,
    wanted: Option<SessionId>,
    next_id: u64,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn FrameSourceProvider>,
        detectors: Arc<dyn DetectorFactory>,
        landmark_count: usize,
        events: Sender<Event>,
    ) -> Self {
        Self {
            provider,
            detectors,
            landmark_count,
            events,
            active: None,
            in_flight: None,
            wanted: None,
            next_id: 1,
        }
    }

    /// Requests a session. The result of a new acquisition arrives later as
    /// [`Event::Acquired`] and must be passed to [`SessionManager::complete`].
    pub fn start(&mut self) -> StartOutcome {
        if let Some(session) = &self.active {
            return StartOutcome::AlreadyActive(session.id());
        }

        // An abandoned acquisition is still running; take it back rather than
        // opening the device a second time.
        if let Some(id) = self.in_flight {
            self.wanted = Some(id);
            return StartOutcome::Pending(id);
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.in_flight = Some(id);
        self.wanted = Some(id);

        let provider = self.provider.clone();
        let detectors = self.detectors.clone();
        let landmark_count = self.landmark_count;
        let events = self.events.clone();
        log::info!("acquiring capture session {id}");
        thread::spawn(move || {
            let result = CaptureSession::open(
                id,
                provider.as_ref(),
                detectors.as_ref(),
                landmark_count,
                events.clone(),
            );
            // If the controller is gone the session is dropped, which releases it.
            let _ = events.send(Event::Acquired {
                session: id,
                result,
            });
        });

        StartOutcome::Pending(id)
    }

    pub fn complete(
        &mut self,
        id: SessionId,
        result: Result<CaptureSession, CaptureError>,
    ) -> Completion {
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }

        if self.wanted != Some(id) {
            match result {
                Ok(mut session) => {
                    log::warn!("capture session {id} acquired after it was cancelled; releasing");
                    session.release();
                }
                Err(err) => log::debug!("cancelled acquisition {id} failed: {err}"),
            }
            return Completion::Stale;
        }
        self.wanted = None;

        match result {
            Ok(session) => {
                log::info!("capture session {id} active");
                self.active = Some(session);
                Completion::Adopted(id)
            }
            Err(err) => {
                log::error!("capture session {id} failed: {err}");
                Completion::Failed(err)
            }
        }
    }

    /// Releases the active session and abandons any pending acquisition.
    /// Safe to call when nothing is held.
    pub fn stop(&mut self) {
        self.wanted = None;
        if let Some(mut session) = self.active.take() {
            session.release();
        }
    }

    pub fn set_result_handler(&self, handler: Option<Arc<dyn ResultHandler>>) -> bool {
        match &self.active {
            Some(session) => {
                session.set_result_handler(handler);
                true
            }
            None => false,
        }
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(CaptureSession::id)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    #[cfg(test)]
    pub fn is_acquiring(&self) -> bool {
        self.wanted.is_some()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}
