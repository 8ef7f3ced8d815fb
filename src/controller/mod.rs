//! Mode controller: decides who consumes detector results and what happens
//! to the camera on every transition.
//!
//! Everything here runs on one thread. Commands, acquisition results,
//! detector results and backend replies all arrive as [`Event`]s and are
//! applied one at a time, so no state in this module needs locking. Async
//! completions carry the session and handler epoch they were started under
//! and are dropped when either no longer matches.

pub mod collector;
pub mod dispatcher;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use self::{
    collector::{CollectorStatus, RecordRequest, SampleCollector},
    dispatcher::PredictionDispatcher,
};
use crate::{
    backend::{Backend, BackendRequest},
    error::{BackendError, CaptureError, ConsoleError},
    pipeline::{
        detector::ResultHandler,
        session::{CaptureSession, Completion, SessionId, SessionManager, StartOutcome},
    },
    types::{DisplayGestureState, LandmarkFrame, Mode, Prediction, SampleBatch},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Bumped every time the result handler is replaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Epoch(u64);

impl Epoch {
    fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Monitor,
    Record,
}

/// Identifies the handler installation a detector result was delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerTag {
    pub session: SessionId,
    pub epoch: Epoch,
    pub route: Route,
}

struct ForwardingHandler {
    tag: HandlerTag,
    events: Sender<Event>,
}

impl ResultHandler for ForwardingHandler {
    fn on_result(&self, landmarks: Option<LandmarkFrame>) {
        let _ = self.events.send(Event::Detection {
            tag: self.tag,
            landmarks,
        });
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Start,
    Pause,
    Stop,
    Record { label: String, target: i64 },
    CancelRecord,
    Resubmit,
    Status,
    Backend(BackendRequest),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::Record { .. } => "record",
            Command::CancelRecord => "cancel",
            Command::Resubmit => "resubmit",
            Command::Status => "status",
            Command::Backend(request) => request.name(),
        }
    }
}

pub enum Event {
    Command(Command),
    Acquired {
        session: SessionId,
        result: Result<CaptureSession, CaptureError>,
    },
    Detection {
        tag: HandlerTag,
        landmarks: Option<LandmarkFrame>,
    },
    Prediction {
        tag: HandlerTag,
        result: Result<Prediction, BackendError>,
    },
    Submitted {
        batch: SampleBatch,
        result: Result<(), BackendError>,
    },
    BackendReply {
        request: &'static str,
        result: Result<String, BackendError>,
    },
    /// The session's detector gave up; the session is no longer usable.
    DetectorFailed {
        session: SessionId,
        error: CaptureError,
    },
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusLine {
    pub level: StatusLevel,
    pub text: String,
}

/// What the console renders.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Status(StatusLine),
    Mode(Mode),
    Gesture(DisplayGestureState),
    Progress {
        label: String,
        collected: usize,
        target: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Done,
    /// Completion will be reported through [`Update`]s.
    Pending,
}

#[derive(Clone, Copy, Debug)]
pub struct SubmitPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

enum Entry {
    Monitor,
    Record(RecordRequest),
}

enum Phase {
    Idle,
    /// Waiting for the camera. Only ever entered from Idle.
    Transitioning {
        session: SessionId,
        entry: Entry,
    },
    LiveMonitoring,
    Recording {
        resume: Mode,
    },
}

impl Phase {
    fn mode(&self) -> Mode {
        match self {
            Phase::Idle | Phase::Transitioning { .. } => Mode::Idle,
            Phase::LiveMonitoring => Mode::LiveMonitoring,
            Phase::Recording { .. } => Mode::Recording,
        }
    }
}

pub struct ModeController {
    sessions: SessionManager,
    phase: Phase,
    epoch: Epoch,
    collector: SampleCollector,
    dispatcher: PredictionDispatcher,
    display: DisplayGestureState,
    backend: Arc<dyn Backend>,
    submit_policy: SubmitPolicy,
    submissions_in_flight: usize,
    unsent: Vec<SampleBatch>,
    status: Option<StatusLine>,
    events: Sender<Event>,
    updates: Sender<Update>,
}

impl ModeController {
    pub fn new(
        sessions: SessionManager,
        backend: Arc<dyn Backend>,
        submit_policy: SubmitPolicy,
        events: Sender<Event>,
        updates: Sender<Update>,
    ) -> Self {
        Self {
            sessions,
            phase: Phase::Idle,
            epoch: Epoch::default(),
            collector: SampleCollector::default(),
            dispatcher: PredictionDispatcher::new(backend.clone(), events.clone()),
            display: DisplayGestureState::default(),
            backend,
            submit_policy,
            submissions_in_flight: 0,
            unsent: Vec::new(),
            status: None,
            events,
            updates,
        }
    }

    pub fn run(mut self, events: Receiver<Event>) {
        while let Ok(event) = events.recv() {
            if let Event::Shutdown = event {
                break;
            }
            self.handle_event(event);
        }
        self.shutdown(&events);
    }

    pub fn mode(&self) -> Mode {
        self.phase.mode()
    }

    #[cfg(test)]
    pub fn is_transitioning(&self) -> bool {
        matches!(self.phase, Phase::Transitioning { .. })
    }

    #[cfg(test)]
    pub fn display(&self) -> &DisplayGestureState {
        &self.display
    }

    #[cfg(test)]
    pub fn status(&self) -> Option<&StatusLine> {
        self.status.as_ref()
    }

    #[cfg(test)]
    pub fn unsent(&self) -> &[SampleBatch] {
        &self.unsent
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Command(command) => {
                let name = command.name();
                if let Err(err) = self.handle_command(command) {
                    log::error!("{name} failed: {err}");
                    self.report(StatusLevel::Error, err.to_string());
                }
            }
            Event::Acquired { session, result } => self.on_acquired(session, result),
            Event::Detection { tag, landmarks } => self.on_detection(tag, landmarks),
            Event::Prediction { tag, result } => self.on_prediction(tag, result),
            Event::Submitted { batch, result } => self.on_submitted(batch, result),
            Event::BackendReply { request, result } => match result {
                Ok(message) => self.report(StatusLevel::Info, message),
                Err(err) => {
                    log::error!("{request} failed: {err}");
                    self.report(StatusLevel::Error, err.to_string());
                }
            },
            Event::DetectorFailed { session, error } => self.on_detector_failed(session, error),
            Event::Shutdown => self.sessions.stop(),
        }
    }

    pub fn handle_command(&mut self, command: Command) -> Result<Ack, ConsoleError> {
        match command {
            Command::Start => self.start(),
            Command::Pause => Ok(self.pause()),
            Command::Stop => Ok(self.stop()),
            Command::Record { label, target } => {
                // Validate before any hardware is touched.
                let request = RecordRequest::new(&label, target)?;
                self.record(request)
            }
            Command::CancelRecord => self.cancel_record(),
            Command::Resubmit => self.resubmit(),
            Command::Status => {
                self.report_summary();
                Ok(Ack::Done)
            }
            Command::Backend(request) => {
                self.spawn_backend_request(request);
                Ok(Ack::Pending)
            }
        }
    }

    fn start(&mut self) -> Result<Ack, ConsoleError> {
        match &mut self.phase {
            Phase::Idle => match self.sessions.start() {
                StartOutcome::AlreadyActive(_) => {
                    self.enter_monitoring();
                    Ok(Ack::Done)
                }
                StartOutcome::Pending(session) => {
                    self.phase = Phase::Transitioning {
                        session,
                        entry: Entry::Monitor,
                    };
                    self.report(StatusLevel::Info, "Starting camera…".to_string());
                    Ok(Ack::Pending)
                }
            },
            Phase::Transitioning {
                entry: Entry::Monitor,
                ..
            } => Ok(Ack::Pending),
            Phase::Transitioning { .. } => Err(ConsoleError::InvalidCommand {
                command: "start",
                mode: Mode::Idle,
            }),
            Phase::LiveMonitoring => Ok(Ack::Done),
            Phase::Recording { resume } => {
                *resume = Mode::LiveMonitoring;
                self.report(
                    StatusLevel::Info,
                    "Live monitoring resumes after recording".to_string(),
                );
                Ok(Ack::Done)
            }
        }
    }

    /// Leaves monitoring but keeps the camera warm.
    fn pause(&mut self) -> Ack {
        match &mut self.phase {
            Phase::Idle => {}
            Phase::Transitioning { .. } => self.abandon_transition("Start cancelled"),
            Phase::LiveMonitoring => {
                self.install_handler(None);
                self.reset_display();
                self.set_phase(Phase::Idle);
                self.report(StatusLevel::Info, "Monitoring paused".to_string());
            }
            Phase::Recording { resume } => {
                *resume = Mode::Idle;
                self.report(
                    StatusLevel::Info,
                    "Monitoring stays off after recording".to_string(),
                );
            }
        }
        Ack::Done
    }

    /// Leaves monitoring and releases the camera.
    fn stop(&mut self) -> Ack {
        match &mut self.phase {
            Phase::Idle => self.sessions.stop(),
            Phase::Transitioning { .. } => self.abandon_transition("Start cancelled"),
            Phase::LiveMonitoring => {
                self.install_handler(None);
                self.sessions.stop();
                self.reset_display();
                self.set_phase(Phase::Idle);
                self.report(StatusLevel::Info, "System stopped".to_string());
            }
            Phase::Recording { resume } => {
                *resume = Mode::Idle;
                self.report(
                    StatusLevel::Info,
                    "Camera will be released after recording".to_string(),
                );
            }
        }
        Ack::Done
    }

    fn record(&mut self, request: RecordRequest) -> Result<Ack, ConsoleError> {
        match &self.phase {
            Phase::Idle => match self.sessions.start() {
                StartOutcome::AlreadyActive(_) => {
                    self.enter_recording(request, Mode::Idle);
                    Ok(Ack::Done)
                }
                StartOutcome::Pending(session) => {
                    self.reset_display();
                    self.phase = Phase::Transitioning {
                        session,
                        entry: Entry::Record(request),
                    };
                    self.report(StatusLevel::Info, "Starting camera…".to_string());
                    Ok(Ack::Pending)
                }
            },
            // The camera is already running: swap the handler, nothing else.
            Phase::LiveMonitoring => {
                self.enter_recording(request, Mode::LiveMonitoring);
                Ok(Ack::Done)
            }
            Phase::Transitioning { .. } | Phase::Recording { .. } => {
                Err(ConsoleError::InvalidCommand {
                    command: "record",
                    mode: self.mode(),
                })
            }
        }
    }

    fn cancel_record(&mut self) -> Result<Ack, ConsoleError> {
        match &self.phase {
            Phase::Recording { resume } => {
                let resume = *resume;
                let dropped = self.collector.cancel();
                log::info!("recording cancelled, {dropped} samples discarded");
                self.leave_recording(resume);
                self.report(StatusLevel::Info, "Recording stopped".to_string());
                Ok(Ack::Done)
            }
            Phase::Transitioning {
                entry: Entry::Record(_),
                ..
            } => {
                self.abandon_transition("Recording stopped");
                Ok(Ack::Done)
            }
            _ => Err(ConsoleError::InvalidCommand {
                command: "cancel",
                mode: self.mode(),
            }),
        }
    }

    fn resubmit(&mut self) -> Result<Ack, ConsoleError> {
        if self.unsent.is_empty() {
            return Err(ConsoleError::NothingToResubmit);
        }
        let batches = std::mem::take(&mut self.unsent);
        self.report(
            StatusLevel::Info,
            format!("Resubmitting {} recording(s)", batches.len()),
        );
        for batch in batches {
            self.submit(batch);
        }
        Ok(Ack::Pending)
    }

    fn abandon_transition(&mut self, message: &str) {
        self.sessions.stop();
        self.set_phase(Phase::Idle);
        self.report(StatusLevel::Info, message.to_string());
    }

    fn on_acquired(&mut self, session: SessionId, result: Result<CaptureSession, CaptureError>) {
        match self.sessions.complete(session, result) {
            Completion::Stale => {}
            Completion::Failed(err) => {
                // Back to the state the transition started from.
                self.set_phase(Phase::Idle);
                self.report(StatusLevel::Error, ConsoleError::from(err).to_string());
            }
            Completion::Adopted(id) => {
                match std::mem::replace(&mut self.phase, Phase::Idle) {
                    Phase::Transitioning {
                        session,
                        entry: Entry::Monitor,
                    } if session == id => self.enter_monitoring(),
                    Phase::Transitioning {
                        session,
                        entry: Entry::Record(request),
                    } if session == id => self.enter_recording(request, Mode::Idle),
                    other => {
                        log::warn!("capture session {id} arrived outside a transition; releasing");
                        self.phase = other;
                        self.sessions.stop();
                    }
                }
            }
        }
    }

    fn enter_monitoring(&mut self) {
        self.install_handler(Some(Route::Monitor));
        self.set_phase(Phase::LiveMonitoring);
        self.report(StatusLevel::Info, "Live monitoring started".to_string());
    }

    fn enter_recording(&mut self, request: RecordRequest, resume: Mode) {
        if resume == Mode::Idle {
            self.reset_display();
        }
        let (label, target) = (request.label().to_string(), request.target());
        self.collector.begin(request);
        self.install_handler(Some(Route::Record));
        self.set_phase(Phase::Recording { resume });
        self.publish(Update::Progress {
            label: label.clone(),
            collected: 0,
            target,
        });
        self.report(
            StatusLevel::Info,
            format!("Recording '{label}': 0/{target}"),
        );
    }

    fn leave_recording(&mut self, resume: Mode) {
        if resume == Mode::LiveMonitoring {
            self.install_handler(Some(Route::Monitor));
            self.set_phase(Phase::LiveMonitoring);
        } else {
            self.install_handler(None);
            self.sessions.stop();
            self.reset_display();
            self.set_phase(Phase::Idle);
        }
    }

    fn on_detection(&mut self, tag: HandlerTag, landmarks: Option<LandmarkFrame>) {
        if !self.is_current(tag) {
            log::debug!("dropping detector result from {:?}", tag.epoch);
            return;
        }

        let monitoring = matches!(self.phase, Phase::LiveMonitoring);
        let recording = matches!(self.phase, Phase::Recording { .. });
        match tag.route {
            Route::Monitor if monitoring => {
                if self.dispatcher.on_frame(&mut self.display, tag, landmarks) {
                    self.publish(Update::Gesture(self.display.clone()));
                }
            }
            Route::Record if recording => {
                let Some(frame) = landmarks else {
                    return;
                };
                match self.collector.push(frame) {
                    CollectorStatus::Collecting { collected, target } => {
                        let label = self.collector.label().unwrap_or_default().to_string();
                        self.publish(Update::Progress {
                            label,
                            collected,
                            target,
                        });
                    }
                    CollectorStatus::Completed => self.complete_recording(),
                    CollectorStatus::Ignored => {}
                }
            }
            route => log::debug!("detector result for {route:?} outside its mode"),
        }
    }

    /// Ends whatever the session was used for. A recording in progress is
    /// discarded since its remaining frames can never arrive.
    fn on_detector_failed(&mut self, session: SessionId, error: CaptureError) {
        if self.sessions.active_id() != Some(session) {
            log::debug!("ignoring detector failure of released session {session}");
            return;
        }
        if let Phase::Recording { .. } = self.phase {
            let dropped = self.collector.cancel();
            log::warn!("recording aborted, {dropped} samples discarded");
        }
        self.install_handler(None);
        self.sessions.stop();
        self.reset_display();
        self.set_phase(Phase::Idle);
        self.report(StatusLevel::Error, ConsoleError::from(error).to_string());
    }

    fn complete_recording(&mut self) {
        let Phase::Recording { resume } = &self.phase else {
            return;
        };
        let resume = *resume;
        let Some(batch) = self.collector.take_completed() else {
            return;
        };

        let collected = batch.landmarks.len();
        self.publish(Update::Progress {
            label: batch.gesture.clone(),
            collected,
            target: collected,
        });
        self.report(
            StatusLevel::Info,
            format!("Captured {collected} samples for '{}', saving", batch.gesture),
        );
        self.submit(batch);
        self.leave_recording(resume);
    }

    fn on_prediction(&mut self, tag: HandlerTag, result: Result<Prediction, BackendError>) {
        if !self.is_current(tag) || !matches!(self.phase, Phase::LiveMonitoring) {
            log::debug!("dropping stale prediction");
            return;
        }
        if self.dispatcher.on_reply(&mut self.display, result) {
            self.publish(Update::Gesture(self.display.clone()));
        }
    }

    fn on_submitted(&mut self, batch: SampleBatch, result: Result<(), BackendError>) {
        self.submissions_in_flight = self.submissions_in_flight.saturating_sub(1);
        match result {
            Ok(()) => {
                log::info!(
                    "saved {} samples for '{}'",
                    batch.landmarks.len(),
                    batch.gesture
                );
                self.report(
                    StatusLevel::Info,
                    format!("Gesture '{}' saved successfully", batch.gesture),
                );
            }
            Err(err) => {
                log::error!("failed to save samples for '{}': {err}", batch.gesture);
                let gesture = batch.gesture.clone();
                self.unsent.push(batch);
                self.report(
                    StatusLevel::Error,
                    format!(
                        "Samples for '{gesture}' were not saved ({err}); {} recording(s) waiting for resubmit",
                        self.unsent.len()
                    ),
                );
            }
        }
    }

    fn submit(&mut self, batch: SampleBatch) {
        self.submissions_in_flight += 1;
        let backend = self.backend.clone();
        let events = self.events.clone();
        let policy = self.submit_policy;
        thread::spawn(move || {
            let mut attempt = 0;
            let result = loop {
                match backend.add_landmarks(&batch) {
                    Ok(()) => break Ok(()),
                    Err(err) if attempt < policy.retries => {
                        attempt += 1;
                        log::warn!("upload of '{}' failed ({err}), retry {attempt}", batch.gesture);
                        thread::sleep(policy.backoff * attempt);
                    }
                    Err(err) => break Err(err),
                }
            };
            let _ = events.send(Event::Submitted { batch, result });
        });
    }

    fn spawn_backend_request(&self, request: BackendRequest) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        thread::spawn(move || {
            let result = request.execute(backend.as_ref());
            let _ = events.send(Event::BackendReply {
                request: request.name(),
                result,
            });
        });
    }

    fn is_current(&self, tag: HandlerTag) -> bool {
        tag.epoch == self.epoch && self.sessions.active_id() == Some(tag.session)
    }

    /// Swaps the detector's result handler. Every call starts a new epoch,
    /// which invalidates results and replies from the previous handler.
    fn install_handler(&mut self, route: Option<Route>) {
        self.epoch = self.epoch.next();
        let handler = match (route, self.sessions.active_id()) {
            (Some(route), Some(session)) => Some(Arc::new(ForwardingHandler {
                tag: HandlerTag {
                    session,
                    epoch: self.epoch,
                    route,
                },
                events: self.events.clone(),
            }) as Arc<dyn ResultHandler>),
            _ => None,
        };
        self.sessions.set_result_handler(handler);
    }

    fn set_phase(&mut self, phase: Phase) {
        let before = self.phase.mode();
        self.phase = phase;
        let after = self.phase.mode();
        if before != after {
            log::info!("mode: {before} -> {after}");
            self.publish(Update::Mode(after));
        }
    }

    fn reset_display(&mut self) {
        if self.display != DisplayGestureState::default() {
            self.display.reset();
            self.publish(Update::Gesture(self.display.clone()));
        }
    }

    fn report_summary(&mut self) {
        let mut text = format!(
            "Mode: {} | camera: {} | Current Gesture: {}",
            self.mode(),
            if self.sessions.is_active() { "on" } else { "off" },
            self.display.display_text()
        );
        if let Some((collected, target)) = self.collector.progress() {
            text.push_str(&format!(" | recording {collected}/{target}"));
        }
        if !self.unsent.is_empty() {
            text.push_str(&format!(" | {} unsent recording(s)", self.unsent.len()));
        }
        self.report(StatusLevel::Info, text);
    }

    /// Replaces the single status line.
    fn report(&mut self, level: StatusLevel, text: String) {
        let line = StatusLine { level, text };
        if self.status.as_ref() == Some(&line) {
            return;
        }
        self.status = Some(line.clone());
        self.publish(Update::Status(line));
    }

    fn publish(&self, update: Update) {
        let _ = self.updates.send(update);
    }

    /// Releases the camera, then waits briefly for uploads still running so
    /// recorded samples are not lost on exit.
    fn shutdown(&mut self, events: &Receiver<Event>) {
        self.install_handler(None);
        self.collector.cancel();
        self.sessions.stop();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.submissions_in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(Event::Submitted { batch, result }) => self.on_submitted(batch, result),
                Ok(Event::Acquired { session, result }) => {
                    self.sessions.complete(session, result);
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !self.unsent.is_empty() || self.submissions_in_flight > 0 {
            log::error!(
                "exiting with {} unsaved recording(s)",
                self.unsent.len() + self.submissions_in_flight
            );
        }
        log::info!("controller stopped");
    }
}
