use std::{sync::Arc, thread};

use crossbeam_channel::Sender;

use super::{Event, HandlerTag};
use crate::{
    backend::Backend,
    error::BackendError,
    types::{DisplayGestureState, LandmarkFrame, Prediction},
};

/// Fire-and-forget `/predict` calls for live monitoring. Requests are not
/// queued or sequenced; whichever reply lands last sets the display.
pub struct PredictionDispatcher {
    backend: Arc<dyn Backend>,
    events: Sender<Event>,
}

impl PredictionDispatcher {
    pub fn new(backend: Arc<dyn Backend>, events: Sender<Event>) -> Self {
        Self { backend, events }
    }

    /// Returns true when the display changed right away (hand absent).
    pub fn on_frame(
        &self,
        display: &mut DisplayGestureState,
        tag: HandlerTag,
        landmarks: Option<LandmarkFrame>,
    ) -> bool {
        let Some(landmarks) = landmarks else {
            let changed = display.gesture.is_some() || display.confidence != 0.0;
            display.reset();
            return changed;
        };

        let backend = self.backend.clone();
        let events = self.events.clone();
        thread::spawn(move || {
            let result = backend.predict(&landmarks);
            let _ = events.send(Event::Prediction { tag, result });
        });
        false
    }

    /// Applies a reply that the controller has already checked for staleness.
    pub fn on_reply(
        &self,
        display: &mut DisplayGestureState,
        result: Result<Prediction, BackendError>,
    ) -> bool {
        match result {
            Ok(prediction) => {
                log::debug!(
                    "prediction: {:?} ({:.1}%)",
                    prediction.gesture,
                    prediction.confidence
                );
                display.apply(prediction);
                true
            }
            Err(err) => {
                log::warn!("prediction failed: {err}");
                false
            }
        }
    }
}
