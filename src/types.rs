use std::{fmt, time::Instant};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    #[allow(dead_code)]
    pub timestamp: Instant,
}

/// A normalized hand point. `x`/`y` are in `[0, 1]` image space, `z` is depth
/// relative to the wrist as reported by the detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One hand's ordered landmark set, already mirrored into the front-facing
/// view (`x' = 1 - x`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkFrame(Vec<Landmark>);

impl LandmarkFrame {
    /// Builds a frame from raw sensor-space points, flipping x so the
    /// coordinates match the mirrored preview.
    pub fn from_sensor(points: &[[f32; 3]]) -> Self {
        Self(
            points
                .iter()
                .map(|&[x, y, z]| Landmark { x: 1.0 - x, y, z })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn points(&self) -> &[Landmark] {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Idle,
    LiveMonitoring,
    Recording,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::LiveMonitoring => "live monitoring",
            Mode::Recording => "recording",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reply of the backend's `/predict` endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Prediction {
    pub gesture: Option<String>,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisplayGestureState {
    pub gesture: Option<String>,
    pub confidence: f32,
}

impl DisplayGestureState {
    pub fn apply(&mut self, prediction: Prediction) {
        self.gesture = prediction.gesture;
        self.confidence = prediction.confidence.clamp(0.0, 100.0);
    }

    pub fn reset(&mut self) {
        self.gesture = None;
        self.confidence = 0.0;
    }

    pub fn display_text(&self) -> String {
        match &self.gesture {
            Some(gesture) => format!("{gesture} ({:.1}%)", self.confidence),
            None => "None (0.0%)".to_string(),
        }
    }
}

/// A finalized recording, in the shape `/add_landmarks` expects.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampleBatch {
    pub gesture: String,
    pub landmarks: Vec<LandmarkFrame>,
}
