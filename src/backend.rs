//! REST client for the gesture backend.

use std::{collections::BTreeMap, time::Duration};

use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    error::BackendError,
    types::{LandmarkFrame, Prediction, SampleBatch},
};

/// `{status, message}` reply used by the mutating endpoints.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct StatusReply {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusReply {
    fn into_result(self, endpoint: &str) -> Result<StatusReply, BackendError> {
        if self.status == "error" {
            Err(BackendError::Rejected {
                endpoint: endpoint.to_string(),
                message: self.message.unwrap_or_else(|| "no reason given".to_string()),
            })
        } else {
            Ok(self)
        }
    }

    fn summary(&self, fallback: &str) -> String {
        self.message
            .clone()
            .or_else(|| (!self.status.is_empty()).then(|| self.status.clone()))
            .unwrap_or_else(|| fallback.to_string())
    }
}

pub trait Backend: Send + Sync {
    fn predict(&self, landmarks: &LandmarkFrame) -> Result<Prediction, BackendError>;
    fn add_landmarks(&self, batch: &SampleBatch) -> Result<(), BackendError>;
    fn gestures(&self) -> Result<Vec<String>, BackendError>;
    fn actions(&self) -> Result<BTreeMap<String, String>, BackendError>;
    fn update_action(&self, gesture: &str, action: &str) -> Result<(), BackendError>;
    fn remove_mapping(&self, gesture: &str) -> Result<StatusReply, BackendError>;
    fn delete_gesture(&self, gesture: &str) -> Result<StatusReply, BackendError>;
    fn start_system(&self) -> Result<StatusReply, BackendError>;
    fn stop_system(&self) -> Result<StatusReply, BackendError>;
    fn retrain(&self) -> Result<(), BackendError>;
    fn set_confidence(&self, threshold: f32) -> Result<(), BackendError>;
    fn current_gesture(&self) -> Result<Prediction, BackendError>;
}

pub struct HttpBackend {
    base_url: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, BackendError> {
        let response = self
            .client
            .get(self.url(endpoint))
            .send()
            .map_err(|err| transport(endpoint, err))?;
        decode(endpoint, checked(endpoint, response)?)
    }

    fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> Result<Response, BackendError> {
        let response = self
            .client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .map_err(|err| transport(endpoint, err))?;
        checked(endpoint, response)
    }

    fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        decode(endpoint, self.post(endpoint, body)?)
    }
}

fn transport(endpoint: &str, err: reqwest::Error) -> BackendError {
    BackendError::Transport {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

fn checked(endpoint: &str, response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BackendError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        })
    }
}

fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, BackendError> {
    response.json().map_err(|err| BackendError::Decode {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    })
}

impl Backend for HttpBackend {
    fn predict(&self, landmarks: &LandmarkFrame) -> Result<Prediction, BackendError> {
        self.post_json("/predict", &json!({ "landmarks": landmarks }))
    }

    fn add_landmarks(&self, batch: &SampleBatch) -> Result<(), BackendError> {
        self.post("/add_landmarks", batch).map(drop)
    }

    fn gestures(&self) -> Result<Vec<String>, BackendError> {
        self.get("/gestures")
    }

    fn actions(&self) -> Result<BTreeMap<String, String>, BackendError> {
        self.get("/actions")
    }

    fn update_action(&self, gesture: &str, action: &str) -> Result<(), BackendError> {
        self.post(
            "/update_action",
            &json!({ "gesture": gesture, "action": action }),
        )
        .map(drop)
    }

    fn remove_mapping(&self, gesture: &str) -> Result<StatusReply, BackendError> {
        self.post_json::<_, StatusReply>("/remove_mapping", &json!({ "gesture": gesture }))?
            .into_result("/remove_mapping")
    }

    fn delete_gesture(&self, gesture: &str) -> Result<StatusReply, BackendError> {
        self.post_json::<_, StatusReply>("/delete_gesture", &json!({ "gesture": gesture }))?
            .into_result("/delete_gesture")
    }

    fn start_system(&self) -> Result<StatusReply, BackendError> {
        self.get("/start")
    }

    fn stop_system(&self) -> Result<StatusReply, BackendError> {
        self.get("/stop")
    }

    fn retrain(&self) -> Result<(), BackendError> {
        self.post("/retrain", &json!({})).map(drop)
    }

    fn set_confidence(&self, threshold: f32) -> Result<(), BackendError> {
        self.post("/settings/confidence", &json!({ "threshold": threshold }))
            .map(drop)
    }

    fn current_gesture(&self) -> Result<Prediction, BackendError> {
        self.get("/gesture")
    }
}

/// Backend calls that only read or edit backend data and never touch the
/// capture state.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendRequest {
    ListGestures,
    ListMappings,
    MapAction { gesture: String, action: String },
    RemoveMapping { gesture: String },
    DeleteGesture { gesture: String },
    Retrain,
    SetConfidence(f32),
    SystemStart,
    SystemStop,
    CurrentGesture,
}

impl BackendRequest {
    pub fn name(&self) -> &'static str {
        match self {
            BackendRequest::ListGestures => "gestures",
            BackendRequest::ListMappings => "mappings",
            BackendRequest::MapAction { .. } => "map",
            BackendRequest::RemoveMapping { .. } => "unmap",
            BackendRequest::DeleteGesture { .. } => "delete",
            BackendRequest::Retrain => "retrain",
            BackendRequest::SetConfidence(_) => "threshold",
            BackendRequest::SystemStart => "system start",
            BackendRequest::SystemStop => "system stop",
            BackendRequest::CurrentGesture => "backend gesture",
        }
    }

    /// Runs the request and renders the reply as an operator message.
    pub fn execute(&self, backend: &dyn Backend) -> Result<String, BackendError> {
        match self {
            BackendRequest::ListGestures => {
                let gestures = backend.gestures()?;
                Ok(if gestures.is_empty() {
                    "No gestures recorded".to_string()
                } else {
                    format!("Gestures: {}", gestures.join(", "))
                })
            }
            BackendRequest::ListMappings => {
                let actions = backend.actions()?;
                if actions.is_empty() {
                    return Ok("No mappings".to_string());
                }
                let lines: Vec<String> = actions
                    .iter()
                    .map(|(gesture, action)| format!("{gesture} → {action}"))
                    .collect();
                Ok(format!("Mappings:\n  {}", lines.join("\n  ")))
            }
            BackendRequest::MapAction { gesture, action } => {
                backend.update_action(gesture, action)?;
                Ok(format!("Mapping updated: {gesture} → {action}"))
            }
            BackendRequest::RemoveMapping { gesture } => Ok(backend
                .remove_mapping(gesture)?
                .summary(&format!("Mapping for '{gesture}' removed"))),
            BackendRequest::DeleteGesture { gesture } => Ok(backend
                .delete_gesture(gesture)?
                .summary(&format!("Gesture '{gesture}' deleted"))),
            BackendRequest::Retrain => {
                backend.retrain()?;
                Ok("Model retrained".to_string())
            }
            BackendRequest::SetConfidence(threshold) => {
                backend.set_confidence(*threshold)?;
                Ok(format!("Threshold updated to {threshold}"))
            }
            BackendRequest::SystemStart => {
                Ok(backend.start_system()?.summary("System started"))
            }
            BackendRequest::SystemStop => Ok(backend.stop_system()?.summary("System stopped")),
            BackendRequest::CurrentGesture => {
                let prediction = backend.current_gesture()?;
                Ok(format!(
                    "Backend gesture: {} ({:.1}%)",
                    prediction.gesture.as_deref().unwrap_or("None"),
                    prediction.confidence
                ))
            }
        }
    }
}
