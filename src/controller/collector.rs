use crate::{
    error::ValidationError,
    types::{LandmarkFrame, SampleBatch},
};

/// A validated `record` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordRequest {
    label: String,
    target: usize,
}

impl RecordRequest {
    pub fn new(label: &str, target: i64) -> Result<Self, ValidationError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(ValidationError::EmptyLabel);
        }
        if target <= 0 {
            return Err(ValidationError::NonPositiveTarget(target));
        }
        let target =
            usize::try_from(target).map_err(|_| ValidationError::NonPositiveTarget(target))?;
        Ok(Self {
            label: label.to_string(),
            target,
        })
    }

    /// Parses operator input for the sample count.
    pub fn parse_target(raw: &str) -> Result<i64, ValidationError> {
        raw.trim()
            .parse()
            .map_err(|_| ValidationError::NonNumericTarget(raw.to_string()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorStatus {
    Collecting { collected: usize, target: usize },
    Completed,
    /// The buffer is frozen or was never started; the frame was dropped.
    Ignored,
}

#[derive(Debug)]
struct SampleBuffer {
    request: RecordRequest,
    collected: Vec<LandmarkFrame>,
}

#[derive(Debug, Default)]
enum BufferState {
    #[default]
    Inactive,
    Collecting(SampleBuffer),
    Completed(SampleBuffer),
}

/// Bounded accumulation of landmark frames for one recording.
#[derive(Debug, Default)]
pub struct SampleCollector {
    state: BufferState,
}

impl SampleCollector {
    pub fn begin(&mut self, request: RecordRequest) {
        let capacity = request.target;
        self.state = BufferState::Collecting(SampleBuffer {
            request,
            collected: Vec::with_capacity(capacity),
        });
    }

    pub fn push(&mut self, frame: LandmarkFrame) -> CollectorStatus {
        let BufferState::Collecting(buffer) = &mut self.state else {
            return CollectorStatus::Ignored;
        };

        buffer.collected.push(frame);
        let collected = buffer.collected.len();
        let target = buffer.request.target;
        if collected < target {
            return CollectorStatus::Collecting { collected, target };
        }

        if let BufferState::Collecting(buffer) = std::mem::take(&mut self.state) {
            self.state = BufferState::Completed(buffer);
        }
        CollectorStatus::Completed
    }

    /// Hands out the finished batch once; the collector is inactive after.
    pub fn take_completed(&mut self) -> Option<SampleBatch> {
        match std::mem::take(&mut self.state) {
            BufferState::Completed(buffer) => Some(SampleBatch {
                gesture: buffer.request.label,
                landmarks: buffer.collected,
            }),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Drops everything collected so far. Safe at any point.
    pub fn cancel(&mut self) -> usize {
        let dropped = match &self.state {
            BufferState::Collecting(buffer) | BufferState::Completed(buffer) => {
                buffer.collected.len()
            }
            BufferState::Inactive => 0,
        };
        self.state = BufferState::Inactive;
        dropped
    }

    pub fn progress(&self) -> Option<(usize, usize)> {
        match &self.state {
            BufferState::Collecting(buffer) | BufferState::Completed(buffer) => {
                Some((buffer.collected.len(), buffer.request.target))
            }
            BufferState::Inactive => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match &self.state {
            BufferState::Collecting(buffer) | BufferState::Completed(buffer) => {
                Some(buffer.request.label())
            }
            BufferState::Inactive => None,
        }
    }
}
