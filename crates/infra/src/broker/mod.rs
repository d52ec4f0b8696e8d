//! Task broker the pipeline hands accepted jobs to.

mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use imagegate_core::JobId;

pub use in_memory::InMemoryTaskBroker;

/// Task name workers listen on for image jobs.
pub const PROCESS_IMAGE_TASK: &str = "process_image";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub name: String,
    pub payload: serde_json::Value,
    /// Earliest delivery, relative to enqueue time.
    #[serde(default)]
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessImagePayload {
    pub job_id: JobId,
}

impl TaskMessage {
    pub fn process_image(job_id: JobId) -> Self {
        Self {
            name: PROCESS_IMAGE_TASK.to_string(),
            payload: serde_json::json!({ "job_id": job_id }),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Decode a `process_image` payload; `None` for other tasks or a
    /// malformed body.
    pub fn process_image_payload(&self) -> Option<ProcessImagePayload> {
        if self.name != PROCESS_IMAGE_TASK {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("task rejected: {0}")]
    Rejected(String),
}

/// Fire-and-forget task submission. Delivery after a successful enqueue is
/// the broker's responsibility.
#[async_trait]
pub trait TaskBroker: Send + Sync + core::fmt::Debug {
    async fn enqueue(&self, task: TaskMessage) -> Result<(), BrokerError>;
}
