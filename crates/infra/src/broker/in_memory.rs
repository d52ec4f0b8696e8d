use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use imagegate_core::{Clock, SystemClock};

use super::{BrokerError, TaskBroker, TaskMessage};

#[derive(Debug)]
struct Scheduled {
    task: TaskMessage,
    ready_at: DateTime<Utc>,
}

/// FIFO broker for tests/dev. Delayed tasks become visible once the clock
/// passes their `ready_at`.
#[derive(Debug)]
pub struct InMemoryTaskBroker {
    queue: Mutex<VecDeque<Scheduled>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Pop the oldest task whose delay has elapsed.
    pub fn next_ready(&self) -> Option<TaskMessage> {
        let now = self.clock.now();
        let mut queue = self.lock();
        let idx = queue.iter().position(|s| s.ready_at <= now)?;
        queue.remove(idx).map(|s| s.task)
    }

    /// Tasks queued, delayed ones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every queued task in delivery order.
    pub fn pending(&self) -> Vec<TaskMessage> {
        self.lock().iter().map(|s| s.task.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Scheduled>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for InMemoryTaskBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBroker for InMemoryTaskBroker {
    async fn enqueue(&self, task: TaskMessage) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let ready_at = match task.delay {
            Some(delay) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| BrokerError::Rejected(format!("delay out of range: {delay:?}")))?,
            None => now,
        };
        self.lock().push_back(Scheduled { task, ready_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use imagegate_core::{JobId, ManualClock};

    #[tokio::test]
    async fn delayed_tasks_wait_for_clock() {
        let clock = ManualClock::starting_now();
        let broker = InMemoryTaskBroker::with_clock(Arc::new(clock.clone()));
        let (first, second) = (JobId::new(), JobId::new());

        broker
            .enqueue(TaskMessage::process_image(first).delayed(Duration::from_secs(10)))
            .await
            .unwrap();
        broker.enqueue(TaskMessage::process_image(second)).await.unwrap();

        let ready = broker.next_ready().unwrap();
        assert_eq!(ready.process_image_payload().unwrap().job_id, second);
        assert!(broker.next_ready().is_none());
        assert_eq!(broker.len(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(broker.next_ready().unwrap().process_image_payload().unwrap().job_id, first);
        assert!(broker.is_empty());
    }

    #[test]
    fn payload_decoding_rejects_foreign_tasks() {
        let task = TaskMessage {
            name: "other".into(),
            payload: serde_json::json!({"job_id": JobId::new()}),
            delay: None,
        };
        assert!(task.process_image_payload().is_none());

        let malformed = TaskMessage {
            name: crate::broker::PROCESS_IMAGE_TASK.into(),
            payload: serde_json::json!({"job": 1}),
            delay: None,
        };
        assert!(malformed.process_image_payload().is_none());
    }
}
