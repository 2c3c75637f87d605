//! Remote task collaborators: submission, response join and a local delegate

use crate::core::error::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A task handed to a delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_type: String,
    pub parameters: Value,
    #[serde(default)]
    pub selectors: Vec<String>,
    pub account_id: String,
    pub timeout_secs: u64,
}

impl TaskRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Status reported by a delegate for a finished task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandExecutionStatus {
    Success,
    Failure,
    Running,
    Queued,
    Skipped,
}

impl std::fmt::Display for CommandExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandExecutionStatus::Success => "SUCCESS",
            CommandExecutionStatus::Failure => "FAILURE",
            CommandExecutionStatus::Running => "RUNNING",
            CommandExecutionStatus::Queued => "QUEUED",
            CommandExecutionStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Response of an artifact fetch task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactTaskResponse {
    pub command_execution_status: CommandExecutionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifact_delegate_responses: Vec<Value>,
}

impl ArtifactTaskResponse {
    pub fn success(details: Value) -> Self {
        Self {
            command_execution_status: CommandExecutionStatus::Success,
            error_message: None,
            artifact_delegate_responses: vec![details],
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            command_execution_status: CommandExecutionStatus::Failure,
            error_message: Some(message.into()),
            artifact_delegate_responses: Vec::new(),
        }
    }
}

/// One reply delivered by the response join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResponseData {
    ArtifactTask(ArtifactTaskResponse),
    /// The delegate could not run the task at all
    #[serde(rename_all = "camelCase")]
    ErrorNotify { error_message: String },
}

/// Fire-and-forget task submission
#[async_trait]
pub trait RemoteTaskDispatcher: Send + Sync {
    /// Submit a task and return its correlation id
    async fn submit_async(&self, request: TaskRequest) -> Result<String, DispatchError>;
}

/// Waits until every correlation id has a reply
#[async_trait]
pub trait TaskResponseJoin: Send + Sync {
    async fn await_all(&self, task_ids: &[String]) -> Result<BTreeMap<String, ResponseData>, DispatchError>;
}

/// Handler that produces the reply for a task
pub type TaskHandler = Arc<dyn Fn(&TaskRequest) -> ResponseData + Send + Sync>;

struct PendingTask {
    receiver: oneshot::Receiver<ResponseData>,
    timeout: Duration,
}

/// In-process delegate. Each submitted task runs its handler on the blocking
/// pool, and [`TaskResponseJoin::await_all`] waits for the replies side by
/// side, each under its own timeout.
pub struct LocalDelegate {
    handler: TaskHandler,
    pending: Mutex<HashMap<String, PendingTask>>,
}

impl LocalDelegate {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&TaskRequest) -> ResponseData + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Delegate that answers every artifact task with its own parameters
    pub fn echo() -> Self {
        Self::new(|request| ResponseData::ArtifactTask(ArtifactTaskResponse::success(request.parameters.clone())))
    }
}

#[async_trait]
impl RemoteTaskDispatcher for LocalDelegate {
    async fn submit_async(&self, request: TaskRequest) -> Result<String, DispatchError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        let handler = self.handler.clone();
        let timeout = request.timeout();

        debug!("Submitting {} task {}", request.task_type, task_id);
        self.pending
            .lock()
            .await
            .insert(task_id.clone(), PendingTask { receiver, timeout });

        tokio::task::spawn_blocking(move || {
            let response = handler(&request);
            // The join may have given up already
            let _ = sender.send(response);
        });

        Ok(task_id)
    }
}

#[async_trait]
impl TaskResponseJoin for LocalDelegate {
    async fn await_all(&self, task_ids: &[String]) -> Result<BTreeMap<String, ResponseData>, DispatchError> {
        let mut replies = JoinSet::new();
        {
            let mut pending = self.pending.lock().await;
            if let Some(unknown) = task_ids.iter().find(|id| !pending.contains_key(id.as_str())) {
                return Err(DispatchError::UnknownTask(unknown.clone()));
            }
            for task_id in task_ids {
                let Some(PendingTask { receiver, timeout }) = pending.remove(task_id) else {
                    continue;
                };
                let task_id = task_id.clone();
                replies.spawn(async move {
                    let reply = tokio::time::timeout(timeout, receiver).await;
                    (task_id, timeout, reply)
                });
            }
        }

        let mut responses = BTreeMap::new();
        while let Some(joined) = replies.join_next().await {
            let (task_id, timeout, reply) = joined?;
            let response = match reply {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(DispatchError::Dropped(task_id)),
                Err(_) => {
                    warn!("Task {} timed out after {}s", task_id, timeout.as_secs());
                    ResponseData::ErrorNotify {
                        error_message: format!("Task timed out after {} seconds", timeout.as_secs()),
                    }
                }
            };
            responses.insert(task_id, response);
        }

        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(task_type: &str) -> TaskRequest {
        TaskRequest {
            task_type: task_type.to_string(),
            parameters: json!({"imagePath": "nginx"}),
            selectors: vec![],
            account_id: "acc".to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_local_delegate_joins_all_replies() {
        let delegate = LocalDelegate::echo();
        let first = delegate.submit_async(request("DOCKER_ARTIFACT_TASK_NG")).await.unwrap();
        let second = delegate.submit_async(request("ECR_ARTIFACT_TASK_NG")).await.unwrap();

        let responses = delegate.await_all(&[first.clone(), second.clone()]).await.unwrap();

        assert_eq!(responses.len(), 2);
        match &responses[&first] {
            ResponseData::ArtifactTask(r) => {
                assert_eq!(r.command_execution_status, CommandExecutionStatus::Success);
                assert_eq!(r.artifact_delegate_responses[0]["imagePath"], "nginx");
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_task_id_is_an_error() {
        let delegate = LocalDelegate::echo();
        let err = delegate.await_all(&["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTask(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_unknown_task_id_leaves_others_pending() {
        let delegate = LocalDelegate::echo();
        let known = delegate.submit_async(request("GCR_ARTIFACT_TASK_NG")).await.unwrap();

        let err = delegate
            .await_all(&[known.clone(), "nope".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTask(id) if id == "nope"));

        let responses = delegate.await_all(&[known.clone()]).await.unwrap();
        assert!(responses.contains_key(&known));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeouts_run_side_by_side() {
        let delegate = LocalDelegate::new(|_| {
            std::thread::sleep(Duration::from_millis(1500));
            ResponseData::ArtifactTask(ArtifactTaskResponse::success(json!({})))
        });
        let mut slow = request("DOCKER_ARTIFACT_TASK_NG");
        slow.timeout_secs = 1;
        let first = delegate.submit_async(slow.clone()).await.unwrap();
        let second = delegate.submit_async(slow).await.unwrap();

        let started = std::time::Instant::now();
        let responses = delegate.await_all(&[first.clone(), second.clone()]).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1800));
        for id in [&first, &second] {
            match &responses[id] {
                ResponseData::ErrorNotify { error_message } => {
                    assert_eq!(error_message, "Task timed out after 1 seconds")
                }
                other => panic!("unexpected response {:?}", other),
            }
        }
    }

    #[test]
    fn test_response_data_serialization() {
        let data = ResponseData::ErrorNotify {
            error_message: "no delegates".to_string(),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "errorNotify");
        assert_eq!(json["errorMessage"], "no delegates");
    }
}
