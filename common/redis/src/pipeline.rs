use std::sync::Arc;

use metrics::{counter, histogram};
use tracing::warn;

use crate::cmd::{Cmd, Pipeline};
use crate::codec::Reply;
use crate::connection::ConnectionManager;
use crate::metrics_consts::{PIPELINE_SIZE_HISTOGRAM, REQUEST_RETRIES_COUNTER};
use crate::{CustomRedisError, RetryMethod};

/// Runs commands over a [`ConnectionManager`], one request/response cycle at a time.
///
/// Replies are matched to commands purely by arrival order: reply `i` belongs to command `i`.
#[derive(Clone)]
pub struct PipelineEngine {
    connection: Arc<ConnectionManager>,
}

impl PipelineEngine {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Send one command and return its reply. An error reply becomes `CustomRedisError::Server`.
    pub async fn execute(&self, cmd: &Cmd) -> Result<Reply, CustomRedisError> {
        let mut replies = self.execute_pipeline(std::slice::from_ref(cmd)).await?;
        match replies.pop() {
            Some(reply) => reply.into_result(),
            None => Err(CustomRedisError::connection_lost("missing reply")),
        }
    }

    /// Send every command in a single write and collect exactly one reply per command.
    ///
    /// Per-command error replies are returned in place as [`Reply::Error`] so that one rejected
    /// command does not hide the results of the others. A transport failure triggers a
    /// reconnect and exactly one retry of the whole batch.
    pub async fn execute_pipeline(&self, cmds: &[Cmd]) -> Result<Vec<Reply>, CustomRedisError> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        histogram!(PIPELINE_SIZE_HISTOGRAM).record(cmds.len() as f64);

        let mut guard = self.connection.lock().await;
        guard.ensure_ready().await?;

        match guard.round_trip(cmds).await {
            Ok(replies) => Ok(replies),
            Err(e) if e.retry_method() == RetryMethod::Reconnect => {
                warn!(
                    error = %e,
                    commands = cmds.len(),
                    first_command = %cmds[0].name(),
                    "Redis request failed, reconnecting and retrying once"
                );
                counter!(REQUEST_RETRIES_COUNTER).increment(1);
                guard.ensure_ready().await?;
                guard.round_trip(cmds).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn query(&self, pipeline: &Pipeline) -> Result<Vec<Reply>, CustomRedisError> {
        self.execute_pipeline(pipeline.commands()).await
    }
}
