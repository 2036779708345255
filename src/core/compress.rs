use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::backend::{BackendEvent, BackendRegistry, BackendRequest};
use crate::core::task::{Task, TaskStore};

pub const COMPRESSION_PROMPT: &str = "Summarize this conversation so far in a compact form. \
Include: key decisions made, important facts learned, current state of any ongoing work, \
and anything the user asked you to remember. Be specific but concise. \
This summary will be your only memory of this conversation going forward.";

/// Folds long-running conversations into summaries. After each
/// completed run the policy checks the task's turn counter; past the
/// threshold it asks the task's own backend for a summary and rotates
/// the session. A failed or interrupted summarization is simply
/// deferred to the next completed run.
pub struct CompressionPolicy {
    store: Arc<TaskStore>,
    backends: Arc<BackendRegistry>,
    threshold: u32,
}

impl CompressionPolicy {
    pub fn new(store: Arc<TaskStore>, backends: Arc<BackendRegistry>, threshold: u32) -> Self {
        Self {
            store,
            backends,
            threshold,
        }
    }

    /// Called by the run controller after every completed run, while
    /// the task's run slot is still held.
    pub async fn after_run_completed(&self, task_id: &str, interrupt: &CancellationToken) {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task = task_id, error = %e, "compression check failed to load task");
                return;
            }
        };
        if self.threshold == 0 || task.turn_count < self.threshold || task.session.is_none() {
            return;
        }

        match self.summarize(&task, interrupt).await {
            Ok(summary) => {
                if let Err(e) = self.store.rotate_session(task_id, &summary).await {
                    warn!(task = task_id, error = %e, "failed to rotate session");
                    return;
                }
                info!(
                    task = task_id,
                    turns = task.turn_count,
                    "compressed conversation into summary"
                );
            }
            Err(e) => {
                // Deferred, not fatal: the session stays live and the
                // next completed run tries again.
                debug!(task = task_id, error = %e, "summarization deferred");
            }
        }
    }

    /// Operator-initiated compression, regardless of the threshold.
    /// Returns the summary, or None when there is no session to fold.
    pub async fn compress_now(&self, task_id: &str) -> Result<Option<String>> {
        let task = self.store.get(task_id).await?;
        if task.session.is_none() {
            return Ok(None);
        }
        let summary = self
            .summarize(&task, &CancellationToken::new())
            .await
            .context("summarization failed")?;
        self.store.rotate_session(task_id, &summary).await?;
        Ok(Some(summary))
    }

    async fn summarize(&self, task: &Task, interrupt: &CancellationToken) -> Result<String> {
        let backend = self.backends.get(task.provider)?;
        let (tx, mut rx) = mpsc::channel(64);
        let req = BackendRequest {
            session: task.session.clone(),
            prompt: COMPRESSION_PROMPT.to_string(),
            system_prompt: "You are a careful note-taker.".to_string(),
            // Summarization is a single plain-text turn.
            tool_permissions: Vec::new(),
        };

        let cancel = interrupt.child_token();
        let run = backend.run(req, tx, cancel);
        tokio::pin!(run);

        let mut summary = None;
        loop {
            tokio::select! {
                res = &mut run => {
                    res?;
                    break;
                }
                ev = rx.recv() => match ev {
                    Some(BackendEvent::Completed { final_text, .. }) => {
                        summary = Some(final_text);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        // Drain anything still buffered after the backend returned.
        while let Ok(ev) = rx.try_recv() {
            if let BackendEvent::Completed { final_text, .. } = ev {
                summary = Some(final_text);
            }
        }

        summary
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("backend produced an empty summary"))
    }
}
