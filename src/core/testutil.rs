use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::backend::{
    BackendEvent, BackendRegistry, BackendRequest, ModelBackend, Provider, SessionHandle,
};
use crate::core::error::RunError;

/// One step of a scripted backend run.
#[derive(Clone)]
pub enum Step {
    Emit(BackendEvent),
    Delay(Duration),
    /// Block until cancelled (or forever, if the script ignores
    /// cancellation).
    Hang,
    Fail(RunError),
    Complete { final_text: String, session: String },
}

/// Backend that replays a fixed script, for exercising the controller
/// without a network.
pub struct ScriptedBackend {
    provider: Provider,
    script: Vec<Step>,
    /// When false the backend pretends not to see cancellation.
    honor_cancel: bool,
    pub runs_started: std::sync::atomic::AtomicU32,
    /// High-water mark of runs executing at the same time.
    pub max_concurrent: std::sync::atomic::AtomicU32,
    concurrent: std::sync::atomic::AtomicU32,
    /// Session handle of each request, in arrival order.
    pub seen_sessions: std::sync::Mutex<Vec<Option<String>>>,
}

/// Decrements the in-flight gauge even when the run future is dropped
/// mid-await (the controller aborts unresponsive backends).
struct InFlight<'a>(&'a ScriptedBackend);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0
            .concurrent
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            provider: Provider::OpenAi,
            script,
            honor_cancel: true,
            runs_started: std::sync::atomic::AtomicU32::new(0),
            max_concurrent: std::sync::atomic::AtomicU32::new(0),
            concurrent: std::sync::atomic::AtomicU32::new(0),
            seen_sessions: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    /// Shorthand for a backend that streams a couple of deltas and
    /// completes.
    pub fn completing(text: &str) -> Self {
        Self::new(vec![
            Step::Emit(BackendEvent::Thinking),
            Step::Emit(BackendEvent::TextDelta {
                text: text.to_string(),
            }),
            Step::Complete {
                final_text: text.to_string(),
                session: "scripted-session".to_string(),
            },
        ])
    }

    pub fn failing(err: RunError) -> Self {
        Self::new(vec![Step::Fail(err)])
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn run(
        &self,
        req: BackendRequest,
        tx: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RunError> {
        use std::sync::atomic::Ordering::SeqCst;
        self.runs_started.fetch_add(1, SeqCst);
        self.seen_sessions
            .lock()
            .unwrap()
            .push(req.session.map(|s| s.0));
        let now = self.concurrent.fetch_add(1, SeqCst) + 1;
        self.max_concurrent.fetch_max(now, SeqCst);
        let _in_flight = InFlight(self);
        for step in &self.script {
            if self.honor_cancel && cancel.is_cancelled() {
                return Err(RunError::cancelled());
            }
            match step {
                Step::Emit(ev) => {
                    let _ = tx.send(ev.clone()).await;
                }
                Step::Delay(d) => {
                    if self.honor_cancel {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(RunError::cancelled()),
                            _ = tokio::time::sleep(*d) => {}
                        }
                    } else {
                        tokio::time::sleep(*d).await;
                    }
                }
                Step::Hang => {
                    if self.honor_cancel {
                        cancel.cancelled().await;
                        return Err(RunError::cancelled());
                    }
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Step::Fail(e) => return Err(e.clone()),
                Step::Complete {
                    final_text,
                    session,
                } => {
                    let _ = tx
                        .send(BackendEvent::Completed {
                            final_text: final_text.clone(),
                            session: SessionHandle(session.clone()),
                        })
                        .await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Collects messages a scheduler or projector tried to deliver.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().await.clone()
    }
}

pub fn registry_with(backend: Arc<dyn ModelBackend>) -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(backend);
    Arc::new(registry)
}
