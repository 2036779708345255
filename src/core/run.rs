use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::backend::{BackendEvent, BackendRegistry, BackendRequest};
use crate::core::compress::CompressionPolicy;
use crate::core::error::{RunError, RunErrorKind, StoreError};
use crate::core::task::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// Progress event delivered to whoever is watching a run. `seq` is
/// strictly increasing within one run.
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub seq: u64,
    pub kind: RunEventKind,
}

#[derive(Debug, Clone)]
pub enum RunEventKind {
    ThinkingStarted,
    ToolCallStarted { tool: String, args_summary: String },
    ToolCallFinished { tool: String, ok: bool },
    MessageDelta { text: String },
    UsageReported {
        input_tokens: u64,
        output_tokens: u64,
        cost_estimate: Option<f64>,
    },
    RunCompleted { final_text: String },
    RunFailed { kind: RunErrorKind, message: String },
    RunCancelled,
}

impl RunEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEventKind::RunCompleted { .. }
                | RunEventKind::RunFailed { .. }
                | RunEventKind::RunCancelled
        )
    }
}

/// Caller's view of an in-flight run: an event stream, a state watch,
/// and a cancel button.
pub struct RunHandle {
    pub run_id: String,
    pub task_id: String,
    pub events: mpsc::Receiver<RunEvent>,
    pub state: watch::Receiver<RunState>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Request cancellation. Safe to call more than once; extra calls
    /// are no-ops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Clone)]
struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Drives runs against backends, enforcing one active run per task.
/// Starting a run on a busy task pre-empts the previous run: it is
/// cancelled and the new run waits for it to wind down before starting.
pub struct RunController {
    store: Arc<TaskStore>,
    backends: Arc<BackendRegistry>,
    compressor: Arc<CompressionPolicy>,
    run_timeout: Duration,
    cancel_grace: Duration,
    tool_permissions: Vec<String>,
    slots: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl RunController {
    pub fn new(
        store: Arc<TaskStore>,
        backends: Arc<BackendRegistry>,
        compressor: Arc<CompressionPolicy>,
        run_timeout: Duration,
        cancel_grace: Duration,
        tool_permissions: Vec<String>,
    ) -> Self {
        Self {
            store,
            backends,
            compressor,
            run_timeout,
            cancel_grace,
            tool_permissions,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start_run(
        &self,
        task_id: &str,
        prompt: String,
        system_prompt: String,
    ) -> Result<RunHandle, StoreError> {
        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(RunState::Pending);

        // Claim the task's slot, pre-empting whoever holds it. The
        // emptiness check and the insert happen under one lock hold,
        // so two racing callers cannot both claim the slot; the loser
        // loops and pre-empts the winner.
        loop {
            let mut slots = self.slots.lock().await;
            let Some(prev) = slots.get(task_id).cloned() else {
                slots.insert(
                    task_id.to_string(),
                    ActiveRun {
                        run_id: run_id.clone(),
                        cancel: cancel.clone(),
                        done: done_rx.clone(),
                    },
                );
                break;
            };
            drop(slots);
            debug!(task = task_id, run = %prev.run_id, "pre-empting active run");
            prev.cancel.cancel();
            let mut done = prev.done.clone();
            let wind_down = self.cancel_grace + Duration::from_secs(1);
            // The watch Ref inside the Ok(Ok(_)) result is not Send,
            // so collapse it to a bool before awaiting the lock.
            let wound_down = matches!(
                tokio::time::timeout(wind_down, done.wait_for(|d| *d)).await,
                Ok(Ok(_))
            );
            // Driver stuck past its own grace bound, or gone
            // without cleanup: evict the slot. The driver's
            // cleanup is id-checked, so it cannot remove a
            // successor's entry later.
            if !wound_down {
                let mut slots = self.slots.lock().await;
                if slots.get(task_id).map(|a| a.run_id.as_str()) == Some(prev.run_id.as_str()) {
                    slots.remove(task_id);
                }
            }
        }

        // Read the task only after the slot is held, so the session
        // snapshot includes the pre-empted run's bookkeeping.
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                let mut slots = self.slots.lock().await;
                if slots.get(task_id).map(|a| a.run_id.as_str()) == Some(run_id.as_str()) {
                    slots.remove(task_id);
                }
                drop(slots);
                let _ = done_tx.send(true);
                return Err(e);
            }
        };

        let driver = RunDriver {
            store: self.store.clone(),
            backends: self.backends.clone(),
            compressor: self.compressor.clone(),
            run_timeout: self.run_timeout,
            cancel_grace: self.cancel_grace,
            task_id: task_id.to_string(),
            run_id: run_id.clone(),
            session: task.session.clone(),
            provider: task.provider,
            prompt,
            system_prompt,
            tool_permissions: self.tool_permissions.clone(),
            cancel: cancel.clone(),
            event_tx,
            state_tx,
            seq: std::sync::atomic::AtomicU64::new(0),
        };
        let slots = self.slots.clone();
        let cleanup_run_id = run_id.clone();
        let cleanup_task_id = task_id.to_string();
        tokio::spawn(async move {
            driver.drive().await;
            // Only clear the slot if it still belongs to this run; a
            // pre-empting run may already have replaced it.
            let mut slots = slots.lock().await;
            if slots.get(&cleanup_task_id).map(|a| a.run_id.as_str())
                == Some(cleanup_run_id.as_str())
            {
                slots.remove(&cleanup_task_id);
            }
            drop(slots);
            let _ = done_tx.send(true);
        });

        Ok(RunHandle {
            run_id,
            task_id: task_id.to_string(),
            events: event_rx,
            state: state_rx,
            cancel,
        })
    }
}

struct RunDriver {
    store: Arc<TaskStore>,
    backends: Arc<BackendRegistry>,
    compressor: Arc<CompressionPolicy>,
    run_timeout: Duration,
    cancel_grace: Duration,
    task_id: String,
    run_id: String,
    session: Option<crate::core::backend::SessionHandle>,
    provider: crate::core::backend::Provider,
    prompt: String,
    system_prompt: String,
    tool_permissions: Vec<String>,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<RunEvent>,
    state_tx: watch::Sender<RunState>,
    seq: std::sync::atomic::AtomicU64,
}

impl RunDriver {
    fn next_seq(&self) -> u64 {
        self.seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1
    }
}

enum DriverOutcome {
    Completed {
        final_text: String,
        session: crate::core::backend::SessionHandle,
    },
    Failed(RunError),
    Cancelled,
}

impl RunDriver {
    async fn drive(self) {
        let outcome = self.stream_backend().await;
        self.finish(outcome).await;
    }

    async fn stream_backend(&self) -> DriverOutcome {
        let backend = match self.backends.get(self.provider) {
            Ok(b) => b,
            Err(e) => return DriverOutcome::Failed(e),
        };

        let (btx, mut brx) = mpsc::channel(64);
        let backend_cancel = self.cancel.child_token();
        let req = BackendRequest {
            session: self.session.clone(),
            prompt: self.prompt.clone(),
            system_prompt: self.system_prompt.clone(),
            tool_permissions: self.tool_permissions.clone(),
        };
        let backend_for_task = backend.clone();
        let task_cancel = backend_cancel.clone();
        let mut backend_task =
            tokio::spawn(async move { backend_for_task.run(req, btx, task_cancel).await });

        let deadline = tokio::time::sleep(self.run_timeout);
        tokio::pin!(deadline);
        let mut streaming = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    backend_cancel.cancel();
                    // Give the backend a moment to stop cleanly, then
                    // abandon it.
                    if tokio::time::timeout(self.cancel_grace, &mut backend_task)
                        .await
                        .is_err()
                    {
                        backend_task.abort();
                    }
                    return DriverOutcome::Cancelled;
                }
                _ = &mut deadline => {
                    backend_cancel.cancel();
                    if tokio::time::timeout(self.cancel_grace, &mut backend_task)
                        .await
                        .is_err()
                    {
                        backend_task.abort();
                    }
                    return DriverOutcome::Failed(RunError::timeout(
                        self.run_timeout.as_secs(),
                    ));
                }
                ev = brx.recv() => match ev {
                    Some(BackendEvent::Completed { final_text, session }) => {
                        return DriverOutcome::Completed { final_text, session };
                    }
                    Some(ev) => {
                        if !streaming {
                            streaming = true;
                            let _ = self.state_tx.send(RunState::Streaming);
                        }
                        let kind = match ev {
                            BackendEvent::Thinking => RunEventKind::ThinkingStarted,
                            BackendEvent::ToolStarted { tool, args_summary } => {
                                RunEventKind::ToolCallStarted { tool, args_summary }
                            }
                            BackendEvent::ToolFinished { tool, ok } => {
                                RunEventKind::ToolCallFinished { tool, ok }
                            }
                            BackendEvent::TextDelta { text } => {
                                RunEventKind::MessageDelta { text }
                            }
                            BackendEvent::Usage {
                                input_tokens,
                                output_tokens,
                                cost_estimate,
                            } => RunEventKind::UsageReported {
                                input_tokens,
                                output_tokens,
                                cost_estimate,
                            },
                            BackendEvent::Completed { .. } => unreachable!(),
                        };
                        let _ = self
                            .event_tx
                            .send(RunEvent {
                                seq: self.next_seq(),
                                kind,
                            })
                            .await;
                    }
                    None => {
                        // Backend hung up without a Completed event.
                        return match backend_task.await {
                            Ok(Err(e)) => {
                                if e.kind == RunErrorKind::Cancelled {
                                    DriverOutcome::Cancelled
                                } else {
                                    DriverOutcome::Failed(e)
                                }
                            }
                            Ok(Ok(())) => DriverOutcome::Failed(RunError::unavailable(
                                "backend stream ended without completing",
                            )),
                            Err(e) => DriverOutcome::Failed(RunError::unavailable(format!(
                                "backend task panicked: {}",
                                e
                            ))),
                        };
                    }
                },
            }
        }
    }

    async fn finish(&self, outcome: DriverOutcome) {
        match outcome {
            DriverOutcome::Completed {
                final_text,
                session,
            } => {
                if let Err(e) = self
                    .store
                    .record_completion(&self.task_id, session, &self.prompt, &final_text)
                    .await
                {
                    error!(task = %self.task_id, error = %e, "failed to persist completed run");
                }
                let _ = self.state_tx.send(RunState::Completed);
                let _ = self
                    .event_tx
                    .send(RunEvent {
                        seq: self.next_seq(),
                        kind: RunEventKind::RunCompleted { final_text },
                    })
                    .await;
                info!(task = %self.task_id, run = %self.run_id, "run completed");

                // Compression happens while this task's slot is still
                // held, so a new run cannot start mid-rotation.
                self.compressor
                    .after_run_completed(&self.task_id, &self.cancel)
                    .await;
            }
            DriverOutcome::Failed(e) => {
                let _ = self.state_tx.send(RunState::Failed);
                let _ = self
                    .event_tx
                    .send(RunEvent {
                        seq: self.next_seq(),
                        kind: RunEventKind::RunFailed {
                            kind: e.kind,
                            message: e.message.clone(),
                        },
                    })
                    .await;
                info!(task = %self.task_id, run = %self.run_id, error = %e, "run failed");
            }
            DriverOutcome::Cancelled => {
                let _ = self.state_tx.send(RunState::Cancelled);
                let _ = self
                    .event_tx
                    .send(RunEvent {
                        seq: self.next_seq(),
                        kind: RunEventKind::RunCancelled,
                    })
                    .await;
                info!(task = %self.task_id, run = %self.run_id, "run cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{Provider, SessionHandle};
    use crate::core::testutil::{ScriptedBackend, Step, registry_with};
    use crate::core::task::Surface;
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<TaskStore>,
        controller: RunController,
        _dir: TempDir,
    }

    fn fixture(backend: ScriptedBackend) -> Fixture {
        fixture_with(backend, Duration::from_secs(10), 1000)
    }

    /// Like `fixture`, but the caller keeps a handle on the backend to
    /// inspect it after the runs.
    fn fixture_shared(backend: Arc<ScriptedBackend>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            TaskStore::open(dir.path().to_path_buf(), Provider::OpenAi).unwrap(),
        );
        let backends = registry_with(backend);
        let compressor = Arc::new(CompressionPolicy::new(
            store.clone(),
            backends.clone(),
            1000,
        ));
        let controller = RunController::new(
            store.clone(),
            backends,
            compressor,
            Duration::from_secs(10),
            Duration::from_millis(200),
            Vec::new(),
        );
        Fixture {
            store,
            controller,
            _dir: dir,
        }
    }

    fn fixture_with(backend: ScriptedBackend, run_timeout: Duration, threshold: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            TaskStore::open(dir.path().to_path_buf(), Provider::OpenAi).unwrap(),
        );
        let backends = registry_with(Arc::new(backend));
        let compressor = Arc::new(CompressionPolicy::new(
            store.clone(),
            backends.clone(),
            threshold,
        ));
        let controller = RunController::new(
            store.clone(),
            backends,
            compressor,
            run_timeout,
            Duration::from_millis(200),
            Vec::new(),
        );
        Fixture {
            store,
            controller,
            _dir: dir,
        }
    }

    async fn collect_terminal(handle: &mut RunHandle) -> RunEventKind {
        while let Some(event) = handle.events.recv().await {
            if event.kind.is_terminal() {
                return event.kind;
            }
        }
        panic!("event stream closed without a terminal event");
    }

    #[tokio::test]
    async fn completed_run_updates_the_task() {
        let f = fixture(ScriptedBackend::completing("all done"));
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "go".into(), "sys".into())
            .await
            .unwrap();
        let terminal = collect_terminal(&mut handle).await;

        match terminal {
            RunEventKind::RunCompleted { final_text } => assert_eq!(final_text, "all done"),
            other => panic!("unexpected terminal event: {:?}", other),
        }

        // Terminal state lands on the watch as well.
        let state = handle
            .state
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap();
        assert_eq!(state, RunState::Completed);

        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 1);
        assert_eq!(task.session, Some(SessionHandle("scripted-session".into())));
        assert_eq!(task.last_response.as_deref(), Some("all done"));
    }

    #[tokio::test]
    async fn event_sequence_is_strictly_increasing() {
        let f = fixture(ScriptedBackend::completing("ok"));
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "go".into(), "sys".into())
            .await
            .unwrap();

        let mut last_seq = 0;
        while let Some(event) = handle.events.recv().await {
            assert!(event.seq > last_seq, "seq went backwards");
            last_seq = event.seq;
            if event.kind.is_terminal() {
                break;
            }
        }
        assert!(last_seq >= 3);
    }

    #[tokio::test]
    async fn failed_run_leaves_the_task_untouched() {
        let f = fixture(ScriptedBackend::failing(RunError::unavailable(
            "connection refused",
        )));
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "go".into(), "sys".into())
            .await
            .unwrap();
        let terminal = collect_terminal(&mut handle).await;

        match terminal {
            RunEventKind::RunFailed { kind, message } => {
                assert_eq!(kind, RunErrorKind::BackendUnavailable);
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }

        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 0);
        assert!(task.session.is_none());
    }

    #[tokio::test]
    async fn cancel_mid_stream_discards_the_run() {
        let f = fixture(ScriptedBackend::new(vec![
            Step::Emit(crate::core::backend::BackendEvent::TextDelta {
                text: "partial".into(),
            }),
            Step::Hang,
        ]));
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "go".into(), "sys".into())
            .await
            .unwrap();

        // Wait for the first delta so cancellation lands mid-stream.
        let first = handle.events.recv().await.unwrap();
        assert!(matches!(first.kind, RunEventKind::MessageDelta { .. }));

        handle.cancel();
        handle.cancel(); // second call is a no-op

        let terminal = collect_terminal(&mut handle).await;
        assert!(matches!(terminal, RunEventKind::RunCancelled));

        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 0);
        assert!(task.last_response.is_none());
    }

    #[tokio::test]
    async fn timeout_fails_the_run() {
        let f = fixture_with(
            ScriptedBackend::new(vec![Step::Hang]),
            Duration::from_millis(100),
            1000,
        );
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "go".into(), "sys".into())
            .await
            .unwrap();
        let terminal = collect_terminal(&mut handle).await;

        match terminal {
            RunEventKind::RunFailed { kind, .. } => {
                assert_eq!(kind, RunErrorKind::BackendTimeout);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unresponsive_backend_is_abandoned_after_grace() {
        let f = fixture(ScriptedBackend::new(vec![Step::Hang]).ignoring_cancel());
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "go".into(), "sys".into())
            .await
            .unwrap();
        handle.cancel();

        let started = tokio::time::Instant::now();
        let terminal = collect_terminal(&mut handle).await;
        assert!(matches!(terminal, RunEventKind::RunCancelled));
        // Cancelled locally within the grace window even though the
        // backend never stopped.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn new_run_preempts_the_active_one() {
        let f = fixture(ScriptedBackend::new(vec![
            Step::Delay(Duration::from_millis(50)),
            Step::Complete {
                final_text: "answer".into(),
                session: "s".into(),
            },
        ]));
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut first = f
            .controller
            .start_run(&task.id, "one".into(), "sys".into())
            .await
            .unwrap();
        let mut second = f
            .controller
            .start_run(&task.id, "two".into(), "sys".into())
            .await
            .unwrap();

        let first_terminal = collect_terminal(&mut first).await;
        assert!(matches!(first_terminal, RunEventKind::RunCancelled));

        let second_terminal = collect_terminal(&mut second).await;
        assert!(matches!(
            second_terminal,
            RunEventKind::RunCompleted { .. }
        ));

        // Only the surviving run is recorded.
        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 1);
    }

    #[tokio::test]
    async fn concurrent_starts_keep_one_run_per_task() {
        use std::sync::atomic::Ordering::SeqCst;

        let backend = Arc::new(ScriptedBackend::new(vec![Step::Hang]));
        let f = fixture_shared(backend.clone());
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut first = f
            .controller
            .start_run(&task.id, "one".into(), "sys".into())
            .await
            .unwrap();
        while backend.runs_started.load(SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Two callers race for the occupied slot at once.
        let (second, third) = tokio::join!(
            f.controller.start_run(&task.id, "two".into(), "sys".into()),
            f.controller.start_run(&task.id, "three".into(), "sys".into()),
        );
        let mut second = second.unwrap();
        let mut third = third.unwrap();

        let first_terminal = collect_terminal(&mut first).await;
        assert!(matches!(first_terminal, RunEventKind::RunCancelled));

        // One racer pre-empted the other; cancel whichever survived.
        second.cancel();
        third.cancel();
        assert!(matches!(
            collect_terminal(&mut second).await,
            RunEventKind::RunCancelled
        ));
        assert!(matches!(
            collect_terminal(&mut third).await,
            RunEventKind::RunCancelled
        ));

        assert_eq!(backend.max_concurrent.load(SeqCst), 1);
        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 0);
    }

    #[tokio::test]
    async fn next_run_starts_from_the_recorded_session() {
        let backend = Arc::new(ScriptedBackend::completing("ok"));
        let f = fixture_shared(backend.clone());
        let task = f.store.create("t", Surface::Local).await.unwrap();

        // Second run starts while the first driver may still be in its
        // post-completion work; it must wait for the slot and read the
        // task only afterwards.
        for prompt in ["one", "two"] {
            let mut handle = f
                .controller
                .start_run(&task.id, prompt.into(), "sys".into())
                .await
                .unwrap();
            let terminal = collect_terminal(&mut handle).await;
            assert!(matches!(terminal, RunEventKind::RunCompleted { .. }));
        }

        let seen = backend.seen_sessions.lock().unwrap().clone();
        assert_eq!(seen, vec![None, Some("scripted-session".to_string())]);
        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 2);
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let f = fixture(ScriptedBackend::completing("x"));
        assert!(matches!(
            f.controller
                .start_run("missing", "go".into(), "sys".into())
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn threshold_triggers_compression_after_completion() {
        let f = fixture_with(
            ScriptedBackend::completing("useful summary text"),
            Duration::from_secs(10),
            2,
        );
        let task = f.store.create("t", Surface::Local).await.unwrap();

        for prompt in ["one", "two"] {
            let mut handle = f
                .controller
                .start_run(&task.id, prompt.into(), "sys".into())
                .await
                .unwrap();
            let terminal = collect_terminal(&mut handle).await;
            assert!(matches!(terminal, RunEventKind::RunCompleted { .. }));
            // Compression runs after the terminal event, while the
            // slot is held; wait for the slot to clear.
            let mut state = handle.state.clone();
            let _ = state.wait_for(|s| s.is_terminal()).await;
        }
        // Give the driver time to finish its post-completion work.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 0);
        assert!(task.session.is_none());
        assert_eq!(task.summary.as_deref(), Some("useful summary text"));
    }

    #[tokio::test]
    async fn empty_summary_defers_compression() {
        let backend = ScriptedBackend::new(vec![Step::Complete {
            final_text: "".into(),
            session: "s".into(),
        }]);
        let f = fixture_with(backend, Duration::from_secs(10), 1);
        let task = f.store.create("t", Surface::Local).await.unwrap();

        let mut handle = f
            .controller
            .start_run(&task.id, "one".into(), "sys".into())
            .await
            .unwrap();
        let terminal = collect_terminal(&mut handle).await;
        assert!(matches!(terminal, RunEventKind::RunCompleted { .. }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Summarization produced nothing usable: the session survives
        // and the turn counter keeps its value for the next attempt.
        let task = f.store.get(&task.id).await.unwrap();
        assert_eq!(task.turn_count, 1);
        assert!(task.session.is_some());
        assert!(task.summary.is_none());
    }
}
