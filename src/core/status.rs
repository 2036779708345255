use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::core::error::RunErrorKind;
use crate::core::run::{RunEvent, RunEventKind};

/// Where a live status rendering goes. Implementations edit a chat
/// message, redraw a terminal line, or discard everything.
#[async_trait]
pub trait RenderTarget: Send {
    async fn render(&mut self, text: &str) -> Result<()>;
    /// Called exactly once with the final text when the run reaches a
    /// terminal state.
    async fn finalize(&mut self, text: &str) -> Result<()>;
}

/// Sink for runs nobody is watching.
pub struct NullTarget;

#[async_trait]
impl RenderTarget for NullTarget {
    async fn render(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }
    async fn finalize(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: Option<f64>,
}

/// What a run ultimately produced, independent of how it was rendered.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { final_text: String, usage: Usage },
    Failed { kind: RunErrorKind, message: String },
    Cancelled,
}

impl RunOutcome {
    pub fn final_text(&self) -> Option<&str> {
        match self {
            RunOutcome::Completed { final_text, .. } => Some(final_text),
            _ => None,
        }
    }
}

/// Projects a run's event stream onto a single mutable status view:
/// elapsed time, recent activity, usage so far. Renders are rate
/// limited and skipped when nothing changed since the last one.
pub struct StatusProjector {
    min_interval: Duration,
    max_steps: usize,
}

impl StatusProjector {
    pub fn new(min_interval: Duration, max_steps: usize) -> Self {
        Self {
            min_interval,
            max_steps,
        }
    }

    /// Consume `events` to completion, painting progress onto
    /// `target`. Returns the run's outcome after finalizing the view.
    pub async fn project(
        &self,
        mut events: mpsc::Receiver<RunEvent>,
        target: &mut dyn RenderTarget,
    ) -> RunOutcome {
        let started = Instant::now();
        let mut steps: VecDeque<String> = VecDeque::new();
        let mut usage = Usage::default();
        let mut text_len = 0usize;
        let mut last_painted = String::new();
        let mut last_render: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                ev = events.recv() => ev,
                _ = ticker.tick() => {
                    self.maybe_render(
                        target, started, &steps, &usage, text_len,
                        &mut last_painted, &mut last_render,
                    )
                    .await;
                    continue;
                }
            };

            let Some(event) = event else {
                // Producer vanished without a terminal event.
                let _ = target.finalize("⚠️ Run ended unexpectedly.").await;
                return RunOutcome::Failed {
                    kind: RunErrorKind::BackendUnavailable,
                    message: "event stream closed before a terminal event".to_string(),
                };
            };

            match event.kind {
                RunEventKind::ThinkingStarted => {
                    push_step(&mut steps, self.max_steps, "🧠 Thinking…".to_string());
                }
                RunEventKind::ToolCallStarted { tool, args_summary } => {
                    let line = if args_summary.is_empty() {
                        format!("{} {}", tool_icon(&tool), tool)
                    } else {
                        format!("{} {} {}", tool_icon(&tool), tool, args_summary)
                    };
                    push_step(&mut steps, self.max_steps, line);
                }
                RunEventKind::ToolCallFinished { tool, ok } => {
                    if !ok {
                        push_step(&mut steps, self.max_steps, format!("❌ {} failed", tool));
                    }
                }
                RunEventKind::MessageDelta { text } => {
                    text_len += text.len();
                }
                RunEventKind::UsageReported {
                    input_tokens,
                    output_tokens,
                    cost_estimate,
                } => {
                    usage.input_tokens += input_tokens;
                    usage.output_tokens += output_tokens;
                    if let Some(cost) = cost_estimate {
                        usage.cost_estimate =
                            Some(usage.cost_estimate.unwrap_or(0.0) + cost);
                    }
                }
                RunEventKind::RunCompleted { final_text } => {
                    let _ = target.finalize(&final_text).await;
                    return RunOutcome::Completed { final_text, usage };
                }
                RunEventKind::RunFailed { kind, message } => {
                    let _ = target
                        .finalize(&format!("⚠️ Run failed: {}", message))
                        .await;
                    return RunOutcome::Failed { kind, message };
                }
                RunEventKind::RunCancelled => {
                    let _ = target.finalize("⚠️ Interrupted.").await;
                    return RunOutcome::Cancelled;
                }
            }

            self.maybe_render(
                target, started, &steps, &usage, text_len,
                &mut last_painted, &mut last_render,
            )
            .await;
        }
    }

    /// Consume events without rendering anywhere. Used for scheduled
    /// firings, which have no live view.
    pub async fn drain(events: mpsc::Receiver<RunEvent>) -> RunOutcome {
        let projector = StatusProjector::new(Duration::from_secs(3600), 1);
        let mut target = NullTarget;
        projector.project(events, &mut target).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn maybe_render(
        &self,
        target: &mut dyn RenderTarget,
        started: Instant,
        steps: &VecDeque<String>,
        usage: &Usage,
        text_len: usize,
        last_painted: &mut String,
        last_render: &mut Option<Instant>,
    ) {
        if let Some(last) = last_render
            && last.elapsed() < self.min_interval
        {
            return;
        }
        let painted = self.compose(started, steps, usage, text_len);
        if painted == *last_painted {
            return;
        }
        if let Err(e) = target.render(&painted).await {
            debug!(error = %e, "status render failed");
            return;
        }
        *last_painted = painted;
        *last_render = Some(Instant::now());
    }

    fn compose(
        &self,
        started: Instant,
        steps: &VecDeque<String>,
        usage: &Usage,
        text_len: usize,
    ) -> String {
        let mut out = format!("⏳ {}", format_elapsed(started.elapsed()));
        if text_len > 0 {
            out.push_str(&format!(" · writing ({} chars)", text_len));
        }
        for step in steps {
            out.push('\n');
            out.push_str(step);
        }
        if usage.input_tokens > 0 || usage.output_tokens > 0 {
            out.push_str(&format!(
                "\n📊 {}→{} tokens",
                usage.input_tokens, usage.output_tokens
            ));
            if let Some(cost) = usage.cost_estimate {
                out.push_str(&format!(" (${:.4})", cost));
            }
        }
        out
    }
}

fn push_step(steps: &mut VecDeque<String>, max: usize, line: String) {
    steps.push_back(line);
    while steps.len() > max {
        steps.pop_front();
    }
}

fn tool_icon(tool: &str) -> &'static str {
    let t = tool.to_lowercase();
    if t.contains("bash") || t.contains("exec") || t.contains("shell") {
        "💻"
    } else if t.contains("write") || t.contains("edit") {
        "✏️"
    } else if t.contains("read") {
        "📖"
    } else if t.contains("glob") || t.contains("grep") || t.contains("search") {
        "🔍"
    } else if t.contains("web") || t.contains("fetch") || t.contains("http") {
        "🌐"
    } else {
        "⚙️"
    }
}

pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run::RunEvent;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct CapturingTarget {
        renders: Arc<Mutex<Vec<String>>>,
        finals: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RenderTarget for CapturingTarget {
        async fn render(&mut self, text: &str) -> Result<()> {
            self.renders.lock().await.push(text.to_string());
            Ok(())
        }
        async fn finalize(&mut self, text: &str) -> Result<()> {
            self.finals.lock().await.push(text.to_string());
            Ok(())
        }
    }

    fn target() -> (CapturingTarget, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let renders = Arc::new(Mutex::new(Vec::new()));
        let finals = Arc::new(Mutex::new(Vec::new()));
        (
            CapturingTarget {
                renders: renders.clone(),
                finals: finals.clone(),
            },
            renders,
            finals,
        )
    }

    fn ev(seq: u64, kind: RunEventKind) -> RunEvent {
        RunEvent { seq, kind }
    }

    #[tokio::test]
    async fn completed_run_finalizes_with_text_only() {
        let (mut t, renders, finals) = target();
        let (tx, rx) = mpsc::channel(16);
        tx.send(ev(1, RunEventKind::ThinkingStarted)).await.unwrap();
        tx.send(ev(
            2,
            RunEventKind::ToolCallStarted {
                tool: "bash".into(),
                args_summary: "ls".into(),
            },
        ))
        .await
        .unwrap();
        tx.send(ev(
            3,
            RunEventKind::RunCompleted {
                final_text: "done".into(),
            },
        ))
        .await
        .unwrap();
        drop(tx);

        let projector = StatusProjector::new(Duration::from_millis(0), 8);
        let outcome = projector.project(rx, &mut t).await;

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let finals = finals.lock().await;
        assert_eq!(finals.as_slice(), &["done".to_string()]);
        // Progress renders carry the elapsed header and steps.
        let renders = renders.lock().await;
        assert!(renders.iter().any(|r| r.contains("💻 bash ls")));
        assert!(renders.iter().all(|r| r.starts_with("⏳")));
    }

    #[tokio::test]
    async fn failed_run_finalizes_with_reason() {
        let (mut t, _renders, finals) = target();
        let (tx, rx) = mpsc::channel(16);
        tx.send(ev(
            1,
            RunEventKind::RunFailed {
                kind: RunErrorKind::BackendTimeout,
                message: "run exceeded the 300s timeout".into(),
            },
        ))
        .await
        .unwrap();
        drop(tx);

        let projector = StatusProjector::new(Duration::from_millis(0), 8);
        let outcome = projector.project(rx, &mut t).await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                kind: RunErrorKind::BackendTimeout,
                ..
            }
        ));
        assert!(finals.lock().await[0].contains("timeout"));
    }

    #[tokio::test]
    async fn closed_stream_without_terminal_is_a_failure() {
        let (mut t, _renders, finals) = target();
        let (tx, rx) = mpsc::channel::<RunEvent>(4);
        drop(tx);

        let projector = StatusProjector::new(Duration::from_millis(0), 8);
        let outcome = projector.project(rx, &mut t).await;

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(finals.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn usage_accumulates_across_reports() {
        let (mut t, _renders, _finals) = target();
        let (tx, rx) = mpsc::channel(16);
        for _ in 0..2 {
            tx.send(ev(
                1,
                RunEventKind::UsageReported {
                    input_tokens: 100,
                    output_tokens: 20,
                    cost_estimate: Some(0.01),
                },
            ))
            .await
            .unwrap();
        }
        tx.send(ev(
            3,
            RunEventKind::RunCompleted {
                final_text: "ok".into(),
            },
        ))
        .await
        .unwrap();
        drop(tx);

        let projector = StatusProjector::new(Duration::from_millis(0), 8);
        match projector.project(rx, &mut t).await {
            RunOutcome::Completed { usage, .. } => {
                assert_eq!(usage.input_tokens, 200);
                assert_eq!(usage.output_tokens, 40);
                assert_eq!(usage.cost_estimate, Some(0.02));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn steps_are_capped() {
        let (mut t, renders, _finals) = target();
        let (tx, rx) = mpsc::channel(64);
        for i in 0..20 {
            tx.send(ev(
                i,
                RunEventKind::ToolCallStarted {
                    tool: format!("tool{}", i),
                    args_summary: String::new(),
                },
            ))
            .await
            .unwrap();
        }
        tx.send(ev(
            21,
            RunEventKind::RunCompleted {
                final_text: "ok".into(),
            },
        ))
        .await
        .unwrap();
        drop(tx);

        let projector = StatusProjector::new(Duration::from_millis(0), 8);
        projector.project(rx, &mut t).await;

        let renders = renders.lock().await;
        let last = renders.last().unwrap();
        assert!(!last.contains("tool11"));
        assert!(last.contains("tool19"));
        // Header plus at most eight step lines plus optional usage.
        assert!(last.lines().count() <= 10);
    }

    #[tokio::test]
    async fn drain_returns_outcome() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ev(1, RunEventKind::RunCancelled)).await.unwrap();
        drop(tx);
        assert!(matches!(
            StatusProjector::drain(rx).await,
            RunOutcome::Cancelled
        ));
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_secs(5)), "5s");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "59s");
        assert_eq!(format_elapsed(Duration::from_secs(60)), "1m00s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m05s");
    }
}
