use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use console::style;
use tokio::io::AsyncBufReadExt;

use crate::core::agent::AgentEngine;
use crate::core::schedule::ScheduleStore;
use crate::core::status::{RenderTarget, RunOutcome, StatusProjector};
use crate::core::task::Surface;

/// Single-line status display: every render repaints the same
/// terminal line, finalize clears it and prints the answer.
struct TerminalTarget;

#[async_trait]
impl RenderTarget for TerminalTarget {
    async fn render(&mut self, text: &str) -> Result<()> {
        // Status is composed as one line when max_steps is 1; flatten
        // just in case.
        let line = text.replace('\n', " · ");
        print!("\r\x1b[2K{}", style(line).dim());
        std::io::stdout().flush()?;
        Ok(())
    }

    async fn finalize(&mut self, text: &str) -> Result<()> {
        print!("\r\x1b[2K");
        println!("{}", text);
        std::io::stdout().flush()?;
        Ok(())
    }
}

pub struct Repl {
    engine: Arc<AgentEngine>,
    schedules: Arc<ScheduleStore>,
}

impl Repl {
    pub fn new(engine: Arc<AgentEngine>, schedules: Arc<ScheduleStore>) -> Self {
        Self { engine, schedules }
    }

    pub async fn run(&self) -> Result<()> {
        println!(
            "{} Interactive session. {} for commands, {} to quit.",
            style("runa").cyan().bold(),
            style("/help").yellow(),
            style("/exit").yellow()
        );

        // The active task lives here, in the loop, not in any global.
        let mut current_task_id: Option<String> = None;

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            print!("{} ", style("›").cyan());
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line.split_whitespace().next() {
                Some("/exit") | Some("/quit") => break,
                Some("/help") => self.print_help(),
                Some("/new") => {
                    let task = self.engine.tasks().create("", Surface::Local).await?;
                    println!("🆕 Started task {}", style(&task.id).green());
                    current_task_id = Some(task.id);
                }
                Some("/tasks") => {
                    let tasks = self.engine.tasks().list().await;
                    if tasks.is_empty() {
                        println!("No tasks yet.");
                    }
                    for task in tasks {
                        let marker = if Some(&task.id) == current_task_id.as_ref() {
                            "*"
                        } else {
                            " "
                        };
                        println!(
                            "{} {} · {} · {} turns · {}",
                            marker,
                            style(&task.id).green(),
                            task.display_name(),
                            task.turn_count,
                            task.surface
                        );
                    }
                }
                Some("/resume") => {
                    let Some(id) = line.split_whitespace().nth(1) else {
                        println!("Usage: /resume <task id>");
                        continue;
                    };
                    match self.engine.tasks().get(id).await {
                        Ok(task) => {
                            println!(
                                "▶️ Resumed task {} ({})",
                                style(&task.id).green(),
                                task.display_name()
                            );
                            current_task_id = Some(task.id);
                        }
                        Err(e) => println!("❌ {}", e),
                    }
                }
                Some("/compress") => {
                    let Some(task_id) = &current_task_id else {
                        println!("No active task. Send a message or /resume one first.");
                        continue;
                    };
                    match self.engine.compress_now(task_id).await {
                        Ok(Some(_)) => println!("🗜️ Compressed."),
                        Ok(None) => println!("Nothing to compress yet."),
                        Err(e) => println!("❌ {:#}", e),
                    }
                }
                Some("/skills") => {
                    let skills = self.engine.skills().list();
                    if skills.is_empty() {
                        println!("No skills loaded.");
                    }
                    for skill in skills {
                        println!("• {} — {}", style(&skill.name).green(), skill.description);
                    }
                }
                Some("/schedules") => {
                    for schedule in self.schedules.list().await? {
                        println!(
                            "{} · {} · {}",
                            style(&schedule.id).green(),
                            schedule.name,
                            schedule.cron
                        );
                    }
                }
                _ => {
                    let task_id = match &current_task_id {
                        Some(id) => id.clone(),
                        None => {
                            let task = self
                                .engine
                                .tasks()
                                .get_or_create_for_surface(Surface::Local)
                                .await?;
                            current_task_id = Some(task.id.clone());
                            task.id
                        }
                    };
                    self.run_prompt(&task_id, line).await?;
                }
            }
        }
        println!("bye");
        Ok(())
    }

    /// Runs a prompt on the current task. Ctrl-C cancels the run
    /// instead of killing the process.
    async fn run_prompt(&self, task_id: &str, text: &str) -> Result<()> {
        let handle = self.engine.process_task(task_id, text).await?;
        let cancel = handle.cancel_token();

        let projector = StatusProjector::new(Duration::from_millis(250), 1);
        let mut target = TerminalTarget;
        let project = projector.project(handle.events, &mut target);
        tokio::pin!(project);

        let outcome = loop {
            tokio::select! {
                outcome = &mut project => break outcome,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    // Keep consuming events; the run ends as cancelled.
                }
            }
        };

        if let RunOutcome::Completed { usage, .. } = &outcome
            && (usage.input_tokens > 0 || usage.output_tokens > 0)
        {
            println!(
                "{}",
                style(format!(
                    "({}→{} tokens)",
                    usage.input_tokens, usage.output_tokens
                ))
                .dim()
            );
        }
        Ok(())
    }

    fn print_help(&self) {
        println!("/new            start a fresh task");
        println!("/tasks          list tasks (* marks the active one)");
        println!("/resume <id>    switch to an existing task");
        println!("/compress       fold the active task's history into a summary");
        println!("/skills         list loaded skills");
        println!("/schedules      list schedules");
        println!("/exit           quit");
        println!();
        println!("Anything else is sent to the agent. Ctrl-C interrupts a running turn.");
    }
}
