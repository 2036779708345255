use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::compress::CompressionPolicy;
use crate::core::run::{RunController, RunHandle};
use crate::core::scheduler::ScheduledRunner;
use crate::core::status::{RunOutcome, StatusProjector};
use crate::core::task::{Surface, Task, TaskStore};
use crate::skills::SkillsLoader;

const IDENTITY_PROMPT: &str = "You are Runa, a persistent personal assistant. \
You work on long-lived tasks: conversations that survive restarts and pick up where they left off. \
Be direct and concrete. When asked to do something, do it rather than describing how you would. \
If context from a previous conversation is provided below, treat it as your own memory.";

fn scheduling_prompt(chat_id: Option<i64>, schedules_dir: &std::path::Path) -> String {
    let chat_line = match chat_id {
        Some(id) => format!("The current chat id is {}.", id),
        None => "There is no chat bound to this conversation; use chat id 0 for local-only schedules.".to_string(),
    };
    format!(
        "You can schedule recurring prompts for yourself by writing JSON files into {dir}. \
Each file becomes one schedule; the filename (without .json) is its id. Format:\n\
{{\"name\": \"morning summary\", \"cron\": \"0 9 * * *\", \"prompt\": \"summarize my inbox\", \
\"chat_id\": <chat id>, \"created_at\": \"<RFC3339 timestamp>\", \"once\": false}}\n\
Cron is the standard five fields (minute hour day month weekday), e.g. \"*/30 * * * *\" for \
every half hour. Set \"once\": true for a one-shot reminder that deletes itself after firing. \
{chat}",
        dir = schedules_dir.display(),
        chat = chat_line,
    )
}

/// Front door for both interfaces and the scheduler: resolves the
/// task behind a surface, builds the system prompt, and hands the
/// run to the controller.
pub struct AgentEngine {
    store: Arc<TaskStore>,
    controller: Arc<RunController>,
    compressor: Arc<CompressionPolicy>,
    skills: SkillsLoader,
    schedules_dir: PathBuf,
}

impl AgentEngine {
    pub fn new(
        store: Arc<TaskStore>,
        controller: Arc<RunController>,
        compressor: Arc<CompressionPolicy>,
        skills: SkillsLoader,
        schedules_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            controller,
            compressor,
            skills,
            schedules_dir,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Run a prompt on whatever task currently owns `surface`.
    pub async fn process(&self, surface: Surface, text: &str) -> Result<RunHandle> {
        let task = self.store.get_or_create_for_surface(surface).await?;
        self.process_task(&task.id, text).await
    }

    pub async fn process_task(&self, task_id: &str, text: &str) -> Result<RunHandle> {
        let task = self.store.get(task_id).await?;
        let system_prompt = self.build_system_prompt(&task);
        let handle = self
            .controller
            .start_run(task_id, text.to_string(), system_prompt)
            .await?;
        Ok(handle)
    }

    /// Run to completion with no live rendering. Used by the
    /// scheduler and by anything that only wants the final text.
    pub async fn run_to_outcome(&self, surface: Surface, text: &str) -> RunOutcome {
        match self.process(surface, text).await {
            Ok(handle) => StatusProjector::drain(handle.events).await,
            Err(e) => RunOutcome::Failed {
                kind: crate::core::error::RunErrorKind::BackendUnavailable,
                message: format!("{:#}", e),
            },
        }
    }

    pub async fn compress_now(&self, task_id: &str) -> Result<Option<String>> {
        self.compressor.compress_now(task_id).await
    }

    pub fn skills(&self) -> &SkillsLoader {
        &self.skills
    }

    fn build_system_prompt(&self, task: &Task) -> String {
        let chat_id = match task.surface {
            Surface::Chat { chat_id } => Some(chat_id),
            Surface::Local => None,
        };

        let mut prompt = String::from(IDENTITY_PROMPT);
        prompt.push_str("\n\n");
        prompt.push_str(&scheduling_prompt(chat_id, &self.schedules_dir));

        let skills_section = self.skills.prompt_section();
        if !skills_section.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&skills_section);
        }

        // A task without a live session restarts the conversation, so
        // re-seed the model with what it knew before.
        if task.session.is_none()
            && (task.summary.is_some() || task.last_response.is_some())
        {
            prompt.push_str("\n\n<previous-context>\n");
            if let Some(summary) = &task.summary {
                prompt.push_str("Summary of the conversation so far:\n");
                prompt.push_str(summary);
                prompt.push('\n');
            }
            if let Some(last) = &task.last_response {
                prompt.push_str("Your last reply was:\n");
                prompt.push_str(last);
                prompt.push('\n');
            }
            prompt.push_str("</previous-context>");
        }

        prompt
    }
}

#[async_trait]
impl ScheduledRunner for AgentEngine {
    async fn run_scheduled(&self, chat_id: i64, prompt: String) -> RunOutcome {
        self.run_to_outcome(Surface::Chat { chat_id }, &prompt).await
    }
}
