use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tracing::{error, info, warn};

use super::transport::{ChatMessageTarget, ChatTransport, MessageRef, split_message};
use crate::core::agent::AgentEngine;
use crate::core::schedule::ScheduleStore;
use crate::core::scheduler::DeliverMessage;
use crate::core::status::StatusProjector;
use crate::core::task::Surface;

/// Thin teloxide wrapper so the rest of the crate never touches the
/// bot API directly.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef> {
        let sent = self.bot.send_message(ChatId(chat_id), text).await?;
        Ok(MessageRef {
            chat_id,
            message_id: sent.id.0,
        })
    }

    async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(ChatId(msg.chat_id), MessageId(msg.message_id), text)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.bot
            .delete_message(ChatId(msg.chat_id), MessageId(msg.message_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeliverMessage for TelegramTransport {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, super::transport::MAX_MESSAGE_LEN) {
            self.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

pub struct TelegramInterface {
    bot: Bot,
    engine: Arc<AgentEngine>,
    schedules: Arc<ScheduleStore>,
    allowed_users: Vec<u64>,
}

impl TelegramInterface {
    pub fn new(
        bot: Bot,
        engine: Arc<AgentEngine>,
        schedules: Arc<ScheduleStore>,
        allowed_users: Vec<u64>,
    ) -> Self {
        Self {
            bot,
            engine,
            schedules,
            allowed_users,
        }
    }

    pub async fn run(self) {
        let commands = vec![
            teloxide::types::BotCommand::new("help", "Show available commands"),
            teloxide::types::BotCommand::new("new", "Start a fresh task in this chat"),
            teloxide::types::BotCommand::new("tasks", "List tasks"),
            teloxide::types::BotCommand::new("resume", "Resume a task here: /resume <id>"),
            teloxide::types::BotCommand::new("compress", "Fold this task's history into a summary"),
            teloxide::types::BotCommand::new("skills", "List loaded skills"),
            teloxide::types::BotCommand::new("schedules", "List schedules"),
        ];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            error!("failed to set telegram bot commands: {}", e);
        }
        info!("telegram interface started");

        let engine = self.engine.clone();
        let schedules = self.schedules.clone();
        let allowed = Arc::new(self.allowed_users.clone());

        teloxide::repl(self.bot.clone(), move |bot: Bot, msg: Message| {
            let engine = engine.clone();
            let schedules = schedules.clone();
            let allowed = allowed.clone();
            async move {
                let user_id = msg.from.as_ref().map(|u| u.id.0);
                if !user_id.is_some_and(|id| allowed.contains(&id)) {
                    let _ = bot
                        .send_message(
                            msg.chat.id,
                            format!(
                                "⛔ Not authorized. Your user id is {}.",
                                user_id.map_or("unknown".to_string(), |id| id.to_string())
                            ),
                        )
                        .await;
                    return Ok(());
                }
                let Some(text) = msg.text() else {
                    return Ok(());
                };
                if let Err(e) =
                    handle_message(&bot, &engine, &schedules, msg.chat.id.0, text).await
                {
                    warn!(chat = msg.chat.id.0, error = %format!("{:#}", e), "message handling failed");
                    let _ = bot
                        .send_message(msg.chat.id, format!("❌ {:#}", e))
                        .await;
                }
                Ok(())
            }
        })
        .await;
    }
}

async fn handle_message(
    bot: &Bot,
    engine: &Arc<AgentEngine>,
    schedules: &Arc<ScheduleStore>,
    chat_id: i64,
    text: &str,
) -> Result<()> {
    let surface = Surface::Chat { chat_id };
    let reply = |text: String| async move {
        bot.send_message(ChatId(chat_id), text).await?;
        anyhow::Ok(())
    };

    match text.split_whitespace().next() {
        Some("/start") | Some("/help") => {
            reply(
                "Send me anything and I'll work on it in this chat's task.\n\n\
                 /new - start a fresh task here\n\
                 /tasks - list tasks\n\
                 /resume <id> - continue an existing task in this chat\n\
                 /compress - fold this task's history into a summary\n\
                 /skills - list loaded skills\n\
                 /schedules - list schedules\n\n\
                 Sending a new message while I'm working interrupts the current run."
                    .to_string(),
            )
            .await
        }
        Some("/new") => {
            let task = engine.tasks().create("", surface).await?;
            reply(format!("🆕 Started task {}.", task.id)).await
        }
        Some("/tasks") => {
            let tasks = engine.tasks().list().await;
            if tasks.is_empty() {
                return reply("No tasks yet.".to_string()).await;
            }
            let lines: Vec<String> = tasks
                .iter()
                .map(|t| {
                    format!(
                        "{} · {} · {} turns · {}",
                        t.id,
                        t.display_name(),
                        t.turn_count,
                        t.surface
                    )
                })
                .collect();
            reply(format!("📋 Tasks:\n{}", lines.join("\n"))).await
        }
        Some("/resume") => {
            let Some(id) = text.split_whitespace().nth(1) else {
                return reply("Usage: /resume <task id>".to_string()).await;
            };
            let task = engine.tasks().bind_to_surface(id, surface).await?;
            reply(format!("▶️ Resumed task {} ({}) here.", task.id, task.display_name())).await
        }
        Some("/compress") => {
            let task = engine.tasks().get_or_create_for_surface(surface).await?;
            match engine.compress_now(&task.id).await? {
                Some(summary) => {
                    reply(format!("🗜️ Compressed.\n\n{}", summary)).await
                }
                None => reply("Nothing to compress yet.".to_string()).await,
            }
        }
        Some("/skills") => {
            let skills = engine.skills().list();
            if skills.is_empty() {
                return reply("No skills loaded.".to_string()).await;
            }
            let lines: Vec<String> = skills
                .iter()
                .map(|s| format!("• {} — {}", s.name, s.description))
                .collect();
            reply(format!("🧩 Skills:\n{}", lines.join("\n"))).await
        }
        Some("/schedules") => {
            let all = schedules.list().await?;
            if all.is_empty() {
                return reply("No schedules.".to_string()).await;
            }
            let lines: Vec<String> = all
                .iter()
                .map(|s| {
                    format!(
                        "{} · {} · `{}`{}",
                        s.id,
                        s.name,
                        s.cron,
                        if s.enabled { "" } else { " (disabled)" }
                    )
                })
                .collect();
            reply(format!("⏰ Schedules:\n{}", lines.join("\n"))).await
        }
        _ => run_prompt(bot, engine, chat_id, text).await,
    }
}

/// Runs a prompt on the chat's task, projecting live status onto an
/// editable placeholder message. On the terminal event the placeholder
/// is deleted and the result is sent as a fresh message. Starting a run
/// while one is active pre-empts it.
async fn run_prompt(
    bot: &Bot,
    engine: &Arc<AgentEngine>,
    chat_id: i64,
    text: &str,
) -> Result<()> {
    let handle = engine.process(Surface::Chat { chat_id }, text).await?;
    tracing::debug!(chat = chat_id, task = %handle.task_id, run = %handle.run_id, "run started");

    let transport: Arc<dyn ChatTransport> = Arc::new(TelegramTransport::new(bot.clone()));
    let placeholder = transport.send_message(chat_id, "⏳ Starting…").await?;
    let mut target = ChatMessageTarget::new(transport, placeholder);

    let projector = StatusProjector::new(Duration::from_secs(1), 8);
    projector.project(handle.events, &mut target).await;
    Ok(())
}
