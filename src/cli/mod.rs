use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::core::agent::AgentEngine;
use crate::core::backend::{BackendRegistry, Provider};
use crate::core::backend::openai::OpenAiCompatBackend;
use crate::core::compress::CompressionPolicy;
use crate::core::run::RunController;
use crate::core::schedule::ScheduleStore;
use crate::core::scheduler::Scheduler;
use crate::core::task::TaskStore;
use crate::interfaces::repl::Repl;
use crate::interfaces::telegram::{TelegramInterface, TelegramTransport};
use crate::skills::SkillsLoader;

pub fn print_error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

fn print_help() {
    println!("{} — persistent agent runner", style("runa").cyan().bold());
    println!();
    println!("Usage: runa [command]");
    println!();
    println!("  chat                      interactive session (default)");
    println!("  serve                     run the telegram bot and scheduler");
    println!("  tasks                     list tasks");
    println!("  task delete <id>          delete a task and its files");
    println!("  task export <id>          print a task's history");
    println!("  schedule list             list schedules");
    println!("  schedule add <name> <cron> <prompt> [--chat <id>] [--once]");
    println!("  schedule rm <id>          remove a schedule");
    println!("  skills                    list loaded skills");
    println!("  help                      this message");
}

/// Everything a frontend needs, wired from config.
pub struct Runtime {
    pub engine: Arc<AgentEngine>,
    pub schedules: Arc<ScheduleStore>,
}

pub fn build_runtime(config: Config) -> Result<Runtime> {
    let data_dir = config.store.data_dir.clone();
    let provider = Provider::from_name(&config.agent.provider)
        .with_context(|| format!("unknown provider {:?}", config.agent.provider))?;

    let store = Arc::new(
        TaskStore::open(data_dir.clone(), provider)
            .with_context(|| format!("failed to open task store in {}", data_dir.display()))?,
    );
    let schedules = Arc::new(ScheduleStore::open(&data_dir)?);

    let sessions_dir = data_dir.join("sessions");
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(match (provider, &config.agent.base_url) {
        // A base_url override rebinds the default provider.
        (p, Some(base)) => OpenAiCompatBackend::new(
            p,
            base.clone(),
            config.agent.api_key.clone(),
            config.agent.model.clone(),
            sessions_dir.clone(),
        ),
        (Provider::OpenAi, None) => OpenAiCompatBackend::openai(
            config.agent.api_key.clone(),
            config.agent.model.clone(),
            sessions_dir.clone(),
        ),
        (Provider::Gemini, None) => OpenAiCompatBackend::gemini(
            config.agent.api_key.clone(),
            config.agent.model.clone(),
            sessions_dir.clone(),
        ),
        (Provider::Grok, None) => OpenAiCompatBackend::grok(
            config.agent.api_key.clone(),
            config.agent.model.clone(),
            sessions_dir.clone(),
        ),
    }));
    let backends = Arc::new(registry);

    let compressor = Arc::new(CompressionPolicy::new(
        store.clone(),
        backends.clone(),
        config.store.compress_after_turns,
    ));
    let controller = Arc::new(RunController::new(
        store.clone(),
        backends,
        compressor.clone(),
        Duration::from_secs(config.agent.run_timeout_secs),
        Duration::from_secs(config.agent.cancel_grace_secs),
        config.agent.allowed_tools.clone(),
    ));
    let engine = Arc::new(AgentEngine::new(
        store,
        controller,
        compressor,
        SkillsLoader::new(config.skills.skills_dir.clone()),
        schedules.dir().to_path_buf(),
    ));

    Ok(Runtime { engine, schedules })
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = Config::load()?;

    let cmd = args.get(1).map(String::as_str).unwrap_or("chat");
    match cmd {
        "chat" => {
            let runtime = build_runtime(config)?;
            Repl::new(runtime.engine, runtime.schedules).run().await
        }
        "serve" => serve(config).await,
        "tasks" => {
            let runtime = build_runtime(config)?;
            let tasks = runtime.engine.tasks().list().await;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{} · {} · {} · {} turns · {}",
                    style(&task.id).green(),
                    task.display_name(),
                    task.provider,
                    task.turn_count,
                    task.surface
                );
            }
            Ok(())
        }
        "task" => task_command(&args[2..], config).await,
        "schedule" => schedule_command(&args[2..], config).await,
        "skills" => {
            let runtime = build_runtime(config)?;
            let skills = runtime.engine.skills().list();
            if skills.is_empty() {
                println!("No skills loaded.");
            }
            for skill in skills {
                let marker = if skill.always_include { " (always)" } else { "" };
                println!(
                    "• {}{} — {}",
                    style(&skill.name).green(),
                    marker,
                    skill.description
                );
            }
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    if config.telegram.token.is_empty() {
        bail!("telegram token is not configured (set RUNA_TELEGRAM_TOKEN or telegram.token)");
    }
    let poll = Duration::from_secs(config.scheduler.poll_interval_secs);
    let allowed_users = config.telegram.allowed_users.clone();
    let token = config.telegram.token.clone();
    let runtime = build_runtime(config)?;

    let bot = teloxide::Bot::new(token);
    let transport = Arc::new(TelegramTransport::new(bot.clone()));

    let scheduler = Scheduler::new(
        runtime.schedules.clone(),
        runtime.engine.clone(),
        transport,
        poll,
    );
    let shutdown = CancellationToken::new();
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let interface = TelegramInterface::new(
        bot,
        runtime.engine.clone(),
        runtime.schedules.clone(),
        allowed_users,
    );
    let bot_task = tokio::spawn(interface.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    let _ = scheduler_task.await;
    bot_task.abort();
    Ok(())
}

async fn task_command(args: &[String], config: Config) -> Result<()> {
    let runtime = build_runtime(config)?;
    match args.first().map(String::as_str) {
        Some("delete") => {
            let id = args.get(1).context("usage: runa task delete <id>")?;
            runtime.engine.tasks().delete(id).await?;
            println!("🗑️ Deleted task {}.", id);
            Ok(())
        }
        Some("export") => {
            let id = args.get(1).context("usage: runa task export <id>")?;
            for entry in runtime.engine.tasks().export_history(id)? {
                println!(
                    "[{}] {}\n{}\n",
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.role,
                    entry.content
                );
            }
            Ok(())
        }
        _ => {
            print_error("usage: runa task <delete|export> <id>");
            Ok(())
        }
    }
}

async fn schedule_command(args: &[String], config: Config) -> Result<()> {
    let runtime = build_runtime(config)?;
    match args.first().map(String::as_str) {
        Some("list") | None => {
            let all = runtime.schedules.list().await?;
            if all.is_empty() {
                println!("No schedules.");
            }
            for s in all {
                println!(
                    "{} · {} · {} · chat {}{}{}",
                    style(&s.id).green(),
                    s.name,
                    s.cron,
                    s.chat_id,
                    if s.once { " · once" } else { "" },
                    if s.enabled { "" } else { " · disabled" }
                );
            }
            Ok(())
        }
        Some("add") => {
            let mut positional = Vec::new();
            let mut chat_id: i64 = 0;
            let mut once = false;
            let mut i = 1;
            while i < args.len() {
                match args[i].as_str() {
                    "--chat" => {
                        chat_id = args
                            .get(i + 1)
                            .context("--chat needs a value")?
                            .parse()
                            .context("--chat must be a number")?;
                        i += 2;
                    }
                    "--once" => {
                        once = true;
                        i += 1;
                    }
                    other => {
                        positional.push(other.to_string());
                        i += 1;
                    }
                }
            }
            let [name, cron, prompt] = positional.as_slice() else {
                bail!("usage: runa schedule add <name> <cron> <prompt> [--chat <id>] [--once]");
            };
            let schedule = runtime
                .schedules
                .add(name, cron, prompt, chat_id, once)
                .await?;
            println!("⏰ Added schedule {} ({}).", style(&schedule.id).green(), schedule.name);
            Ok(())
        }
        Some("rm") => {
            let id = args.get(1).context("usage: runa schedule rm <id>")?;
            runtime.schedules.remove(id).await?;
            println!("🗑️ Removed schedule {}.", id);
            Ok(())
        }
        _ => {
            print_error("usage: runa schedule <list|add|rm>");
            Ok(())
        }
    }
}
