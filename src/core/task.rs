use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::backend::{Provider, SessionHandle};
use crate::core::error::StoreError;

/// Where a task's conversation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Surface {
    Local,
    Chat { chat_id: i64 },
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Surface::Local => write!(f, "local"),
            Surface::Chat { chat_id } => write!(f, "chat:{}", chat_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Empty until the first completed run names it after the prompt.
    pub name: String,
    pub provider: Provider,
    /// Live backend session, if any. None after creation and after
    /// every rotation; the next run starts fresh with the summary
    /// injected as context.
    pub session: Option<SessionHandle>,
    pub summary: Option<String>,
    pub last_response: Option<String>,
    /// Completed runs since the last rotation.
    pub turn_count: u32,
    pub surface: Surface,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Task {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(unnamed)"
        } else {
            &self.name
        }
    }
}

/// One line of a task's history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Durable task records under `<data_dir>/tasks/<id>.json`, with
/// rotation summaries in `summaries/` and append-only history in
/// `history/`. All mutations persist before returning.
pub struct TaskStore {
    data_dir: PathBuf,
    default_provider: Provider,
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskStore {
    pub fn open(data_dir: PathBuf, default_provider: Provider) -> Result<Self, StoreError> {
        let tasks_dir = data_dir.join("tasks");
        std::fs::create_dir_all(&tasks_dir)?;
        std::fs::create_dir_all(data_dir.join("summaries"))?;
        std::fs::create_dir_all(data_dir.join("history"))?;

        let mut tasks = HashMap::new();
        for entry in std::fs::read_dir(&tasks_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Task>(&raw) {
                Ok(task) => {
                    tasks.insert(task.id.clone(), task);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt task record");
                }
            }
        }

        Ok(Self {
            data_dir,
            default_provider,
            tasks: Mutex::new(tasks),
        })
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("tasks").join(format!("{}.json", id))
    }

    fn summary_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("summaries").join(format!("{}.md", id))
    }

    fn history_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("history").join(format!("{}.jsonl", id))
    }

    async fn persist(&self, task: &Task) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(task).map_err(|e| StoreError::Corrupt {
            path: self.task_path(&task.id),
            reason: e.to_string(),
        })?;
        tokio::fs::write(self.task_path(&task.id), raw).await?;
        Ok(())
    }

    fn new_id(tasks: &HashMap<String, Task>) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut id = format!("{:x}", millis);
        let mut n = 0u32;
        while tasks.contains_key(&id) {
            n += 1;
            id = format!("{:x}-{}", millis, n);
        }
        id
    }

    pub async fn create(&self, name: &str, surface: Surface) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        let task = Task {
            id: Self::new_id(&tasks),
            name: name.to_string(),
            provider: self.default_provider,
            session: None,
            summary: None,
            last_response: None,
            turn_count: 0,
            surface,
            created_at: now,
            last_active_at: now,
        };
        self.persist(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    /// Newest task bound to `surface`, creating one when none exists.
    pub async fn get_or_create_for_surface(&self, surface: Surface) -> Result<Task, StoreError> {
        {
            let tasks = self.tasks.lock().await;
            if let Some(task) = tasks
                .values()
                .filter(|t| t.surface == surface)
                .max_by_key(|t| t.last_active_at)
            {
                return Ok(task.clone());
            }
        }
        self.create("", surface).await
    }

    /// All tasks, newest activity first.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        all
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.remove(id).is_none() {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        tokio::fs::remove_file(self.task_path(id)).await?;
        // Companion files may not exist; that's fine.
        let _ = tokio::fs::remove_file(self.summary_path(id)).await;
        let _ = tokio::fs::remove_file(self.history_path(id)).await;
        Ok(())
    }

    /// Fold a successful run into the task: bump the turn counter,
    /// adopt the session handle the backend returned, remember the
    /// final response, and append both sides to history.
    pub async fn record_completion(
        &self,
        id: &str,
        session: SessionHandle,
        prompt: &str,
        final_text: &str,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        task.turn_count += 1;
        task.session = Some(session);
        task.last_response = Some(final_text.to_string());
        if task.name.is_empty() {
            task.name = prompt.chars().take(80).collect();
        }
        task.last_active_at = Utc::now();
        let snapshot = task.clone();
        drop(tasks);

        self.persist(&snapshot).await?;
        self.append_history(id, "user", prompt).await?;
        self.append_history(id, "assistant", final_text).await?;
        Ok(snapshot)
    }

    /// Swap the live session for a summary. The next run starts a
    /// fresh backend conversation seeded from the summary.
    pub async fn rotate_session(&self, id: &str, summary: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        task.session = None;
        task.summary = Some(summary.to_string());
        task.turn_count = 0;
        task.last_active_at = Utc::now();
        let snapshot = task.clone();
        drop(tasks);

        self.persist(&snapshot).await?;
        tokio::fs::write(self.summary_path(id), summary).await?;
        Ok(())
    }

    /// Re-home a task onto a different surface, e.g. resuming an old
    /// task from a new chat.
    pub async fn bind_to_surface(&self, id: &str, surface: Surface) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        task.surface = surface;
        task.last_active_at = Utc::now();
        let snapshot = task.clone();
        drop(tasks);

        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    async fn append_history(&self, id: &str, role: &str, content: &str) -> Result<(), StoreError> {
        let entry = HistoryEntry {
            role: role.to_string(),
            content: content.to_string(),
            at: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt {
            path: self.history_path(id),
            reason: e.to_string(),
        })?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Lazy iterator over a task's history lines. Malformed lines are
    /// skipped with a warning rather than aborting the export.
    pub fn export_history(
        &self,
        id: &str,
    ) -> Result<impl Iterator<Item = HistoryEntry>, StoreError> {
        let path = self.history_path(id);
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(format!("history for {}", id)),
            _ => StoreError::Io(e),
        })?;
        let reader = BufReader::new(file);
        Ok(reader.lines().filter_map(move |line| {
            let line = line.ok()?;
            if line.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping malformed history line");
                    None
                }
            }
        }))
    }

    pub async fn get_summary(&self, id: &str) -> Option<String> {
        tokio::fs::read_to_string(self.summary_path(id)).await.ok()
    }
}
