use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::core::cron::CronExpr;
use crate::core::error::StoreError;

fn default_enabled() -> bool {
    true
}

/// One recurring prompt. Persisted as `<data_dir>/schedules/<id>.json`
/// where the id is the filename stem, so schedules can also be dropped
/// into the directory by hand (or by the agent itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub chat_id: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fire once, then delete.
    #[serde(default)]
    pub once: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_due: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Due when the cached next occurrence (or the first occurrence
    /// after the last firing, or after creation) is not in the future.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let next = match self.next_due {
            Some(next) => Some(next),
            None => {
                let cron = match CronExpr::parse(&self.cron) {
                    Ok(cron) => cron,
                    Err(e) => {
                        warn!(schedule = %self.id, error = %e, "unparseable cron expression");
                        return false;
                    }
                };
                cron.next_after(self.last_run.unwrap_or(self.created_at))
            }
        };
        match next {
            Some(next) => next <= now,
            None => false,
        }
    }
}

pub struct ScheduleStore {
    dir: PathBuf,
}

impl ScheduleStore {
    pub fn open(data_dir: &std::path::Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("schedules");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// All schedules sorted by id. Read from disk every time so that
    /// files written by other processes (or the agent) are picked up
    /// without a restart. Corrupt files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Schedule>(&raw) {
                Ok(mut schedule) => {
                    schedule.id = stem.to_string();
                    out.push(schedule);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt schedule");
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<Schedule, StoreError> {
        let path = self.path(id);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("schedule {}", id))
            } else {
                StoreError::Io(e)
            }
        })?;
        let mut schedule: Schedule =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                path,
                reason: e.to_string(),
            })?;
        schedule.id = id.to_string();
        Ok(schedule)
    }

    /// Validates the cron expression up front so a typo fails at add
    /// time rather than silently never firing.
    pub async fn add(
        &self,
        name: &str,
        cron: &str,
        prompt: &str,
        chat_id: i64,
        once: bool,
    ) -> Result<Schedule, StoreError> {
        CronExpr::parse(cron).map_err(|e| StoreError::Corrupt {
            path: self.dir.clone(),
            reason: format!("invalid cron expression {:?}: {}", cron, e),
        })?;

        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let schedule = Schedule {
            id: id.clone(),
            name: name.to_string(),
            cron: cron.to_string(),
            prompt: prompt.to_string(),
            chat_id,
            enabled: true,
            once,
            created_at: Utc::now(),
            last_run: None,
            next_due: None,
        };
        self.persist(&schedule).await?;
        Ok(schedule)
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        tokio::fs::remove_file(self.path(id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("schedule {}", id))
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Advance the schedule past `now` whether or not the firing
    /// succeeded, so a failing prompt cannot fire in a tight loop.
    pub async fn mark_fired(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut schedule = self.get(id).await?;
        schedule.last_run = Some(now);
        schedule.next_due = CronExpr::parse(&schedule.cron)
            .ok()
            .and_then(|cron| cron.next_after(now));
        self.persist(&schedule).await
    }

    async fn persist(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(schedule).map_err(|e| StoreError::Corrupt {
            path: self.path(&schedule.id),
            reason: e.to_string(),
        })?;
        tokio::fs::write(self.path(&schedule.id), raw).await?;
        Ok(())
    }
}
