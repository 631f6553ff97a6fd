//! Daily send cap, persisted between runs as a small JSON file.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyQuota {
    pub limit: u32,
    pub used: u32,
    pub day: NaiveDate,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl DailyQuota {
    pub fn new(limit: u32, day: NaiveDate) -> Self {
        Self {
            limit,
            used: 0,
            day,
            path: None,
        }
    }

    /// Load the counter from `path`, starting fresh when the file is missing or
    /// unreadable. The configured `limit` always wins over the stored one.
    pub fn load_or_new(path: impl AsRef<Path>, limit: u32, today: NaiveDate) -> Result<Self> {
        let path = path.as_ref();
        let mut quota = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<DailyQuota>(&contents) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt quota state");
                    Self::new(limit, today)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::new(limit, today),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read quota state {}", path.display()));
            }
        };
        quota.limit = limit;
        quota.path = Some(path.to_path_buf());
        quota.roll_over(today);
        Ok(quota)
    }

    /// Write the counter back to the file it was loaded from, if any.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write quota state {}", path.display()))
    }

    /// Reset the counter when the day has changed.
    pub fn roll_over(&mut self, today: NaiveDate) {
        if self.day != today {
            info!(previous_day = %self.day, used = self.used, "New day — resetting daily quota");
            self.day = today;
            self.used = 0;
        }
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn consume(&mut self) {
        self.used = self.used.saturating_add(1);
    }
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}
