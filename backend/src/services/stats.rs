//! Active-user statistics.

use chrono::{DateTime, Datelike, Utc};
use dashmap::{DashMap, DashSet};

#[cfg_attr(test, mockall::automock)]
pub trait StatReporter: Send + Sync {
    fn report_active_user(&self, user_id: &str) -> anyhow::Result<()>;
}

/// Counts distinct authenticated users per calendar month.
#[derive(Default)]
pub struct ActiveUserStats {
    months: DashMap<String, DashSet<String>>,
}

impl ActiveUserStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn month_key(at: DateTime<Utc>) -> String {
        format!("{:04}{:02}", at.year(), at.month())
    }

    pub fn record_at(&self, user_id: &str, at: DateTime<Utc>) {
        self.months
            .entry(Self::month_key(at))
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn active_users(&self, month: &str) -> usize {
        self.months.get(month).map_or(0, |users| users.len())
    }
}

impl StatReporter for ActiveUserStats {
    fn report_active_user(&self, user_id: &str) -> anyhow::Result<()> {
        if user_id.trim().is_empty() {
            anyhow::bail!("blank user id");
        }
        self.record_at(user_id, Utc::now());
        Ok(())
    }
}
