use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerSettings;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule interval {0:?}: expected 'daily' or 'x hours'")]
    InvalidInterval(String),
    #[error("scheduler request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("scheduler returned {status}: {body}")]
    Response { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    ScheduledBackup,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ScheduledBackup => "scheduled_backup",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub subject_id: String,
    pub job_type: String,
    pub repeat_interval: String,
}

/// External job scheduler consumed for requeueing failed scheduled backups.
#[async_trait]
pub trait ScheduleClient: Send + Sync {
    async fn schedule(
        &self,
        subject_id: &str,
        job: JobType,
        repeat_interval: &str,
    ) -> Result<(), ScheduleError>;

    async fn get_schedule(
        &self,
        subject_id: &str,
        job: JobType,
    ) -> Result<Option<Schedule>, ScheduleError>;

    async fn cancel_schedule(&self, subject_id: &str, job: JobType) -> Result<(), ScheduleError>;
}

pub struct HttpScheduleClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpScheduleClient {
    pub fn new(settings: &SchedulerSettings) -> Result<Self, ScheduleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(HttpScheduleClient {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, subject_id: &str, job: JobType) -> String {
        format!("{}/jobs/{}/{subject_id}", self.base_url, job.as_str())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ScheduleError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScheduleError::Response {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ScheduleClient for HttpScheduleClient {
    async fn schedule(
        &self,
        subject_id: &str,
        job: JobType,
        repeat_interval: &str,
    ) -> Result<(), ScheduleError> {
        let body = Schedule {
            subject_id: subject_id.to_string(),
            job_type: job.as_str().to_string(),
            repeat_interval: repeat_interval.to_string(),
        };
        let response = self
            .client
            .put(self.url(subject_id, job))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_schedule(
        &self,
        subject_id: &str,
        job: JobType,
    ) -> Result<Option<Schedule>, ScheduleError> {
        let response = self.client.get(self.url(subject_id, job)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn cancel_schedule(&self, subject_id: &str, job: JobType) -> Result<(), ScheduleError> {
        let response = self.client.delete(self.url(subject_id, job)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

/// Turns a plan backup interval (`daily` or `x hours`) into a concrete cron
/// expression whose first firing is `after_minutes` from `now`.
pub fn cron_with_interval_after(
    interval: &str,
    after_minutes: i64,
    now: DateTime<Utc>,
) -> Result<String, ScheduleError> {
    let at = now + chrono::Duration::minutes(after_minutes);
    let hour = at.hour() as i64;
    let minute = at.minute();

    if interval == "daily" {
        return Ok(format!("{minute} {hour} * * *"));
    }

    if let Some(rest) = interval.strip_suffix("hours").map(str::trim) {
        let every: i64 = rest
            .trim()
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(interval.to_string()))?;
        if !(1..=24).contains(&every) {
            return Err(ScheduleError::InvalidInterval(interval.to_string()));
        }
        if every == 24 {
            return Ok(format!("{minute} {hour} * * *"));
        }
        let mut hours = vec![hour];
        let mut nth = hour;
        while nth + every < 24 {
            nth += every;
            hours.push(nth);
        }
        nth = hour;
        while nth - every >= 0 {
            nth -= every;
            hours.push(nth);
        }
        // an interval that does not divide 24 still gets a midnight run
        if 24 % every != 0 && !hours.contains(&0) {
            hours.push(0);
        }
        hours.sort_unstable();
        let joined = hours
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(",");
        return Ok(format!("{minute} {joined} * * *"));
    }

    Err(ScheduleError::InvalidInterval(interval.to_string()))
}
