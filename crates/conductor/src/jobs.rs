use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::agent::Agent;
use crate::errors::{AgentError, AgentResult};

pub type JobHandler =
    Arc<dyn for<'a> Fn(&'a Agent) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Work to run against an agent on a cron schedule. Running it is up to a [`JobScheduler`].
#[derive(Clone)]
pub struct Job {
    pub name: String,
    /// As given, five or six fields
    pub schedule: String,
    /// IANA name handed to the scheduler; [`Job::next_run`] is always in UTC
    pub timezone: Option<String>,
    parsed: Schedule,
    handler: JobHandler,
}

/// Standard five field cron expressions gain a leading seconds field
fn normalize(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

impl Job {
    pub fn new<N, S, F>(name: N, schedule: S, handler: F) -> AgentResult<Self>
    where
        N: Into<String>,
        S: Into<String>,
        F: for<'a> Fn(&'a Agent) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        let name = name.into();
        let schedule = schedule.into();
        if name.trim().is_empty() {
            return Err(AgentError::InvalidJob("job name is empty".to_string()));
        }

        let parsed = Schedule::from_str(&normalize(&schedule)).map_err(|e| {
            AgentError::InvalidJob(format!("{}: invalid schedule '{}': {}", name, schedule, e))
        })?;

        Ok(Self {
            name,
            schedule,
            timezone: None,
            parsed,
            handler: Arc::new(handler),
        })
    }

    pub fn with_timezone<T: Into<String>>(mut self, timezone: T) -> AgentResult<Self> {
        let timezone = timezone.into();
        if timezone.trim().is_empty() {
            return Err(AgentError::InvalidJob(format!(
                "{}: timezone must not be empty",
                self.name
            )));
        }
        self.timezone = Some(timezone);
        Ok(self)
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run_after(&Utc::now())
    }

    pub fn next_run_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.parsed.after(after).next()
    }

    pub async fn run(&self, agent: &Agent) -> Result<()> {
        tracing::info!(job = %self.name, "running job");
        (self.handler)(agent).await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("timezone", &self.timezone)
            .finish()
    }
}

/// Something that owns timers. The agent only hands jobs over and takes them back.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job: Job) -> Result<()>;

    async fn cancel(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noop(_agent: &Agent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_five_field_expression_is_accepted() {
        let job = Job::new("digest", "30 9 * * *", noop).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let next = job.next_run_after(&after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap());
        assert_eq!(job.schedule, "30 9 * * *");
    }

    #[test]
    fn test_six_field_expression_is_kept() {
        let job = Job::new("tick", "*/15 * * * * *", noop).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();

        let next = job.next_run_after(&after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 15).unwrap());
        assert!(job.next_run().is_some());
    }

    #[test]
    fn test_invalid_jobs() {
        assert!(matches!(
            Job::new("bad", "every tuesday", noop),
            Err(AgentError::InvalidJob(_))
        ));
        assert!(matches!(
            Job::new("  ", "* * * * *", noop),
            Err(AgentError::InvalidJob(_))
        ));

        let job = Job::new("ok", "* * * * *", noop).unwrap();
        assert!(job.clone().with_timezone("").is_err());
        assert_eq!(
            job.with_timezone("Europe/Paris").unwrap().timezone.as_deref(),
            Some("Europe/Paris")
        );
    }
}
