use std::convert::TryFrom;

use async_trait::async_trait;
use sqlx::types::Json;
use time::OffsetDateTime;

use crate::{
    application::{
        jobs::RENDER_JOB_TYPE,
        repos::{JobQueue, RepoError},
    },
    domain::{
        entities::{JobRecord, NewRenderJob, QueueCounts, RenderJobPayload},
        types::JobState,
    },
};

use super::{PostgresRepositories, map_sqlx_error, util::convert_count};

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job: Json<RenderJobPayload>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    priority: Option<i32>,
    run_at: OffsetDateTime,
    last_error: Option<String>,
    lock_by: Option<String>,
    done_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = job_state(&row.status, row.attempts >= row.max_attempts)?;

        Ok(Self {
            id: row.id,
            payload: row.job.0,
            state,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            priority: row.priority.unwrap_or(0),
            run_at: row.run_at,
            last_error: row.last_error,
            locked_by: row.lock_by,
            done_at: row.done_at,
        })
    }
}

/// Map an apalis status onto the render job lifecycle.
///
/// apalis re-fetches `Failed` rows while attempts remain, so those are still
/// waiting. Aborted jobs are `Killed` at any attempt; only exhausted ones are
/// dead letters.
fn job_state(status: &str, exhausted: bool) -> Result<JobState, RepoError> {
    let state = match status {
        "Pending" | "Scheduled" | "Retry" => JobState::Pending,
        "Running" => JobState::Running,
        "Done" => JobState::Done,
        "Failed" if !exhausted => JobState::Pending,
        "Failed" | "Killed" if exhausted => JobState::Killed,
        "Killed" => JobState::Failed,
        other => {
            return Err(RepoError::from_persistence(format!(
                "unknown job state `{other}`"
            )));
        }
    };
    Ok(state)
}

#[async_trait]
impl JobQueue for PostgresRepositories {
    async fn enqueue(&self, job: NewRenderJob) -> Result<String, RepoError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id
            "#,
        )
        .bind(RENDER_JOB_TYPE)
        .bind(Json(&job.payload))
        .bind("Pending")
        .bind(job.run_at)
        .bind(job.max_attempts)
        .bind(job.priority)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn defer(&self, id: &str, run_at: OffsetDateTime) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE apalis.jobs
               SET run_at = $3
             WHERE id = $1
               AND job_type = $2
            "#,
        )
        .bind(id)
        .bind(RENDER_JOB_TYPE)
        .bind(run_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<JobRecord>, RepoError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id,
                   job,
                   status,
                   attempts,
                   max_attempts,
                   priority,
                   run_at,
                   last_error,
                   lock_by,
                   done_at
              FROM apalis.jobs
             WHERE id = $1
               AND job_type = $2
            "#,
        )
        .bind(id)
        .bind(RENDER_JOB_TYPE)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn counts(&self) -> Result<QueueCounts, RepoError> {
        let rows: Vec<(String, bool, i64)> = sqlx::query_as(
            r#"
            SELECT status, attempts >= max_attempts AS exhausted, COUNT(*)
              FROM apalis.jobs
             WHERE job_type = $1
             GROUP BY 1, 2
            "#,
        )
        .bind(RENDER_JOB_TYPE)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let mut counts = QueueCounts::default();
        for (status, exhausted, count) in rows {
            let count = convert_count(count)?;
            match job_state(&status, exhausted)? {
                JobState::Pending => counts.waiting += count,
                JobState::Running => counts.active += count,
                JobState::Done => counts.completed += count,
                JobState::Failed => counts.failed += count,
                JobState::Killed => {
                    counts.failed += count;
                    counts.dead_lettered += count;
                }
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_rows_with_attempts_left_are_still_waiting() {
        assert_eq!(job_state("Failed", false).unwrap(), JobState::Pending);
        assert_eq!(job_state("Failed", true).unwrap(), JobState::Killed);
    }

    #[test]
    fn aborted_rows_are_terminal_unless_exhausted() {
        assert_eq!(job_state("Killed", false).unwrap(), JobState::Failed);
        assert_eq!(job_state("Killed", true).unwrap(), JobState::Killed);
    }

    #[test]
    fn queued_statuses_wait_and_unknown_ones_are_rejected() {
        for status in ["Pending", "Scheduled", "Retry"] {
            assert_eq!(job_state(status, false).unwrap(), JobState::Pending);
        }
        assert_eq!(job_state("Running", true).unwrap(), JobState::Running);
        assert_eq!(job_state("Done", true).unwrap(), JobState::Done);
        assert!(matches!(
            job_state("Paused", false),
            Err(RepoError::Persistence(_))
        ));
    }
}
