//! Repository traits over pooled connections.

use std::future::Future;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use jiff_diesel::Timestamp;

use crate::PgConnection;
use crate::error::{PgError, PgResult};
use crate::model::{CrawlResultRow, SurveyRow, TaskRow, UpdateTaskRow};
use crate::schema;

/// Status labels that end the task lifecycle; guarded updates use this
/// list so a terminal row is never overwritten.
pub const TERMINAL_STATUSES: [&str; 3] = ["completed", "failed", "timeout"];

/// Repository for task registry operations.
pub trait TaskRepository {
    /// Inserts a new task row. The primary key enforces single-flight.
    fn insert_task(&mut self, row: TaskRow) -> impl Future<Output = PgResult<TaskRow>> + Send;

    /// Finds a task by id.
    fn find_task(
        &mut self,
        task_id: &str,
    ) -> impl Future<Output = PgResult<Option<TaskRow>>> + Send;

    /// Applies a changeset to a task. When `guard_terminal` is set the
    /// update skips rows already in a terminal status. Returns whether a
    /// row was updated.
    fn update_task(
        &mut self,
        task_id: &str,
        changes: UpdateTaskRow,
        guard_terminal: bool,
    ) -> impl Future<Output = PgResult<bool>> + Send;

    /// Lists tasks newest-first, optionally filtered by status label.
    fn list_tasks(
        &mut self,
        status: Option<String>,
        limit: i64,
    ) -> impl Future<Output = PgResult<Vec<TaskRow>>> + Send;

    /// Deletes a task. Returns whether it existed.
    fn delete_task(&mut self, task_id: &str) -> impl Future<Output = PgResult<bool>> + Send;

    /// Counts tasks whose status is non-terminal.
    fn count_active_tasks(&mut self) -> impl Future<Output = PgResult<i64>> + Send;

    /// Deletes tasks past their expiration. Returns the count removed.
    fn delete_expired_tasks(
        &mut self,
        now: Timestamp,
    ) -> impl Future<Output = PgResult<usize>> + Send;
}

impl TaskRepository for PgConnection {
    async fn insert_task(&mut self, row: TaskRow) -> PgResult<TaskRow> {
        use schema::tasks;

        diesel::insert_into(tasks::table)
            .values(&row)
            .returning(TaskRow::as_returning())
            .get_result(self)
            .await
            .map_err(PgError::from)
    }

    async fn find_task(&mut self, task_id: &str) -> PgResult<Option<TaskRow>> {
        use schema::tasks::{self, dsl};

        tasks::table
            .filter(dsl::task_id.eq(task_id))
            .select(TaskRow::as_select())
            .first(self)
            .await
            .optional()
            .map_err(PgError::from)
    }

    async fn update_task(
        &mut self,
        task_id: &str,
        changes: UpdateTaskRow,
        guard_terminal: bool,
    ) -> PgResult<bool> {
        use schema::tasks::dsl;

        let updated = if guard_terminal {
            diesel::update(
                dsl::tasks
                    .filter(dsl::task_id.eq(task_id))
                    .filter(dsl::status.ne_all(TERMINAL_STATUSES)),
            )
            .set(&changes)
            .execute(self)
            .await
        } else {
            diesel::update(dsl::tasks.filter(dsl::task_id.eq(task_id)))
                .set(&changes)
                .execute(self)
                .await
        }
        .map_err(PgError::from)?;

        Ok(updated > 0)
    }

    async fn list_tasks(
        &mut self,
        status: Option<String>,
        limit: i64,
    ) -> PgResult<Vec<TaskRow>> {
        use schema::tasks::{self, dsl};

        let mut query = tasks::table.select(TaskRow::as_select()).into_boxed();
        if let Some(status) = status {
            query = query.filter(dsl::status.eq(status));
        }
        query
            .order(dsl::created_at.desc())
            .limit(limit)
            .load(self)
            .await
            .map_err(PgError::from)
    }

    async fn delete_task(&mut self, task_id: &str) -> PgResult<bool> {
        use schema::tasks::dsl;

        let deleted = diesel::delete(dsl::tasks.filter(dsl::task_id.eq(task_id)))
            .execute(self)
            .await
            .map_err(PgError::from)?;
        Ok(deleted > 0)
    }

    async fn count_active_tasks(&mut self) -> PgResult<i64> {
        use schema::tasks::{self, dsl};

        tasks::table
            .filter(dsl::status.ne_all(TERMINAL_STATUSES))
            .count()
            .get_result(self)
            .await
            .map_err(PgError::from)
    }

    async fn delete_expired_tasks(&mut self, now: Timestamp) -> PgResult<usize> {
        use schema::tasks::dsl;

        diesel::delete(dsl::tasks.filter(dsl::expire_at.lt(now)))
            .execute(self)
            .await
            .map_err(PgError::from)
    }
}

/// Repository for survey results and crawl handoffs.
pub trait SurveyRepository {
    /// Upserts a survey result row by task id.
    fn upsert_survey(&mut self, row: SurveyRow) -> impl Future<Output = PgResult<()>> + Send;

    /// Finds a survey result by task id.
    fn find_survey(
        &mut self,
        task_id: &str,
    ) -> impl Future<Output = PgResult<Option<SurveyRow>>> + Send;

    /// Lists survey results newest-first with optional status filter.
    fn list_surveys(
        &mut self,
        status: Option<String>,
        limit: i64,
        skip: i64,
    ) -> impl Future<Output = PgResult<Vec<SurveyRow>>> + Send;

    /// Updates the status label of a survey result.
    fn update_survey_status(
        &mut self,
        task_id: &str,
        status: String,
    ) -> impl Future<Output = PgResult<bool>> + Send;

    /// Deletes a survey result. Returns whether it existed.
    fn delete_survey(&mut self, task_id: &str) -> impl Future<Output = PgResult<bool>> + Send;

    /// Counts all survey results and the completed subset.
    fn count_surveys(&mut self) -> impl Future<Output = PgResult<(i64, i64)>> + Send;

    /// Creation instant of the newest survey result.
    fn latest_survey_at(
        &mut self,
    ) -> impl Future<Output = PgResult<Option<Timestamp>>> + Send;

    /// Upserts crawl results for a task.
    fn upsert_crawl_results(
        &mut self,
        row: CrawlResultRow,
    ) -> impl Future<Output = PgResult<()>> + Send;

    /// Fetches crawl results for a task.
    fn find_crawl_results(
        &mut self,
        task_id: &str,
    ) -> impl Future<Output = PgResult<Option<serde_json::Value>>> + Send;

    /// Deletes crawl results. Returns whether they existed.
    fn delete_crawl_results(
        &mut self,
        task_id: &str,
    ) -> impl Future<Output = PgResult<bool>> + Send;
}

impl SurveyRepository for PgConnection {
    async fn upsert_survey(&mut self, row: SurveyRow) -> PgResult<()> {
        use schema::surveys::dsl;

        diesel::insert_into(dsl::surveys)
            .values(&row)
            .on_conflict(dsl::task_id)
            .do_update()
            .set((
                dsl::title.eq(&row.title),
                dsl::survey_data.eq(&row.survey_data),
                dsl::created_at.eq(&row.created_at),
                dsl::status.eq(&row.status),
                dsl::cite_ratio.eq(row.cite_ratio),
                dsl::content_length.eq(row.content_length),
                dsl::references_count.eq(row.references_count),
            ))
            .execute(self)
            .await
            .map_err(PgError::from)?;
        Ok(())
    }

    async fn find_survey(&mut self, task_id: &str) -> PgResult<Option<SurveyRow>> {
        use schema::surveys::{self, dsl};

        surveys::table
            .filter(dsl::task_id.eq(task_id))
            .select(SurveyRow::as_select())
            .first(self)
            .await
            .optional()
            .map_err(PgError::from)
    }

    async fn list_surveys(
        &mut self,
        status: Option<String>,
        limit: i64,
        skip: i64,
    ) -> PgResult<Vec<SurveyRow>> {
        use schema::surveys::{self, dsl};

        let mut query = surveys::table.select(SurveyRow::as_select()).into_boxed();
        if let Some(status) = status {
            query = query.filter(dsl::status.eq(status));
        }
        query
            .order(dsl::created_at.desc())
            .offset(skip)
            .limit(limit)
            .load(self)
            .await
            .map_err(PgError::from)
    }

    async fn update_survey_status(&mut self, task_id: &str, status: String) -> PgResult<bool> {
        use schema::surveys::dsl;

        let updated = diesel::update(dsl::surveys.filter(dsl::task_id.eq(task_id)))
            .set(dsl::status.eq(status))
            .execute(self)
            .await
            .map_err(PgError::from)?;
        Ok(updated > 0)
    }

    async fn delete_survey(&mut self, task_id: &str) -> PgResult<bool> {
        use schema::surveys::dsl;

        let deleted = diesel::delete(dsl::surveys.filter(dsl::task_id.eq(task_id)))
            .execute(self)
            .await
            .map_err(PgError::from)?;
        Ok(deleted > 0)
    }

    async fn count_surveys(&mut self) -> PgResult<(i64, i64)> {
        use schema::surveys::{self, dsl};

        let total: i64 = surveys::table
            .count()
            .get_result(self)
            .await
            .map_err(PgError::from)?;
        let completed: i64 = surveys::table
            .filter(dsl::status.eq("completed"))
            .count()
            .get_result(self)
            .await
            .map_err(PgError::from)?;
        Ok((total, completed))
    }

    async fn latest_survey_at(&mut self) -> PgResult<Option<Timestamp>> {
        use schema::surveys::{self, dsl};

        surveys::table
            .order(dsl::created_at.desc())
            .select(dsl::created_at)
            .first(self)
            .await
            .optional()
            .map_err(PgError::from)
    }

    async fn upsert_crawl_results(&mut self, row: CrawlResultRow) -> PgResult<()> {
        use schema::crawl_results::dsl;

        diesel::insert_into(dsl::crawl_results)
            .values(&row)
            .on_conflict(dsl::task_id)
            .do_update()
            .set((dsl::data.eq(&row.data), dsl::created_at.eq(&row.created_at)))
            .execute(self)
            .await
            .map_err(PgError::from)?;
        Ok(())
    }

    async fn find_crawl_results(
        &mut self,
        task_id: &str,
    ) -> PgResult<Option<serde_json::Value>> {
        use schema::crawl_results::{self, dsl};

        crawl_results::table
            .filter(dsl::task_id.eq(task_id))
            .select(dsl::data)
            .first(self)
            .await
            .optional()
            .map_err(PgError::from)
    }

    async fn delete_crawl_results(&mut self, task_id: &str) -> PgResult<bool> {
        use schema::crawl_results::dsl;

        let deleted = diesel::delete(dsl::crawl_results.filter(dsl::task_id.eq(task_id)))
            .execute(self)
            .await
            .map_err(PgError::from)?;
        Ok(deleted > 0)
    }
}
