use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use tollgate_core::domain::approval::{
    normalize_role, ApprovalLevel, ApprovalRequest, ApprovalRequestId, EntityType, LevelStatus,
    Priority, RequestStatus,
};
use tollgate_core::domain::dispatch::DispatchTask;
use tollgate_core::ports::{ApprovalQueries, ApprovalStore, CommitOutcome, StoreError};
use tollgate_core::query::{
    rank_approvers, start_of_day, ApprovalFilter, ApprovalStats, Page, PageRequest,
};

use super::dispatch_queue::insert_task;
use super::{
    encode_optional_timestamp, encode_timestamp, parse_decimal, parse_enum,
    parse_optional_timestamp, parse_timestamp, parse_u32, parse_u64, RepositoryError,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "r.id,
    r.entity_type,
    r.entity_id,
    r.title,
    r.description,
    r.amount,
    r.metadata_json,
    r.requested_by,
    r.requested_at,
    r.current_level,
    r.total_levels,
    r.status,
    r.priority,
    r.completed_at,
    r.state_version,
    r.updated_at";

const ACTIVE_LEVEL_JOIN: &str =
    "JOIN approval_level l ON l.request_id = r.id AND l.level = r.current_level";

const INBOX_ORDER: &str = "ORDER BY
    CASE r.priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
    r.requested_at DESC,
    r.id ASC";

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_request(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approval_request (
                id,
                entity_type,
                entity_id,
                title,
                description,
                amount,
                metadata_json,
                requested_by,
                requested_at,
                current_level,
                total_levels,
                status,
                priority,
                completed_at,
                state_version,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(request.entity_type.as_str())
        .bind(&request.entity_id)
        .bind(&request.title)
        .bind(request.description.as_deref())
        .bind(request.amount.to_string())
        .bind(request.metadata.to_string())
        .bind(&request.requested_by)
        .bind(encode_timestamp(request.requested_at))
        .bind(i64::from(request.current_level))
        .bind(i64::from(request.total_levels))
        .bind(request.status.as_str())
        .bind(request.priority.as_str())
        .bind(encode_optional_timestamp(request.completed_at))
        .bind(i64::from(request.state_version))
        .bind(encode_timestamp(request.updated_at))
        .execute(&mut *tx)
        .await?;

        for level in &request.levels {
            insert_level(&mut tx, &request.id, level).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_request(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM approval_request r WHERE r.id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        dispatch: Option<&DispatchTask>,
    ) -> Result<CommitOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE approval_request SET
                current_level = ?,
                status = ?,
                completed_at = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(i64::from(request.current_level))
        .bind(request.status.as_str())
        .bind(encode_optional_timestamp(request.completed_at))
        .bind(i64::from(request.state_version))
        .bind(encode_timestamp(request.updated_at))
        .bind(&request.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(
                event_name = "approval.commit.conflict",
                request_id = %request.id,
                expected_version,
                "state_version moved before commit"
            );
            return Ok(CommitOutcome::Conflict);
        }

        for level in &request.levels {
            sqlx::query(
                "UPDATE approval_level SET
                    status = ?,
                    approved_by = ?,
                    approved_at = ?,
                    comments = ?
                 WHERE request_id = ? AND level = ?",
            )
            .bind(level.status.as_str())
            .bind(level.approved_by.as_deref())
            .bind(encode_optional_timestamp(level.approved_at))
            .bind(level.comments.as_deref())
            .bind(&request.id.0)
            .bind(i64::from(level.level))
            .execute(&mut *tx)
            .await?;
        }

        if let Some(task) = dispatch {
            insert_task(&mut tx, task).await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    /// Decodes request rows and attaches their levels, preserving row order.
    async fn hydrate(&self, rows: Vec<SqliteRow>) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut requests = rows.into_iter().map(request_from_row).collect::<Result<Vec<_>, _>>()?;
        if requests.is_empty() {
            return Ok(requests);
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT
                request_id,
                level,
                approver_role,
                approver_ids_json,
                amount_threshold,
                status,
                approved_by,
                approved_at,
                comments
             FROM approval_level
             WHERE request_id IN (",
        );
        let mut ids = builder.separated(", ");
        for request in &requests {
            ids.push_bind(request.id.0.clone());
        }
        ids.push_unseparated(") ORDER BY request_id ASC, level ASC");

        let mut levels: HashMap<String, Vec<ApprovalLevel>> = HashMap::new();
        for row in builder.build().fetch_all(&self.pool).await? {
            let request_id: String = row.try_get("request_id")?;
            levels.entry(request_id).or_default().push(level_from_row(&row)?);
        }

        for request in &mut requests {
            request.levels = levels.remove(&request.id.0).unwrap_or_default();
        }
        Ok(requests)
    }

    async fn pending_for_role(
        &self,
        role: &str,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, RepositoryError> {
        let role_key = normalize_role(role);

        let count_sql = format!(
            "SELECT COUNT(*) AS count FROM approval_request r {ACTIVE_LEVEL_JOIN}
             WHERE r.status = 'pending' AND l.approver_role_key = ?"
        );
        let total: i64 = sqlx::query(&count_sql)
            .bind(&role_key)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        let items_sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request r {ACTIVE_LEVEL_JOIN}
             WHERE r.status = 'pending' AND l.approver_role_key = ?
             {INBOX_ORDER}
             LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&items_sql)
            .bind(&role_key)
            .bind(i64::from(page.limit))
            .bind(offset(page))
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(self.hydrate(rows).await?, parse_u64("count", total)?, page))
    }

    async fn list_filtered(
        &self,
        filter: &ApprovalFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, RepositoryError> {
        let mut count: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM approval_request r");
        push_filter(&mut count, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get("count")?;

        let mut items: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {REQUEST_COLUMNS} FROM approval_request r"));
        push_filter(&mut items, filter);
        items.push(" ORDER BY r.requested_at DESC, r.id ASC LIMIT ");
        items.push_bind(i64::from(page.limit));
        items.push(" OFFSET ");
        items.push_bind(offset(page));
        let rows = items.build().fetch_all(&self.pool).await?;

        Ok(Page::new(self.hydrate(rows).await?, parse_u64("count", total)?, page))
    }

    async fn decided_history(
        &self,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, RepositoryError> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM approval_request
             WHERE status IN ('approved', 'rejected')",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request r
             WHERE r.status IN ('approved', 'rejected')
             ORDER BY r.completed_at DESC, r.id ASC
             LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(page.limit))
            .bind(offset(page))
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(self.hydrate(rows).await?, parse_u64("count", total)?, page))
    }

    async fn search_requests(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", escape_like(&needle));

        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request r
             WHERE lower(r.id) LIKE ? ESCAPE '\\' OR lower(r.title) LIKE ? ESCAPE '\\'
             ORDER BY r.requested_at DESC, r.id ASC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(&pattern)
            .bind(&pattern)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        self.hydrate(rows).await
    }

    async fn aggregate_stats(&self, now: DateTime<Utc>) -> Result<ApprovalStats, RepositoryError> {
        let mut stats = ApprovalStats {
            by_status: self.count_by("status").await?,
            by_entity_type: self.count_by("entity_type").await?,
            by_priority: self.count_by("priority").await?,
            ..ApprovalStats::default()
        };

        let pending = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN current_level = 1 THEN 1 ELSE 0 END), 0) AS first_level,
                COALESCE(SUM(CASE WHEN current_level > 1 THEN 1 ELSE 0 END), 0) AS under_review
             FROM approval_request
             WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.pending_first_level = parse_u64("first_level", pending.try_get("first_level")?)?;
        stats.under_review = parse_u64("under_review", pending.try_get("under_review")?)?;

        // Amounts are stored as exact decimal text, so the sum is taken here.
        let amounts = sqlx::query("SELECT amount FROM approval_request WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await?;
        stats.total_pending_amount = amounts
            .into_iter()
            .map(|row| -> Result<Decimal, RepositoryError> {
                parse_decimal("amount", row.try_get("amount")?)
            })
            .sum::<Result<Decimal, RepositoryError>>()?;

        let approved = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN completed_at >= ? THEN 1 ELSE 0 END), 0) AS approved_today,
                AVG((julianday(completed_at) - julianday(requested_at)) * 24.0) AS avg_hours
             FROM approval_request
             WHERE status = 'approved' AND completed_at IS NOT NULL",
        )
        .bind(encode_timestamp(start_of_day(now)))
        .fetch_one(&self.pool)
        .await?;
        stats.approved_today = parse_u64("approved_today", approved.try_get("approved_today")?)?;
        stats.avg_hours_to_approval = approved.try_get::<Option<f64>, _>("avg_hours")?;

        let tallies = sqlx::query(
            "SELECT approved_by, COUNT(*) AS decisions
             FROM approval_level
             WHERE status IN ('approved', 'rejected') AND approved_by IS NOT NULL
             GROUP BY approved_by",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<(String, u64), RepositoryError> {
            let approver: String = row.try_get("approved_by")?;
            let decisions = parse_u64("decisions", row.try_get("decisions")?)?;
            Ok((approver, decisions))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;
        stats.top_approvers = rank_approvers(tallies);

        Ok(stats)
    }

    async fn count_by(
        &self,
        column: &'static str,
    ) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let sql = format!(
            "SELECT {column} AS bucket, COUNT(*) AS count FROM approval_request GROUP BY {column}"
        );
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| -> Result<(String, u64), RepositoryError> {
                let bucket: String = row.try_get("bucket")?;
                Ok((bucket, parse_u64("count", row.try_get("count")?)?))
            })
            .collect()
    }
}

#[async_trait]
impl ApprovalStore for SqlApprovalRepository {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        Ok(self.insert_request(request).await?)
    }

    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.find_request(id).await?)
    }

    async fn commit_decision(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        dispatch: Option<&DispatchTask>,
    ) -> Result<CommitOutcome, StoreError> {
        Ok(self.commit(request, expected_version, dispatch).await?)
    }
}

#[async_trait]
impl ApprovalQueries for SqlApprovalRepository {
    async fn list_pending_for_role(
        &self,
        role: &str,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, StoreError> {
        Ok(self.pending_for_role(role, page).await?)
    }

    async fn list(
        &self,
        filter: &ApprovalFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, StoreError> {
        Ok(self.list_filtered(filter, page).await?)
    }

    async fn history(&self, page: PageRequest) -> Result<Page<ApprovalRequest>, StoreError> {
        Ok(self.decided_history(page).await?)
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(self.search_requests(query, limit).await?)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<ApprovalStats, StoreError> {
        Ok(self.aggregate_stats(now).await?)
    }
}

async fn insert_level(
    conn: &mut SqliteConnection,
    request_id: &ApprovalRequestId,
    level: &ApprovalLevel,
) -> Result<(), RepositoryError> {
    let approver_ids = serde_json::to_string(&level.approver_ids)
        .map_err(|error| RepositoryError::Decode(format!("approver ids: {error}")))?;

    sqlx::query(
        "INSERT INTO approval_level (
            request_id,
            level,
            approver_role,
            approver_role_key,
            approver_ids_json,
            amount_threshold,
            status,
            approved_by,
            approved_at,
            comments
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&request_id.0)
    .bind(i64::from(level.level))
    .bind(&level.approver_role)
    .bind(normalize_role(&level.approver_role))
    .bind(approver_ids)
    .bind(level.amount_threshold.to_string())
    .bind(level.status.as_str())
    .bind(level.approved_by.as_deref())
    .bind(encode_optional_timestamp(level.approved_at))
    .bind(level.comments.as_deref())
    .execute(conn)
    .await?;

    Ok(())
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ApprovalFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(status) = filter.status {
        builder.push(" AND r.status = ").push_bind(status.as_str());
    }
    if let Some(entity_type) = filter.entity_type {
        builder.push(" AND r.entity_type = ").push_bind(entity_type.as_str());
    }
    if let Some(priority) = filter.priority {
        builder.push(" AND r.priority = ").push_bind(priority.as_str());
    }
    if let Some(from) = filter.requested_from {
        builder.push(" AND r.requested_at >= ").push_bind(encode_timestamp(from));
    }
    if let Some(to) = filter.requested_to {
        builder.push(" AND r.requested_at <= ").push_bind(encode_timestamp(to));
    }
}

fn offset(page: PageRequest) -> i64 {
    i64::try_from(page.offset()).unwrap_or(i64::MAX)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn request_from_row(row: SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let metadata_raw: String = row.try_get("metadata_json")?;
    let metadata = serde_json::from_str(&metadata_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid metadata_json: {error}")))?;

    Ok(ApprovalRequest {
        id: ApprovalRequestId(row.try_get("id")?),
        entity_type: parse_enum("entity type", row.try_get("entity_type")?, EntityType::parse)?,
        entity_id: row.try_get("entity_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        amount: parse_decimal("amount", row.try_get("amount")?)?,
        metadata,
        requested_by: row.try_get("requested_by")?,
        requested_at: parse_timestamp("requested_at", row.try_get("requested_at")?)?,
        current_level: parse_u32("current_level", row.try_get("current_level")?)?,
        total_levels: parse_u32("total_levels", row.try_get("total_levels")?)?,
        levels: Vec::new(),
        status: parse_enum("request status", row.try_get("status")?, RequestStatus::parse)?,
        priority: parse_enum("priority", row.try_get("priority")?, Priority::parse)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn level_from_row(row: &SqliteRow) -> Result<ApprovalLevel, RepositoryError> {
    let approver_ids_raw: String = row.try_get("approver_ids_json")?;
    let approver_ids = serde_json::from_str(&approver_ids_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid approver_ids_json: {error}")))?;

    Ok(ApprovalLevel {
        level: parse_u32("level", row.try_get("level")?)?,
        approver_role: row.try_get("approver_role")?,
        approver_ids,
        amount_threshold: parse_decimal("amount_threshold", row.try_get("amount_threshold")?)?,
        status: parse_enum("level status", row.try_get("status")?, LevelStatus::parse)?,
        approved_by: row.try_get("approved_by")?,
        approved_at: parse_optional_timestamp("approved_at", row.try_get("approved_at")?)?,
        comments: row.try_get("comments")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;
    use tollgate_core::domain::approval::{
        ApprovalRequestId, EntityType, LevelStatus, Priority, RequestStatus,
    };
    use tollgate_core::domain::dispatch::{
        CompletionOutcome, DispatchTask, DispatchTaskId, DispatchTaskState,
    };
    use tollgate_core::ports::{
        ApprovalQueries, ApprovalStore, CommitOutcome, DispatchQueue, StoreError,
    };
    use tollgate_core::query::{ApprovalFilter, PageRequest};

    use super::SqlApprovalRepository;
    use crate::repositories::test_support::{parse_ts, pending_request, setup_pool};
    use crate::repositories::SqlDispatchQueueRepository;

    fn approval_task(request_id: &str) -> DispatchTask {
        let at = parse_ts("2026-03-02T11:00:00Z");
        DispatchTask {
            id: DispatchTaskId(format!("DSP-{request_id}")),
            request_id: ApprovalRequestId(request_id.to_string()),
            entity_type: EntityType::Invoice,
            entity_id: format!("invoice-{request_id}"),
            outcome: CompletionOutcome::Approved,
            actor_id: "u-finance".to_string(),
            reason: None,
            state: DispatchTaskState::Queued,
            retry_count: 0,
            max_retries: 5,
            available_at: at,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn insert_and_find_preserve_levels_and_metadata() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());
        let mut request = pending_request("APR-1", EntityType::Journal, 125_000);
        request.levels[1].approver_ids = vec!["u-fm-1".to_string(), "u-fm-2".to_string()];

        repo.insert(&request).await.expect("insert");

        let found = repo.find_by_id(&request.id).await.expect("find");
        assert_eq!(found, Some(request));
        assert_eq!(
            repo.find_by_id(&ApprovalRequestId("APR-missing".to_string())).await.expect("find"),
            None
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_insert_maps_to_duplicate_error() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());
        let request = pending_request("APR-1", EntityType::Invoice, 60_000);

        repo.insert(&request).await.expect("first insert");
        let error = repo.insert(&request).await.expect_err("second insert should fail");

        assert!(matches!(error, StoreError::Duplicate(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn commit_is_compare_and_set_and_writes_outbox_atomically() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());
        let queue = SqlDispatchQueueRepository::new(pool.clone());
        let request = pending_request("APR-1", EntityType::Invoice, 60_000);
        repo.insert(&request).await.expect("insert");

        let decided_at = parse_ts("2026-03-02T11:00:00Z");
        let mut approved = request.clone();
        approved.levels[0].status = LevelStatus::Approved;
        approved.levels[0].approved_by = Some("u-manager".to_string());
        approved.levels[0].approved_at = Some(decided_at);
        approved.levels[1].status = LevelStatus::Approved;
        approved.levels[1].approved_by = Some("u-finance".to_string());
        approved.levels[1].approved_at = Some(decided_at);
        approved.levels[1].comments = Some("ok".to_string());
        approved.current_level = 2;
        approved.status = RequestStatus::Approved;
        approved.completed_at = Some(decided_at);
        approved.state_version = 2;
        approved.updated_at = decided_at;

        let mut rejected = request.clone();
        rejected.status = RequestStatus::Rejected;
        rejected.state_version = 2;

        let task = approval_task("APR-1");
        let won = repo.commit_decision(&approved, 1, Some(&task)).await.expect("commit");
        let lost = repo.commit_decision(&rejected, 1, None).await.expect("stale commit");

        assert_eq!(won, CommitOutcome::Committed);
        assert_eq!(lost, CommitOutcome::Conflict);
        assert_eq!(repo.find_by_id(&request.id).await.expect("find"), Some(approved));
        assert_eq!(queue.list_tasks(None).await.expect("tasks"), vec![task]);

        pool.close().await;
    }

    #[tokio::test]
    async fn failed_outbox_insert_rolls_back_the_decision() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());
        let first = pending_request("APR-1", EntityType::Invoice, 60_000);
        let second = pending_request("APR-2", EntityType::Invoice, 60_000);
        repo.insert(&first).await.expect("insert first");
        repo.insert(&second).await.expect("insert second");

        let mut decided = first.clone();
        decided.status = RequestStatus::Rejected;
        decided.state_version = 2;
        repo.commit_decision(&decided, 1, Some(&approval_task("APR-1"))).await.expect("commit");

        // Reusing the task id forces a unique violation inside the transaction.
        let mut clash = approval_task("APR-1");
        clash.request_id = second.id.clone();
        let mut second_decided = second.clone();
        second_decided.status = RequestStatus::Rejected;
        second_decided.state_version = 2;
        let error = repo
            .commit_decision(&second_decided, 1, Some(&clash))
            .await
            .expect_err("duplicate task id should fail");

        assert!(matches!(error, StoreError::Duplicate(_)));
        let stored = repo.find_by_id(&second.id).await.expect("find").expect("present");
        assert_eq!(stored.status, RequestStatus::Pending);
        assert_eq!(stored.state_version, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn pending_inbox_orders_by_priority_then_newest() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());

        let mut low_new = pending_request("APR-LOW", EntityType::Expense, 10_000);
        low_new.priority = Priority::Low;
        low_new.requested_at = parse_ts("2026-03-03T09:00:00Z");
        let mut high_old = pending_request("APR-HIGH-OLD", EntityType::Payment, 900_000);
        high_old.priority = Priority::High;
        let mut high_new = pending_request("APR-HIGH-NEW", EntityType::Payment, 950_000);
        high_new.priority = Priority::High;
        high_new.requested_at = parse_ts("2026-03-02T12:00:00Z");
        let mut other_role = pending_request("APR-L2", EntityType::Payment, 300_000);
        other_role.current_level = 2;
        other_role.levels[0].status = LevelStatus::Approved;

        for request in [&low_new, &high_old, &high_new, &other_role] {
            repo.insert(request).await.expect("insert");
        }

        let page = repo
            .list_pending_for_role(" manager ", PageRequest::new(1, 2))
            .await
            .expect("inbox");

        let ids: Vec<&str> = page.items.iter().map(|request| request.id.0.as_str()).collect();
        assert_eq!(ids, vec!["APR-HIGH-NEW", "APR-HIGH-OLD"]);
        assert_eq!(page.total, 3);
        assert_eq!(page.pages, 2);

        let second = repo
            .list_pending_for_role("MANAGER", PageRequest::new(2, 2))
            .await
            .expect("inbox page 2");
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].id.0, "APR-LOW");

        let finance = repo
            .list_pending_for_role("finance manager", PageRequest::default())
            .await
            .expect("finance inbox");
        assert_eq!(finance.total, 1);
        assert_eq!(finance.items[0].id.0, "APR-L2");

        pool.close().await;
    }

    #[tokio::test]
    async fn list_filters_and_search_matches_id_or_title() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());

        let mut journal = pending_request("APR-J", EntityType::Journal, 70_000);
        journal.title = "Accrual_reversal 100%".to_string();
        let mut invoice = pending_request("APR-I", EntityType::Invoice, 70_000);
        invoice.requested_at = parse_ts("2026-03-05T09:00:00Z");
        repo.insert(&journal).await.expect("insert journal");
        repo.insert(&invoice).await.expect("insert invoice");

        let journals = repo
            .list(
                &ApprovalFilter { entity_type: Some(EntityType::Journal), ..Default::default() },
                PageRequest::default(),
            )
            .await
            .expect("list journals");
        assert_eq!(journals.total, 1);
        assert_eq!(journals.items[0].id, journal.id);

        let recent = repo
            .list(
                &ApprovalFilter {
                    requested_from: Some(parse_ts("2026-03-04T00:00:00Z")),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .expect("list recent");
        assert_eq!(recent.items.len(), 1);
        assert_eq!(recent.items[0].id, invoice.id);

        let by_title = repo.search("ACCRUAL_", 10).await.expect("search title");
        assert_eq!(by_title.len(), 1);
        assert_eq!(by_title[0].id, journal.id);

        // `_` and `%` are literals, not wildcards.
        assert!(repo.search("accrual%rev", 10).await.expect("search literal").is_empty());
        assert_eq!(repo.search("apr-", 10).await.expect("search ids").len(), 2);
        assert!(repo.search("   ", 10).await.expect("blank search").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn history_and_stats_aggregate_decided_requests() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());
        let now = parse_ts("2026-03-02T18:00:00Z");

        let pending = pending_request("APR-P", EntityType::Invoice, 80_000);
        let mut under_review = pending_request("APR-R", EntityType::Invoice, 250_000);
        under_review.current_level = 2;
        under_review.levels[0].status = LevelStatus::Approved;
        under_review.levels[0].approved_by = Some("u-manager".to_string());

        let mut approved = pending_request("APR-A", EntityType::Payment, 90_000);
        approved.status = RequestStatus::Approved;
        approved.current_level = 2;
        approved.completed_at = Some(approved.requested_at + Duration::hours(4));
        for level in &mut approved.levels {
            level.status = LevelStatus::Approved;
            level.approved_by = Some("u-manager".to_string());
        }

        let mut rejected = pending_request("APR-X", EntityType::Payment, 95_000);
        rejected.status = RequestStatus::Rejected;
        rejected.completed_at = Some(rejected.requested_at + Duration::hours(1));
        rejected.levels[0].status = LevelStatus::Rejected;
        rejected.levels[0].approved_by = Some("u-other".to_string());

        for request in [&pending, &under_review, &approved, &rejected] {
            repo.insert(request).await.expect("insert");
        }

        let history = repo.history(PageRequest::default()).await.expect("history");
        let ids: Vec<&str> = history.items.iter().map(|request| request.id.0.as_str()).collect();
        assert_eq!(ids, vec!["APR-A", "APR-X"]);

        let stats = repo.stats(now).await.expect("stats");
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.by_status.get("approved"), Some(&1));
        assert_eq!(stats.by_entity_type.get("payment"), Some(&2));
        assert_eq!(stats.pending_first_level, 1);
        assert_eq!(stats.under_review, 1);
        assert_eq!(stats.approved_today, 1);
        assert_eq!(stats.total_pending_amount, Decimal::new(330_000, 0));
        let avg = stats.avg_hours_to_approval.expect("average present");
        assert!((avg - 4.0).abs() < 0.01, "average was {avg}");
        assert_eq!(stats.top_approvers[0].approver_id, "u-manager");
        assert_eq!(stats.top_approvers[0].decisions, 3);
        assert_eq!(stats.top_approvers[1].approver_id, "u-other");

        pool.close().await;
    }
}
