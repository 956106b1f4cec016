use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use tollgate_core::domain::approval::ApprovalRequestId;
use tollgate_core::notify::{
    Contact, ContactDirectory, EmailOutbox, NotificationKind, OutboundEmail,
};
use tollgate_core::ports::StoreError;

use super::{encode_timestamp, parse_enum, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlContactDirectory {
    pool: DbPool,
}

impl SqlContactDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_contact(&self, contact: &Contact) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approver_contact (user_id, display_name, email)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                email = excluded.email",
        )
        .bind(&contact.user_id)
        .bind(&contact.display_name)
        .bind(contact.email.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, user_id: &str) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query(
            "SELECT user_id, display_name, email FROM approver_contact WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Contact, RepositoryError> {
            Ok(Contact {
                user_id: row.try_get("user_id")?,
                display_name: row.try_get("display_name")?,
                email: row.try_get("email")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl ContactDirectory for SqlContactDirectory {
    async fn find_contact(&self, user_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.find(user_id).await?)
    }
}

/// Durable queue of outgoing emails; delivery is owned by a separate sender.
pub struct SqlEmailOutbox {
    pool: DbPool,
}

impl SqlEmailOutbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_request(
        &self,
        request_id: &ApprovalRequestId,
    ) -> Result<Vec<OutboundEmail>, RepositoryError> {
        sqlx::query(
            "SELECT id, request_id, kind, sender, recipient, subject, body, created_at
             FROM notification_email_queue
             WHERE request_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(email_from_row)
        .collect()
    }

    async fn insert(&self, email: &OutboundEmail) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO notification_email_queue (
                id,
                request_id,
                kind,
                sender,
                recipient,
                subject,
                body,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&email.id)
        .bind(&email.request_id.0)
        .bind(email.kind.event_type())
        .bind(&email.from)
        .bind(&email.to)
        .bind(&email.subject)
        .bind(&email.body)
        .bind(encode_timestamp(email.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EmailOutbox for SqlEmailOutbox {
    async fn enqueue(&self, email: &OutboundEmail) -> Result<(), StoreError> {
        Ok(self.insert(email).await?)
    }
}

fn email_from_row(row: SqliteRow) -> Result<OutboundEmail, RepositoryError> {
    Ok(OutboundEmail {
        id: row.try_get("id")?,
        request_id: ApprovalRequestId(row.try_get("request_id")?),
        kind: parse_enum(
            "notification kind",
            row.try_get("kind")?,
            NotificationKind::from_event_type,
        )?,
        from: row.try_get("sender")?,
        to: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
