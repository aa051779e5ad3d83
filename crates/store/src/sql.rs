use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use courier_core::{
    ChannelKind, ConversationId, ConversationKey, ConversationRecord, ConversationStatus,
    MessageEntry, ProjectId, RequestId, TenantId, UsageMetrics,
};

use crate::store::{ConversationStore, StoreError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT
                conversation_id,
                recipient,
                tenant_id,
                project_id,
                request_id,
                channel,
                status,
                workflow_ref,
                delivery_ref,
                failure_reason,
                state_version,
                created_at,
                updated_at
             FROM conversation
             WHERE recipient = ? AND conversation_id = ?",
        )
        .bind(&key.recipient)
        .bind(&key.conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = record_from_row(row)?;

        let message_rows = sqlx::query(
            "SELECT
                seq,
                created_at,
                completed_at,
                content_summary,
                provider_message_id,
                prompt_tokens,
                completion_tokens,
                latency_ms
             FROM conversation_message
             WHERE recipient = ? AND conversation_id = ?
             ORDER BY seq ASC",
        )
        .bind(&key.recipient)
        .bind(&key.conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        record.messages =
            message_rows.into_iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(record))
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn create_if_absent(
        &self,
        record: ConversationRecord,
    ) -> Result<(ConversationRecord, bool), StoreError> {
        let result = sqlx::query(
            "INSERT INTO conversation (
                conversation_id,
                recipient,
                tenant_id,
                project_id,
                request_id,
                channel,
                status,
                workflow_ref,
                delivery_ref,
                failure_reason,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (recipient, conversation_id) DO NOTHING",
        )
        .bind(&record.key.conversation_id.0)
        .bind(&record.key.recipient)
        .bind(&record.tenant_id.0)
        .bind(&record.project_id.0)
        .bind(&record.request_id.0)
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(record.workflow_ref.as_deref())
        .bind(record.delivery_ref.as_deref())
        .bind(record.failure_reason.as_deref())
        .bind(i64::from(record.state_version))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the create race (or redelivery): adopt the winner's record.
            let existing = self.fetch(&record.key).await?.ok_or(StoreError::NotFound)?;
            return Ok((existing, false));
        }

        upsert_messages(&self.pool, &record).await?;
        Ok((record, true))
    }

    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationRecord>, StoreError> {
        self.fetch(key).await
    }

    async fn update(
        &self,
        record: &ConversationRecord,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE conversation SET
                status = ?,
                workflow_ref = ?,
                delivery_ref = ?,
                failure_reason = ?,
                state_version = ?,
                updated_at = ?
             WHERE recipient = ? AND conversation_id = ? AND state_version = ?",
        )
        .bind(record.status.as_str())
        .bind(record.workflow_ref.as_deref())
        .bind(record.delivery_ref.as_deref())
        .bind(record.failure_reason.as_deref())
        .bind(i64::from(record.state_version))
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.key.recipient)
        .bind(&record.key.conversation_id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let found = sqlx::query(
                "SELECT state_version FROM conversation
                 WHERE recipient = ? AND conversation_id = ?",
            )
            .bind(&record.key.recipient)
            .bind(&record.key.conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;

            return Err(match found {
                None => StoreError::NotFound,
                Some(row) => StoreError::VersionConflict {
                    expected: expected_version,
                    found: parse_u32("state_version", row.try_get("state_version")?)?,
                },
            });
        }

        upsert_messages(&self.pool, record).await?;
        Ok(())
    }
}

async fn upsert_messages(pool: &DbPool, record: &ConversationRecord) -> Result<(), StoreError> {
    for (seq, message) in record.messages.iter().enumerate() {
        sqlx::query(
            "INSERT INTO conversation_message (
                conversation_id,
                recipient,
                seq,
                created_at,
                completed_at,
                content_summary,
                provider_message_id,
                prompt_tokens,
                completion_tokens,
                latency_ms
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (recipient, conversation_id, seq) DO UPDATE SET
                completed_at = excluded.completed_at,
                content_summary = excluded.content_summary,
                provider_message_id = excluded.provider_message_id,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                latency_ms = excluded.latency_ms",
        )
        .bind(&record.key.conversation_id.0)
        .bind(&record.key.recipient)
        .bind(seq as i64)
        .bind(message.created_at.to_rfc3339())
        .bind(message.completed_at.map(|value| value.to_rfc3339()))
        .bind(message.content_summary.as_deref())
        .bind(message.provider_message_id.as_deref())
        .bind(i64::from(message.usage.prompt_tokens))
        .bind(i64::from(message.usage.completion_tokens))
        .bind(message.usage.latency_ms as i64)
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn record_from_row(row: SqliteRow) -> Result<ConversationRecord, StoreError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ConversationStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown conversation status `{status_raw}`")))?;

    let channel_raw = row.try_get::<String, _>("channel")?;
    let channel = ChannelKind::parse(&channel_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown channel `{channel_raw}`")))?;

    Ok(ConversationRecord {
        key: ConversationKey {
            recipient: row.try_get("recipient")?,
            conversation_id: ConversationId(row.try_get("conversation_id")?),
        },
        tenant_id: TenantId(row.try_get("tenant_id")?),
        project_id: ProjectId(row.try_get("project_id")?),
        request_id: RequestId(row.try_get("request_id")?),
        channel,
        status,
        workflow_ref: row.try_get("workflow_ref")?,
        delivery_ref: row.try_get("delivery_ref")?,
        messages: Vec::new(),
        failure_reason: row.try_get("failure_reason")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<MessageEntry, StoreError> {
    Ok(MessageEntry {
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        content_summary: row.try_get("content_summary")?,
        provider_message_id: row.try_get("provider_message_id")?,
        usage: UsageMetrics {
            prompt_tokens: parse_u32("prompt_tokens", row.try_get("prompt_tokens")?)?,
            completion_tokens: parse_u32("completion_tokens", row.try_get("completion_tokens")?)?,
            latency_ms: row.try_get::<i64, _>("latency_ms")?.max(0) as u64,
        },
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| {
        StoreError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| StoreError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})")),
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use courier_core::{
        ConversationId, ConversationKey, ConversationRecord, ConversationStatus, ProjectId,
        RequestId, TenantId, UsageMetrics,
    };

    use super::SqlConversationStore;
    use crate::migrations;
    use crate::store::{ConversationStore, StoreError};
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_record(request_id: &str) -> ConversationRecord {
        let tenant = TenantId("acme".to_string());
        let project = ProjectId("p1".to_string());
        let request = RequestId(request_id.to_string());
        let now = Utc::now();
        ConversationRecord {
            key: ConversationKey {
                recipient: "+10000000000".to_string(),
                conversation_id: ConversationId::derive(&tenant, &project, &request, "+10000000000"),
            },
            tenant_id: tenant,
            project_id: project,
            request_id: request,
            channel: courier_core::ChannelKind::WhatsApp,
            status: ConversationStatus::Processing,
            workflow_ref: None,
            delivery_ref: None,
            messages: Vec::new(),
            failure_reason: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let pool = setup_pool().await;
        let repo = SqlConversationStore::new(pool.clone());
        let record = sample_record("r-sql-001");

        let (created, fresh) = repo.create_if_absent(record.clone()).await.expect("create");
        assert!(fresh);
        assert_eq!(created, record);

        let found = repo.get(&record.key).await.expect("get");
        // Timestamps survive only to rfc3339 precision, so compare fields.
        let found = found.expect("record present");
        assert_eq!(found.key, record.key);
        assert_eq!(found.status, ConversationStatus::Processing);
        assert_eq!(found.state_version, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_create_adopts_existing_record() {
        let pool = setup_pool().await;
        let repo = SqlConversationStore::new(pool.clone());
        let record = sample_record("r-sql-002");

        repo.create_if_absent(record.clone()).await.expect("first create");

        let mut duplicate = record.clone();
        duplicate.state_version = 99;
        let (adopted, fresh) = repo.create_if_absent(duplicate).await.expect("second create");

        assert!(!fresh);
        assert_eq!(adopted.state_version, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn guarded_update_persists_messages_and_status() {
        let pool = setup_pool().await;
        let repo = SqlConversationStore::new(pool.clone());
        let record = sample_record("r-sql-003");
        repo.create_if_absent(record.clone()).await.expect("create");

        let mut mutated = record.clone();
        let now = Utc::now();
        mutated.append_pending_message(
            UsageMetrics { prompt_tokens: 10, completion_tokens: 5, latency_ms: 120 },
            now,
        );
        mutated.set_workflow_ref("thread-abc", now).expect("workflow ref");
        mutated.complete_pending_message("wamid.1", "intro", now).expect("complete");
        mutated.transition(ConversationStatus::InitialMessageSent, now).expect("transition");

        repo.update(&mutated, 1).await.expect("guarded update");

        let found = repo.get(&record.key).await.expect("get").expect("present");
        assert_eq!(found.status, ConversationStatus::InitialMessageSent);
        assert_eq!(found.workflow_ref.as_deref(), Some("thread-abc"));
        assert_eq!(found.delivery_ref.as_deref(), Some("wamid.1"));
        assert_eq!(found.messages.len(), 1);
        assert_eq!(found.messages[0].provider_message_id.as_deref(), Some("wamid.1"));
        assert_eq!(found.state_version, mutated.state_version);

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_update_reports_version_conflict() {
        let pool = setup_pool().await;
        let repo = SqlConversationStore::new(pool.clone());
        let record = sample_record("r-sql-004");
        repo.create_if_absent(record.clone()).await.expect("create");

        let mut winner = record.clone();
        winner.transition(ConversationStatus::Failed, Utc::now()).expect("transition");
        repo.update(&winner, 1).await.expect("winner update");

        let mut loser = record.clone();
        loser.transition(ConversationStatus::InitialMessageSent, Utc::now()).expect("transition");
        let error = repo.update(&loser, 1).await.expect_err("stale update");

        assert!(matches!(error, StoreError::VersionConflict { expected: 1, found: 2 }));

        pool.close().await;
    }

    #[tokio::test]
    async fn update_of_missing_record_reports_not_found() {
        let pool = setup_pool().await;
        let repo = SqlConversationStore::new(pool.clone());
        let record = sample_record("r-sql-005");

        let error = repo.update(&record, 1).await.expect_err("missing record");
        assert!(matches!(error, StoreError::NotFound));

        pool.close().await;
    }
}
