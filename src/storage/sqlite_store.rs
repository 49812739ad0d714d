//! SQLite implementation of the Message Store, with physically channel-sharded
//! tables (`M<C>`, `MM<C>`, `MC<C>`, `MA<C>`, `MCM<C>`, `MS<C>`).
//!
//! Table creation uses dynamic, sanitized-identifier DDL issued at deploy time,
//! generalizing the teacher's `CREATE TABLE IF NOT EXISTS` precedent in
//! `storage/agent_storage.rs` to ids that aren't known at compile time.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument, warn};

use super::{MessageBundle, MessageStore, StorageError, table_suffix};
use crate::database::DatabaseConnection;
use crate::domain::message::{Attachment, ConnectorMessage, Maps, Message, MessageContent};
use crate::domain_types::{
    ChannelId, ConnectorMessageStatus, ContentType, ErrorCode, MessageId, MetaDataId, ServerId,
};

/// SQLite-backed [`MessageStore`].
pub struct SqliteMessageStore {
    connection: DatabaseConnection,
}

impl SqliteMessageStore {
    /// Wraps an already-initialized [`DatabaseConnection`].
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn pool(&self) -> &SqlitePool {
        self.connection.pool()
    }

    fn status_to_str(status: ConnectorMessageStatus) -> &'static str {
        match status {
            ConnectorMessageStatus::Received => "RECEIVED",
            ConnectorMessageStatus::Filtered => "FILTERED",
            ConnectorMessageStatus::Transformed => "TRANSFORMED",
            ConnectorMessageStatus::Pending => "PENDING",
            ConnectorMessageStatus::Queued => "QUEUED",
            ConnectorMessageStatus::Sent => "SENT",
            ConnectorMessageStatus::Error => "ERROR",
        }
    }

    fn status_from_str(value: &str) -> Result<ConnectorMessageStatus, StorageError> {
        match value {
            "RECEIVED" => Ok(ConnectorMessageStatus::Received),
            "FILTERED" => Ok(ConnectorMessageStatus::Filtered),
            "TRANSFORMED" => Ok(ConnectorMessageStatus::Transformed),
            "PENDING" => Ok(ConnectorMessageStatus::Pending),
            "QUEUED" => Ok(ConnectorMessageStatus::Queued),
            "SENT" => Ok(ConnectorMessageStatus::Sent),
            "ERROR" => Ok(ConnectorMessageStatus::Error),
            other => Err(StorageError::Fatal(format!("unknown status {other}"))),
        }
    }

    fn content_type_to_str(content_type: ContentType) -> &'static str {
        match content_type {
            ContentType::Raw => "RAW",
            ContentType::ProcessedRaw => "PROCESSED_RAW",
            ContentType::Transformed => "TRANSFORMED",
            ContentType::Encoded => "ENCODED",
            ContentType::Sent => "SENT",
            ContentType::Response => "RESPONSE",
            ContentType::ResponseTransformed => "RESPONSE_TRANSFORMED",
            ContentType::ProcessedResponse => "PROCESSED_RESPONSE",
            ContentType::SourceMap => "SOURCE_MAP",
            ContentType::ConnectorMap => "CONNECTOR_MAP",
            ContentType::ChannelMap => "CHANNEL_MAP",
            ContentType::ResponseMap => "RESPONSE_MAP",
        }
    }

    fn content_type_from_str(value: &str) -> Result<ContentType, StorageError> {
        match value {
            "RAW" => Ok(ContentType::Raw),
            "PROCESSED_RAW" => Ok(ContentType::ProcessedRaw),
            "TRANSFORMED" => Ok(ContentType::Transformed),
            "ENCODED" => Ok(ContentType::Encoded),
            "SENT" => Ok(ContentType::Sent),
            "RESPONSE" => Ok(ContentType::Response),
            "RESPONSE_TRANSFORMED" => Ok(ContentType::ResponseTransformed),
            "PROCESSED_RESPONSE" => Ok(ContentType::ProcessedResponse),
            "SOURCE_MAP" => Ok(ContentType::SourceMap),
            "CONNECTOR_MAP" => Ok(ContentType::ConnectorMap),
            "CHANNEL_MAP" => Ok(ContentType::ChannelMap),
            "RESPONSE_MAP" => Ok(ContentType::ResponseMap),
            other => Err(StorageError::Fatal(format!("unknown content type {other}"))),
        }
    }

    fn parse_timestamp(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }

    fn parse_message_row(row: &sqlx::sqlite::SqliteRow, channel: &ChannelId) -> Result<Message, StorageError> {
        let id: i64 = row.get("ID");
        let server_id: String = row.get("SERVER_ID");
        let received_secs: i64 = row.get("RECEIVED_DATE");
        let processed: i64 = row.get("PROCESSED");
        let original_id: Option<i64> = row.get("ORIGINAL_ID");
        let import_id: Option<i64> = row.get("IMPORT_ID");
        let import_channel_id: Option<String> = row.get("IMPORT_CHANNEL_ID");

        Ok(Message {
            id: MessageId::try_new(id).map_err(|e| StorageError::Fatal(e.to_string()))?,
            channel_id: channel.clone(),
            server_id: ServerId::try_new(server_id).map_err(|e| StorageError::Fatal(e.to_string()))?,
            received_date: Self::parse_timestamp(received_secs),
            processed: processed != 0,
            original_id: original_id
                .map(MessageId::try_new)
                .transpose()
                .map_err(|e| StorageError::Fatal(e.to_string()))?,
            import_id,
            import_channel_id: import_channel_id
                .map(ChannelId::try_new)
                .transpose()
                .map_err(|e| StorageError::Fatal(e.to_string()))?,
        })
    }

    fn parse_connector_message_row(
        row: &sqlx::sqlite::SqliteRow,
        channel: &ChannelId,
    ) -> Result<ConnectorMessage, StorageError> {
        let message_id: i64 = row.get("MESSAGE_ID");
        let meta_data_id: i32 = row.get("METADATA_ID");
        let received_secs: i64 = row.get("RECEIVED_DATE");
        let status: String = row.get("STATUS");
        let connector_name: String = row.get("CONNECTOR_NAME");
        let send_attempts: i64 = row.get("SEND_ATTEMPTS");
        let send_date: Option<i64> = row.get("SEND_DATE");
        let response_date: Option<i64> = row.get("RESPONSE_DATE");
        let error_code: i64 = row.get("ERROR_CODE");
        let chain_id: Option<String> = row.get("CHAIN_ID");
        let order_id: i32 = row.get("ORDER_ID");

        Ok(ConnectorMessage {
            message_id: MessageId::try_new(message_id).map_err(|e| StorageError::Fatal(e.to_string()))?,
            channel_id: channel.clone(),
            meta_data_id: MetaDataId::try_new(meta_data_id).map_err(|e| StorageError::Fatal(e.to_string()))?,
            connector_name,
            status: Self::status_from_str(&status)?,
            #[allow(clippy::cast_sign_loss)]
            send_attempts: send_attempts as u32,
            received_date: Self::parse_timestamp(received_secs),
            send_date: send_date.map(Self::parse_timestamp),
            response_date: response_date.map(Self::parse_timestamp),
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            error_code: ErrorCode::from_bits(error_code as u8),
            error_detail: row.get("ERROR_DETAIL"),
            chain_id,
            order_id,
            maps: Maps::default(),
        })
    }

    /// Creates the six per-channel sharded tables if they don't already exist.
    async fn create_channel_tables(&self, suffix: &str) -> Result<(), StorageError> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS M{suffix} (
                    ID INTEGER PRIMARY KEY,
                    SERVER_ID TEXT NOT NULL,
                    RECEIVED_DATE INTEGER NOT NULL,
                    PROCESSED INTEGER NOT NULL DEFAULT 0,
                    ORIGINAL_ID INTEGER,
                    IMPORT_ID INTEGER,
                    IMPORT_CHANNEL_ID TEXT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS MM{suffix} (
                    MESSAGE_ID INTEGER NOT NULL,
                    METADATA_ID INTEGER NOT NULL,
                    RECEIVED_DATE INTEGER NOT NULL,
                    STATUS TEXT NOT NULL,
                    CONNECTOR_NAME TEXT NOT NULL,
                    SEND_ATTEMPTS INTEGER NOT NULL DEFAULT 0,
                    SEND_DATE INTEGER,
                    RESPONSE_DATE INTEGER,
                    ERROR_CODE INTEGER NOT NULL DEFAULT 0,
                    ERROR_DETAIL TEXT,
                    CHAIN_ID TEXT,
                    ORDER_ID INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (MESSAGE_ID, METADATA_ID)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS MC{suffix} (
                    MESSAGE_ID INTEGER NOT NULL,
                    METADATA_ID INTEGER NOT NULL,
                    CONTENT_TYPE TEXT NOT NULL,
                    CONTENT TEXT NOT NULL,
                    DATA_TYPE TEXT NOT NULL,
                    IS_ENCRYPTED INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (MESSAGE_ID, METADATA_ID, CONTENT_TYPE)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS MA{suffix} (
                    ID INTEGER NOT NULL,
                    MESSAGE_ID INTEGER NOT NULL,
                    TYPE TEXT NOT NULL,
                    SEGMENT_ID INTEGER NOT NULL,
                    ATTACHMENT BLOB NOT NULL,
                    PRIMARY KEY (ID, SEGMENT_ID)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS MCM{suffix} (
                    MESSAGE_ID INTEGER NOT NULL,
                    META_DATA_KEY TEXT NOT NULL,
                    META_DATA_VALUE TEXT,
                    PRIMARY KEY (MESSAGE_ID, META_DATA_KEY)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS MS{suffix} (
                    METADATA_ID INTEGER PRIMARY KEY,
                    RECEIVED INTEGER NOT NULL DEFAULT 0,
                    FILTERED INTEGER NOT NULL DEFAULT 0,
                    TRANSFORMED INTEGER NOT NULL DEFAULT 0,
                    PENDING INTEGER NOT NULL DEFAULT 0,
                    SENT INTEGER NOT NULL DEFAULT 0,
                    ERROR INTEGER NOT NULL DEFAULT 0
                )"
            ),
            format!("CREATE TABLE IF NOT EXISTS SEQ{suffix} (NEXT_ID INTEGER NOT NULL)"),
        ];

        let mut tx = self.pool().begin().await.map_err(|e| StorageError::Transient(e.to_string()))?;
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Fatal(e.to_string()))?;
        }
        sqlx::query(&format!(
            "INSERT INTO SEQ{suffix} (NEXT_ID) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM SEQ{suffix})"
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Fatal(e.to_string()))?;
        tx.commit().await.map_err(|e| StorageError::Fatal(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self), fields(channel = %channel.as_ref()))]
    async fn ensure_channel_tables(&self, channel: &ChannelId) -> Result<(), StorageError> {
        self.create_channel_tables(table_suffix(channel)).await?;
        info!("ensured message tables for channel");
        Ok(())
    }

    #[instrument(skip(self), fields(channel = %channel.as_ref()))]
    async fn next_message_id(&self, channel: &ChannelId) -> Result<MessageId, StorageError> {
        let suffix = table_suffix(channel);
        let mut tx = self.pool().begin().await.map_err(|e| StorageError::Transient(e.to_string()))?;

        let row = sqlx::query(&format!("UPDATE SEQ{suffix} SET NEXT_ID = NEXT_ID + 1 RETURNING NEXT_ID - 1 AS id"))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                if e.to_string().contains("no such table") {
                    StorageError::MissingTables(channel.clone())
                } else {
                    StorageError::Transient(e.to_string())
                }
            })?;

        let Some(row) = row else {
            return Err(StorageError::MissingTables(channel.clone()));
        };
        let id: i64 = row.get("id");
        tx.commit().await.map_err(|e| StorageError::Transient(e.to_string()))?;

        MessageId::try_new(id).map_err(|e| StorageError::Fatal(e.to_string()))
    }

    #[instrument(skip(self, message), fields(channel = %message.channel_id.as_ref(), message_id = message.id.into_inner()))]
    async fn insert_message(&self, message: &Message) -> Result<(), StorageError> {
        let suffix = table_suffix(&message.channel_id);
        sqlx::query(&format!(
            "INSERT INTO M{suffix} (ID, SERVER_ID, RECEIVED_DATE, PROCESSED, ORIGINAL_ID, IMPORT_ID, IMPORT_CHANNEL_ID)
             VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(message.id.into_inner())
        .bind(message.server_id.clone().into_inner())
        .bind(message.received_date.timestamp())
        .bind(i64::from(message.processed))
        .bind(message.original_id.map(MessageId::into_inner))
        .bind(message.import_id)
        .bind(message.import_channel_id.as_ref().map(|c| c.clone().into_inner()))
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, cm), fields(channel = %cm.channel_id.as_ref(), message_id = cm.message_id.into_inner(), meta = cm.meta_data_id.into_inner()))]
    async fn insert_connector_message(&self, cm: &ConnectorMessage) -> Result<(), StorageError> {
        let suffix = table_suffix(&cm.channel_id);
        sqlx::query(&format!(
            "INSERT INTO MM{suffix} (MESSAGE_ID, METADATA_ID, RECEIVED_DATE, STATUS, CONNECTOR_NAME, SEND_ATTEMPTS, SEND_DATE, RESPONSE_DATE, ERROR_CODE, ERROR_DETAIL, CHAIN_ID, ORDER_ID)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(cm.message_id.into_inner())
        .bind(cm.meta_data_id.into_inner())
        .bind(cm.received_date.timestamp())
        .bind(Self::status_to_str(cm.status))
        .bind(cm.connector_name.clone())
        .bind(i64::from(cm.send_attempts))
        .bind(cm.send_date.map(|d| d.timestamp()))
        .bind(cm.response_date.map(|d| d.timestamp()))
        .bind(i64::from(cm.error_code.bits()))
        .bind(cm.error_detail.clone())
        .bind(cm.chain_id.clone())
        .bind(cm.order_id)
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;

        self.increment_statistic(&cm.channel_id, cm.meta_data_id, cm.status).await.ok();
        Ok(())
    }

    #[instrument(skip(self, content), fields(channel = %channel.as_ref()))]
    async fn insert_content(&self, channel: &ChannelId, content: &MessageContent) -> Result<(), StorageError> {
        let suffix = table_suffix(channel);
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO MC{suffix} (MESSAGE_ID, METADATA_ID, CONTENT_TYPE, CONTENT, DATA_TYPE, IS_ENCRYPTED)
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(content.message_id.into_inner())
        .bind(content.meta_data_id.into_inner())
        .bind(Self::content_type_to_str(content.content_type))
        .bind(content.content.clone())
        .bind(content.data_type.clone())
        .bind(i64::from(content.is_encrypted))
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, attachment), fields(channel = %channel.as_ref()))]
    async fn insert_attachment(&self, channel: &ChannelId, attachment: &Attachment) -> Result<(), StorageError> {
        let suffix = table_suffix(channel);
        sqlx::query(&format!(
            "INSERT INTO MA{suffix} (ID, MESSAGE_ID, TYPE, SEGMENT_ID, ATTACHMENT) VALUES (?, ?, ?, ?, ?)"
        ))
        .bind(attachment.id)
        .bind(attachment.message_id.into_inner())
        .bind(attachment.mime_type.clone())
        .bind(attachment.segment_id)
        .bind(attachment.data.clone())
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(channel = %channel.as_ref(), message_id = message_id.into_inner(), meta = meta_data_id.into_inner()))]
    async fn update_connector_message_status(
        &self,
        channel: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        new_status: ConnectorMessageStatus,
        send_attempts: Option<u32>,
        error: Option<(ErrorCode, String)>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let suffix = table_suffix(channel);
        let (error_code, error_detail) = error.map_or((None, None), |(c, d)| (Some(i64::from(c.bits())), Some(d)));

        let result = sqlx::query(&format!(
            "UPDATE MM{suffix} SET
                STATUS = ?,
                SEND_ATTEMPTS = COALESCE(?, SEND_ATTEMPTS),
                SEND_DATE = CASE WHEN ? = 'QUEUED' THEN ? ELSE SEND_DATE END,
                RESPONSE_DATE = CASE WHEN ? IN ('SENT', 'ERROR') THEN ? ELSE RESPONSE_DATE END,
                ERROR_CODE = COALESCE(?, ERROR_CODE),
                ERROR_DETAIL = COALESCE(?, ERROR_DETAIL)
             WHERE MESSAGE_ID = ? AND METADATA_ID = ?"
        ))
        .bind(Self::status_to_str(new_status))
        .bind(send_attempts.map(i64::from))
        .bind(Self::status_to_str(new_status))
        .bind(timestamp.timestamp())
        .bind(Self::status_to_str(new_status))
        .bind(timestamp.timestamp())
        .bind(error_code)
        .bind(error_detail.clone())
        .bind(message_id.into_inner())
        .bind(meta_data_id.into_inner())
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict { channel: channel.clone(), message: message_id });
        }
        if let Some(detail) = error_detail {
            warn!(detail = %detail, "connector message entered error state");
        }

        self.increment_statistic(channel, meta_data_id, new_status).await.ok();
        Ok(())
    }

    #[instrument(skip(self), fields(channel = %channel.as_ref(), message_id = message_id.into_inner()))]
    async fn mark_processed(&self, channel: &ChannelId, message_id: MessageId) -> Result<(), StorageError> {
        let suffix = table_suffix(channel);
        sqlx::query(&format!("UPDATE M{suffix} SET PROCESSED = 1 WHERE ID = ?"))
            .bind(message_id.into_inner())
            .execute(self.pool())
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn increment_statistic(
        &self,
        channel: &ChannelId,
        meta_data_id: MetaDataId,
        status: ConnectorMessageStatus,
    ) -> Result<(), StorageError> {
        let suffix = table_suffix(channel);
        let column = match status {
            ConnectorMessageStatus::Received => "RECEIVED",
            ConnectorMessageStatus::Filtered => "FILTERED",
            ConnectorMessageStatus::Transformed => "TRANSFORMED",
            ConnectorMessageStatus::Pending => "PENDING",
            ConnectorMessageStatus::Queued => return Ok(()),
            ConnectorMessageStatus::Sent => "SENT",
            ConnectorMessageStatus::Error => "ERROR",
        };

        sqlx::query(&format!(
            "INSERT INTO MS{suffix} (METADATA_ID, {column}) VALUES (?, 1)
             ON CONFLICT(METADATA_ID) DO UPDATE SET {column} = {column} + 1"
        ))
        .bind(meta_data_id.into_inner())
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(channel = %channel.as_ref(), message_id = message_id.into_inner()))]
    async fn fetch_message(
        &self,
        channel: &ChannelId,
        message_id: MessageId,
        include_content: bool,
    ) -> Result<Option<MessageBundle>, StorageError> {
        let suffix = table_suffix(channel);
        let message_row = sqlx::query(&format!("SELECT * FROM M{suffix} WHERE ID = ?"))
            .bind(message_id.into_inner())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;

        let Some(message_row) = message_row else {
            return Ok(None);
        };
        let message = Self::parse_message_row(&message_row, channel)?;

        let cm_rows = sqlx::query(&format!("SELECT * FROM MM{suffix} WHERE MESSAGE_ID = ? ORDER BY METADATA_ID"))
            .bind(message_id.into_inner())
            .fetch_all(self.pool())
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        let connector_messages = cm_rows
            .iter()
            .map(|row| Self::parse_connector_message_row(row, channel))
            .collect::<Result<Vec<_>, _>>()?;

        let content = if include_content {
            let rows = sqlx::query(&format!("SELECT * FROM MC{suffix} WHERE MESSAGE_ID = ?"))
                .bind(message_id.into_inner())
                .fetch_all(self.pool())
                .await
                .map_err(|e| StorageError::Transient(e.to_string()))?;
            rows.iter()
                .map(|row| {
                    let meta_data_id: i32 = row.get("METADATA_ID");
                    let content_type: String = row.get("CONTENT_TYPE");
                    let content_text: String = row.get("CONTENT");
                    let data_type: String = row.get("DATA_TYPE");
                    let is_encrypted: i64 = row.get("IS_ENCRYPTED");
                    Ok(MessageContent {
                        message_id,
                        meta_data_id: MetaDataId::try_new(meta_data_id)
                            .map_err(|e| StorageError::Fatal(e.to_string()))?,
                        content_type: Self::content_type_from_str(&content_type)?,
                        content: content_text,
                        data_type,
                        is_encrypted: is_encrypted != 0,
                    })
                })
                .collect::<Result<Vec<_>, StorageError>>()?
        } else {
            Vec::new()
        };

        Ok(Some(MessageBundle { message, connector_messages, content }))
    }

    #[instrument(skip(self, skip_statuses), fields(channel = %channel.as_ref()))]
    async fn get_messages_to_prune(
        &self,
        channel: &ChannelId,
        before: DateTime<Utc>,
        limit: u32,
        skip_statuses: &[ConnectorMessageStatus],
        skip_incomplete: bool,
    ) -> Result<Vec<MessageId>, StorageError> {
        let suffix = table_suffix(channel);
        let skip_list = skip_statuses
            .iter()
            .map(|s| format!("'{}'", Self::status_to_str(*s)))
            .collect::<Vec<_>>()
            .join(", ");
        let skip_clause = if skip_list.is_empty() {
            String::new()
        } else {
            format!(
                "AND M.ID NOT IN (SELECT MESSAGE_ID FROM MM{suffix} WHERE STATUS IN ({skip_list}))"
            )
        };
        let processed_clause = if skip_incomplete { "AND M.PROCESSED = 1" } else { "" };

        let query = format!(
            "SELECT M.ID as id FROM M{suffix} M
             WHERE M.RECEIVED_DATE < ? {skip_clause} {processed_clause}
             ORDER BY M.ID
             LIMIT ?"
        );

        let rows = sqlx::query(&query)
            .bind(before.timestamp())
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.get("id");
                MessageId::try_new(id).map_err(|e| StorageError::Fatal(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self, ids), fields(channel = %channel.as_ref(), count = ids.len()))]
    async fn prune_messages(&self, channel: &ChannelId, ids: &[MessageId]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let suffix = table_suffix(channel);
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut tx = self.pool().begin().await.map_err(|e| StorageError::Transient(e.to_string()))?;

        for table in ["MC", "MA", "MM", "MCM"] {
            let mut query = sqlx::query(&format!("DELETE FROM {table}{suffix} WHERE MESSAGE_ID IN ({placeholders})"));
            for id in ids {
                query = query.bind(id.into_inner());
            }
            query.execute(&mut *tx).await.map_err(|e| StorageError::Transient(e.to_string()))?;
        }

        let mut query = sqlx::query(&format!("DELETE FROM M{suffix} WHERE ID IN ({placeholders})"));
        for id in ids {
            query = query.bind(id.into_inner());
        }
        let result = query.execute(&mut *tx).await.map_err(|e| StorageError::Transient(e.to_string()))?;
        tx.commit().await.map_err(|e| StorageError::Transient(e.to_string()))?;

        info!(removed = result.rows_affected(), "pruned messages");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(channel = %channel.as_ref(), count = ids.len()))]
    async fn prune_message_content(&self, channel: &ChannelId, ids: &[MessageId]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let suffix = table_suffix(channel);
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut tx = self.pool().begin().await.map_err(|e| StorageError::Transient(e.to_string()))?;

        let mut total = 0u64;
        for table in ["MC", "MA"] {
            let mut query = sqlx::query(&format!("DELETE FROM {table}{suffix} WHERE MESSAGE_ID IN ({placeholders})"));
            for id in ids {
                query = query.bind(id.into_inner());
            }
            let result = query.execute(&mut *tx).await.map_err(|e| StorageError::Transient(e.to_string()))?;
            total += result.rows_affected();
        }
        tx.commit().await.map_err(|e| StorageError::Transient(e.to_string()))?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use crate::domain_types::ServerId;
    use tempfile::tempdir;

    async fn test_store() -> (SqliteMessageStore, ChannelId) {
        let dir = tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let conn = DatabaseConnection::initialize(config).await.unwrap();
        let store = SqliteMessageStore::new(conn);
        let channel = ChannelId::try_new("test_channel").unwrap();
        store.ensure_channel_tables(&channel).await.unwrap();
        (store, channel)
    }

    #[tokio::test]
    async fn next_message_id_is_strictly_increasing() {
        let (store, channel) = test_store().await;
        let a = store.next_message_id(&channel).await.unwrap();
        let b = store.next_message_id(&channel).await.unwrap();
        assert!(b.into_inner() > a.into_inner());
    }

    #[tokio::test]
    async fn next_message_id_fails_for_undeployed_channel() {
        let (store, _) = test_store().await;
        let other = ChannelId::try_new("never_deployed").unwrap();
        let result = store.next_message_id(&other).await;
        assert!(matches!(result, Err(StorageError::MissingTables(_))));
    }

    #[tokio::test]
    async fn insert_and_fetch_message_round_trips() {
        let (store, channel) = test_store().await;
        let id = store.next_message_id(&channel).await.unwrap();
        let message = Message::received(
            id,
            channel.clone(),
            ServerId::try_new("server-1").unwrap(),
            Utc::now(),
        );
        store.insert_message(&message).await.unwrap();

        let fetched = store.fetch_message(&channel, id, false).await.unwrap().unwrap();
        assert_eq!(fetched.message.id, id);
        assert!(!fetched.message.processed);
    }

    #[tokio::test]
    async fn prune_messages_is_idempotent() {
        let (store, channel) = test_store().await;
        let id = store.next_message_id(&channel).await.unwrap();
        let message = Message::received(
            id,
            channel.clone(),
            ServerId::try_new("server-1").unwrap(),
            Utc::now(),
        );
        store.insert_message(&message).await.unwrap();

        let first = store.prune_messages(&channel, &[id]).await.unwrap();
        let second = store.prune_messages(&channel, &[id]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
