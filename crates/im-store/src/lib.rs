// im-store: the durable Postgres layer behind the messaging core.
//
// Mirrors the teacher's `repo::events` shape (idempotent upsert keyed on a
// unique id, `sqlx::query!`/`query_as!` against a pooled connection) but the
// unique key here is the message `id` rather than `(stream_id, epoch, seq)`,
// and the schema adds the conversation/seq-bound/timeline tables the
// messaging core needs that the teacher's event log doesn't.

pub mod idgen;
pub mod traits;

pub use idgen::IdGenerator;
pub use traits::{MessageStore, SeqStore};

use std::collections::HashMap;

use im_protocol::{ConvType, Message};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Row shape as it actually sits in `messages`; `conv_type` is the raw
/// `SMALLINT`, converted to [`ConvType`] at the API boundary.
struct MessageRow {
    id: i64,
    conversation_id: String,
    seq: i64,
    sender_id: String,
    target_id: String,
    conv_type: i16,
    msg_type: i32,
    content: serde_json::Value,
    send_time: i64,
    create_time: i64,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.conversation_id,
            seq: row.seq,
            sender_id: row.sender_id,
            target_id: row.target_id,
            conv_type: if row.conv_type == ConvType::Group as i16 {
                ConvType::Group
            } else {
                ConvType::Single
            },
            msg_type: row.msg_type,
            content: row.content,
            send_time: row.send_time,
            create_time: row.create_time,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvReadSeq {
    pub min_seq: i64,
    pub read_seq: i64,
    pub max_seq: i64,
}

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub owner_id: String,
    pub seq: i64,
    pub conversation_id: String,
    pub msg_id: i64,
    pub ref_msg_seq: i64,
    pub msg_type: i32,
    pub sender_id: String,
    pub snapshot: serde_json::Value,
    pub create_time: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent batch insert: a message with an id already on file has its
    /// `content`/`send_time` overwritten rather than rejected, so ingest
    /// retries after a crash are safe.
    pub async fn upsert_messages(&self, messages: &[Message]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for msg in messages {
            sqlx::query!(
                r#"INSERT INTO messages
                       (id, conversation_id, seq, sender_id, target_id, conv_type, msg_type, content, send_time, create_time)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                   ON CONFLICT (id) DO UPDATE
                       SET content = EXCLUDED.content, send_time = EXCLUDED.send_time"#,
                msg.id,
                msg.conversation_id,
                msg.seq,
                msg.sender_id,
                msg.target_id,
                msg.conv_type as i16,
                msg.msg_type,
                msg.content,
                msg.send_time,
                msg.create_time,
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn fetch_messages_by_seq_list(
        &self,
        conversation_id: &str,
        seqs: &[i64],
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as!(
            MessageRow,
            r#"SELECT id, conversation_id, seq, sender_id, target_id,
                      conv_type, msg_type, content, send_time, create_time
               FROM messages
               WHERE conversation_id = $1 AND seq = ANY($2)
               ORDER BY seq ASC"#,
            conversation_id,
            seqs,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    pub async fn fetch_messages_in_range(
        &self,
        conversation_id: &str,
        begin_seq: i64,
        end_seq: i64,
        limit: i64,
        descending: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = if descending {
            sqlx::query_as!(
                MessageRow,
                r#"SELECT id, conversation_id, seq, sender_id, target_id,
                          conv_type, msg_type, content, send_time, create_time
                   FROM messages
                   WHERE conversation_id = $1 AND seq >= $2 AND seq <= $3
                   ORDER BY seq DESC
                   LIMIT $4"#,
                conversation_id,
                begin_seq,
                end_seq,
                limit,
            )
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as!(
                MessageRow,
                r#"SELECT id, conversation_id, seq, sender_id, target_id,
                          conv_type, msg_type, content, send_time, create_time
                   FROM messages
                   WHERE conversation_id = $1 AND seq >= $2 AND seq <= $3
                   ORDER BY seq ASC
                   LIMIT $4"#,
                conversation_id,
                begin_seq,
                end_seq,
                limit,
            )
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().map(Message::from).collect())
    }

    /// Registers (or no-ops on an already-registered) `user_id` as a
    /// participant in `conversation_id`.
    pub async fn upsert_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"INSERT INTO conversations (user_id, conversation_id)
               VALUES ($1, $2)
               ON CONFLICT (user_id, conversation_id) DO NOTHING"#,
            user_id,
            conversation_id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_conversation_read_seq(
        &self,
        user_id: &str,
        conversation_id: &str,
        read_seq: i64,
        max_seq: i64,
    ) -> Result<(), StoreError> {
        sqlx::query!(
            r#"UPDATE conversations SET read_seq = $3, max_seq = $4
               WHERE user_id = $1 AND conversation_id = $2"#,
            user_id,
            conversation_id,
            read_seq,
            max_seq,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every conversation `user_id` currently has a membership row for;
    /// backs the newest-seq fan-out (4.I "max-seq for all convs" needs the
    /// user's conversation list before it can batch the allocator).
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query!(
            r#"SELECT conversation_id FROM conversations WHERE user_id = $1"#,
            user_id,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.conversation_id).collect())
    }

    pub async fn get_conv_read_max_seq(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, ConvReadSeq>, StoreError> {
        let rows = sqlx::query!(
            r#"SELECT conversation_id, min_seq, read_seq, max_seq FROM conversations
               WHERE user_id = $1 AND conversation_id = ANY($2)"#,
            user_id,
            conversation_ids,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.conversation_id,
                    ConvReadSeq {
                        min_seq: row.min_seq,
                        read_seq: row.read_seq,
                        max_seq: row.max_seq,
                    },
                )
            })
            .collect())
    }

    /// Row-locks `seq_conversations.conversation_id`, creating it on first
    /// use, increments `max_seq` by `refill`, and returns the pre-increment
    /// value as the first assignable sequence. Used by the allocator's
    /// refill-from-store path when the cache has no live state.
    pub async fn refill_conversation_seq(
        &self,
        conversation_id: &str,
        refill: i64,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query!(
            r#"INSERT INTO seq_conversations (conversation_id) VALUES ($1)
               ON CONFLICT (conversation_id) DO NOTHING"#,
            conversation_id,
        )
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query!(
            r#"SELECT max_seq FROM seq_conversations WHERE conversation_id = $1 FOR UPDATE"#,
            conversation_id,
        )
        .fetch_one(&mut *tx)
        .await?;
        let prev_max = row.max_seq;
        sqlx::query!(
            r#"UPDATE seq_conversations SET max_seq = $2 WHERE conversation_id = $1"#,
            conversation_id,
            prev_max + refill,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(prev_max)
    }

    /// Same refill contract as [`Store::refill_conversation_seq`] but for a
    /// per-user timeline sequence.
    pub async fn refill_user_seq(&self, user_id: &str, refill: i64) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query!(
            r#"INSERT INTO seq_users (user_id) VALUES ($1)
               ON CONFLICT (user_id) DO NOTHING"#,
            user_id,
        )
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query!(
            r#"SELECT max_seq FROM seq_users WHERE user_id = $1 FOR UPDATE"#,
            user_id,
        )
        .fetch_one(&mut *tx)
        .await?;
        let prev_max = row.max_seq;
        sqlx::query!(
            r#"UPDATE seq_users SET max_seq = $2 WHERE user_id = $1"#,
            user_id,
            prev_max + refill,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(prev_max)
    }

    pub async fn insert_timeline_entry(&self, entry: &TimelineEntry) -> Result<(), StoreError> {
        sqlx::query!(
            r#"INSERT INTO user_timelines
                   (owner_id, seq, conversation_id, msg_id, ref_msg_seq, msg_type, sender_id, snapshot, create_time)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (owner_id, seq) DO NOTHING"#,
            entry.owner_id,
            entry.seq,
            entry.conversation_id,
            entry.msg_id,
            entry.ref_msg_seq,
            entry.msg_type,
            entry.sender_id,
            entry.snapshot,
            entry.create_time,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_timeline(
        &self,
        owner_id: &str,
        from_seq: i64,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        let rows = sqlx::query!(
            r#"SELECT owner_id, seq, conversation_id, msg_id, ref_msg_seq, msg_type, sender_id, snapshot, create_time
               FROM user_timelines
               WHERE owner_id = $1 AND seq >= $2
               ORDER BY seq ASC"#,
            owner_id,
            from_seq,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TimelineEntry {
                owner_id: row.owner_id,
                seq: row.seq,
                conversation_id: row.conversation_id,
                msg_id: row.msg_id,
                ref_msg_seq: row.ref_msg_seq,
                msg_type: row.msg_type,
                sender_id: row.sender_id,
                snapshot: row.snapshot,
                create_time: row.create_time,
            })
            .collect())
    }
}
