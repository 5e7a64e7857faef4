// Trait seams over `Store` so the allocator and the ingest/pull services can
// be unit tested against an in-memory double (see `im-test-support`)
// instead of a live Postgres instance. `Store` implements both; production
// code is generic over the trait, not the concrete type.

use std::collections::HashMap;

use im_protocol::Message;

use crate::{ConvReadSeq, Store, StoreError, TimelineEntry};

/// The allocator's only dependency on the durable store: the row-locked
/// refill of a conversation's (or user's) counter row.
#[async_trait::async_trait]
pub trait SeqStore: Send + Sync {
    async fn refill_conversation_seq(&self, conversation_id: &str, refill: i64) -> Result<i64, StoreError>;
    async fn refill_user_seq(&self, user_id: &str, refill: i64) -> Result<i64, StoreError>;
}

#[async_trait::async_trait]
impl SeqStore for Store {
    async fn refill_conversation_seq(&self, conversation_id: &str, refill: i64) -> Result<i64, StoreError> {
        Store::refill_conversation_seq(self, conversation_id, refill).await
    }

    async fn refill_user_seq(&self, user_id: &str, refill: i64) -> Result<i64, StoreError> {
        Store::refill_user_seq(self, user_id, refill).await
    }
}

/// The ingest pipeline's and pull/sync service's dependency on the durable
/// store: message persistence, conversation membership and per-conversation
/// read/visibility bounds, and the user timeline.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<(), StoreError>;
    async fn fetch_messages_by_seq_list(&self, conversation_id: &str, seqs: &[i64]) -> Result<Vec<Message>, StoreError>;
    async fn fetch_messages_in_range(
        &self,
        conversation_id: &str,
        begin_seq: i64,
        end_seq: i64,
        limit: i64,
        descending: bool,
    ) -> Result<Vec<Message>, StoreError>;
    async fn upsert_conversation(&self, user_id: &str, conversation_id: &str) -> Result<(), StoreError>;
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<String>, StoreError>;
    async fn set_conversation_read_seq(
        &self,
        user_id: &str,
        conversation_id: &str,
        read_seq: i64,
        max_seq: i64,
    ) -> Result<(), StoreError>;
    async fn get_conv_read_max_seq(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, ConvReadSeq>, StoreError>;
    async fn insert_timeline_entry(&self, entry: &TimelineEntry) -> Result<(), StoreError>;
    async fn fetch_timeline(&self, owner_id: &str, from_seq: i64) -> Result<Vec<TimelineEntry>, StoreError>;
}

#[async_trait::async_trait]
impl MessageStore for Store {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<(), StoreError> {
        Store::upsert_messages(self, messages).await
    }

    async fn fetch_messages_by_seq_list(&self, conversation_id: &str, seqs: &[i64]) -> Result<Vec<Message>, StoreError> {
        Store::fetch_messages_by_seq_list(self, conversation_id, seqs).await
    }

    async fn fetch_messages_in_range(
        &self,
        conversation_id: &str,
        begin_seq: i64,
        end_seq: i64,
        limit: i64,
        descending: bool,
    ) -> Result<Vec<Message>, StoreError> {
        Store::fetch_messages_in_range(self, conversation_id, begin_seq, end_seq, limit, descending).await
    }

    async fn upsert_conversation(&self, user_id: &str, conversation_id: &str) -> Result<(), StoreError> {
        Store::upsert_conversation(self, user_id, conversation_id).await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Store::list_conversations(self, user_id).await
    }

    async fn set_conversation_read_seq(
        &self,
        user_id: &str,
        conversation_id: &str,
        read_seq: i64,
        max_seq: i64,
    ) -> Result<(), StoreError> {
        Store::set_conversation_read_seq(self, user_id, conversation_id, read_seq, max_seq).await
    }

    async fn get_conv_read_max_seq(
        &self,
        user_id: &str,
        conversation_ids: &[String],
    ) -> Result<HashMap<String, ConvReadSeq>, StoreError> {
        Store::get_conv_read_max_seq(self, user_id, conversation_ids).await
    }

    async fn insert_timeline_entry(&self, entry: &TimelineEntry) -> Result<(), StoreError> {
        Store::insert_timeline_entry(self, entry).await
    }

    async fn fetch_timeline(&self, owner_id: &str, from_seq: i64) -> Result<Vec<TimelineEntry>, StoreError> {
        Store::fetch_timeline(self, owner_id, from_seq).await
    }
}
