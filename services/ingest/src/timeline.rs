// User-timeline materialization, per spec.md §4.C: a 1:1 message appends a
// per-recipient timeline entry whose own `(owner_id, seq)` is assigned by a
// row-locked per-user counter. Group-timeline materialization is called out
// in spec.md §9 as a deferred policy hook rather than a contract this
// pipeline owns, so this is modeled as a pluggable trait the same way
// gateway's `GroupDirectory`/`KickPolicy` are: a reference implementation
// covers the 1:1 case, groups are a no-op until fan-in is scoped.

use im_protocol::{ConvType, Message};
use im_store::{MessageStore, SeqStore, TimelineEntry};
use tracing::warn;

#[async_trait::async_trait]
pub trait TimelinePolicy<St>: Send + Sync
where
    St: MessageStore + SeqStore,
{
    async fn materialize(&self, store: &St, message: &Message);
}

pub struct RecipientTimelinePolicy;

#[async_trait::async_trait]
impl<St> TimelinePolicy<St> for RecipientTimelinePolicy
where
    St: MessageStore + SeqStore,
{
    async fn materialize(&self, store: &St, message: &Message) {
        if message.conv_type != ConvType::Single {
            return;
        }
        let owner_id = message.target_id.clone();
        let seq = match store.refill_user_seq(&owner_id, 1).await {
            Ok(prev_max) => prev_max + 1,
            Err(err) => {
                warn!(owner_id = %owner_id, %err, "failed allocating timeline seq, skipping entry");
                return;
            }
        };
        let entry = TimelineEntry {
            owner_id,
            seq,
            conversation_id: message.conversation_id.clone(),
            msg_id: message.id,
            ref_msg_seq: message.seq,
            msg_type: message.msg_type,
            sender_id: message.sender_id.clone(),
            snapshot: message.content.clone(),
            create_time: message.create_time,
        };
        if let Err(err) = store.insert_timeline_entry(&entry).await {
            warn!(owner_id = %entry.owner_id, %err, "failed inserting timeline entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use im_test_support::InMemoryStore;

    #[tokio::test]
    async fn single_chat_message_gets_a_recipient_timeline_entry() {
        let store = InMemoryStore::default();
        let message = Message {
            id: 1,
            conversation_id: "single:1_2".to_owned(),
            seq: 1,
            sender_id: "1".to_owned(),
            target_id: "2".to_owned(),
            conv_type: ConvType::Single,
            msg_type: 100,
            content: serde_json::json!({"text": "hi"}),
            send_time: 0,
            create_time: 0,
        };
        RecipientTimelinePolicy.materialize(&store, &message).await;

        let timeline = store.fetch_timeline("2", 0).await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].seq, 1);
        assert_eq!(timeline[0].msg_id, 1);

        let sender_timeline = store.fetch_timeline("1", 0).await.unwrap();
        assert!(sender_timeline.is_empty());
    }

    #[tokio::test]
    async fn group_messages_are_left_for_a_future_policy() {
        let store = InMemoryStore::default();
        let message = Message {
            id: 2,
            conversation_id: "group:g1".to_owned(),
            seq: 1,
            sender_id: "1".to_owned(),
            target_id: "g1".to_owned(),
            conv_type: ConvType::Group,
            msg_type: 100,
            content: serde_json::json!({"text": "hi"}),
            send_time: 0,
            create_time: 0,
        };
        RecipientTimelinePolicy.materialize(&store, &message).await;
        assert!(store.fetch_timeline("g1", 0).await.unwrap().is_empty());
    }
}
