// Fan-out Pusher, per spec.md §4.F: consumes the `push` topic and delivers
// each stored message to every live session of its recipients, over the
// same `SessionRegistry` the WS handlers register sessions into — folded
// into this binary rather than split into its own per SPEC_FULL.md §10,
// since the original wires the pusher directly against the live WS server
// reference rather than over a network hop.

use std::sync::Arc;

use im_allocator::SeqCache;
use im_cache::RawStore;
use im_protocol::{conversation, req_identifier, Message, OutEnvelope};
use im_queue::{Handler, QueueError, Record};
use im_store::{MessageStore, SeqStore};
use tracing::{debug, warn};

use crate::group::GroupDirectory;
use crate::registry::SessionRegistry;

pub struct Pusher {
    registry: Arc<SessionRegistry>,
    group_directory: Arc<dyn GroupDirectory>,
}

impl Pusher {
    pub fn new(registry: Arc<SessionRegistry>, group_directory: Arc<dyn GroupDirectory>) -> Self {
        Self { registry, group_directory }
    }

    pub fn from_state<Csq, Rs, St>(state: &crate::state::AppState<Csq, Rs, St>) -> Self
    where
        Csq: SeqCache + 'static,
        Rs: RawStore + 'static,
        St: MessageStore + SeqStore + 'static,
    {
        Self::new(state.registry.clone(), state.group_directory.clone())
    }

    /// Recipients of `message`: the other participant for a 1:1 conversation,
    /// every group member for a group conversation (minus the sender, who
    /// already has it from its own send path).
    async fn recipients(&self, message: &Message) -> Vec<String> {
        if conversation::is_group(&message.conversation_id) {
            self.group_directory
                .members(&message.target_id)
                .await
                .into_iter()
                .filter(|m| m != &message.sender_id)
                .collect()
        } else {
            vec![message.target_id.clone()]
        }
    }

    async fn deliver_to(&self, user_id: &str, message: &Message) {
        let sessions = self.registry.get_all(user_id).await;
        if sessions.is_empty() {
            debug!(user_id, conversation_id = %message.conversation_id, "push dropped, no live session");
            return;
        }
        let envelope = OutEnvelope::ok(
            req_identifier::WS_PUSH_MSG,
            String::new(),
            serde_json::to_value(message).unwrap_or_default(),
        );
        for session in sessions {
            if !session.send_envelope(&envelope).await {
                warn!(user_id, session_id = session.id(), "push write failed, closing session");
                session.close(&self.registry).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler<Message> for Pusher {
    async fn handle(&self, record: Record<Message>) -> Result<(), QueueError> {
        let message = record.value;
        for recipient in self.recipients(&message).await {
            self.deliver_to(&recipient, &message).await;
        }
        Ok(())
    }
}
