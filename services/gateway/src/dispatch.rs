// Req_identifier dispatch table, per spec.md §4.G: every inbound envelope
// is routed by `req_identifier` to exactly one handler; an identifier this
// crate doesn't recognize gets `UNKNOWN_REQUEST` back rather than being
// dropped silently, and a payload that doesn't decode against the
// identifier's expected shape gets `INVALID_REQUEST`.

use im_allocator::{AllocatorError, SeqCache};
use im_cache::{Cache, RawStore};
use im_protocol::{
    codes, conversation, req_identifier, ConvType, GetConvMaxReadSeqReq, InEnvelope, OutEnvelope,
    PullConvLastMessageReq, PullMsgBySeqListReq, PullMsgReq, SendMsgReq, SendMsgResp,
};
use im_queue::{QueueError, INGEST_TOPIC};
use im_store::{MessageStore, SeqStore, StoreError};
use tracing::warn;

use crate::pull_sync::{self, PullSyncError};
use crate::state::AppState;

impl From<PullSyncError> for i32 {
    fn from(err: PullSyncError) -> Self {
        match err {
            PullSyncError::Allocator(AllocatorError::LockTimeout(_)) => codes::ALLOCATOR_UNAVAILABLE,
            PullSyncError::Allocator(AllocatorError::InvalidSize(_)) => codes::INVALID_REQUEST,
            _ => codes::INTERNAL_ERROR,
        }
    }
}

/// Routes one decoded inbound envelope to its handler and returns the
/// envelope to write back. Never panics or propagates an error out: every
/// failure path is folded into an `OutEnvelope::error` so the per-connection
/// reader loop can keep running.
pub async fn dispatch<Csq, Rs, St>(state: &AppState<Csq, Rs, St>, user_id: &str, env: InEnvelope) -> OutEnvelope
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let req_identifier = env.req_identifier;
    let msg_incr = env.msg_incr.clone();
    let result = match req_identifier {
        req_identifier::WS_GET_NEWEST_SEQ => handle_get_newest_seq(state, user_id).await,
        req_identifier::WS_PULL_MSG_BY_SEQ_LIST => handle_pull_by_seq_list(state, user_id, env).await,
        req_identifier::WS_SEND_MSG => handle_send_msg(state, user_id, env).await,
        req_identifier::WS_PULL_MSG => handle_pull_msg(state, user_id, env).await,
        req_identifier::WS_GET_CONV_MAX_READ_SEQ => handle_conv_max_read_seq(state, user_id, env).await,
        req_identifier::WS_PULL_CONV_LAST_MESSAGE => handle_last_message(state, user_id, env).await,
        req_identifier::WS_TEST => Ok(env.data),
        other => {
            return OutEnvelope::error(
                other,
                msg_incr,
                codes::UNKNOWN_REQUEST,
                format!("unknown req_identifier {other}"),
            )
        }
    };
    match result {
        Ok(data) => OutEnvelope::ok(req_identifier, msg_incr, data),
        Err(DispatchError::Decode) => OutEnvelope::error(
            req_identifier,
            msg_incr,
            codes::INVALID_REQUEST,
            "payload did not match the expected shape for this req_identifier",
        ),
        Err(DispatchError::PullSync(e)) => {
            warn!(user_id, req_identifier, error = %e, "dispatch handler failed");
            OutEnvelope::error(req_identifier, msg_incr, e.into(), "request failed")
        }
        Err(DispatchError::Queue(e)) => {
            warn!(user_id, req_identifier, error = %e, "publish to ingest failed");
            OutEnvelope::error(req_identifier, msg_incr, codes::INTERNAL_ERROR, "request failed")
        }
        Err(DispatchError::Store(e)) => {
            warn!(user_id, req_identifier, error = %e, "store call failed");
            OutEnvelope::error(req_identifier, msg_incr, codes::INTERNAL_ERROR, "request failed")
        }
    }
}

enum DispatchError {
    Decode,
    PullSync(PullSyncError),
    Queue(QueueError),
    Store(StoreError),
}

impl From<PullSyncError> for DispatchError {
    fn from(e: PullSyncError) -> Self {
        DispatchError::PullSync(e)
    }
}

impl From<QueueError> for DispatchError {
    fn from(e: QueueError) -> Self {
        DispatchError::Queue(e)
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        DispatchError::Store(e)
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, DispatchError> {
    serde_json::from_value(data).map_err(|_| DispatchError::Decode)
}

async fn handle_get_newest_seq<Csq, Rs, St>(
    state: &AppState<Csq, Rs, St>,
    user_id: &str,
) -> Result<serde_json::Value, DispatchError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let resp = pull_sync::newest_seqs(&state.allocator, &state.store, user_id).await?;
    Ok(serde_json::to_value(resp).unwrap_or_default())
}

async fn handle_pull_by_seq_list<Csq, Rs, St>(
    state: &AppState<Csq, Rs, St>,
    user_id: &str,
    env: InEnvelope,
) -> Result<serde_json::Value, DispatchError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let req: PullMsgBySeqListReq = decode(env.data)?;
    let resp = pull_sync::pull_by_seq_list(
        &state.allocator,
        &state.cache,
        &state.store,
        user_id,
        &req.conversation_id,
        &req.seqs,
        req.order,
    )
    .await?;
    Ok(serde_json::to_value(resp).unwrap_or_default())
}

async fn handle_pull_msg<Csq, Rs, St>(
    state: &AppState<Csq, Rs, St>,
    user_id: &str,
    env: InEnvelope,
) -> Result<serde_json::Value, DispatchError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let req: PullMsgReq = decode(env.data)?;
    let resp = pull_sync::pull_by_seq_range(
        &state.allocator,
        &state.cache,
        &state.store,
        user_id,
        &req.conversation_id,
        req.begin_seq,
        req.end_seq,
        req.num,
        req.order,
    )
    .await?;
    Ok(serde_json::to_value(resp).unwrap_or_default())
}

async fn handle_conv_max_read_seq<Csq, Rs, St>(
    state: &AppState<Csq, Rs, St>,
    user_id: &str,
    env: InEnvelope,
) -> Result<serde_json::Value, DispatchError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let req: GetConvMaxReadSeqReq = decode(env.data)?;
    let resp = pull_sync::conv_read_max_seq(&state.allocator, &state.store, user_id, &req.conversation_ids).await?;
    Ok(serde_json::to_value(resp).unwrap_or_default())
}

async fn handle_last_message<Csq, Rs, St>(
    state: &AppState<Csq, Rs, St>,
    user_id: &str,
    env: InEnvelope,
) -> Result<serde_json::Value, DispatchError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let req: PullConvLastMessageReq = decode(env.data)?;
    let resp = pull_sync::last_messages(&state.allocator, &state.cache, &state.store, user_id, &req.conversation_ids).await?;
    Ok(serde_json::to_value(resp).unwrap_or_default())
}

/// 1003 WSSendMsg. The durable seq/msg_id assignment happens asynchronously
/// downstream in the ingest pipeline, so this handler only validates the
/// request, registers the conversation membership for a brand-new 1:1 (group
/// membership is the group service's job, not the gateway's), and publishes
/// to the `ingest` topic keyed by conversation so a single ingest worker
/// owns ordering for that conversation. The immediate response is an
/// acknowledgment-of-submission — `seq`/`msg_id` are `0` sentinels; the
/// authoritative values arrive later over the same session as a `2001
/// WSPushMsg` frame once the ingest pipeline completes.
async fn handle_send_msg<Csq, Rs, St>(
    state: &AppState<Csq, Rs, St>,
    user_id: &str,
    env: InEnvelope,
) -> Result<serde_json::Value, DispatchError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let mut req: SendMsgReq = decode(env.data)?;
    req.sender_id = user_id.to_owned();

    let conversation_id = match req.conv_type {
        ConvType::Single => conversation::single(&req.sender_id, &req.target_id),
        ConvType::Group => conversation::group(&req.target_id),
    };

    if req.conv_type == ConvType::Single {
        state.store.upsert_conversation(&req.sender_id, &conversation_id).await?;
        state.store.upsert_conversation(&req.target_id, &conversation_id).await?;
    }

    state.producer.send(INGEST_TOPIC, &conversation_id, &req).await?;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let resp = SendMsgResp {
        conversation_id,
        client_msg_id: req.client_msg_id,
        msg_id: 0,
        seq: 0,
        send_time: now_ms,
    };
    Ok(serde_json::to_value(resp).unwrap_or_default())
}
