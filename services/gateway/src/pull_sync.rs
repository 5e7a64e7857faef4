// Pull/Sync visibility-window arithmetic, per spec.md §4.I. Every read here
// is bounded below by the user's recorded `min_seq` for the conversation
// (set when they joined — they never see history from before that) and
// above by whichever is tighter: the user's own pinned `max_seq` (set when
// they left a conversation, so they stop seeing anything past that point)
// or the allocator's live ceiling for conversations they're still a member
// of. `max_seq = 0` on the membership row means "no pin" — fall through to
// the live allocator value — matching the table's `DEFAULT 0` and the fact
// that `0` is never an assignable sequence number.

use std::collections::HashMap;

use im_allocator::{Allocator, AllocatorError, SeqCache};
use im_cache::{Cache, CacheError, RawStore};
use im_protocol::{
    ConvReadSeq as WireConvReadSeq, GetConvMaxReadSeqResp, GetNewestSeqResp, Message, Order,
    PullConvLastMessageResp, PullMsgBySeqListResp, PullMsgResp,
};
use im_store::{MessageStore, SeqStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PullSyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Resolves the `[lo, hi]` seq range `user_id` may see in `conversation_id`,
/// or `None` if they have no membership row (never joined, or the store
/// hasn't caught up with a just-issued `upsert_conversation`).
async fn visibility_window<Csq, St>(
    allocator: &Allocator<Csq, St>,
    store: &St,
    user_id: &str,
    conversation_id: &str,
) -> Result<Option<(i64, i64)>, PullSyncError>
where
    Csq: SeqCache,
    St: MessageStore + SeqStore,
{
    let rows = store
        .get_conv_read_max_seq(user_id, std::slice::from_ref(&conversation_id.to_owned()))
        .await?;
    let Some(row) = rows.get(conversation_id) else {
        return Ok(None);
    };
    let live_max = allocator.current_max_seq(conversation_id).await?;
    let hi = if row.max_seq > 0 { row.max_seq.min(live_max) } else { live_max };
    Ok(Some((row.min_seq, hi)))
}

/// 1005 WSPullMsg: seq-range pull. Clamps the caller's `[begin_seq, end_seq]`
/// to the visibility window before fetching, and reports `is_end` so the
/// client knows whether to keep paging.
pub async fn pull_by_seq_range<Csq, Rs, St>(
    allocator: &Allocator<Csq, St>,
    _cache: &Cache<Rs>,
    store: &St,
    user_id: &str,
    conversation_id: &str,
    begin_seq: i64,
    end_seq: i64,
    num: i64,
    order: Order,
) -> Result<PullMsgResp, PullSyncError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let Some((lo, hi)) = visibility_window(allocator, store, user_id, conversation_id).await? else {
        return Ok(PullMsgResp { messages: Vec::new(), is_end: true });
    };
    let clamped_begin = begin_seq.max(lo);
    let clamped_end = if end_seq > 0 { end_seq.min(hi) } else { hi };
    if clamped_begin > clamped_end {
        return Ok(PullMsgResp { messages: Vec::new(), is_end: true });
    }
    // Always select from the end of the window backward: spec.md §4.I's
    // truncation rule ("return the last `num` of the range") keeps the
    // highest-seq messages regardless of requested order, so an ascending
    // pull over a window wider than `num` must come back as the *top* `num`
    // seqs (reversed into ascending presentation), not the bottom `num`.
    let mut messages = store
        .fetch_messages_in_range(conversation_id, clamped_begin, clamped_end, num.max(1), true)
        .await?;
    if order == Order::Asc {
        messages.reverse();
    }
    let is_end = match order {
        Order::Asc => messages.last().map(|m| m.seq).unwrap_or(clamped_begin) >= clamped_end,
        Order::Desc => messages.last().map(|m| m.seq).unwrap_or(clamped_end) <= clamped_begin,
    };
    Ok(PullMsgResp { messages, is_end })
}

/// 1002 WSPullMsgBySeqList: pulls an explicit set of seqs, silently dropping
/// any outside the caller's visibility window rather than erroring — a
/// client racing a leave/kick shouldn't get an error for a seq it legitimately
/// can no longer see.
pub async fn pull_by_seq_list<Csq, Rs, St>(
    allocator: &Allocator<Csq, St>,
    _cache: &Cache<Rs>,
    store: &St,
    user_id: &str,
    conversation_id: &str,
    seqs: &[i64],
    order: Order,
) -> Result<PullMsgBySeqListResp, PullSyncError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let Some((lo, hi)) = visibility_window(allocator, store, user_id, conversation_id).await? else {
        return Ok(PullMsgBySeqListResp { messages: Vec::new(), is_end: true, end_seq: 0 });
    };
    // Per spec.md §4.I: descending pulls that asked for anything below `lo`
    // have reached the visibility floor (`end_seq = lo`); ascending pulls
    // that asked for anything above `hi` have reached the ceiling
    // (`end_seq = hi`). The two directions never share an `end_seq`.
    let (is_end, end_seq) = match order {
        Order::Desc => (seqs.iter().any(|s| *s < lo), lo),
        Order::Asc => (seqs.iter().any(|s| *s > hi), hi),
    };
    let visible: Vec<i64> = seqs.iter().copied().filter(|s| *s >= lo && *s <= hi).collect();
    if visible.is_empty() {
        return Ok(PullMsgBySeqListResp { messages: Vec::new(), is_end, end_seq });
    }
    let mut messages = store.fetch_messages_by_seq_list(conversation_id, &visible).await?;
    if order == Order::Desc {
        messages.reverse();
    }
    Ok(PullMsgBySeqListResp { messages, is_end, end_seq })
}

/// 1007 WSPullConvLastMessage: the newest visible message in each requested
/// conversation, or `None` if the conversation is empty (or not visible to
/// this user) — never an error, per spec.md §4.I.
pub async fn last_messages<Csq, Rs, St>(
    allocator: &Allocator<Csq, St>,
    cache: &Cache<Rs>,
    store: &St,
    user_id: &str,
    conversation_ids: &[String],
) -> Result<PullConvLastMessageResp, PullSyncError>
where
    Csq: SeqCache,
    Rs: RawStore,
    St: MessageStore + SeqStore,
{
    let mut last_messages = HashMap::new();
    for conversation_id in conversation_ids {
        let Some((lo, hi)) = visibility_window(allocator, store, user_id, conversation_id).await? else {
            last_messages.insert(conversation_id.clone(), None);
            continue;
        };
        if hi < lo {
            last_messages.insert(conversation_id.clone(), None);
            continue;
        }
        let key = im_cache::keys::message(conversation_id, hi);
        let conv_id = conversation_id.clone();
        let message: Option<Message> = cache
            .get_or_load(&key, std::time::Duration::from_secs(24 * 3600), || async {
                let mut found = store
                    .fetch_messages_by_seq_list(&conv_id, &[hi])
                    .await
                    .map_err(|e| CacheError::Loader(e.to_string()))?;
                Ok(found.pop())
            })
            .await?;
        last_messages.insert(conversation_id.clone(), message);
    }
    Ok(PullConvLastMessageResp { last_messages })
}

/// 1001 WSGetNewestSeq: the current allocator ceiling for every conversation
/// `user_id` belongs to, per spec.md §4.I's "max-seq for all convs" — needs
/// the user's conversation list before it can batch the allocator, which is
/// why [`im_store::MessageStore::list_conversations`] exists. Conversations
/// whose live max is still zero (nothing ever sent) are omitted, matching
/// the original's "filter out zero-seq conversations".
pub async fn newest_seqs<Csq, St>(
    allocator: &Allocator<Csq, St>,
    store: &St,
    user_id: &str,
) -> Result<GetNewestSeqResp, PullSyncError>
where
    Csq: SeqCache,
    St: MessageStore + SeqStore,
{
    let conversation_ids = store.list_conversations(user_id).await?;
    let mut max_seqs = HashMap::new();
    for conversation_id in conversation_ids {
        let live_max = allocator.current_max_seq(&conversation_id).await?;
        if live_max > 0 {
            max_seqs.insert(conversation_id, live_max);
        }
    }
    Ok(GetNewestSeqResp { max_seqs })
}

/// 1006 WSGetConvMaxReadSeq: the `(read_seq, max_seq)` pair for each
/// requested conversation, with `max_seq` resolved against the live
/// allocator the same way the visibility window is, so a client sees the
/// true unread count rather than a stale cached ceiling.
pub async fn conv_read_max_seq<Csq, St>(
    allocator: &Allocator<Csq, St>,
    store: &St,
    user_id: &str,
    conversation_ids: &[String],
) -> Result<GetConvMaxReadSeqResp, PullSyncError>
where
    Csq: SeqCache,
    St: MessageStore + SeqStore,
{
    let rows = store.get_conv_read_max_seq(user_id, conversation_ids).await?;
    let mut conversations = HashMap::new();
    for conversation_id in conversation_ids {
        let Some(row) = rows.get(conversation_id) else {
            continue;
        };
        let live_max = allocator.current_max_seq(conversation_id).await?;
        let max_seq = if row.max_seq > 0 { row.max_seq.min(live_max) } else { live_max };
        conversations.insert(
            conversation_id.clone(),
            WireConvReadSeq { read_seq: row.read_seq, max_seq },
        );
    }
    Ok(GetConvMaxReadSeqResp { conversations })
}
