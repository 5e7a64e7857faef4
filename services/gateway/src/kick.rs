// Multi-device kick policy, per spec.md §4.H / §9's open question: "Precise
// policy for multi-device kicking (same-token vs. same-platform) is a stub
// in sources; the specification leaves it pluggable." `KickPolicy` is the
// pluggable seam; the reference implementation leaves coexistence untouched
// (kicks no one), matching the original's empty `multiTerminalLoginChecker`.

use crate::session::Session;

#[async_trait::async_trait]
pub trait KickPolicy: Send + Sync {
    /// Called when `session` is about to be registered for `user_id` at
    /// `platform_id`, with whatever sessions already occupy that
    /// `(user_id, platform_id)` slot. Returns the subset of `existing` that
    /// should be sent a `WSKickOnlineMsg` frame and closed.
    async fn on_new_session(&self, user_id: &str, platform_id: i32, existing: &[Session]) -> Vec<Session>;
}

pub struct NoKickPolicy;

#[async_trait::async_trait]
impl KickPolicy for NoKickPolicy {
    async fn on_new_session(&self, _user_id: &str, _platform_id: i32, _existing: &[Session]) -> Vec<Session> {
        Vec::new()
    }
}

/// Kicks every prior session at the same `(user_id, platform_id)` — the
/// "one session per platform" policy some deployments want in place of the
/// default coexistence behavior.
pub struct SinglePlatformSessionPolicy;

#[async_trait::async_trait]
impl KickPolicy for SinglePlatformSessionPolicy {
    async fn on_new_session(&self, _user_id: &str, _platform_id: i32, existing: &[Session]) -> Vec<Session> {
        existing.to_vec()
    }
}
