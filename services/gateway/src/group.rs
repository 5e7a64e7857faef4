// Group membership resolution is an external collaborator per spec.md §1:
// "User/friend/group CRUD services — provide `group_members(group_id) ->
// [user_id]`." `GroupDirectory` is that seam; this crate ships only the
// trait plus a stub that reports every group as empty, matching
// spec.md §9's framing of this as deferred policy, not a contract this core
// owns.

#[async_trait::async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn members(&self, group_id: &str) -> Vec<String>;
}

pub struct EmptyGroupDirectory;

#[async_trait::async_trait]
impl GroupDirectory for EmptyGroupDirectory {
    async fn members(&self, _group_id: &str) -> Vec<String> {
        Vec::new()
    }
}
