// Identity verification is explicitly out of scope per spec.md §1: "the
// gateway requires only a verifier that maps an opaque token to a `user_id`
// or rejects it." `IdentityVerifier` is that seam, injected at the
// composition root exactly the way `GroupDirectory` is (§10) — production
// deployments supply a real implementation (an HTTP call to the identity
// service, a local JWT check, whatever the token format turns out to be);
// this crate ships only the trait plus a pass-through reference
// implementation suitable for local development and tests.

#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Recovers a `user_id` from an opaque upgrade-time token, or `None` if
    /// the token is missing, malformed, or expired.
    async fn verify(&self, token: &str) -> Option<String>;
}

/// Treats the token itself as the `user_id`. Never appropriate in
/// production — the token format is explicitly out of scope — but it keeps
/// local runs and integration tests unblocked without standing up a real
/// identity service.
pub struct PassThroughVerifier;

#[async_trait::async_trait]
impl IdentityVerifier for PassThroughVerifier {
    async fn verify(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            None
        } else {
            Some(token.to_owned())
        }
    }
}
