// Composition root: the explicit dependency-injected handles spec.md §9
// calls for in place of global singletons. `AppState` is generic over the
// allocator's cache backend, the message cache's raw store, and the durable
// store, so production code wires the Redis/Postgres implementations while
// tests wire `im-test-support`'s in-memory doubles — the same pattern
// `im-allocator`/`im-cache` already use for their own single-dependency
// generics, just composed one level up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use im_allocator::{Allocator, SeqCache};
use im_cache::{Cache, RawStore};
use im_protocol::SendMsgReq;
use im_queue::Producer;
use im_store::{MessageStore, SeqStore};

use crate::auth::IdentityVerifier;
use crate::group::GroupDirectory;
use crate::kick::KickPolicy;
use crate::registry::SessionRegistry;

pub struct AppState<Csq, Rs, St>
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    pub allocator: Arc<Allocator<Csq, St>>,
    pub cache: Arc<Cache<Rs>>,
    pub store: Arc<St>,
    pub registry: Arc<SessionRegistry>,
    pub producer: Arc<dyn Producer<SendMsgReq>>,
    pub group_directory: Arc<dyn GroupDirectory>,
    pub identity_verifier: Arc<dyn IdentityVerifier>,
    pub kick_policy: Arc<dyn KickPolicy>,
    connections: Arc<AtomicUsize>,
    pub max_connections: usize,
}

// Derived `Clone` would require `Csq: Clone` / `Rs: Clone` / `St: Clone`
// bounds even though every field is already behind an `Arc`; implement it
// by hand to keep the bounds on the struct itself, not on every clone site.
impl<Csq, Rs, St> Clone for AppState<Csq, Rs, St>
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    fn clone(&self) -> Self {
        Self {
            allocator: self.allocator.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            producer: self.producer.clone(),
            group_directory: self.group_directory.clone(),
            identity_verifier: self.identity_verifier.clone(),
            kick_policy: self.kick_policy.clone(),
            connections: self.connections.clone(),
            max_connections: self.max_connections,
        }
    }
}

impl<Csq, Rs, St> AppState<Csq, Rs, St>
where
    Csq: SeqCache + 'static,
    Rs: RawStore + 'static,
    St: MessageStore + SeqStore + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        allocator: Allocator<Csq, St>,
        cache: Cache<Rs>,
        store: St,
        producer: Arc<dyn Producer<SendMsgReq>>,
        group_directory: Arc<dyn GroupDirectory>,
        identity_verifier: Arc<dyn IdentityVerifier>,
        kick_policy: Arc<dyn KickPolicy>,
        max_connections: usize,
    ) -> Self {
        Self {
            allocator: Arc::new(allocator),
            cache: Arc::new(cache),
            store: Arc::new(store),
            registry: Arc::new(SessionRegistry::new()),
            producer,
            group_directory,
            identity_verifier,
            kick_policy,
            connections: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Enforces the process-wide connection cap from spec.md §4.G. Returns
    /// `true` (and holds the slot) if admission succeeds; the caller must
    /// call [`release_connection_slot`](Self::release_connection_slot) when
    /// the connection ends.
    pub fn try_acquire_connection_slot(&self) -> bool {
        loop {
            let current = self.connections.load(Ordering::SeqCst);
            if current >= self.max_connections {
                return false;
            }
            if self
                .connections
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_connection_slot(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}
