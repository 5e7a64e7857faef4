// im-test-support: in-memory doubles and a WebSocket test client shared by
// the messaging core's integration tests, grounded on `crates/rt-test-utils`
// (same mock-client shape, same "fake the backing stores, exercise the
// protocol" approach).

pub mod in_memory;
pub mod mock_ws_client;

pub use in_memory::{InMemoryRawStore, InMemorySeqCache, InMemoryStore};
pub use mock_ws_client::MockWsClient;
