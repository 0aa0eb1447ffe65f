//! Session and sandbox lifecycle: the in-memory session index fed by the
//! object watch, the idle reaper, the warm-pool controller, and the
//! per-principal client cache the API layer draws from.

pub mod client_cache;
pub mod index;
pub mod reaper;
pub mod scheduler;
pub mod warm_pool;
pub mod watch;

pub use client_cache::UserClientCache;
pub use index::SessionIndex;
pub use reaper::Reaper;
pub use scheduler::Scheduler;
pub use warm_pool::WarmPoolController;
pub use watch::WatchAdapter;

/// Annotation recording when a session began occupying its sandbox. For a
/// freshly created sandbox this equals the object's creation time; for a
/// sandbox donated by the warm pool it is stamped at claim time, so that
/// time spent idling warm does not count against the session TTL.
pub const ANNOTATION_SESSION_CREATED: &str = "session-created-at";
