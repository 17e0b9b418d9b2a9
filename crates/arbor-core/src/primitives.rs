//! # Runtime Primitives
//!
//! Hardcoded limits and defaults for the Arbor runtime.

/// Default bound on root-to-node path length during path enumeration.
///
/// A node may have several parents, so the number of paths can grow
/// quickly in shared graphs. Enumeration stops at this depth.
pub const DEFAULT_MAX_TRAVERSAL_DEPTH: usize = 256;

/// Maximum number of root-to-node paths returned by a single query.
pub const MAX_PATH_COUNT: usize = 1024;

/// Environment variable selecting the reactivation policy.
pub const ENV_REACTIVATION: &str = "ARBOR_REACTIVATION";

/// Environment variable toggling last-seen snapshots.
pub const ENV_RETAIN_LAST_SEEN: &str = "ARBOR_RETAIN_LAST_SEEN";

/// Environment variable overriding the traversal depth bound.
pub const ENV_MAX_TRAVERSAL_DEPTH: &str = "ARBOR_MAX_TRAVERSAL_DEPTH";

/// Environment variable selecting the log format (`text` or `json`).
pub const ENV_LOG_FORMAT: &str = "ARBOR_LOG_FORMAT";
