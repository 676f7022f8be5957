//! Tunables shared across the control plane.

use std::time::Duration;

/// First retry delay after a peer RPC failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(8);
/// Retry delay cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Full syncs running in parallel start at this many peers and double per
/// success up to [`MAX_PARALLEL_SYNCS`].
pub const INITIAL_PARALLEL_SYNCS: usize = 2;
pub const MAX_PARALLEL_SYNCS: usize = 32;

/// Deadline applied to every outbound peer RPC.
pub const RPC_DEADLINE: Duration = Duration::from_secs(15);

/// Keep-alive period for initialized peers.
pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Values whose remaining TTL falls below this are omitted from dumps.
pub const TTL_THRESHOLD: Duration = Duration::from_millis(500);

/// Delay before draining rate-limited publications from the flood buffer.
pub const FLOOD_PENDING_DRAIN: Duration = Duration::from_millis(100);

/// Coalescing delay for prefix-manager KvStore reconciliation.
pub const KVSTORE_SYNC_THROTTLE: Duration = Duration::from_millis(100);

/// Default hold before the prefix manager's first full KvStore sync.
pub const PREFIX_INITIAL_SYNC_HOLD: Duration = Duration::from_secs(10);

/// Floor for the persist client's TTL refresh interval.
pub const MIN_TTL_REFRESH: Duration = Duration::from_secs(1);

/// Marker every prefix key starts with.
pub const PREFIX_DB_MARKER: &str = "prefix:";

/// Nexthop addresses for locally originated routes.
pub const LOCAL_ROUTE_NEXTHOP_V4: &str = "0.0.0.0";
pub const LOCAL_ROUTE_NEXTHOP_V6: &str = "::";

pub const DEFAULT_PATH_PREFERENCE: i32 = 1000;
pub const DEFAULT_SOURCE_PREFERENCE: i32 = 100;
