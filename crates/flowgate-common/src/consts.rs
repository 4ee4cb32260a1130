//! Stable identifiers and limits. These are part of the control plane's
//! contract: the provider and sublayer keys identify our filters across
//! service restarts, and the wire limits bound every IPC exchange.

use std::time::Duration;

use uuid::{uuid, Uuid};

/// Provider object owning every filter this service pins.
pub const PROVIDER_KEY: Uuid = uuid!("b16b0914-6b71-4c0a-9a6f-8b7d26f55b2a");

/// Sublayer holding our filters; weight decides arbitration among sublayers.
pub const SUBLAYER_KEY: Uuid = uuid!("4ee8dc6b-2a4f-4d07-8f55-3c91b1a0d9e4");

pub const SUBLAYER_WEIGHT: u16 = 0x8000;

/// Fixed key for the end-to-end pipeline check filter.
pub const DEMO_BLOCK_FILTER_KEY: Uuid = uuid!("9d3b2a1c-5e88-49c2-b1d4-7a6f0c2e8b31");

/// Sinkhole endpoint for the demo block filter (TEST-NET-1).
pub const DEMO_BLOCK_REMOTE_IP: [u8; 4] = [192, 0, 2, 1];
pub const DEMO_BLOCK_REMOTE_PORT: u16 = 80;

pub const SERVICE_NAME: &str = "flowgated";
pub const SERVICE_DISPLAY_NAME: &str = "Flowgate Traffic Control";

/// Endpoint identifier; on the reference host this is the pipe name under
/// `\\.\pipe\`. On Unix hosts the endpoint is a socket file of the same
/// name-space under the data directory.
pub const PIPE_NAME: &str = "WfpTrafficControl";
pub const SOCKET_FILE: &str = "flowgate.sock";

pub const DEFAULT_DATA_DIR: &str = "/var/lib/flowgate";
pub const LKG_FILE: &str = "lkg-policy.json";
pub const LKG_TMP_FILE: &str = "lkg.tmp";
pub const AUDIT_FILE: &str = "audit.log";
pub const HISTORY_DIR: &str = "History";
pub const HISTORY_INDEX_FILE: &str = "history-index.json";

/// Group whose members may drive the control surface (the local
/// administrators group on the reference host).
pub const ADMIN_GROUP: &str = "flowgate-admin";

// Wire protocol.
pub const PROTOCOL_VERSION_MIN: i64 = 0;
pub const PROTOCOL_VERSION: i64 = 1;
pub const MAX_MESSAGE_SIZE: usize = 65_536;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

// Policy limits.
pub const MAX_POLICY_BYTES: usize = 1024 * 1024;
pub const MAX_RULES: usize = 10_000;
pub const MAX_RULE_ID_LEN: usize = 128;
pub const MAX_COMMENT_LEN: usize = 1024;
pub const MAX_PROCESS_PATH_LEN: usize = 260;

/// Compiled filter weight floor; rule priority is added on top.
pub const BASE_FILTER_WEIGHT: i64 = 1000;

// Rate limiting.
pub const RATE_LIMIT_CAPACITY: u32 = 10;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_LIMIT_PRUNE_EVERY: u64 = 100;

pub const MAX_HISTORY_ENTRIES: usize = 100;

// File watcher debounce.
pub const DEBOUNCE_DEFAULT_MS: u64 = 1000;
pub const DEBOUNCE_MIN_MS: u64 = 100;
pub const DEBOUNCE_MAX_MS: u64 = 30_000;

/// How many filters a single enumeration call requests from the platform.
pub const ENUM_BATCH_SIZE: usize = 100;
