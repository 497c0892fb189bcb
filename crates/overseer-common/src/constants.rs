// Well-known defaults shared by the master and worker processes.

use std::time::Duration;

/// Default TCP port the master listens on for worker connections.
pub const DEFAULT_WORKER_PORT: u16 = 9989;

/// Default TCP port the master listens on for build submissions.
pub const DEFAULT_TRIGGER_PORT: u16 = 9988;

/// Interval at which a connected worker sends heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A worker silent for longer than this is considered offline.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the master scans the registry for stale workers.
pub const HEARTBEAT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Times a request is re-queued after losing its worker before it is
/// marked permanently failed.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// How long the master waits for an abort acknowledgement before it
/// force-disconnects the worker.
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(10);

/// Largest frame either side will encode or accept (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Environment variable overriding the settings file path.
pub mod env_vars {
    pub const MASTER_SETTINGS: &str = "OVERSEER_MASTER_SETTINGS";
    pub const WORKER_SETTINGS: &str = "OVERSEER_WORKER_SETTINGS";
}

/// Process exit codes.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}
