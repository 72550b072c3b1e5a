pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"piece-manager/snapshot/";

pub const SECTOR_ID_COUNTER_KEY: &[u8] = b"piece-manager/sector-id-counter/";

pub const DEFAULT_NUM_WORKERS: usize = 2;

pub const DEFAULT_MAX_STAGE_RETRIES: u32 = 3;

// Bounds the number of in-flight requests queued for the scheduler thread.
pub const SCHEDULER_CHANNEL_CAPACITY: usize = 256;

// Events buffered per subscriber; later events are dropped until it drains.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

// Delay before re-applying stage results whose transition could not be
// persisted.
pub const PERSIST_RETRY_INTERVAL_MS: u64 = 1000;

pub const ABORT_FAILURE_REASON: &str = "sealing aborted";
