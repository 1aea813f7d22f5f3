//! Constants for the download module (timeouts, chunking, throttling).

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes between body reads).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Bytes read from the source per iteration.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Bytes written between successive progress events.
pub const PROGRESS_THRESHOLD: u64 = 512 * 1024;

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 10;
