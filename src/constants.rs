// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";
pub const WS_CONNECT_PATH: &str = "connect";
pub const EVENTS_PATH: &str = "events";
pub const API_PREFIX: [&str; 3] = ["api", "v1", "realtime"];

// Poll transport timing
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

// Push sockets are pinged this often so that quiet clients stay active
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

// Idle clients are reaped after this long without activity
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

// Global rate limit tiers
pub const DEFAULT_BURST_LIMIT: u64 = 10;
pub const DEFAULT_BURST_WINDOW_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u64 = 60;

pub const DEFAULT_CHANNEL: &str = "general";
pub const ANNOUNCEMENT_CHANNELS: [&str; 2] = ["general", "announcements"];

// Header carrying the identity verified by the upstream auth layer
pub const IDENTITY_HEADER: &str = "x-authenticated-user-id";
pub const API_KEY_HEADER: &str = "x-api-key";

// Ids minted for poll clients; push clients may not claim them
pub const POLL_CLIENT_PREFIX: &str = "sse_";
