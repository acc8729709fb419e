use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub pending_room_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub close_grace_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("VC_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            poll_interval_ms: env::var("VC_RELAY_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
            command_timeout_ms: env::var("VC_RELAY_COMMAND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
            sync_timeout_ms: env::var("VC_RELAY_SYNC_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            pending_room_ttl_seconds: env::var("VC_RELAY_PENDING_ROOM_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            sweep_interval_seconds: env::var("VC_RELAY_SWEEP_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            close_grace_ms: env::var("VC_RELAY_CLOSE_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            poll_interval_ms: 200,
            command_timeout_ms: 5_000,
            sync_timeout_ms: 1_000,
            pending_room_ttl_seconds: 120,
            sweep_interval_seconds: 30,
            close_grace_ms: 250,
        }
    }
}
