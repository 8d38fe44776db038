use std::env;
use std::time::Duration;

/// Session configuration. ICE servers are injected here; the core never
/// hardcodes or provides STUN/TURN itself.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// How long a Disconnected link is retained before it is failed.
    pub disconnect_grace: Duration,
    /// Quality sampling interval.
    pub sample_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            disconnect_grace: Duration::from_secs(10),
            sample_interval: Duration::from_secs(2),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
        }
    }
}

impl RoomConfig {
    pub fn new(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signaling_url: env::var("INTERVIEW_SIGNALING_URL")
                .unwrap_or(defaults.signaling_url),
            ice_servers: env::var("INTERVIEW_ICE_SERVERS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.ice_servers),
            disconnect_grace: env::var("INTERVIEW_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.disconnect_grace),
            sample_interval: env::var("INTERVIEW_SAMPLE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sample_interval),
            reconnect_attempts: defaults.reconnect_attempts,
            reconnect_delay: defaults.reconnect_delay,
        }
    }
}
