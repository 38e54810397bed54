use std::time::Duration;

use reqwest::header::HeaderMap;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Filename of the output playlist on the local endpoint.
pub const PLAYLIST_FILENAME: &str = "stream.m3u8";

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub http: HttpConfig,
    pub monitor: MonitorConfig,
    pub live_monitor: LiveMonitorConfig,
    pub event_monitor: EventMonitorConfig,
    pub provider: ProviderConfig,
    pub live_provider: LiveProviderConfig,
    pub event_provider: EventProviderConfig,
    pub server: ServerConfig,
}

// --- HTTP Configuration ---
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Time allowed to establish the connection
    pub connect_timeout: Duration,
    /// Time allowed until response headers arrive
    pub response_timeout: Duration,
    /// Time allowed for the whole transfer, body included
    pub transfer_timeout: Duration,
    pub user_agent: String,
    pub headers: HeaderMap,
    /// Basic auth for credentialed sources
    pub credentials: Option<Credentials>,
    /// Query pairs appended to every playlist request
    pub playlist_query: Vec<(String, String)>,
    /// Query pairs appended to every segment request
    pub segment_query: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            response_timeout: Duration::from_secs(3),
            transfer_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            credentials: None,
            playlist_query: Vec::new(),
            segment_query: Vec::new(),
        }
    }
}

// --- Monitor Configuration ---
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Max concurrent segment downloads (default: 3)
    pub concurrent_download_max: usize,
    /// Poll interval used while the target duration is unknown
    pub default_poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            concurrent_download_max: 3,
            default_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveMonitorConfig {
    /// Number of segments kept in hand to maintain the download list
    pub window_size: usize,
    /// Number of segments we assume the server still retains
    pub alive_size: usize,
    /// Number of segments from the tail fetched after falling behind
    pub catch_up_size: usize,
}

impl Default for LiveMonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            alive_size: 5,
            catch_up_size: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventMonitorConfig {
    /// Number of segments allowed to pend for download before polling is suspended
    pub pending_max: usize,
    pub window_size: usize,
}

impl Default for EventMonitorConfig {
    fn default() -> Self {
        Self {
            pending_max: 5,
            window_size: 10,
        }
    }
}

// --- Provider Configuration ---
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Contiguous buffered segments required before output is served
    pub prebuffer_size: usize,
    /// Version written to output playlists
    pub hls_version: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            prebuffer_size: 2,
            hls_version: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveProviderConfig {
    /// Maximum number of cached segment payloads
    pub cache_max: usize,
    /// Number of segments in the output playlist
    pub playlist_window: usize,
}

impl Default for LiveProviderConfig {
    fn default() -> Self {
        Self {
            cache_max: 10,
            playlist_window: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventProviderConfig {
    /// Consecutive unchanged refreshes tolerated while buffering before a
    /// stalled segment is evicted
    pub unchanged_max: usize,
}

impl Default for EventProviderConfig {
    fn default() -> Self {
        Self { unchanged_max: 10 }
    }
}

// --- Server Configuration ---
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base URL segments are published under, e.g. `http://127.0.0.1:9999`
    pub service_url: String,
    /// Idle time between client playlist requests before `ClientIdle` is notified
    pub client_idle_timeout: Duration,
    /// Failed playlist requests tolerated in a row
    pub playlist_failure_max: u32,
    /// Unchanged playlist responses tolerated in a row
    pub playlist_unchanged_max: u32,
    /// Event cache size at which downloading pauses
    pub event_cache_upper: usize,
    /// Event cache size at which downloading resumes
    pub event_cache_lower: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:9999".to_owned(),
            client_idle_timeout: Duration::from_secs(5),
            playlist_failure_max: 10,
            playlist_unchanged_max: 10,
            event_cache_upper: 25,
            event_cache_lower: 20,
        }
    }
}

impl ServerConfig {
    pub fn playlist_url(&self) -> String {
        format!(
            "{}/{}",
            self.service_url.trim_end_matches('/'),
            PLAYLIST_FILENAME
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.monitor.concurrent_download_max, 3);
        assert_eq!(config.live_monitor.window_size, 10);
        assert_eq!(config.live_monitor.alive_size, 5);
        assert_eq!(config.live_monitor.catch_up_size, 2);
        assert_eq!(config.event_monitor.pending_max, 5);
        assert_eq!(config.provider.prebuffer_size, 2);
        assert_eq!(config.live_provider.cache_max, 10);
        assert_eq!(config.live_provider.playlist_window, 5);
        assert_eq!(config.event_provider.unchanged_max, 10);
        assert_eq!(config.http.response_timeout, Duration::from_secs(3));
        assert_eq!(config.http.transfer_timeout, Duration::from_secs(10));
    }

    #[test]
    fn playlist_url_joins_service_url() {
        let server = ServerConfig {
            service_url: "http://localhost:9999/".to_owned(),
            ..Default::default()
        };
        assert_eq!(server.playlist_url(), "http://localhost:9999/stream.m3u8");
    }
}
