use std::time::Duration;

/// Engine configuration. Plain data, cloned freely.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// WebSocket endpoint of the messaging server.
    pub socket_url: String,
    /// Base URL for the history / mark-as-read REST API.
    pub api_base: String,
    /// Base URL for the AI assistant request/response API.
    pub assistant_base: String,
    /// Messages per history page.
    pub page_size: usize,
    /// Reconnect delays. After the last entry automatic retries stop and
    /// the connection surfaces a terminal Disconnected state.
    pub backoff: Vec<Duration>,
    /// How long an `invoke` issued while disconnected may wait for the
    /// connection to come back before rejecting.
    pub invoke_wait: Duration,
    /// Per-request timeout for REST calls.
    pub request_timeout: Duration,
    /// Minimum spacing between outbound read receipts.
    pub read_receipt_min_interval: Duration,
    /// How many prior turns accompany each stateless assistant call.
    pub ai_context_window: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:8080/chat".to_string(),
            api_base: "http://localhost:8080/api".to_string(),
            assistant_base: "http://localhost:8080/ai".to_string(),
            page_size: 30,
            backoff: vec![
                Duration::from_secs(0),
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            invoke_wait: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            read_receipt_min_interval: Duration::from_secs(2),
            ai_context_window: 10,
        }
    }
}
