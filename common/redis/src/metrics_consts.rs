// ==== Connection metrics ====
/// Counter for reconnect attempts made after the connection was lost
pub const RECONNECT_ATTEMPTS_COUNTER: &str = "redis_reconnect_attempts_total";

/// Counter for failed connects (transport, handshake or timeout)
pub const CONNECTION_ERRORS_COUNTER: &str = "redis_connection_errors_total";

// ==== Request metrics ====
/// Counter for requests retried once after a reconnect
pub const REQUEST_RETRIES_COUNTER: &str = "redis_request_retries_total";

/// Histogram for number of commands per write+read cycle
pub const PIPELINE_SIZE_HISTOGRAM: &str = "redis_pipeline_size_commands";

/// Counter for response timeouts
pub const RESPONSE_TIMEOUTS_COUNTER: &str = "redis_response_timeouts_total";
