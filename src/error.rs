/// An enum of all possible errors that could be encountered during the
/// execution of the notarizer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Outbound HTTP client error (notary or publish endpoint).
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// Error in the underlying WebSocket command server.
    #[error(transparent)]
    Ws(#[from] tungstenite::tungstenite::Error),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// A URL pattern string failed to compile.
    ///
    /// The active pattern set is left untouched when this is returned.
    #[error("Invalid url pattern at index {}: {}", index, source)]
    InvalidUrlPattern {
        /// Position of the offending pattern in the submitted set.
        index: usize,
        /// The underlying regex compile error.
        #[source]
        source: regex::Error,
    },
    /// The external notarization call failed or returned a non-success
    /// status.
    #[error("Notarization failed for {}: {}", request_id, reason)]
    Notarization {
        /// The request that was being notarized.
        request_id: String,
        /// Failure reason as reported by the notary (or transport).
        reason: String,
    },
    /// The external publish call failed.
    #[error("Publish failed: {}", reason)]
    Publish {
        /// Failure reason as reported by the publish endpoint.
        reason: String,
    },
    /// A queued request id had no captured data left in the cache.
    #[error("Request {} is no longer in the capture cache", request_id)]
    RequestNotCaptured {
        /// The request id that was dequeued.
        request_id: String,
    },
    /// The configured proof encryption key is not a 32-byte hex string.
    #[error("Encryption key must be 64 hex chars (32 bytes)")]
    InvalidEncryptionKey,
    /// Failed to send the response to the client.
    #[error("Failed to send response to the client")]
    FailedToSendResponse,
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

/// A type alias for the result for the notarizer, that uses the `Error` enum.
pub type Result<T> = std::result::Result<T, Error>;
