use thiserror::Error;

/// Failure kinds the connection state machine reacts to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Required setting missing or invalid. Terminal until reconfigured.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credentials rejected or the digest challenge could not be used.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Request could not be delivered or timed out.
    #[error("network error: {0}")]
    Network(String),

    /// Device answered but the matrix feature query was unusable.
    #[error("matrix feature discovery failed: {0}")]
    FeatureDiscovery(String),

    /// Action could not be executed.
    #[error("action failed: {0}")]
    Action(String),
}

/// Coarse kind of a [GatewayError], handy for matching without the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Authentication,
    Network,
    FeatureDiscovery,
    Action,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::Authentication(_) => ErrorKind::Authentication,
            GatewayError::Network(_) => ErrorKind::Network,
            GatewayError::FeatureDiscovery(_) => ErrorKind::FeatureDiscovery,
            GatewayError::Action(_) => ErrorKind::Action,
        }
    }

    /// Find the typed error in an anyhow chain. Anything untyped is treated
    /// as a network problem.
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        err.chain()
            .find_map(|e| e.downcast_ref::<GatewayError>())
            .map(|e| e.kind())
            .unwrap_or(ErrorKind::Network)
    }

    /// Retried through the reconnect backoff (everything except config).
    pub fn is_retryable(kind: ErrorKind) -> bool {
        !matches!(kind, ErrorKind::Config)
    }
}
