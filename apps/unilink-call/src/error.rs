use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("signaling rejected credentials: {0}")]
    AuthRejected(String),
    #[error("signaling connection timed out after {0} ms")]
    Timeout(u64),
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    Closed,
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("capture device is busy: {0}")]
    DeviceBusy(String),
    #[error("constraints cannot be satisfied: {0}")]
    Overconstrained(String),
    #[error("permission to capture media denied")]
    PermissionDenied,
    #[error("no capture device found for {0}")]
    NotFound(String),
    #[error("media capture failed: {0}")]
    Other(String),
}

impl MediaError {
    /// Errors after which retrying without video is worthwhile.
    pub fn is_video_recoverable(&self) -> bool {
        matches!(
            self,
            MediaError::DeviceBusy(_) | MediaError::Overconstrained(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to set up peer link: {0}")]
    Setup(String),
    #[error("failed to create offer: {0}")]
    Offer(String),
    #[error("failed to create answer: {0}")]
    Answer(String),
    #[error("failed to apply {kind} description: {reason}")]
    Description { kind: &'static str, reason: String },
    #[error("failed to add ICE candidate: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("peer link closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("invalid call api endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("call {0} not found")]
    NotFound(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat message is empty")]
    Empty,
    #[error("chat channel is not open")]
    NotOpen,
    #[error("chat delivery failed: {0}")]
    Delivery(String),
    #[error("call session has ended")]
    SessionClosed,
}

/// How far an error reaches into the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The session moves to `Failed` and releases everything.
    Fatal,
    /// Triggers the bounded reconnect path.
    Transient,
    /// Logged and ignored.
    Noop,
}

/// Errors as the session state machine sees them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("call {0} not found")]
    CallNotFound(String),
    #[error("Could not access camera or microphone: {0}")]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("Reconnection failed. Please refresh the page.")]
    ReconnectExhausted,
}

impl CallError {
    pub fn severity(&self) -> Severity {
        match self {
            CallError::CallNotFound(_) | CallError::Media(_) | CallError::ReconnectExhausted => {
                Severity::Fatal
            }
            CallError::Signaling(SignalingError::AuthRejected(_))
            | CallError::Signaling(SignalingError::InvalidEndpoint(_)) => Severity::Fatal,
            CallError::Signaling(SignalingError::Closed) => Severity::Noop,
            CallError::Signaling(_) => Severity::Transient,
            CallError::Negotiation(NegotiationError::Setup(_)) => Severity::Fatal,
            CallError::Negotiation(NegotiationError::Candidate(_)) => Severity::Noop,
            CallError::Negotiation(_) => Severity::Transient,
        }
    }
}
