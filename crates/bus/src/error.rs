use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// The broker connection is gone. Fatal for the owning process.
    #[error("transport error: {0}")]
    Transport(#[from] rumqttc::ClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown liveness value '{0}'")]
    Liveness(String),
    #[error("invalid topic id '{0}'")]
    TopicId(String),
}
