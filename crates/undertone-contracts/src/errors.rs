use thiserror::Error;

/// Result type alias shared by the contracts and engine crates.
pub type Result<T> = std::result::Result<T, SubtextError>;

/// Failure taxonomy for the analysis and chat pipeline.
///
/// `Configuration` and `InvalidInput` are raised before any network
/// activity; `Upstream` covers transport-level failures including
/// timeouts and non-success HTTP statuses; `MalformedResponse` covers
/// payloads that are empty or do not satisfy the declared result
/// schema; `Session` covers chat sends with no usable session.
#[derive(Error, Debug)]
pub enum SubtextError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("chat session unavailable: {0}")]
    Session(String),
}

impl SubtextError {
    /// The user-facing message shown by the presentation layer.
    pub fn user_message(&self) -> String {
        match self {
            SubtextError::Configuration(_) => "环境变量中未找到 API Key。".to_string(),
            SubtextError::InvalidInput(detail) => detail.clone(),
            SubtextError::Upstream(_) | SubtextError::MalformedResponse(_) => {
                "分析失败，可能是模型配置错误或网络问题，请重试。".to_string()
            }
            SubtextError::Session(_) => "请先完成一次分析，再继续追问。".to_string(),
        }
    }
}
