use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// 上游返回404，交易对不存在
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// 上游返回429，触发限频
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    /// 上游返回其他非2xx状态
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Web server error: {0}")]
    WebServerError(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
