use std::fmt;

#[derive(Debug)]
pub enum OpslinkError {
    /// 本地 KV 存储错误（唯一被视为不可恢复的一类：快照写入彻底失败）
    KvStore(String),
    Serialization(String),
    IO(String),
    /// 传输层错误（双工通道 / HTTP 轮询），属瞬时类，内部重试
    Transport(String),
    NotConnected,
    Timeout(String),
    /// 队列容量已满且无可驱逐条目
    QueueFull(String),
    /// 远端对单个条目的 4xx/5xx 拒绝，计入该条目的重试预算
    DeliveryRejected { status: u16, message: String },
    Conflict(String),
    InvalidArgument(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    /// 同步阶段失败（记录在 SyncStatus.last_sync_error，水位不前进）
    Sync(String),
    Other(String),
}

impl fmt::Display for OpslinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpslinkError::KvStore(e) => write!(f, "KV store error: {}", e),
            OpslinkError::Serialization(e) => write!(f, "Serialization error: {}", e),
            OpslinkError::IO(e) => write!(f, "IO error: {}", e),
            OpslinkError::Transport(e) => write!(f, "Transport error: {}", e),
            OpslinkError::NotConnected => write!(f, "Not connected"),
            OpslinkError::Timeout(e) => write!(f, "Timeout: {}", e),
            OpslinkError::QueueFull(e) => write!(f, "Queue is full: {}", e),
            OpslinkError::DeliveryRejected { status, message } => {
                write!(f, "Delivery rejected [{}]: {}", status, message)
            }
            OpslinkError::Conflict(e) => write!(f, "Conflict: {}", e),
            OpslinkError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            OpslinkError::Config(e) => write!(f, "Config error: {}", e),
            OpslinkError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            OpslinkError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            OpslinkError::Sync(e) => write!(f, "Sync error: {}", e),
            OpslinkError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for OpslinkError {}

impl From<serde_json::Error> for OpslinkError {
    fn from(error: serde_json::Error) -> Self {
        OpslinkError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for OpslinkError {
    fn from(error: std::io::Error) -> Self {
        OpslinkError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for OpslinkError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            OpslinkError::Timeout(error.to_string())
        } else {
            OpslinkError::Transport(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for OpslinkError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        OpslinkError::Transport(error.to_string())
    }
}

impl OpslinkError {
    /// 判断是否为传输层瞬时错误（内部退避重试，不向调用方传播）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OpslinkError::Transport(_) | OpslinkError::Timeout(_) | OpslinkError::NotConnected
        )
    }

    /// 从 HTTP 状态码构造投递拒绝错误
    pub fn from_http_status(status: u16, message: String) -> Self {
        OpslinkError::DeliveryRejected { status, message }
    }
}

pub type Result<T> = std::result::Result<T, OpslinkError>;
