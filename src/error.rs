use thiserror::Error;

/// 同步核心对外暴露的统一错误类型。
/// 外部协作者（网络/传输层）的错误一律包装成这里的变体，调用方不会看到原始传输错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// 远端拉取失败；由调用方在下一次下拉刷新时重试，核心不自动重试。
    #[error("remote fetch failed: {0}")]
    FetchFailed(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("operation already in progress: {0}")]
    AlreadyInProgress(String),

    /// 远端已不存在但本地仍有未完成传输的记录，保留并提示。
    #[error("record {oc_id} kept locally because a transfer is pending")]
    ConflictPendingTransfer { oc_id: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("search generation was cancelled")]
    Cancelled,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// 将外部协作者返回的任意错误包装成 `FetchFailed`。
    pub fn fetch<E: std::fmt::Display>(err: E) -> Self {
        SyncError::FetchFailed(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        SyncError::Storage(value.to_string())
    }
}
