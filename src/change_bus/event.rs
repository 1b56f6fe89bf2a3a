use crate::error::{SyncError, SyncResult};

/// 变更事件的种类；带有结构化负载，替代字符串键的通知字典。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    /// 内容（etag）变化。
    Updated,
    Deleted,
    Moved { from_server_url: String },
    Renamed { from_file_name: String },
    Favorited { favorite: bool },
    DownloadStarted,
    DownloadFinished,
    DownloadCancelled,
    UploadStarted,
    UploadFinished,
    UploadCancelled,
    /// 刷新结束但数据未变；拉取失败时同样发送，并携带错误。
    DataUnchanged,
    /// 远端已删除但本地仍有未完成传输，记录被保留。
    ConflictPendingTransfer,
}

impl ChangeKind {
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            ChangeKind::DownloadStarted
                | ChangeKind::DownloadFinished
                | ChangeKind::DownloadCancelled
                | ChangeKind::UploadStarted
                | ChangeKind::UploadFinished
                | ChangeKind::UploadCancelled
        )
    }

    /// 传输的终态事件；进度追踪器据此清理条目。
    pub fn is_transfer_terminal(&self) -> bool {
        matches!(
            self,
            ChangeKind::DownloadFinished
                | ChangeKind::DownloadCancelled
                | ChangeKind::UploadFinished
                | ChangeKind::UploadCancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub account: String,
    pub server_url: String,
    pub oc_id: Option<String>,
    pub oc_id_transfer: Option<String>,
    pub error: Option<SyncError>,
}

impl ChangeEvent {
    /// 目录级事件；`server_url` 为空表示不针对具体目录（例如收藏列表）。
    pub fn new(kind: ChangeKind, account: &str, server_url: &str) -> SyncResult<Self> {
        if account.trim().is_empty() {
            return Err(SyncError::InvalidQuery("event account is required".to_string()));
        }
        if !server_url.is_empty() && !server_url.starts_with('/') {
            return Err(SyncError::InvalidQuery(format!(
                "event server url {server_url:?} must be absolute"
            )));
        }
        Ok(Self::unchecked(kind, account, server_url, None))
    }

    /// 传输生命周期事件，必须指明 ocId。
    pub fn transfer(
        kind: ChangeKind,
        account: &str,
        server_url: &str,
        oc_id: &str,
        oc_id_transfer: Option<&str>,
    ) -> SyncResult<Self> {
        if !kind.is_transfer() {
            return Err(SyncError::InvalidQuery(format!(
                "{kind:?} is not a transfer event"
            )));
        }
        if oc_id.trim().is_empty() {
            return Err(SyncError::InvalidQuery(
                "transfer event needs an ocId".to_string(),
            ));
        }
        let mut event = Self::new(kind, account, server_url)?;
        event.oc_id = Some(oc_id.to_string());
        event.oc_id_transfer = oc_id_transfer.map(str::to_string);
        Ok(event)
    }

    /// 内部构造：调用方已经校验过账号与路径。
    pub(crate) fn unchecked(
        kind: ChangeKind,
        account: &str,
        server_url: &str,
        oc_id: Option<&str>,
    ) -> Self {
        Self {
            kind,
            account: account.to_string(),
            server_url: server_url.to_string(),
            oc_id: oc_id.map(str::to_string),
            oc_id_transfer: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: SyncError) -> Self {
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_account_and_relative_path() {
        assert!(ChangeEvent::new(ChangeKind::Created, "", "/docs").is_err());
        assert!(ChangeEvent::new(ChangeKind::Created, "a", "docs").is_err());
        assert!(ChangeEvent::new(ChangeKind::DataUnchanged, "a", "").is_ok());
    }

    #[test]
    fn transfer_events_need_transfer_kind_and_oc_id() {
        assert!(ChangeEvent::transfer(ChangeKind::Created, "a", "/", "1", None).is_err());
        assert!(ChangeEvent::transfer(ChangeKind::UploadFinished, "a", "/", "", None).is_err());
        let event =
            ChangeEvent::transfer(ChangeKind::UploadFinished, "a", "/", "1", Some("t1")).unwrap();
        assert_eq!(event.oc_id_transfer.as_deref(), Some("t1"));
        assert!(event.kind.is_transfer_terminal());
        assert!(!ChangeKind::UploadStarted.is_transfer_terminal());
    }
}
