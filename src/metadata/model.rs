use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// 单个文件/文件夹的本地缓存记录。
/// `oc_id` 在重命名/移动后保持不变；`deleted` 与 `seen_seq` 由存储层维护，写入时会被覆盖。
#[flutter_rust_bridge::frb]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub account: String,
    pub oc_id: String,
    pub server_url: String,
    pub file_name: String,
    pub etag: String,
    pub is_favorite: bool,
    pub status: MetadataStatus,
    pub size: u64,
    pub mtime: i64,
    pub is_directory: bool,
    pub deleted: bool,
    pub seen_seq: i64,
}

impl MetadataRecord {
    pub fn new(
        account: impl Into<String>,
        oc_id: impl Into<String>,
        server_url: impl Into<String>,
        file_name: impl Into<String>,
        etag: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            oc_id: oc_id.into(),
            server_url: server_url.into(),
            file_name: file_name.into(),
            etag: etag.into(),
            is_favorite: false,
            status: MetadataStatus::Normal,
            size: 0,
            mtime: 0,
            is_directory: false,
            deleted: false,
            seen_seq: 0,
        }
    }

    /// 写入前的字段校验；不合法的记录视为调用方的编程错误。
    pub(crate) fn validate(&self) -> SyncResult<()> {
        if self.account.trim().is_empty() {
            return Err(SyncError::InvalidQuery("record account is required".to_string()));
        }
        if self.oc_id.trim().is_empty() {
            return Err(SyncError::InvalidQuery("record ocId is required".to_string()));
        }
        if !self.server_url.starts_with('/') {
            return Err(SyncError::InvalidQuery(format!(
                "record {} has a relative server url {:?}",
                self.oc_id, self.server_url
            )));
        }
        if self.file_name.is_empty() {
            return Err(SyncError::InvalidQuery(format!(
                "record {} has an empty file name",
                self.oc_id
            )));
        }
        Ok(())
    }
}

#[flutter_rust_bridge::frb]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataStatus {
    Normal,
    WaitDownload,
    Downloading,
    WaitUpload,
    Uploading,
}

impl MetadataStatus {
    pub fn is_transferring(self) -> bool {
        self != MetadataStatus::Normal
    }

    pub(crate) fn to_i64(self) -> i64 {
        match self {
            MetadataStatus::Normal => 0,
            MetadataStatus::WaitDownload => 1,
            MetadataStatus::Downloading => 2,
            MetadataStatus::WaitUpload => 3,
            MetadataStatus::Uploading => 4,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            1 => MetadataStatus::WaitDownload,
            2 => MetadataStatus::Downloading,
            3 => MetadataStatus::WaitUpload,
            4 => MetadataStatus::Uploading,
            _ => MetadataStatus::Normal,
        }
    }
}

/// 远端列表返回的单个条目；不携带传输状态，落库时保留本地 status。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    pub oc_id: String,
    pub server_url: String,
    pub file_name: String,
    pub etag: String,
    pub is_directory: bool,
    pub size: u64,
    pub mtime: i64,
    pub is_favorite: bool,
}

impl RemoteFileEntry {
    pub fn new(
        oc_id: impl Into<String>,
        server_url: impl Into<String>,
        file_name: impl Into<String>,
        etag: impl Into<String>,
    ) -> Self {
        Self {
            oc_id: oc_id.into(),
            server_url: server_url.into(),
            file_name: file_name.into(),
            etag: etag.into(),
            is_directory: false,
            size: 0,
            mtime: 0,
            is_favorite: false,
        }
    }

    pub fn favorite(mut self) -> Self {
        self.is_favorite = true;
        self
    }
}

#[flutter_rust_bridge::frb]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    FileName,
    Date,
    Size,
}

/// 查询结果的排序方式，通常来自某个视图的布局偏好。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordOrder {
    pub sort: SortField,
    pub ascending: bool,
    pub directory_on_top: bool,
}

impl Default for RecordOrder {
    fn default() -> Self {
        Self {
            sort: SortField::FileName,
            ascending: true,
            directory_on_top: true,
        }
    }
}

impl RecordOrder {
    /// 只由枚举拼接，不接受外部字符串。
    pub(crate) fn order_by_clause(&self) -> String {
        let direction = if self.ascending { "ASC" } else { "DESC" };
        let column = match self.sort {
            SortField::FileName => "file_name COLLATE NOCASE",
            SortField::Date => "mtime",
            SortField::Size => "size",
        };
        let mut clause = String::new();
        if self.directory_on_top {
            clause.push_str("is_directory DESC, ");
        }
        clause.push_str(&format!("{column} {direction}, oc_id ASC"));
        clause
    }
}

/// 类型化的查询条件，替代字符串谓词；`account` 必填。
#[derive(Clone, Debug, Default)]
pub struct MetadataPredicate {
    pub account: String,
    pub server_url: Option<String>,
    pub favorite: Option<bool>,
    pub statuses: Option<Vec<MetadataStatus>>,
    pub include_deleted: bool,
    pub order: RecordOrder,
}

impl MetadataPredicate {
    pub fn account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Self::default()
        }
    }

    pub fn in_directory(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = Some(server_url.into());
        self
    }

    pub fn favorites(self) -> Self {
        self.with_favorite(true)
    }

    pub fn with_favorite(mut self, favorite: bool) -> Self {
        self.favorite = Some(favorite);
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = MetadataStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn ordered_by(mut self, order: RecordOrder) -> Self {
        self.order = order;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.account.trim().is_empty() {
            return Err(SyncError::InvalidQuery("predicate account is required".to_string()));
        }
        if let Some(server_url) = &self.server_url {
            if !server_url.starts_with('/') {
                return Err(SyncError::InvalidQuery(format!(
                    "server url {server_url:?} must be absolute"
                )));
            }
        }
        if matches!(&self.statuses, Some(statuses) if statuses.is_empty()) {
            return Err(SyncError::InvalidQuery(
                "status filter must name at least one status".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_requires_account() {
        let err = MetadataPredicate::default().validate().unwrap_err();
        assert!(matches!(err, SyncError::InvalidQuery(_)));
    }

    #[test]
    fn predicate_rejects_relative_path_and_empty_status_set() {
        assert!(MetadataPredicate::account("a")
            .in_directory("docs")
            .validate()
            .is_err());
        assert!(MetadataPredicate::account("a")
            .with_statuses(Vec::new())
            .validate()
            .is_err());
        assert!(MetadataPredicate::account("a")
            .in_directory("/docs")
            .favorites()
            .validate()
            .is_ok());
    }

    #[test]
    fn order_clause_puts_directories_first() {
        let order = RecordOrder {
            sort: SortField::Size,
            ascending: false,
            directory_on_top: true,
        };
        assert_eq!(
            order.order_by_clause(),
            "is_directory DESC, size DESC, oc_id ASC"
        );
    }

    #[test]
    fn status_round_trips_through_storage_code() {
        for status in [
            MetadataStatus::Normal,
            MetadataStatus::WaitDownload,
            MetadataStatus::Downloading,
            MetadataStatus::WaitUpload,
            MetadataStatus::Uploading,
        ] {
            assert_eq!(MetadataStatus::from_i64(status.to_i64()), status);
        }
    }
}
