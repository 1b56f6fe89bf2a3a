use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::{self, current_timestamp_millis, Database, LayoutRow};
use crate::error::{SyncError, SyncResult};
use crate::metadata::{RecordOrder, SortField};

/// 收藏页使用的布局键。
pub const LAYOUT_VIEW_FAVORITE: &str = "favorite";
/// 普通文件浏览页使用的布局键。
pub const LAYOUT_VIEW_FILES: &str = "files";

const DEFAULT_COLUMN_COUNT: u32 = 3;

/// 某个视图（账号 + 布局键 + 目录）的展示偏好。
#[flutter_rust_bridge::frb]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutPreference {
    pub account: String,
    pub key: String,
    pub server_url: String,
    pub sort: SortField,
    pub ascending: bool,
    pub directory_on_top: bool,
    pub column_count: u32,
}

impl LayoutPreference {
    pub fn default_for(account: &str, key: &str, server_url: &str) -> Self {
        Self {
            account: account.to_string(),
            key: key.to_string(),
            server_url: server_url.to_string(),
            sort: SortField::FileName,
            ascending: true,
            directory_on_top: true,
            column_count: DEFAULT_COLUMN_COUNT,
        }
    }

    pub fn order(&self) -> RecordOrder {
        RecordOrder {
            sort: self.sort,
            ascending: self.ascending,
            directory_on_top: self.directory_on_top,
        }
    }
}

/// 布局偏好的读写入口：首次访问某个位置时按默认值创建，之后只随用户操作更新。
pub struct LayoutStore {
    database: Arc<Database>,
}

impl LayoutStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    pub fn layout_for_view(
        &self,
        account: &str,
        key: &str,
        server_url: &str,
    ) -> SyncResult<LayoutPreference> {
        if account.trim().is_empty() || key.trim().is_empty() {
            return Err(SyncError::InvalidQuery(
                "layout lookup needs an account and a key".to_string(),
            ));
        }
        self.database.with_connection(|conn| {
            if let Some(row) =
                db::load_layout(conn, account, key, server_url).map_err(SyncError::Storage)?
            {
                return Ok(layout_from_row(row));
            }
            let created = LayoutPreference::default_for(account, key, server_url);
            db::upsert_layout(conn, &row_from_layout(&created)).map_err(SyncError::Storage)?;
            Ok(created)
        })
    }

    pub fn set_layout_for_view(&self, layout: &LayoutPreference) -> SyncResult<()> {
        if layout.column_count == 0 {
            return Err(SyncError::InvalidQuery(
                "layout column count must be positive".to_string(),
            ));
        }
        self.database
            .with_connection(|conn| db::upsert_layout(conn, &row_from_layout(layout)))
            .map_err(SyncError::Storage)
    }

    pub fn remove_account(&self, account: &str) -> SyncResult<usize> {
        self.database
            .with_connection(|conn| db::delete_account_layouts(conn, account))
            .map_err(SyncError::Storage)
    }
}

fn row_from_layout(layout: &LayoutPreference) -> LayoutRow {
    LayoutRow {
        account: layout.account.clone(),
        layout_key: layout.key.clone(),
        server_url: layout.server_url.clone(),
        sort_field: sort_to_i64(layout.sort),
        ascending: layout.ascending,
        directory_on_top: layout.directory_on_top,
        column_count: layout.column_count as i64,
        updated_at_millis: current_timestamp_millis(),
    }
}

fn layout_from_row(row: LayoutRow) -> LayoutPreference {
    LayoutPreference {
        account: row.account,
        key: row.layout_key,
        server_url: row.server_url,
        sort: sort_from_i64(row.sort_field),
        ascending: row.ascending,
        directory_on_top: row.directory_on_top,
        column_count: row.column_count.clamp(1, u32::MAX as i64) as u32,
    }
}

fn sort_to_i64(sort: SortField) -> i64 {
    match sort {
        SortField::FileName => 0,
        SortField::Date => 1,
        SortField::Size => 2,
    }
}

fn sort_from_i64(value: i64) -> SortField {
    match value {
        1 => SortField::Date,
        2 => SortField::Size,
        _ => SortField::FileName,
    }
}
