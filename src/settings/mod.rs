pub mod search_page_limit;
pub mod show_hidden_files;

pub use search_page_limit::{
    default_search_page_limit, get_search_page_limit, set_search_page_limit,
    MAX_SEARCH_PAGE_LIMIT, MIN_SEARCH_PAGE_LIMIT,
};
pub use show_hidden_files::{get_show_hidden_files, set_show_hidden_files};

/// 服务器主版本号达到该值后才使用统一搜索（unified search），否则走旧版单次搜索接口。
pub const UNIFIED_SEARCH_MIN_SERVER_VERSION: u32 = 20;

use std::path::PathBuf;

use crate::db::{self, StorageResult};

/// 同步核心的启动配置：数据库位置与默认日志过滤规则。
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub log_filter: String,
}

impl SyncConfig {
    pub fn with_database_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            log_filter: "info".to_string(),
        }
    }

    /// 使用平台数据目录作为默认数据库位置。
    pub fn platform_default() -> StorageResult<Self> {
        Ok(Self::with_database_path(db::default_database_path()?))
    }
}
