use directories::ProjectDirs;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

mod accounts;
mod layouts;
mod metadata;
mod settings;

pub use accounts::{
    delete_account, get_active_account, list_accounts, load_account, set_active_account,
    upsert_account, AccountRow,
};
pub use layouts::{delete_account_layouts, load_layout, upsert_layout, LayoutRow};
pub use metadata::{
    delete_account_metadata, delete_metadata_row, find_live_by_path, load_metadata_row,
    mark_metadata_deleted, max_seen_seq, query_metadata_rows, upsert_metadata_row, MetadataRow,
    RowFilter,
};
pub use settings::{get_setting, set_setting};

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "Nextsync";
const APPLICATION: &str = "Nextsync";
const DB_FILE_NAME: &str = "nextsync.db";

pub type StorageResult<T> = Result<T, String>;

/// SQLite 连接的唯一持有者。
/// 所有读写都经过同一把锁，因此写批次天然串行，读方不会看到半提交的批次。
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// 打开（或创建）磁盘数据库，并在返回前完成建表。
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("failed to create database directory {dir:?}: {e}"))?;
        }
        let conn =
            Connection::open(path).map_err(|e| format!("failed to open SQLite database: {e}"))?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("failed to open in-memory database: {e}"))?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 在连接锁内执行一次操作；错误类型由调用方决定，便于上层直接返回自身的错误。
    pub fn with_connection<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        operation(&mut conn)
    }
}

fn apply_migrations(conn: &Connection) -> StorageResult<()> {
    let schema = [
        metadata::METADATA_TABLE_SCHEMA,
        layouts::LAYOUT_TABLE_SCHEMA,
        settings::SETTINGS_TABLE_SCHEMA,
        accounts::ACCOUNTS_TABLE_SCHEMA,
    ]
    .join("\n");
    conn.execute_batch(&schema)
        .map_err(|e| format!("failed to initialize database schema: {e}"))?;
    Ok(())
}

/// 默认数据库位置：平台数据目录下的 `nextsync.db`。
pub fn default_database_path() -> StorageResult<PathBuf> {
    let dirs = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| "failed to resolve application data directory".to_string())?;
    Ok(dirs.data_dir().join(DB_FILE_NAME))
}

pub(crate) fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
