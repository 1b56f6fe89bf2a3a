use rusqlite::{params, Connection, OptionalExtension};

use super::{current_timestamp_millis, StorageResult};

/// 键值配置表；类型化读写由 `crate::settings` 负责。
pub(crate) const SETTINGS_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at_millis INTEGER NOT NULL
);";

pub fn get_setting(conn: &Connection, key: &str) -> StorageResult<Option<String>> {
    conn.query_row(
        "SELECT value FROM settings WHERE key = ?",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| format!("failed to read setting {key}: {e}"))
}

/// 写入时间戳只用于排查，读取方不依赖它。
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO settings (key, value, updated_at_millis) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at_millis = excluded.updated_at_millis",
        params![key, value, current_timestamp_millis()],
    )
    .map_err(|e| format!("failed to write setting {key}: {e}"))?;
    Ok(())
}
