use rusqlite::{params, Connection, OptionalExtension};

use super::StorageResult;

/// 视图布局偏好表：每个 `(account, layout_key, server_url)` 一行，
/// 仅在账号移除时整体删除。
pub(crate) const LAYOUT_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS layout_preferences (
    account TEXT NOT NULL,
    layout_key TEXT NOT NULL,
    server_url TEXT NOT NULL,
    sort_field INTEGER NOT NULL,
    ascending INTEGER NOT NULL,
    directory_on_top INTEGER NOT NULL,
    column_count INTEGER NOT NULL,
    updated_at_millis INTEGER NOT NULL,
    PRIMARY KEY (account, layout_key, server_url)
);";

#[derive(Debug, Clone)]
pub struct LayoutRow {
    pub account: String,
    pub layout_key: String,
    pub server_url: String,
    pub sort_field: i64,
    pub ascending: bool,
    pub directory_on_top: bool,
    pub column_count: i64,
    pub updated_at_millis: i64,
}

pub fn upsert_layout(conn: &Connection, row: &LayoutRow) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO layout_preferences (
            account,
            layout_key,
            server_url,
            sort_field,
            ascending,
            directory_on_top,
            column_count,
            updated_at_millis
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(account, layout_key, server_url) DO UPDATE SET
            sort_field = excluded.sort_field,
            ascending = excluded.ascending,
            directory_on_top = excluded.directory_on_top,
            column_count = excluded.column_count,
            updated_at_millis = excluded.updated_at_millis",
        params![
            row.account,
            row.layout_key,
            row.server_url,
            row.sort_field,
            row.ascending as i64,
            row.directory_on_top as i64,
            row.column_count,
            row.updated_at_millis,
        ],
    )
    .map_err(|e| format!("failed to upsert layout {}: {e}", row.layout_key))?;
    Ok(())
}

pub fn load_layout(
    conn: &Connection,
    account: &str,
    layout_key: &str,
    server_url: &str,
) -> StorageResult<Option<LayoutRow>> {
    conn.query_row(
        "SELECT
            account,
            layout_key,
            server_url,
            sort_field,
            ascending,
            directory_on_top,
            column_count,
            updated_at_millis
        FROM layout_preferences
        WHERE account = ? AND layout_key = ? AND server_url = ?",
        params![account, layout_key, server_url],
        |row| {
            Ok(LayoutRow {
                account: row.get(0)?,
                layout_key: row.get(1)?,
                server_url: row.get(2)?,
                sort_field: row.get(3)?,
                ascending: row.get::<_, i64>(4)? != 0,
                directory_on_top: row.get::<_, i64>(5)? != 0,
                column_count: row.get(6)?,
                updated_at_millis: row.get(7)?,
            })
        },
    )
    .optional()
    .map_err(|e| format!("failed to read layout {layout_key}: {e}"))
}

pub fn delete_account_layouts(conn: &Connection, account: &str) -> StorageResult<usize> {
    conn.execute(
        "DELETE FROM layout_preferences WHERE account = ?",
        params![account],
    )
    .map_err(|e| format!("failed to delete layouts of account {account}: {e}"))
}
