use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension, Row};

use super::StorageResult;

/// 文件/文件夹元数据表：`(account, oc_id)` 为主键，
/// 活跃记录（deleted = 0）在 `(account, server_url, file_name)` 上唯一。
pub(crate) const METADATA_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    account TEXT NOT NULL,
    oc_id TEXT NOT NULL,
    server_url TEXT NOT NULL,
    file_name TEXT NOT NULL,
    etag TEXT NOT NULL,
    is_favorite INTEGER NOT NULL,
    status INTEGER NOT NULL,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    is_directory INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    seen_seq INTEGER NOT NULL,
    updated_at_millis INTEGER NOT NULL,
    PRIMARY KEY (account, oc_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS metadata_live_path
    ON metadata (account, server_url, file_name) WHERE deleted = 0;
CREATE INDEX IF NOT EXISTS metadata_favorite ON metadata (account, is_favorite);";

const SELECT_COLUMNS: &str = "account, oc_id, server_url, file_name, etag, is_favorite, status,
    size, mtime, is_directory, deleted, seen_seq, updated_at_millis";

#[derive(Debug, Clone)]
pub struct MetadataRow {
    pub account: String,
    pub oc_id: String,
    pub server_url: String,
    pub file_name: String,
    pub etag: String,
    pub is_favorite: bool,
    pub status: i64,
    pub size: i64,
    pub mtime: i64,
    pub is_directory: bool,
    pub deleted: bool,
    pub seen_seq: i64,
    pub updated_at_millis: i64,
}

/// 查询条件的 SQL 形态；字段已经由上层校验过。
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub account: String,
    pub server_url: Option<String>,
    pub favorite: Option<bool>,
    pub statuses: Option<Vec<i64>>,
    pub include_deleted: bool,
    /// 仅允许由上层枚举拼出的 ORDER BY 子句。
    pub order_by: String,
}

pub fn upsert_metadata_row(conn: &Connection, row: &MetadataRow) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO metadata (
            account,
            oc_id,
            server_url,
            file_name,
            etag,
            is_favorite,
            status,
            size,
            mtime,
            is_directory,
            deleted,
            seen_seq,
            updated_at_millis
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(account, oc_id) DO UPDATE SET
            server_url = excluded.server_url,
            file_name = excluded.file_name,
            etag = excluded.etag,
            is_favorite = excluded.is_favorite,
            status = excluded.status,
            size = excluded.size,
            mtime = excluded.mtime,
            is_directory = excluded.is_directory,
            deleted = excluded.deleted,
            seen_seq = excluded.seen_seq,
            updated_at_millis = excluded.updated_at_millis",
        params![
            row.account,
            row.oc_id,
            row.server_url,
            row.file_name,
            row.etag,
            row.is_favorite as i64,
            row.status,
            row.size,
            row.mtime,
            row.is_directory as i64,
            row.deleted as i64,
            row.seen_seq,
            row.updated_at_millis,
        ],
    )
    .map_err(|e| format!("failed to upsert metadata {}: {e}", row.oc_id))?;
    Ok(())
}

pub fn load_metadata_row(
    conn: &Connection,
    account: &str,
    oc_id: &str,
) -> StorageResult<Option<MetadataRow>> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM metadata WHERE account = ? AND oc_id = ?"),
        params![account, oc_id],
        map_metadata_row,
    )
    .optional()
    .map_err(|e| format!("failed to read metadata {oc_id}: {e}"))
}

pub fn find_live_by_path(
    conn: &Connection,
    account: &str,
    server_url: &str,
    file_name: &str,
) -> StorageResult<Option<MetadataRow>> {
    conn.query_row(
        &format!(
            "SELECT {SELECT_COLUMNS} FROM metadata
            WHERE account = ? AND server_url = ? AND file_name = ? AND deleted = 0"
        ),
        params![account, server_url, file_name],
        map_metadata_row,
    )
    .optional()
    .map_err(|e| format!("failed to read metadata at {server_url}/{file_name}: {e}"))
}

pub fn mark_metadata_deleted(
    conn: &Connection,
    account: &str,
    oc_id: &str,
    seen_seq: i64,
    updated_at_millis: i64,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE metadata SET deleted = 1, seen_seq = ?, updated_at_millis = ?
        WHERE account = ? AND oc_id = ?",
        params![seen_seq, updated_at_millis, account, oc_id],
    )
    .map_err(|e| format!("failed to tombstone metadata {oc_id}: {e}"))?;
    Ok(())
}

pub fn delete_metadata_row(conn: &Connection, account: &str, oc_id: &str) -> StorageResult<bool> {
    let changed = conn
        .execute(
            "DELETE FROM metadata WHERE account = ? AND oc_id = ?",
            params![account, oc_id],
        )
        .map_err(|e| format!("failed to delete metadata {oc_id}: {e}"))?;
    Ok(changed > 0)
}

pub fn delete_account_metadata(conn: &Connection, account: &str) -> StorageResult<usize> {
    conn.execute("DELETE FROM metadata WHERE account = ?", params![account])
        .map_err(|e| format!("failed to delete metadata of account {account}: {e}"))
}

pub fn max_seen_seq(conn: &Connection) -> StorageResult<i64> {
    conn.query_row("SELECT COALESCE(MAX(seen_seq), 0) FROM metadata", [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("failed to read metadata sequence: {e}"))
}

pub fn query_metadata_rows(conn: &Connection, filter: &RowFilter) -> StorageResult<Vec<MetadataRow>> {
    let mut sql = format!("SELECT {SELECT_COLUMNS} FROM metadata WHERE account = ?");
    let mut values: Vec<Value> = vec![Value::Text(filter.account.clone())];

    if !filter.include_deleted {
        sql.push_str(" AND deleted = 0");
    }
    if let Some(server_url) = &filter.server_url {
        sql.push_str(" AND server_url = ?");
        values.push(Value::Text(server_url.clone()));
    }
    if let Some(favorite) = filter.favorite {
        sql.push_str(" AND is_favorite = ?");
        values.push(Value::Integer(favorite as i64));
    }
    if let Some(statuses) = &filter.statuses {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({placeholders})"));
        values.extend(statuses.iter().map(|status| Value::Integer(*status)));
    }
    if !filter.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&filter.order_by);
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("failed to prepare metadata query: {e}"))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), map_metadata_row)
        .map_err(|e| format!("failed to query metadata: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse metadata row: {e}"))?;
    Ok(rows)
}

fn map_metadata_row(row: &Row) -> rusqlite::Result<MetadataRow> {
    Ok(MetadataRow {
        account: row.get(0)?,
        oc_id: row.get(1)?,
        server_url: row.get(2)?,
        file_name: row.get(3)?,
        etag: row.get(4)?,
        is_favorite: row.get::<_, i64>(5)? != 0,
        status: row.get(6)?,
        size: row.get(7)?,
        mtime: row.get(8)?,
        is_directory: row.get::<_, i64>(9)? != 0,
        deleted: row.get::<_, i64>(10)? != 0,
        seen_seq: row.get(11)?,
        updated_at_millis: row.get(12)?,
    })
}
