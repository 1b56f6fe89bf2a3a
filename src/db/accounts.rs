use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{get_setting, set_setting, StorageResult};

/// 账号注册表：替代进程级的 domain 单例，账号信息随数据库一同持久化。
pub(crate) const ACCOUNTS_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    account TEXT PRIMARY KEY,
    url_base TEXT NOT NULL,
    user TEXT NOT NULL,
    user_id TEXT NOT NULL,
    updated_at_millis INTEGER NOT NULL
);";

const ACTIVE_ACCOUNT_KEY: &str = "active_account";

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub account: String,
    pub url_base: String,
    pub user: String,
    pub user_id: String,
    pub updated_at_millis: i64,
}

pub fn upsert_account(conn: &Connection, row: &AccountRow) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO accounts (account, url_base, user, user_id, updated_at_millis)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(account) DO UPDATE SET
            url_base = excluded.url_base,
            user = excluded.user,
            user_id = excluded.user_id,
            updated_at_millis = excluded.updated_at_millis",
        params![
            row.account,
            row.url_base,
            row.user,
            row.user_id,
            row.updated_at_millis,
        ],
    )
    .map_err(|e| format!("failed to upsert account {}: {e}", row.account))?;
    Ok(())
}

pub fn load_account(conn: &Connection, account: &str) -> StorageResult<Option<AccountRow>> {
    conn.query_row(
        "SELECT account, url_base, user, user_id, updated_at_millis
        FROM accounts WHERE account = ?",
        params![account],
        map_account_row,
    )
    .optional()
    .map_err(|e| format!("failed to read account {account}: {e}"))
}

pub fn list_accounts(conn: &Connection) -> StorageResult<Vec<AccountRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT account, url_base, user, user_id, updated_at_millis
            FROM accounts ORDER BY account ASC",
        )
        .map_err(|e| format!("failed to prepare account query: {e}"))?;
    let rows = stmt
        .query_map([], map_account_row)
        .map_err(|e| format!("failed to query accounts: {e}"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse account row: {e}"))?;
    Ok(rows)
}

pub fn delete_account(conn: &Connection, account: &str) -> StorageResult<bool> {
    let changed = conn
        .execute("DELETE FROM accounts WHERE account = ?", params![account])
        .map_err(|e| format!("failed to delete account {account}: {e}"))?;
    Ok(changed > 0)
}

pub fn get_active_account(conn: &Connection) -> StorageResult<Option<String>> {
    Ok(get_setting(conn, ACTIVE_ACCOUNT_KEY)?.filter(|value| !value.is_empty()))
}

/// 传入空串表示清除当前活跃账号。
pub fn set_active_account(conn: &Connection, account: &str) -> StorageResult<()> {
    set_setting(conn, ACTIVE_ACCOUNT_KEY, account)
}

fn map_account_row(row: &Row) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        account: row.get(0)?,
        url_base: row.get(1)?,
        user: row.get(2)?,
        user_id: row.get(3)?,
        updated_at_millis: row.get(4)?,
    })
}
