use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::db::{self, current_timestamp_millis, AccountRow, Database};
use crate::error::{SyncError, SyncResult};

/// 一个已登录的服务器账号。`account` 是缓存、布局与事件使用的账号键。
#[flutter_rust_bridge::frb]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account: String,
    pub url_base: String,
    pub user: String,
    pub user_id: String,
}

impl Account {
    /// 按 `"{user} {url_base}"` 生成账号键。
    pub fn new(url_base: &str, user: &str, user_id: &str) -> Self {
        let url_base = url_base.trim_end_matches('/');
        Self {
            account: format!("{user} {url_base}"),
            url_base: url_base.to_string(),
            user: user.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// `{user}-{host}`，用于本地文件目录等按用户区分的命名。
    pub fn user_base_url(&self) -> String {
        let host = Url::parse(&self.url_base)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        format!("{}-{host}", self.user)
    }

    fn validate(&self) -> SyncResult<()> {
        if self.account.trim().is_empty() || self.user.trim().is_empty() {
            return Err(SyncError::InvalidQuery(
                "account needs an account key and a user".to_string(),
            ));
        }
        Url::parse(&self.url_base).map_err(|e| {
            SyncError::InvalidQuery(format!("invalid account url {:?}: {e}", self.url_base))
        })?;
        Ok(())
    }
}

/// 持久化的账号注册表；删除账号会同时清除它的元数据缓存与布局偏好。
#[derive(Clone)]
pub struct AccountRegistry {
    database: Arc<Database>,
}

impl AccountRegistry {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// 新增账号；已存在时只更新 userId。第一个加入的账号自动成为活跃账号。
    pub fn add(&self, account: Account) -> SyncResult<Account> {
        account.validate()?;
        if self.get(&account.account)?.is_some() {
            return self.update(&account.account, &account.user_id);
        }
        self.database
            .with_connection(|conn| {
                db::upsert_account(conn, &row_from_account(&account))?;
                if db::get_active_account(conn)?.is_none() {
                    db::set_active_account(conn, &account.account)?;
                }
                Ok(())
            })
            .map_err(SyncError::Storage)?;
        info!(account = %account.account, "account added");
        Ok(account)
    }

    pub fn update(&self, account: &str, user_id: &str) -> SyncResult<Account> {
        let mut stored = self.get(account)?.ok_or_else(|| unknown_account(account))?;
        stored.user_id = user_id.to_string();
        self.database
            .with_connection(|conn| db::upsert_account(conn, &row_from_account(&stored)))
            .map_err(SyncError::Storage)?;
        Ok(stored)
    }

    /// 删除账号以及它的全部缓存记录和布局；删除的是活跃账号时改选剩余的第一个。
    pub fn remove(&self, account: &str) -> SyncResult<bool> {
        let removed = self
            .database
            .with_connection(|conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| format!("failed to begin account removal: {e}"))?;
                let removed = db::delete_account(&tx, account)?;
                let records = db::delete_account_metadata(&tx, account)?;
                let layouts = db::delete_account_layouts(&tx, account)?;
                if db::get_active_account(&tx)?.as_deref() == Some(account) {
                    let next = db::list_accounts(&tx)?
                        .into_iter()
                        .next()
                        .map(|row| row.account)
                        .unwrap_or_default();
                    db::set_active_account(&tx, &next)?;
                }
                tx.commit()
                    .map_err(|e| format!("failed to commit account removal: {e}"))?;
                info!(account, records, layouts, "account removed");
                Ok(removed)
            })
            .map_err(SyncError::Storage)?;
        Ok(removed)
    }

    pub fn get(&self, account: &str) -> SyncResult<Option<Account>> {
        self.database
            .with_connection(|conn| db::load_account(conn, account))
            .map(|row| row.map(account_from_row))
            .map_err(SyncError::Storage)
    }

    pub fn list(&self) -> SyncResult<Vec<Account>> {
        self.database
            .with_connection(|conn| db::list_accounts(conn))
            .map(|rows| rows.into_iter().map(account_from_row).collect())
            .map_err(SyncError::Storage)
    }

    pub fn set_active(&self, account: &str) -> SyncResult<()> {
        if self.get(account)?.is_none() {
            return Err(unknown_account(account));
        }
        self.database
            .with_connection(|conn| db::set_active_account(conn, account))
            .map_err(SyncError::Storage)
    }

    pub fn active(&self) -> SyncResult<Option<Account>> {
        let active = self
            .database
            .with_connection(|conn| db::get_active_account(conn))
            .map_err(SyncError::Storage)?;
        match active {
            Some(account) => self.get(&account),
            None => Ok(None),
        }
    }

    /// 未知账号返回 None。
    pub fn user_base_url(&self, account: &str) -> SyncResult<Option<String>> {
        Ok(self.get(account)?.map(|stored| stored.user_base_url()))
    }
}

fn unknown_account(account: &str) -> SyncError {
    SyncError::InvalidQuery(format!("unknown account {account:?}"))
}

fn row_from_account(account: &Account) -> AccountRow {
    AccountRow {
        account: account.account.clone(),
        url_base: account.url_base.clone(),
        user: account.user.clone(),
        user_id: account.user_id.clone(),
        updated_at_millis: current_timestamp_millis(),
    }
}

fn account_from_row(row: AccountRow) -> Account {
    Account {
        account: row.account,
        url_base: row.url_base,
        user: row.user,
        user_id: row.user_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutStore, LAYOUT_VIEW_FILES};
    use crate::metadata::{MetadataRecord, MetadataStore};

    fn registry() -> (AccountRegistry, Arc<Database>) {
        let database = Arc::new(Database::open_in_memory().unwrap());
        (AccountRegistry::new(database.clone()), database)
    }

    #[test]
    fn first_account_becomes_active_and_add_updates_existing() {
        let (registry, _) = registry();
        let alice = registry
            .add(Account::new("https://cloud.example.com/", "alice", "alice"))
            .unwrap();
        assert_eq!(alice.account, "alice https://cloud.example.com");
        registry
            .add(Account::new("https://other.example.org", "bob", "bob"))
            .unwrap();
        assert_eq!(registry.active().unwrap().unwrap().account, alice.account);

        let updated = registry
            .add(Account::new("https://cloud.example.com", "alice", "alice-42"))
            .unwrap();
        assert_eq!(updated.user_id, "alice-42");
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn user_base_url_uses_host() {
        let (registry, _) = registry();
        let alice = registry
            .add(Account::new("https://cloud.example.com:8443/nc", "alice", "alice"))
            .unwrap();
        assert_eq!(
            registry.user_base_url(&alice.account).unwrap().as_deref(),
            Some("alice-cloud.example.com")
        );
        assert_eq!(registry.user_base_url("nobody").unwrap(), None);
    }

    #[test]
    fn rejects_unknown_and_malformed_accounts() {
        let (registry, _) = registry();
        assert!(registry.set_active("ghost").is_err());
        assert!(registry.update("ghost", "x").is_err());
        assert!(registry.add(Account::new("not a url", "alice", "alice")).is_err());
    }

    #[test]
    fn remove_cascades_and_reassigns_active() {
        let (registry, database) = registry();
        let alice = registry
            .add(Account::new("https://cloud.example.com", "alice", "alice"))
            .unwrap();
        let bob = registry
            .add(Account::new("https://cloud.example.com", "bob", "bob"))
            .unwrap();
        let store = MetadataStore::new(database.clone()).unwrap();
        store
            .upsert(vec![MetadataRecord::new(&alice.account, "1", "/docs", "x.txt", "e")])
            .unwrap();
        let layouts = LayoutStore::new(database);
        layouts
            .layout_for_view(&alice.account, LAYOUT_VIEW_FILES, "/docs")
            .unwrap();

        assert!(registry.remove(&alice.account).unwrap());
        assert!(!registry.remove(&alice.account).unwrap());
        assert!(store.get(&alice.account, "1").unwrap().is_none());
        assert_eq!(registry.active().unwrap().unwrap().account, bob.account);
    }
}
