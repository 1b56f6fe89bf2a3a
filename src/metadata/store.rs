use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use rusqlite::Transaction;
use tracing::{debug, warn};

use super::model::{MetadataPredicate, MetadataRecord, MetadataStatus, RemoteFileEntry};
use crate::db::{self, current_timestamp_millis, Database, MetadataRow, RowFilter};
use crate::error::{SyncError, SyncResult};

/// 单条 upsert 的结果分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// 新记录，或被墓碑化的记录重新出现。
    Inserted,
    /// etag 变化，内容字段整体更新。
    Updated,
    /// etag 相同，但所在目录或文件名变化。
    Relocated,
    /// etag 相同，仅收藏/状态变化。
    FlagsChanged,
    Unchanged,
}

#[derive(Clone, Debug)]
pub struct UpsertReport {
    pub oc_id: String,
    pub outcome: UpsertOutcome,
    /// 写入后的记录状态。
    pub record: MetadataRecord,
    /// 写入前的活跃记录（墓碑不算）。
    pub previous: Option<MetadataRecord>,
    /// 因路径冲突被标记删除的另一条记录。
    pub displaced: Option<MetadataRecord>,
}

/// 元数据的持久化存储。
/// 所有写入都在 `Database` 的连接锁内以单个事务提交，因此同一时刻只有一个写方，
/// 而 `seen_seq` 计数器为路径冲突提供确定的“后写者胜出”判定。
pub struct MetadataStore {
    database: Arc<Database>,
    sequence: AtomicI64,
}

impl MetadataStore {
    pub fn new(database: Arc<Database>) -> SyncResult<Self> {
        let seed = database
            .with_connection(|conn| db::max_seen_seq(conn))
            .map_err(SyncError::Storage)?;
        Ok(Self {
            database,
            sequence: AtomicI64::new(seed),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// 在一个 SQLite 事务中执行多次读写；闭包返回错误时整体回滚。
    pub fn transaction<T, F>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> SyncResult<T>,
    {
        self.database.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut txn = StoreTxn {
                tx,
                sequence: &self.sequence,
            };
            let value = operation(&mut txn)?;
            txn.tx.commit()?;
            Ok(value)
        })
    }

    /// 以 `(account, oc_id)` 为键幂等写入一批记录；整批原子提交。
    pub fn upsert(&self, records: Vec<MetadataRecord>) -> SyncResult<Vec<UpsertReport>> {
        self.transaction(|txn| {
            records
                .into_iter()
                .map(|record| txn.upsert(record))
                .collect()
        })
    }

    pub fn remove(&self, account: &str, oc_id: &str) -> SyncResult<bool> {
        self.transaction(|txn| txn.remove(account, oc_id))
    }

    /// 读取单条记录，包括已被墓碑化的记录（`deleted = true`）。
    pub fn get(&self, account: &str, oc_id: &str) -> SyncResult<Option<MetadataRecord>> {
        self.database.with_connection(|conn| {
            Ok(db::load_metadata_row(conn, account, oc_id)
                .map_err(SyncError::Storage)?
                .map(record_from_row))
        })
    }

    pub fn query(&self, predicate: &MetadataPredicate) -> SyncResult<Vec<MetadataRecord>> {
        predicate.validate()?;
        let filter = filter_from_predicate(predicate);
        self.database.with_connection(|conn| {
            Ok(db::query_metadata_rows(conn, &filter)
                .map_err(SyncError::Storage)?
                .into_iter()
                .map(record_from_row)
                .collect())
        })
    }

    /// 供传输协作者更新单条记录的传输状态；记录不存在时返回 false。
    pub fn set_status(&self, account: &str, oc_id: &str, status: MetadataStatus) -> SyncResult<bool> {
        self.transaction(|txn| {
            let Some(mut record) = txn.get(account, oc_id)? else {
                return Ok(false);
            };
            if record.deleted {
                return Ok(false);
            }
            record.status = status;
            txn.upsert(record)?;
            Ok(true)
        })
    }

    pub fn remove_account(&self, account: &str) -> SyncResult<usize> {
        self.database.with_connection(|conn| {
            db::delete_account_metadata(conn, account).map_err(SyncError::Storage)
        })
    }
}

/// 存储事务句柄；只能在 `MetadataStore::transaction` 内部拿到。
#[flutter_rust_bridge::frb(ignore)]
pub struct StoreTxn<'a> {
    tx: Transaction<'a>,
    sequence: &'a AtomicI64,
}

impl StoreTxn<'_> {
    fn next_seq(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, account: &str, oc_id: &str) -> SyncResult<Option<MetadataRecord>> {
        Ok(db::load_metadata_row(&self.tx, account, oc_id)
            .map_err(SyncError::Storage)?
            .map(record_from_row))
    }

    pub fn query(&self, predicate: &MetadataPredicate) -> SyncResult<Vec<MetadataRecord>> {
        predicate.validate()?;
        let filter = filter_from_predicate(predicate);
        Ok(db::query_metadata_rows(&self.tx, &filter)
            .map_err(SyncError::Storage)?
            .into_iter()
            .map(record_from_row)
            .collect())
    }

    /// etag 相同时只应用位置、收藏与状态；etag 不同则整体覆盖。
    /// 目标路径上若已有另一条活跃记录，则将其墓碑化，传入的记录视为最近一次看到的版本。
    pub fn upsert(&mut self, record: MetadataRecord) -> SyncResult<UpsertReport> {
        record.validate()?;
        let account = record.account.clone();
        let previous = self
            .get(&account, &record.oc_id)?
            .filter(|stored| !stored.deleted);

        let (outcome, mut next) = match &previous {
            None => (UpsertOutcome::Inserted, record),
            Some(stored) if stored.etag != record.etag => (UpsertOutcome::Updated, record),
            Some(stored) => {
                let mut merged = stored.clone();
                let relocated =
                    stored.server_url != record.server_url || stored.file_name != record.file_name;
                let flags_changed =
                    stored.is_favorite != record.is_favorite || stored.status != record.status;
                merged.server_url = record.server_url;
                merged.file_name = record.file_name;
                merged.is_favorite = record.is_favorite;
                merged.status = record.status;
                let outcome = if relocated {
                    UpsertOutcome::Relocated
                } else if flags_changed {
                    UpsertOutcome::FlagsChanged
                } else {
                    UpsertOutcome::Unchanged
                };
                (outcome, merged)
            }
        };

        if outcome == UpsertOutcome::Unchanged {
            return Ok(UpsertReport {
                oc_id: next.oc_id.clone(),
                outcome,
                record: next,
                previous,
                displaced: None,
            });
        }

        let now = current_timestamp_millis();
        let displaced =
            db::find_live_by_path(&self.tx, &account, &next.server_url, &next.file_name)
                .map_err(SyncError::Storage)?
                .filter(|row| row.oc_id != next.oc_id)
                .map(record_from_row);
        if let Some(other) = displaced.as_ref().filter(|other| other.status.is_transferring()) {
            return Err(SyncError::ConflictPendingTransfer {
                oc_id: other.oc_id.clone(),
            });
        }
        if let Some(other) = &displaced {
            warn!(
                account = %account,
                oc_id = %next.oc_id,
                displaced = %other.oc_id,
                path = %format!("{}/{}", next.server_url, next.file_name),
                "duplicate path, keeping most recently seen record"
            );
            db::mark_metadata_deleted(&self.tx, &account, &other.oc_id, self.next_seq(), now)
                .map_err(SyncError::Storage)?;
        }

        next.deleted = false;
        next.seen_seq = self.next_seq();
        db::upsert_metadata_row(&self.tx, &row_from_record(&next, now))
            .map_err(SyncError::Storage)?;
        debug!(account = %account, oc_id = %next.oc_id, ?outcome, "metadata upserted");

        Ok(UpsertReport {
            oc_id: next.oc_id.clone(),
            outcome,
            record: next,
            previous,
            displaced: displaced.map(|mut other| {
                other.deleted = true;
                other
            }),
        })
    }

    /// 写入远端条目；远端不携带传输状态，因此保留本地已有的 status。
    pub fn upsert_remote(&mut self, account: &str, entry: RemoteFileEntry) -> SyncResult<UpsertReport> {
        let status = self
            .get(account, &entry.oc_id)?
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.status)
            .unwrap_or(MetadataStatus::Normal);
        self.upsert(record_from_remote(account, entry, status))
    }

    /// 写入只带位置信息的远端条目（例如统一搜索命中，没有 etag 与收藏标记）。
    /// 已有活跃记录时只更新位置，内容字段与标记保持缓存值。
    /// 同一路径上已缓存的记录优先：命中按路径解析到它，不写入也不替换。
    pub fn upsert_located(&mut self, account: &str, entry: RemoteFileEntry) -> SyncResult<UpsertReport> {
        let at_path = db::find_live_by_path(&self.tx, account, &entry.server_url, &entry.file_name)
            .map_err(SyncError::Storage)?
            .map(record_from_row)
            .filter(|stored| stored.oc_id != entry.oc_id);
        if let Some(stored) = at_path {
            debug!(account, hit = %entry.oc_id, oc_id = %stored.oc_id, "located entry resolved by path");
            return Ok(UpsertReport {
                oc_id: stored.oc_id.clone(),
                outcome: UpsertOutcome::Unchanged,
                record: stored.clone(),
                previous: Some(stored),
                displaced: None,
            });
        }
        match self.get(account, &entry.oc_id)?.filter(|stored| !stored.deleted) {
            Some(mut stored) => {
                stored.server_url = entry.server_url;
                stored.file_name = entry.file_name;
                self.upsert(stored)
            }
            None => self.upsert(record_from_remote(account, entry, MetadataStatus::Normal)),
        }
    }

    pub fn remove(&mut self, account: &str, oc_id: &str) -> SyncResult<bool> {
        db::delete_metadata_row(&self.tx, account, oc_id).map_err(SyncError::Storage)
    }
}

pub(crate) fn record_from_remote(
    account: &str,
    entry: RemoteFileEntry,
    status: MetadataStatus,
) -> MetadataRecord {
    MetadataRecord {
        account: account.to_string(),
        oc_id: entry.oc_id,
        server_url: entry.server_url,
        file_name: entry.file_name,
        etag: entry.etag,
        is_favorite: entry.is_favorite,
        status,
        size: entry.size,
        mtime: entry.mtime,
        is_directory: entry.is_directory,
        deleted: false,
        seen_seq: 0,
    }
}

fn filter_from_predicate(predicate: &MetadataPredicate) -> RowFilter {
    RowFilter {
        account: predicate.account.clone(),
        server_url: predicate.server_url.clone(),
        favorite: predicate.favorite,
        statuses: predicate
            .statuses
            .as_ref()
            .map(|statuses| statuses.iter().map(|status| status.to_i64()).collect()),
        include_deleted: predicate.include_deleted,
        order_by: predicate.order.order_by_clause(),
    }
}

/// 运行时记录与数据库行之间的转换统一放在这里，处理有符号/无符号差异。
fn row_from_record(record: &MetadataRecord, updated_at_millis: i64) -> MetadataRow {
    MetadataRow {
        account: record.account.clone(),
        oc_id: record.oc_id.clone(),
        server_url: record.server_url.clone(),
        file_name: record.file_name.clone(),
        etag: record.etag.clone(),
        is_favorite: record.is_favorite,
        status: record.status.to_i64(),
        size: record.size.try_into().unwrap_or(i64::MAX),
        mtime: record.mtime,
        is_directory: record.is_directory,
        deleted: record.deleted,
        seen_seq: record.seen_seq,
        updated_at_millis,
    }
}

fn record_from_row(row: MetadataRow) -> MetadataRecord {
    MetadataRecord {
        account: row.account,
        oc_id: row.oc_id,
        server_url: row.server_url,
        file_name: row.file_name,
        etag: row.etag,
        is_favorite: row.is_favorite,
        status: MetadataStatus::from_i64(row.status),
        size: if row.size >= 0 { row.size as u64 } else { 0 },
        mtime: row.mtime,
        is_directory: row.is_directory,
        deleted: row.deleted,
        seen_seq: row.seen_seq,
    }
}
