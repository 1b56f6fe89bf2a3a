use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
};

use tracing::{debug, warn};

use super::fetcher::{FavoritesFetcher, ListingOptions, RemoteListingFetcher};
use crate::change_bus::{ChangeBus, ChangeEvent, ChangeKind};
use crate::error::{SyncError, SyncResult};
use crate::metadata::{
    MetadataPredicate, MetadataStore, RemoteFileEntry, StoreTxn, UpsertOutcome, UpsertReport,
};
use crate::settings;

/// 对账模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReconcileMode {
    /// 远端列表对该目录完全权威：本地多出的记录会被删除（有未完成传输的除外）。
    FullReplace,
    /// 远端列表只对收藏标记权威：不在列表中的本地收藏被取消，列表条目全部标记为收藏。
    FavoritesOnly,
}

/// 一次对账的结果：发布出去的事件批次，以及因未完成传输而保留的记录。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub events: Vec<ChangeEvent>,
    pub conflicts: Vec<String>,
}

impl ReconcileSummary {
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ChangeKind) -> bool,
    {
        self.events.iter().filter(|event| predicate(&event.kind)).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ReconcileTarget {
    account: String,
    server_url: String,
    mode: ReconcileMode,
}

/// 正在进行的一次拉取；同一目标的后续请求等待并共享它的结果。
struct Flight {
    result: Mutex<Option<SyncResult<ReconcileSummary>>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: SyncResult<ReconcileSummary>) {
        let mut slot = self.result.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> SyncResult<ReconcileSummary> {
        let mut slot = self.result.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(|p| p.into_inner());
        }
    }
}

type FlightMap = Mutex<HashMap<ReconcileTarget, Arc<Flight>>>;

/// 领头者持有；无论正常返回还是 panic，离开作用域时都会移除 flight 并唤醒跟随者。
struct FlightGuard<'a> {
    in_flight: &'a FlightMap,
    target: ReconcileTarget,
    flight: Arc<Flight>,
    result: Option<SyncResult<ReconcileSummary>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.target);
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(SyncError::FetchFailed("refresh aborted".to_string())));
        self.flight.complete(result);
    }
}

/// 负责把远端列表合并进本地缓存，并以单个批次发布变更事件。
pub struct Reconciler {
    store: Arc<MetadataStore>,
    bus: ChangeBus,
    listing: Arc<dyn RemoteListingFetcher>,
    favorites: Arc<dyn FavoritesFetcher>,
    in_flight: FlightMap,
}

impl Reconciler {
    pub fn new(
        store: Arc<MetadataStore>,
        bus: ChangeBus,
        listing: Arc<dyn RemoteListingFetcher>,
        favorites: Arc<dyn FavoritesFetcher>,
    ) -> Self {
        Self {
            store,
            bus,
            listing,
            favorites,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// 拉取目录列表并以 FullReplace 模式对账。
    /// 同一 `(account, server_url)` 的并发请求只会触发一次远端拉取。
    pub fn refresh(&self, account: &str, server_url: &str) -> SyncResult<ReconcileSummary> {
        validate_target(account, server_url, ReconcileMode::FullReplace)?;
        let show_hidden_files = settings::get_show_hidden_files(self.store.database())
            .map_err(SyncError::Storage)?;
        let options = ListingOptions { show_hidden_files };
        self.coalesced(account, server_url, ReconcileMode::FullReplace, || {
            self.listing.fetch(server_url, account, &options)
        })
    }

    /// 拉取收藏列表并以 FavoritesOnly 模式对账。
    pub fn refresh_favorites(&self, account: &str) -> SyncResult<ReconcileSummary> {
        validate_target(account, "", ReconcileMode::FavoritesOnly)?;
        let show_hidden_files = settings::get_show_hidden_files(self.store.database())
            .map_err(SyncError::Storage)?;
        self.coalesced(account, "", ReconcileMode::FavoritesOnly, || {
            self.favorites.fetch_favorites(account, show_hidden_files)
        })
    }

    fn coalesced<F>(
        &self,
        account: &str,
        server_url: &str,
        mode: ReconcileMode,
        fetch: F,
    ) -> SyncResult<ReconcileSummary>
    where
        F: FnOnce() -> Result<Vec<RemoteFileEntry>, String>,
    {
        let target = ReconcileTarget {
            account: account.to_string(),
            server_url: server_url.to_string(),
            mode,
        };
        let (flight, leader) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match in_flight.get(&target) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let flight = Arc::new(Flight::new());
                    in_flight.insert(target.clone(), flight.clone());
                    (flight, true)
                }
            }
        };
        if !leader {
            debug!(account, server_url, "joining in-flight refresh");
            return flight.wait();
        }

        let mut guard = FlightGuard {
            in_flight: &self.in_flight,
            target,
            flight,
            result: None,
        };
        let fetched = panic::catch_unwind(AssertUnwindSafe(fetch))
            .unwrap_or_else(|_| Err("fetch collaborator panicked".to_string()));
        let result = match fetched {
            Ok(listing) => self.reconcile(account, server_url, listing, mode),
            Err(err) => Err(self.fetch_failed(account, server_url, err)),
        };
        guard.result = Some(result.clone());
        result
    }

    /// 拉取失败：本地缓存保持原样，只发布携带错误的“数据未变”事件。
    fn fetch_failed(&self, account: &str, server_url: &str, err: String) -> SyncError {
        let error = SyncError::FetchFailed(err);
        warn!(account, server_url, error = %error, "remote fetch failed, keeping cached data");
        self.bus.publish(vec![ChangeEvent::unchecked(
            ChangeKind::DataUnchanged,
            account,
            server_url,
            None,
        )
        .with_error(error.clone())]);
        error
    }

    /// 将一份已拉取的远端列表合并进缓存；整个过程在一个存储事务中完成，
    /// 结束后发布一个事件批次，供界面一次性刷新。
    pub fn reconcile(
        &self,
        account: &str,
        server_url: &str,
        listing: Vec<RemoteFileEntry>,
        mode: ReconcileMode,
    ) -> SyncResult<ReconcileSummary> {
        validate_target(account, server_url, mode)?;
        let mut summary = self.store.transaction(|txn| match mode {
            ReconcileMode::FullReplace => full_replace(txn, account, server_url, listing),
            ReconcileMode::FavoritesOnly => favorites_only(txn, account, listing),
        })?;

        if summary.events.is_empty() {
            summary.events.push(ChangeEvent::unchecked(
                ChangeKind::DataUnchanged,
                account,
                server_url,
                None,
            ));
        }
        debug!(
            account,
            server_url,
            ?mode,
            events = summary.events.len(),
            conflicts = summary.conflicts.len(),
            "reconcile finished"
        );
        self.bus.publish(summary.events.clone());
        Ok(summary)
    }
}

fn validate_target(account: &str, server_url: &str, mode: ReconcileMode) -> SyncResult<()> {
    if account.trim().is_empty() {
        return Err(SyncError::InvalidQuery("reconcile account is required".to_string()));
    }
    if mode == ReconcileMode::FullReplace && !server_url.starts_with('/') {
        return Err(SyncError::InvalidQuery(format!(
            "reconcile server url {server_url:?} must be absolute"
        )));
    }
    Ok(())
}

fn full_replace(
    txn: &mut StoreTxn<'_>,
    account: &str,
    server_url: &str,
    listing: Vec<RemoteFileEntry>,
) -> SyncResult<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let listed: HashSet<String> = listing.iter().map(|entry| entry.oc_id.clone()).collect();

    for entry in listing {
        match txn.upsert_remote(account, entry) {
            Ok(report) => push_report_events(&mut summary.events, account, &report),
            // 同一路径被待传输记录占用：条目暂不写入，下面的清理循环会把该记录报告为冲突。
            Err(SyncError::ConflictPendingTransfer { oc_id }) => {
                debug!(account, server_url, oc_id = %oc_id, "listing entry deferred behind pending transfer");
            }
            Err(err) => return Err(err),
        }
    }

    let cached = txn.query(
        &MetadataPredicate::account(account)
            .in_directory(server_url)
            .including_deleted(),
    )?;
    for record in cached {
        if listed.contains(&record.oc_id) {
            continue;
        }
        if record.deleted {
            // 路径冲突留下的墓碑，远端不再列出时直接清理。
            txn.remove(account, &record.oc_id)?;
            continue;
        }
        if record.status.is_transferring() {
            warn!(account, server_url, oc_id = %record.oc_id, status = ?record.status, "remote copy gone, transfer pending");
            push_conflict(&mut summary, account, server_url, record.oc_id);
            continue;
        }
        txn.remove(account, &record.oc_id)?;
        summary.events.push(ChangeEvent::unchecked(
            ChangeKind::Deleted,
            account,
            server_url,
            Some(&record.oc_id),
        ));
    }
    Ok(summary)
}

fn favorites_only(
    txn: &mut StoreTxn<'_>,
    account: &str,
    listing: Vec<RemoteFileEntry>,
) -> SyncResult<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let listed: HashSet<String> = listing.iter().map(|entry| entry.oc_id.clone()).collect();

    for mut record in txn.query(&MetadataPredicate::account(account).favorites())? {
        if listed.contains(&record.oc_id) {
            continue;
        }
        record.is_favorite = false;
        let report = txn.upsert(record)?;
        push_report_events(&mut summary.events, account, &report);
    }

    for mut entry in listing {
        entry.is_favorite = true;
        match txn.upsert_remote(account, entry) {
            Ok(report) => push_report_events(&mut summary.events, account, &report),
            Err(SyncError::ConflictPendingTransfer { oc_id }) => {
                let server_url = txn
                    .get(account, &oc_id)?
                    .map(|pending| pending.server_url)
                    .unwrap_or_default();
                warn!(account, server_url = %server_url, oc_id = %oc_id, "favorite shadowed by pending transfer");
                push_conflict(&mut summary, account, &server_url, oc_id);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(summary)
}

/// 待传输记录保留在本地，并以带错误的冲突事件上报。
fn push_conflict(summary: &mut ReconcileSummary, account: &str, server_url: &str, oc_id: String) {
    let error = SyncError::ConflictPendingTransfer {
        oc_id: oc_id.clone(),
    };
    summary.events.push(
        ChangeEvent::unchecked(
            ChangeKind::ConflictPendingTransfer,
            account,
            server_url,
            Some(&oc_id),
        )
        .with_error(error),
    );
    summary.conflicts.push(oc_id);
}

/// 根据 upsert 前后的记录推导事件；一条记录可能同时产生移动、内容更新与收藏变化。
fn push_report_events(events: &mut Vec<ChangeEvent>, account: &str, report: &UpsertReport) {
    if let Some(displaced) = &report.displaced {
        events.push(ChangeEvent::unchecked(
            ChangeKind::Deleted,
            account,
            &displaced.server_url,
            Some(&displaced.oc_id),
        ));
    }

    let current = &report.record;
    let event = |kind: ChangeKind| {
        ChangeEvent::unchecked(kind, account, &current.server_url, Some(&current.oc_id))
    };
    let previous = match (&report.outcome, &report.previous) {
        (UpsertOutcome::Unchanged, _) => return,
        (UpsertOutcome::Inserted, _) | (_, None) => {
            events.push(event(ChangeKind::Created));
            return;
        }
        (_, Some(previous)) => previous,
    };

    if previous.server_url != current.server_url {
        events.push(event(ChangeKind::Moved {
            from_server_url: previous.server_url.clone(),
        }));
    } else if previous.file_name != current.file_name {
        events.push(event(ChangeKind::Renamed {
            from_file_name: previous.file_name.clone(),
        }));
    }
    if previous.etag != current.etag {
        events.push(event(ChangeKind::Updated));
    }
    if previous.is_favorite != current.is_favorite {
        events.push(event(ChangeKind::Favorited {
            favorite: current.is_favorite,
        }));
    }
}
