use std::sync::Arc;

use tracing::info;

use super::accounts::AccountRegistry;
use crate::change_bus::{ChangeBus, ChangeEvent, ChangeKind, SubscriptionId};
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::layout::{LayoutPreference, LayoutStore, LAYOUT_VIEW_FAVORITE};
use crate::logging;
use crate::metadata::{MetadataPredicate, MetadataRecord, MetadataStatus, MetadataStore};
use crate::reconciler::{FavoritesFetcher, ReconcileSummary, Reconciler, RemoteListingFetcher};
use crate::search::{SearchSession, UnifiedSearchProvider};
use crate::settings::SyncConfig;
use crate::transfer::{TransferProgress, TransferTracker};

/// 同步核心依赖的外部网络协作者。
#[derive(Clone)]
pub struct SyncCollaborators {
    pub listing: Arc<dyn RemoteListingFetcher>,
    pub favorites: Arc<dyn FavoritesFetcher>,
    pub search: Arc<dyn UnifiedSearchProvider>,
}

/// 面向界面层的上下文对象：持有存储、事件总线、对账器、搜索会话与传输进度。
/// 每个实例彼此独立，不依赖任何进程级单例。
#[flutter_rust_bridge::frb(opaque)]
pub struct SyncCore {
    store: Arc<MetadataStore>,
    layouts: LayoutStore,
    accounts: AccountRegistry,
    bus: ChangeBus,
    transfers: TransferTracker,
    reconciler: Reconciler,
    search: SearchSession,
}

impl SyncCore {
    /// 打开磁盘数据库并安装日志。
    pub fn open(config: &SyncConfig, collaborators: SyncCollaborators) -> SyncResult<Self> {
        logging::init(&config.log_filter);
        let database = Database::open(&config.database_path).map_err(SyncError::Storage)?;
        info!(path = ?config.database_path, "sync core opened");
        Self::with_database(Arc::new(database), collaborators)
    }

    /// 仅存在于内存中的实例，进程结束即丢弃。
    pub fn in_memory(collaborators: SyncCollaborators) -> SyncResult<Self> {
        let database = Database::open_in_memory().map_err(SyncError::Storage)?;
        Self::with_database(Arc::new(database), collaborators)
    }

    fn with_database(database: Arc<Database>, collaborators: SyncCollaborators) -> SyncResult<Self> {
        let store = Arc::new(MetadataStore::new(database.clone())?);
        let bus = ChangeBus::new();
        let transfers = TransferTracker::new();
        transfers.observe(&bus);
        let reconciler = Reconciler::new(
            store.clone(),
            bus.clone(),
            collaborators.listing,
            collaborators.favorites,
        );
        let search = SearchSession::new(store.clone(), collaborators.search);
        Ok(Self {
            layouts: LayoutStore::new(database.clone()),
            accounts: AccountRegistry::new(database),
            store,
            bus,
            transfers,
            reconciler,
            search,
        })
    }

    pub fn on_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&[ChangeEvent]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// 阻塞直到已发布的事件全部送达观察者。
    pub fn flush_events(&self) {
        self.bus.flush();
    }

    /// 只读快照。
    pub fn current_records(&self, predicate: &MetadataPredicate) -> SyncResult<Vec<MetadataRecord>> {
        self.store.query(predicate)
    }

    /// 按视图保存的布局排序返回记录；收藏视图忽略目录，列出账号下全部收藏。
    pub fn records_for_view(
        &self,
        account: &str,
        key: &str,
        server_url: &str,
    ) -> SyncResult<Vec<MetadataRecord>> {
        let layout = self.layouts.layout_for_view(account, key, server_url)?;
        let predicate = if key == LAYOUT_VIEW_FAVORITE {
            MetadataPredicate::account(account).favorites()
        } else {
            MetadataPredicate::account(account).in_directory(server_url)
        };
        self.store.query(&predicate.ordered_by(layout.order()))
    }

    pub fn progress(&self, oc_id: &str) -> Option<TransferProgress> {
        self.transfers.progress(oc_id)
    }

    pub fn transfers(&self) -> &TransferTracker {
        &self.transfers
    }

    pub fn refresh(&self, account: &str, server_url: &str) -> SyncResult<ReconcileSummary> {
        self.reconciler.refresh(account, server_url)
    }

    pub fn refresh_favorites(&self, account: &str) -> SyncResult<ReconcileSummary> {
        self.reconciler.refresh_favorites(account)
    }

    pub fn search_session(&self) -> &SearchSession {
        &self.search
    }

    pub fn layout_for_view(
        &self,
        account: &str,
        key: &str,
        server_url: &str,
    ) -> SyncResult<LayoutPreference> {
        self.layouts.layout_for_view(account, key, server_url)
    }

    pub fn set_layout_for_view(&self, layout: &LayoutPreference) -> SyncResult<()> {
        self.layouts.set_layout_for_view(layout)
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// 传输协作者报告生命周期变化：更新记录的传输状态并发布对应事件。
    /// 终态事件经由 ChangeBus 让进度表清理条目。
    pub fn record_transfer_event(
        &self,
        kind: ChangeKind,
        account: &str,
        oc_id: &str,
        oc_id_transfer: Option<&str>,
    ) -> SyncResult<()> {
        let status = status_after(&kind).ok_or_else(|| {
            SyncError::InvalidQuery(format!("{kind:?} is not a transfer event"))
        })?;
        let record = self
            .store
            .get(account, oc_id)?
            .filter(|record| !record.deleted)
            .ok_or_else(|| SyncError::InvalidQuery(format!("unknown record {oc_id:?}")))?;
        let event =
            ChangeEvent::transfer(kind, account, &record.server_url, oc_id, oc_id_transfer)?;
        self.store.set_status(account, oc_id, status)?;
        self.bus.publish(vec![event]);
        Ok(())
    }
}

fn status_after(kind: &ChangeKind) -> Option<MetadataStatus> {
    match kind {
        ChangeKind::DownloadStarted => Some(MetadataStatus::Downloading),
        ChangeKind::UploadStarted => Some(MetadataStatus::Uploading),
        ChangeKind::DownloadFinished
        | ChangeKind::DownloadCancelled
        | ChangeKind::UploadFinished
        | ChangeKind::UploadCancelled => Some(MetadataStatus::Normal),
        _ => None,
    }
}
