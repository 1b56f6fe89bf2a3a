use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

use super::provider::{ProviderId, ProviderPage, SearchQuery, UnifiedSearchProvider};
use crate::error::{SyncError, SyncResult};
use crate::metadata::MetadataStore;
use crate::settings;

/// 少于该字符数的搜索词视为噪声，不发起请求。
pub const MIN_SEARCH_TERM_CHARS: usize = 2;

#[flutter_rust_bridge::frb]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Fetching,
    Streaming,
    Cancelled,
    Failed,
}

/// 单个 provider 的结果页：只保存 ocId 引用，记录本身由 `MetadataStore` 持有。
#[flutter_rust_bridge::frb]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResultPage {
    pub provider: ProviderId,
    pub cursor: Option<String>,
    pub is_paginated: bool,
    pub oc_ids: Vec<String>,
    pub in_progress: bool,
    /// 最近一次“加载更多”失败的原因；只影响这一页，会话状态不变。
    pub error: Option<SyncError>,
}

impl SearchResultPage {
    fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            cursor: None,
            is_paginated: false,
            oc_ids: Vec::new(),
            in_progress: false,
            error: None,
        }
    }

    /// 还能否“加载更多”。
    pub fn has_more(&self) -> bool {
        self.is_paginated && self.cursor.is_some()
    }
}

/// 推送给订阅者的会话快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchSnapshot {
    pub state: SearchState,
    pub term: Option<String>,
    pub pages: Vec<SearchResultPage>,
    pub error: Option<SyncError>,
}

struct SessionState {
    generation: u64,
    state: SearchState,
    term: Option<String>,
    account: Option<String>,
    pages: Vec<SearchResultPage>,
    error: Option<SyncError>,
}

impl SessionState {
    fn snapshot(&self) -> SearchSnapshot {
        SearchSnapshot {
            state: self.state,
            term: self.term.clone(),
            pages: self.pages.clone(),
            error: self.error.clone(),
        }
    }

    fn page_mut(&mut self, provider: &str) -> Option<&mut SearchResultPage> {
        self.pages.iter_mut().find(|page| page.provider == provider)
    }
}

/// 已发出的搜索请求；`wait` 阻塞到该请求结束。
/// 请求结束时若会话已被取消或开始了新搜索，返回 `Cancelled`。
#[derive(Debug)]
pub struct SearchTicket {
    generation: u64,
    handle: JoinHandle<SyncResult<()>>,
}

impl SearchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn wait(self) -> SyncResult<()> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(SyncError::FetchFailed("search worker panicked".to_string())))
    }
}

/// 可取消、可分页的搜索会话。
/// 每次 `start` 或 `cancel` 都会递增代数，迟到的旧代结果在写入前被丢弃。
#[derive(Clone)]
pub struct SearchSession {
    state: Arc<Mutex<SessionState>>,
    store: Arc<MetadataStore>,
    provider: Arc<dyn UnifiedSearchProvider>,
    subscribers: Arc<Mutex<Vec<Sender<SearchSnapshot>>>>,
}

impl SearchSession {
    pub fn new(store: Arc<MetadataStore>, provider: Arc<dyn UnifiedSearchProvider>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                generation: 0,
                state: SearchState::Idle,
                term: None,
                account: None,
                pages: Vec::new(),
                error: None,
            })),
            store,
            provider,
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 开始一次新搜索；搜索词过短时什么也不做并返回 `None`。
    pub fn start(&self, term: &str, account: &str) -> SyncResult<Option<SearchTicket>> {
        let term = term.trim();
        if term.chars().count() < MIN_SEARCH_TERM_CHARS {
            debug!(term, "search term too short, ignoring");
            return Ok(None);
        }
        if account.trim().is_empty() {
            return Err(SyncError::InvalidQuery("search account is required".to_string()));
        }
        let limit = self.page_limit()?;

        let (generation, snapshot) = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.state = SearchState::Fetching;
            state.term = Some(term.to_string());
            state.account = Some(account.to_string());
            state.pages.clear();
            state.error = None;
            (state.generation, state.snapshot())
        };
        self.broadcast(snapshot);

        let query = SearchQuery {
            term: term.to_string(),
            account: account.to_string(),
            provider: None,
            cursor: None,
            limit,
        };
        Ok(Some(self.spawn_request(generation, query)))
    }

    /// 使用保存的游标为某个 provider 继续拉取下一页。
    pub fn load_more(&self, provider: &str) -> SyncResult<Option<SearchTicket>> {
        let limit = self.page_limit()?;
        let (generation, query, snapshot) = {
            let mut state = self.lock_state();
            if state.state == SearchState::Cancelled {
                return Ok(None);
            }
            let (term, account) = match (state.term.clone(), state.account.clone()) {
                (Some(term), Some(account)) => (term, account),
                _ => return Ok(None),
            };
            let generation = state.generation;
            let page = state.page_mut(provider).ok_or_else(|| {
                SyncError::InvalidQuery(format!("unknown search provider {provider:?}"))
            })?;
            if page.in_progress {
                return Err(SyncError::AlreadyInProgress(provider.to_string()));
            }
            if !page.has_more() {
                return Ok(None);
            }
            page.in_progress = true;
            page.error = None;
            let query = SearchQuery {
                term,
                account,
                provider: Some(provider.to_string()),
                cursor: page.cursor.clone(),
                limit,
            };
            state.state = SearchState::Fetching;
            (generation, query, state.snapshot())
        };
        self.broadcast(snapshot);
        Ok(Some(self.spawn_request(generation, query)))
    }

    /// 取消当前会话；进行中的请求不会被中断，但其结果会被丢弃。
    pub fn cancel(&self) {
        let snapshot = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.state = SearchState::Cancelled;
            for page in state.pages.iter_mut() {
                page.in_progress = false;
            }
            state.snapshot()
        };
        self.broadcast(snapshot);
    }

    pub fn state(&self) -> SearchState {
        self.lock_state().state
    }

    pub fn term(&self) -> Option<String> {
        self.lock_state().term.clone()
    }

    pub fn pages(&self) -> Vec<SearchResultPage> {
        self.lock_state().pages.clone()
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        self.lock_state().snapshot()
    }

    /// 订阅会话快照；订阅时立即收到一份当前状态。
    pub fn subscribe(&self) -> Receiver<SearchSnapshot> {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(self.snapshot());
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    fn page_limit(&self) -> SyncResult<usize> {
        settings::get_search_page_limit(self.store.database()).map_err(SyncError::Storage)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_request(&self, generation: u64, query: SearchQuery) -> SearchTicket {
        let session = self.clone();
        let handle = thread::spawn(move || session.run_request(generation, query));
        SearchTicket { generation, handle }
    }

    fn run_request(&self, generation: u64, query: SearchQuery) -> SyncResult<()> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.provider.search(&query, &mut |provider, page| {
                self.apply_page(generation, &query.account, provider, page)
            })
        }))
        .unwrap_or_else(|_| Err("search provider panicked".to_string()));
        self.finish(generation, query.provider.as_deref(), outcome)
    }

    /// 落库并把 ocId 追加到对应 provider 的结果页。
    /// 会话锁一直持有到事务提交，`cancel` 或新的 `start` 无法插入检查与写入之间。
    fn apply_page(&self, generation: u64, account: &str, provider: ProviderId, page: ProviderPage) {
        let snapshot = {
            let mut state = self.lock_state();
            if state.generation != generation {
                debug!(generation, provider = %provider, "dropping stale search page");
                return;
            }
            let entries = page.entries;
            let stored = self.store.transaction(|txn| {
                let mut oc_ids = Vec::with_capacity(entries.len());
                for entry in entries {
                    let report = if entry.etag.is_empty() {
                        txn.upsert_located(account, entry)
                    } else {
                        txn.upsert_remote(account, entry)
                    };
                    match report {
                        Ok(report) => oc_ids.push(report.oc_id),
                        // 路径被待传输记录占用：结果引用该本地记录，不覆盖它。
                        Err(SyncError::ConflictPendingTransfer { oc_id }) => oc_ids.push(oc_id),
                        Err(err) => return Err(err),
                    }
                }
                Ok(oc_ids)
            });
            let oc_ids = match stored {
                Ok(oc_ids) => oc_ids,
                Err(err) => {
                    warn!(provider = %provider, error = %err, "failed to store search results");
                    return;
                }
            };

            if state.page_mut(&provider).is_none() {
                state.pages.push(SearchResultPage::new(provider.clone()));
            }
            if let Some(target) = state.page_mut(&provider) {
                for oc_id in oc_ids {
                    if !target.oc_ids.contains(&oc_id) {
                        target.oc_ids.push(oc_id);
                    }
                }
                target.cursor = page.cursor;
                target.is_paginated = page.is_paginated;
            }
            state.state = SearchState::Streaming;
            state.snapshot()
        };
        self.broadcast(snapshot);
    }

    fn finish(
        &self,
        generation: u64,
        provider: Option<&str>,
        outcome: Result<(), String>,
    ) -> SyncResult<()> {
        let (result, snapshot) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return Err(SyncError::Cancelled);
            }
            let result = outcome.map_err(SyncError::fetch);
            match (provider, &result) {
                // 续页失败只记录在该页上，已有结果与会话状态保持不变。
                (Some(id), _) => {
                    if let Some(page) = state.page_mut(id) {
                        page.in_progress = false;
                        page.error = result.as_ref().err().cloned();
                    }
                    if let Err(error) = &result {
                        warn!(generation, provider = id, error = %error, "search page request failed");
                    }
                    let settled = settled_state(&state.pages);
                    state.state = settled;
                }
                (None, Ok(())) => {
                    let settled = settled_state(&state.pages);
                    state.state = settled;
                }
                (None, Err(error)) => {
                    warn!(generation, error = %error, "search request failed");
                    state.state = SearchState::Failed;
                    state.error = Some(error.clone());
                }
            }
            (result, state.snapshot())
        };
        self.broadcast(snapshot);
        result
    }

    fn broadcast(&self, snapshot: SearchSnapshot) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain_mut(|sender| sender.send(snapshot.clone()).is_ok());
        }
    }
}

/// 请求结束后的会话状态：仍有页在加载时保持 Streaming。
fn settled_state(pages: &[SearchResultPage]) -> SearchState {
    if pages.iter().any(|page| page.in_progress) {
        SearchState::Streaming
    } else {
        SearchState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::metadata::{MetadataRecord, MetadataStatus, RemoteFileEntry};
    use crate::search::provider::PageSink;

    /// 首轮返回两个 provider；`files` 带游标，续页返回一条并结束分页。
    struct ScriptedProvider {
        queries: Mutex<Vec<SearchQuery>>,
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    }

    /// 被拦住的下一次请求：`entered` 表示请求已进入 provider，`release` 放行。
    struct Hold {
        entered: Receiver<()>,
        release: Sender<()>,
    }

    impl ScriptedProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                queries: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
            })
        }

        fn hold_next(&self) -> Hold {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
            Hold {
                entered: entered_rx,
                release: release_tx,
            }
        }
    }

    impl UnifiedSearchProvider for ScriptedProvider {
        fn search(&self, query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String> {
            self.queries.lock().unwrap().push(query.clone());
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, release)) = gate {
                let _ = entered.send(());
                let _ = release.recv();
            }
            match query.cursor.as_deref() {
                None => {
                    sink(
                        "files".to_string(),
                        ProviderPage {
                            entries: vec![
                                RemoteFileEntry::new("1", "/docs", "report.pdf", "e1"),
                                RemoteFileEntry::new("2", "/docs", "report-2.pdf", "e2"),
                            ],
                            cursor: Some("2".to_string()),
                            is_paginated: true,
                        },
                    );
                    sink(
                        "talk".to_string(),
                        ProviderPage {
                            entries: vec![RemoteFileEntry::new("9", "/talk", "report.md", "e9")],
                            cursor: None,
                            is_paginated: false,
                        },
                    );
                }
                Some(_) => sink(
                    "files".to_string(),
                    ProviderPage {
                        entries: vec![RemoteFileEntry::new("3", "/archive", "report-3.pdf", "e3")],
                        cursor: None,
                        is_paginated: true,
                    },
                ),
            }
            Ok(())
        }
    }

    struct FailingProvider;

    impl UnifiedSearchProvider for FailingProvider {
        fn search(&self, _query: &SearchQuery, _sink: &mut PageSink<'_>) -> Result<(), String> {
            Err("HTTP 503".to_string())
        }
    }

    /// 首页成功并带游标，续页一律失败。
    struct FlakyMoreProvider;

    impl UnifiedSearchProvider for FlakyMoreProvider {
        fn search(&self, query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String> {
            if query.cursor.is_some() {
                return Err("HTTP 500".to_string());
            }
            sink(
                "files".to_string(),
                ProviderPage {
                    entries: vec![RemoteFileEntry::new("1", "/docs", "report.pdf", "e1")],
                    cursor: Some("1".to_string()),
                    is_paginated: true,
                },
            );
            Ok(())
        }
    }

    /// 统一搜索的命中只带数字 fileId，没有 etag。
    struct FileIdProvider;

    impl UnifiedSearchProvider for FileIdProvider {
        fn search(&self, _query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String> {
            sink(
                "files".to_string(),
                ProviderPage {
                    entries: vec![RemoteFileEntry::new("42", "/docs", "report.pdf", "")],
                    cursor: None,
                    is_paginated: false,
                },
            );
            Ok(())
        }
    }

    /// 每次返回以搜索词命名的一条结果，便于区分不同代的写入。
    struct EchoProvider;

    impl UnifiedSearchProvider for EchoProvider {
        fn search(&self, query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String> {
            sink(
                "files".to_string(),
                ProviderPage {
                    entries: vec![RemoteFileEntry::new(&query.term, "/docs", &query.term, "e")],
                    cursor: None,
                    is_paginated: false,
                },
            );
            Ok(())
        }
    }

    fn store() -> Arc<MetadataStore> {
        Arc::new(MetadataStore::new(Arc::new(Database::open_in_memory().unwrap())).unwrap())
    }

    #[test]
    fn short_terms_are_ignored() {
        let provider = ScriptedProvider::new();
        let session = SearchSession::new(store(), provider.clone());
        assert!(session.start(" r ", "a").unwrap().is_none());
        assert_eq!(session.state(), SearchState::Idle);
        assert!(provider.queries.lock().unwrap().is_empty());
    }

    #[test]
    fn streams_pages_per_provider_in_order() {
        let store = store();
        let session = SearchSession::new(store.clone(), ScriptedProvider::new());
        session.start("report", "a").unwrap().unwrap().wait().unwrap();

        let pages = session.pages();
        assert_eq!(session.state(), SearchState::Idle);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].provider, "files");
        assert_eq!(pages[0].oc_ids, vec!["1".to_string(), "2".to_string()]);
        assert!(pages[0].has_more());
        assert!(!pages[1].has_more());
        assert!(store.get("a", "9").unwrap().is_some());
    }

    #[test]
    fn load_more_uses_cursor_and_configured_limit() {
        let store = store();
        settings::set_search_page_limit(store.database(), 7).unwrap();
        let provider = ScriptedProvider::new();
        let session = SearchSession::new(store, provider.clone());
        session.start("report", "a").unwrap().unwrap().wait().unwrap();

        session.load_more("files").unwrap().unwrap().wait().unwrap();

        let queries = provider.queries.lock().unwrap().clone();
        assert_eq!(queries[1].provider.as_deref(), Some("files"));
        assert_eq!(queries[1].cursor.as_deref(), Some("2"));
        assert_eq!(queries[1].limit, 7);
        let files = &session.pages()[0];
        assert_eq!(files.oc_ids, vec!["1", "2", "3"]);
        assert!(!files.has_more());
        assert!(session.load_more("files").unwrap().is_none());
        assert!(session.load_more("talk").unwrap().is_none());
    }

    #[test]
    fn duplicate_load_more_is_rejected() {
        let provider = ScriptedProvider::new();
        let session = SearchSession::new(store(), provider.clone());
        session.start("report", "a").unwrap().unwrap().wait().unwrap();

        let hold = provider.hold_next();
        let ticket = session.load_more("files").unwrap().unwrap();
        assert_eq!(
            session.load_more("files").unwrap_err(),
            SyncError::AlreadyInProgress("files".to_string())
        );
        hold.release.send(()).unwrap();
        ticket.wait().unwrap();
        assert!(!session.pages()[0].in_progress);
    }

    #[test]
    fn unknown_provider_is_invalid() {
        let session = SearchSession::new(store(), ScriptedProvider::new());
        session.start("report", "a").unwrap().unwrap().wait().unwrap();
        assert!(matches!(
            session.load_more("mail"),
            Err(SyncError::InvalidQuery(_))
        ));
    }

    #[test]
    fn late_results_after_cancel_are_dropped() {
        let store = store();
        let provider = ScriptedProvider::new();
        let session = SearchSession::new(store.clone(), provider.clone());
        let hold = provider.hold_next();
        let ticket = session.start("report", "a").unwrap().unwrap();

        session.cancel();
        hold.release.send(()).unwrap();

        assert_eq!(ticket.wait(), Err(SyncError::Cancelled));
        assert!(session.pages().is_empty());
        assert_eq!(session.state(), SearchState::Cancelled);
        assert!(store.get("a", "1").unwrap().is_none());
        assert!(session.load_more("files").unwrap().is_none());
    }

    #[test]
    fn new_search_discards_previous_generation() {
        let provider = ScriptedProvider::new();
        let session = SearchSession::new(store(), provider.clone());
        let hold = provider.hold_next();
        let stale = session.start("report", "a").unwrap().unwrap();
        hold.entered.recv().unwrap();
        let fresh = session.start("reports", "a").unwrap().unwrap();
        fresh.wait().unwrap();
        hold.release.send(()).unwrap();

        assert_eq!(stale.wait(), Err(SyncError::Cancelled));
        assert_eq!(session.term().as_deref(), Some("reports"));
        assert_eq!(session.pages()[0].oc_ids, vec!["1", "2"]);
    }

    #[test]
    fn failure_keeps_session_failed_with_error() {
        let session = SearchSession::new(store(), Arc::new(FailingProvider));
        let updates = session.subscribe();
        let err = session.start("report", "a").unwrap().unwrap().wait().unwrap_err();

        assert_eq!(err, SyncError::FetchFailed("HTTP 503".to_string()));
        assert_eq!(session.state(), SearchState::Failed);
        let last = updates.try_iter().last().unwrap();
        assert_eq!(last.state, SearchState::Failed);
        assert_eq!(last.error, Some(err));
    }

    #[test]
    fn search_results_keep_local_transfer_status() {
        let store = store();
        let mut record = MetadataRecord::new("a", "1", "/docs", "report.pdf", "e1");
        record.status = MetadataStatus::Downloading;
        store.upsert(vec![record]).unwrap();

        let session = SearchSession::new(store.clone(), ScriptedProvider::new());
        session.start("report", "a").unwrap().unwrap().wait().unwrap();

        assert_eq!(
            store.get("a", "1").unwrap().unwrap().status,
            MetadataStatus::Downloading
        );
    }

    #[test]
    fn failed_load_more_is_recorded_on_its_page() {
        let session = SearchSession::new(store(), Arc::new(FlakyMoreProvider));
        session.start("report", "a").unwrap().unwrap().wait().unwrap();

        let err = session.load_more("files").unwrap().unwrap().wait().unwrap_err();

        assert_eq!(err, SyncError::FetchFailed("HTTP 500".to_string()));
        assert_eq!(session.state(), SearchState::Idle);
        let snapshot = session.snapshot();
        assert!(snapshot.error.is_none());
        let files = &snapshot.pages[0];
        assert_eq!(files.oc_ids, vec!["1"]);
        assert!(!files.in_progress);
        assert_eq!(files.error, Some(err));
        assert!(files.has_more());
    }

    #[test]
    fn file_id_hit_references_cached_record() {
        let store = store();
        store
            .upsert(vec![MetadataRecord::new("a", "00000042ocabc", "/docs", "report.pdf", "e1")])
            .unwrap();
        let session = SearchSession::new(store.clone(), Arc::new(FileIdProvider));

        session.start("report", "a").unwrap().unwrap().wait().unwrap();

        let cached = store.get("a", "00000042ocabc").unwrap().unwrap();
        assert!(!cached.deleted);
        assert_eq!(cached.etag, "e1");
        assert!(store.get("a", "42").unwrap().is_none());
        assert_eq!(session.pages()[0].oc_ids, vec!["00000042ocabc"]);
    }

    #[test]
    fn cancelled_generation_never_reaches_the_store() {
        let store = store();
        let session = SearchSession::new(store.clone(), Arc::new(EchoProvider));
        for i in 0..50 {
            let term = format!("term-{i}");
            let ticket = session.start(&term, "a").unwrap().unwrap();
            session.cancel();
            let _ = ticket.wait();

            let stored = store.get("a", &term).unwrap().is_some();
            let listed = session
                .pages()
                .iter()
                .any(|page| page.oc_ids.contains(&term));
            assert_eq!(stored, listed, "generation {i}");
        }
    }
}
