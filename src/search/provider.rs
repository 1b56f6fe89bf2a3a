use std::sync::Arc;

use tracing::debug;

use crate::metadata::RemoteFileEntry;
use crate::settings::UNIFIED_SEARCH_MIN_SERVER_VERSION;

/// 远端搜索后端的标识，例如 `files`、`fulltextsearch`。
pub type ProviderId = String;

/// 旧版单次搜索接口对外呈现的唯一 provider。
pub const LEGACY_PROVIDER_ID: &str = "files";

/// 一次 provider 请求的参数；`provider` 为空表示向所有 provider 发起首轮搜索。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    pub account: String,
    pub provider: Option<ProviderId>,
    pub cursor: Option<String>,
    pub limit: usize,
}

/// provider 返回的一页结果，条目顺序即 provider 声明的顺序。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderPage {
    pub entries: Vec<RemoteFileEntry>,
    pub cursor: Option<String>,
    pub is_paginated: bool,
}

/// 回调接收 `(provider, page)`；一次搜索可多次回调，每个 provider 一页。
pub type PageSink<'a> = dyn FnMut(ProviderId, ProviderPage) + 'a;

/// 统一搜索（多 provider、游标分页）的传输抽象。
/// 页面通过 `sink` 逐个流式送达；返回 `Err` 表示整个请求失败。
pub trait UnifiedSearchProvider: Send + Sync {
    fn search(&self, query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String>;
}

/// 旧版服务器的单次文件搜索。
pub trait LegacySearchFetcher: Send + Sync {
    fn search_files(&self, term: &str, account: &str) -> Result<Vec<RemoteFileEntry>, String>;
}

/// 把旧版接口包装成只有一个 provider、一页、不可分页的统一搜索。
pub struct LegacySearchProvider {
    fetcher: Arc<dyn LegacySearchFetcher>,
}

impl LegacySearchProvider {
    pub fn new(fetcher: Arc<dyn LegacySearchFetcher>) -> Self {
        Self { fetcher }
    }
}

impl UnifiedSearchProvider for LegacySearchProvider {
    fn search(&self, query: &SearchQuery, sink: &mut PageSink<'_>) -> Result<(), String> {
        if query.cursor.is_some() {
            // 旧接口没有续页。
            return Ok(());
        }
        if let Some(provider) = query.provider.as_deref() {
            if provider != LEGACY_PROVIDER_ID {
                return Ok(());
            }
        }
        let entries = self.fetcher.search_files(&query.term, &query.account)?;
        sink(
            LEGACY_PROVIDER_ID.to_string(),
            ProviderPage {
                entries,
                cursor: None,
                is_paginated: false,
            },
        );
        Ok(())
    }
}

/// 按服务器主版本选择搜索实现：新版走统一搜索，旧版退回单次搜索。
pub fn select_search_provider(
    server_major: u32,
    unified: Arc<dyn UnifiedSearchProvider>,
    legacy: Arc<dyn LegacySearchFetcher>,
) -> Arc<dyn UnifiedSearchProvider> {
    if server_major >= UNIFIED_SEARCH_MIN_SERVER_VERSION {
        unified
    } else {
        debug!(server_major, "server predates unified search, using legacy search");
        Arc::new(LegacySearchProvider::new(legacy))
    }
}
