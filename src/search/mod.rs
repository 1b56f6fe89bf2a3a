pub mod ocs;
pub mod provider;
pub mod session;

pub use ocs::OcsSearchProvider;
pub use provider::{
    select_search_provider, LegacySearchFetcher, LegacySearchProvider, PageSink, ProviderId,
    ProviderPage, SearchQuery, UnifiedSearchProvider, LEGACY_PROVIDER_ID,
};
pub use session::{
    SearchResultPage, SearchSession, SearchSnapshot, SearchState, SearchTicket,
    MIN_SEARCH_TERM_CHARS,
};
