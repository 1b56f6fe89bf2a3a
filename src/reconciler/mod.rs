pub mod core;
pub mod fetcher;

pub use self::core::{ReconcileMode, ReconcileSummary, Reconciler};
pub use fetcher::{FavoritesFetcher, ListingOptions, RemoteListingFetcher};
