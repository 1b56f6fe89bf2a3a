pub mod api;
pub mod change_bus;
pub mod db;
pub mod error;
pub mod layout;
pub mod logging;
pub mod metadata;
pub mod reconciler;
pub mod search;
pub mod settings;
pub mod transfer;

pub use error::{SyncError, SyncResult};
