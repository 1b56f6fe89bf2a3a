pub mod accounts;
pub mod sync_core;

pub use accounts::{Account, AccountRegistry};
pub use sync_core::{SyncCollaborators, SyncCore};
