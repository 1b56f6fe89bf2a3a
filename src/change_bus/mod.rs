pub mod core;
pub mod event;

pub use self::core::{ChangeBus, ChangeHandler, SubscriptionId};
pub use event::{ChangeEvent, ChangeKind};
