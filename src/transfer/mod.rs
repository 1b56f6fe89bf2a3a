pub mod tracker;

pub use tracker::{ProgressTick, SessionKind, TransferProgress, TransferTracker, TransferUpdate};
