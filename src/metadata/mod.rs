pub mod model;
pub mod store;

pub use model::{
    MetadataPredicate, MetadataRecord, MetadataStatus, RecordOrder, RemoteFileEntry, SortField,
};
pub use store::{MetadataStore, StoreTxn, UpsertOutcome, UpsertReport};
