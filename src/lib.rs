pub mod config;
pub mod store;
pub mod widget;

pub use config::{Category, WidgetConfig};
pub use store::{
    Document, DocumentStore, Fields, MemoryStore, Snapshot, SqliteStore, StoreError, Subscription,
    WriteOp, COUNT_FIELD, RATINGS_COLLECTION,
};
pub use widget::{
    CategoryCount, Popup, RatingWidget, VotePhase, WidgetEvent, WidgetSnapshot, WidgetState,
};
