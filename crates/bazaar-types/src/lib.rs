pub mod collection;
pub mod events;
pub mod models;

pub use collection::CollectionSpec;
pub use events::{ChangeEvent, ChangeFilter, ChangeKind};
pub use models::{NotificationRecord, Record, ScheduleEntry};
