//! Immutable turn DAG: fixed-size log records, side tables, head pointers.

pub mod heads;
pub mod log;
pub mod meta;
pub mod record;
pub mod store;

pub use heads::ContextHead;
pub use log::TurnLog;
pub use meta::TurnMeta;
pub use record::{FLAG_HAS_FS, TurnRecord};
pub use store::TurnStore;
