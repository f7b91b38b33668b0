mod error;
pub(crate) mod models;
mod store;

pub use error::{RequestError, RequestResult};
pub use models::{
    AuditRecord, Channel, ChannelStrictness, NewRequest, RequestEntry, RequestFilter,
    RequestMetrics, RequestStatus, ScheduleCandidate, StuckFinding, StuckKind,
};
pub use store::{SqliteRequestStore, SqliteRequestStoreBuilder};
