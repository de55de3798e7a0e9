pub(crate) mod scheduler;
pub mod types;

pub use types::{CancelToken, TransferConfig, TransferMetrics};
