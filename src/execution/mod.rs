pub mod dispatcher;
pub mod idempotency;
pub mod reconciler;
pub mod swap_client;
pub mod venue;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherSettings, QueuedIntent};
pub use idempotency::{Admission, IdempotencyGuard};
pub use reconciler::Reconciler;
pub use venue::{DryRunVenue, ExecutionVenue};
