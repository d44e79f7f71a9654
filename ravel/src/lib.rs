// src/lib.rs
pub mod conn;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pool;
pub mod rcu;
pub mod registry;
pub mod request;
pub mod server;
pub mod signal;
pub mod stats;
pub mod syscalls;

// Re-exports for users
pub use error::{Error, Result};
pub use frame::{encode_frame, encode_request, MAX_FRAME_PAYLOAD};
pub use logging::{init_logging, try_init_logging};
pub use pool::SlotPool;
pub use rcu::{Rcu, RcuCell, RcuGuard};
pub use registry::{Handler, HandlerRegistry};
pub use server::{ServiceManager, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_REQUESTS};
pub use signal::SignalDispatcher;
pub use stats::StatsSnapshot;
