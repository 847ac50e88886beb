mod branch_store;
mod branches;
mod config;
mod history_store;
mod lock;
mod log_store;
mod mutation;
mod watch;

pub use branch_store::*;
pub use branches::*;
pub use config::*;
pub use history_store::*;
pub use lock::*;
pub use log_store::*;
pub use mutation::*;
pub use watch::*;

pub(crate) use log_store::write_atomic;
