mod branch;
mod contract;
mod event;
mod history;
mod status;
mod turns;
mod types;

pub use branch::*;
pub use contract::*;
pub use event::*;
pub use history::*;
pub use status::*;
pub use turns::*;
pub use types::*;
