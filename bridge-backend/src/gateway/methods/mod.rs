pub mod execution;
pub mod session;
pub mod tunnels;

pub use execution::*;
pub use session::*;
pub use tunnels::*;
