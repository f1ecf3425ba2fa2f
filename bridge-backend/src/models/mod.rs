pub mod execution;
pub mod tunnel;
