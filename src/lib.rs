pub mod attempt;
pub mod classify;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod scheduler;
pub mod status;
pub mod store;
