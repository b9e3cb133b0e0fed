pub mod catalog;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod lock;
pub mod pull;
pub mod report;
pub mod runtime;
pub mod sink;
pub mod slack;
pub mod text;
pub mod toggle;
pub mod trigger;
pub mod types;

pub use types::*;
