pub mod catalog;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod request;
pub mod slots;
pub mod store;
pub mod wal;
