pub mod api;
pub mod assembler;
pub mod client;
pub mod config;
pub mod editor;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod session;
pub mod store;
pub mod temp_area;
