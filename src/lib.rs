pub mod api;
pub mod config;
pub mod records;
pub mod sandbox;
pub mod sessions;
pub mod supervisor;
