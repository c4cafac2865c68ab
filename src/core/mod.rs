pub mod types;
pub mod config;
pub mod error;
pub mod table;
pub mod database;
pub mod engine;
