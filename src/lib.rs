pub mod api;
pub mod backends;
pub mod clients;
pub mod config;
pub mod crypto;
pub mod dlq;
pub mod error;
pub mod models;
pub mod producer;
pub mod relay;
pub mod template;
pub mod utils;
pub mod worker;
