pub mod broadcast;
pub mod config;
pub mod database;
pub mod dialogue;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod http_client;
pub mod llm_client;
pub mod runtime;
pub mod server;
pub mod settings;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
