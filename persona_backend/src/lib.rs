pub mod agent;
pub mod config;
pub mod http_client;
pub mod llm_client;
pub mod runtime;
pub mod server;
pub mod state;
pub mod store;
pub mod tools;
