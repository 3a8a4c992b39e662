//! Scenarios run against a live cluster
//!
//! - `web_server`: an nginx instance is committed, started, queried and stopped
//! - `volumes`: data written to a volume survives a stop and restart

mod helpers;
mod volumes;
mod web_server;
