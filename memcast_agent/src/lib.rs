//! memcast agent: samples host memory and pushes it to every connected
//! WebSocket viewer.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod registry;
pub mod sampler;
pub mod server;
pub mod state;
pub mod tls;
pub mod types;
pub mod ws;
