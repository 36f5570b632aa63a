//! The proxy layer: upstream connections and pools, forwarding, the
//! request pipeline, and the server accept loop.

pub mod client;
pub mod context;
pub mod forwarding;
pub mod handler;
pub mod network;
pub mod pool;
pub mod server;
pub mod tls;

pub use client::UpstreamTarget;
pub use pool::{PoolKey, PoolManager};
pub use server::WafServer;
