//! The proxy data path: upstream client, request pipeline, front server.

mod client;
mod forwarder;
mod server;

pub use client::{send_request, OutboundRequest, UpstreamError};
pub use forwarder::Forwarder;
pub use server::Server;
