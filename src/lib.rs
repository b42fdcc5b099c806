//! Multiplexing MCP gateway core.
//!
//! One local endpoint (stdio, HTTP+SSE, streamable HTTP, or WebSocket)
//! fronts a fleet of upstream MCP tool servers, while persistent outbound
//! WebSocket sessions present the aggregated toolset to hub endpoints.

pub mod adapters;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod hub;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod service;
