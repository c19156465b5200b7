//! Core types, message bus, config, session store, and utilities for robun.
//!
//! This crate contains:
//! - **bus**: async inbound/outbound message queues connecting channels to the agent loop
//! - **config**: layered configuration schema, loading, and env var overrides
//! - **session**: JSONL session persistence with an in-memory cache
//! - **heartbeat**: periodic autonomous check-in service
//! - **types**: shared wire-format types (`Message`, tool calls, media)

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;

pub use config::Config;
pub use heartbeat::HeartbeatService;
pub use session::SessionManager;
pub use types::{MediaAttachment, Message, MessageContent, ToolCall, ToolDefinition};
