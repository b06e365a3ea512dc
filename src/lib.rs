//! pagelens: a local coordinator daemon for answering questions about open
//! browser pages.
//!
//! Page contexts push extracted content over WebSocket; the daemon keeps a
//! bounded version history per page in the snapshot cache. UI surfaces send
//! prompts naming one or more pages; the coordinator assembles the cached
//! content into model context and streams the completion back delta by delta.
//! All traffic rides a typed message bus with request/response,
//! fire-and-forget and streaming call shapes.

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod llm;
pub mod settings;

pub use config::Config;
