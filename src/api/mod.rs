//! HTTP and WebSocket API of the coordinator daemon.
//!
//! ## Endpoints
//!
//! - `GET /ws/page` - WebSocket for page contexts (content capture)
//! - `GET /ws/ui` - WebSocket for UI surfaces (prompts and streamed answers)
//! - `GET /api/health` - Health check
//! - `GET /api/pages` - List pages with cached content
//! - `GET /api/settings` - Current provider settings (key redacted)
//! - `PUT /api/settings` - Update provider settings

mod routes;
mod ws;

pub use routes::{serve, AppState};
