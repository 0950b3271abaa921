// DevFlow API: JSON-RPC 2.0 / MCP surface over the plugin and workflow domain
//
// Decision: the tool registry is a derived view, recomputed per request; no
// shared mutable cache to invalidate
// Decision: handlers return domain Results; only the dispatcher knows about
// JSON-RPC error codes

pub mod dispatcher;
pub mod http;
pub mod protocol;
pub mod state;
pub mod sweep;
pub mod tools;

pub use dispatcher::McpDispatcher;
pub use state::McpState;
