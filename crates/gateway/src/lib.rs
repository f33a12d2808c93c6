//! MCP request gateway.
//!
//! Every inbound request runs through one [`pipeline::Pipeline`]: resolve claims, classify the
//! JSON-RPC body, authorize it against a Cedar policy set, forward it upstream, filter list
//! responses down to what the caller may use, then emit exactly one audit event and one set of
//! metrics.

pub mod audit;
pub mod authz;
pub mod claims;
pub mod config;
pub mod error;
pub mod mcp;
pub mod oidc;
pub mod pipeline;
pub mod server;
pub mod telemetry;
pub mod upstream;
