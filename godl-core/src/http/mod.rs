//! HTTP(S) protocol handler — the centerpiece component (spec §4.7, §4.8).
//!
//! Composed from small collaborators rather than one monolithic struct, per
//! the `ProtocolHandler` redesign flag (spec §9): [`probe`] resolves what the
//! server will give us, [`planner`] turns that into a chunk plan, [`chunked`]
//! and [`single_stream`] are the two transfer strategies, and [`handler`]
//! wires probe → resume decision → plan → transfer → finalize.

pub mod chunked;
pub mod handler;
pub mod planner;
pub mod probe;
pub mod single_stream;

pub use handler::HttpHandler;
