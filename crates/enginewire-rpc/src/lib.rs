//! Blocking RPC between a host and its rendering engine.
//!
//! Two directions run over two connections: the host calls into the engine
//! ([`EngineClient`] against an engine's [`RpcServer`]), and the engine
//! notifies the host ([`HostNotifier`] against a host's [`RpcServer`]).
//! Every connection opens with a role-checked handshake.

pub mod client;
pub mod connector;
pub mod controls;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod server;

pub use client::{ConnectionState, EngineClient, HostNotifier, RpcClient};
pub use connector::{admit, admit_stream, dial, Established, RpcConfig};
pub use controls::{
    dispatch_call, dispatch_notification, EngineControls, HandlerError, HandlerResult,
    HostEvents, NoHostEvents,
};
pub use envelope::{CallIds, Envelope};
pub use error::{Result, RpcError};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, HandshakeOutcome, HandshakeRequest,
    HandshakeResponse, Role,
};
pub use server::{Handler, RpcServer};
