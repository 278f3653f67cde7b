//! Network communication layer.
//!
//! Control, peer and client traffic all share one framing ([`rpc`]) and one
//! server loop ([`server`]). [`client::RpcClient`] is the single outbound
//! path and owns the retry policy.

pub mod client;
pub mod rpc;
pub mod server;
pub mod text;

pub use client::RpcClient;
pub use rpc::{
    ClientRequest, ClientResponse, ControlRequest, ControlResponse, Message, MoveDataRequest,
    PeerRequest, PeerResponse, MAX_MESSAGE_SIZE,
};
pub use server::{MessageHandler, NetworkServer};
