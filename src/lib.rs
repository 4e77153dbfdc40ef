//!Public address discovery over UDP, to help with NAT traversal or hole punching.
//!
//!A node behind a NAT or firewall does not know the address and port the rest
//!of the internet sees it from. Ask a publicly reachable rendezvous server:
//!it answers with the source endpoint the request arrived from, the same job
//!a STUN binding request does, but with a confirmed three-way handshake.
//!
//!## How the handshake works
//!The client sends a request carrying a random 16 byte token. The server
//!echoes that token in its response together with a response token of its own
//!and the observed public endpoint, then waits for a confirmation carrying
//!both tokens before it forgets the exchange. The token echoes keep spoofed
//!or stale datagrams out on both sides.
//!
//!The observed port and address bytes travel bit-inverted inside the response,
//!so NAT middleboxes that rewrite literal address patterns in payloads leave
//!them alone. See [`proto`] for the exact packet layout.
//!
//!While a response is unconfirmed, further requests from the same address are
//!rejected for 30 seconds rather than re-answered.
//!
//!## Feature flags
//!For convenience the crate includes both client and server code by default.
//!Mostly you only use one of them, set features to `client` or `server`
//!instead.
//!
//!```toml
//!spade = { version = "0.1", default-features = false, features = ["client"] }
//!```
//!
//!- `client`: discovery client, see [`client::Client`]
//!- `server`: rendezvous server, see [`server::Server`]

mod error;
pub use error::{Error, ProtocolError};

pub mod proto;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub use client::Client;

#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub use server::Server;
