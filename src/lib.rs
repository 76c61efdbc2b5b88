//! Client for Tydom home-automation gateways.
//!
//! The gateway tunnels HTTP/1.1 requests, responses and device pushes over a
//! single websocket, reached either through the remote relay or directly on
//! the local network, and authenticated with a digest challenge.
//!
//! ```no_run
//! # async fn demo() -> Result<(), tydom::ClientError> {
//! let client = tydom::Client::new(tydom::ClientConfig::new("001A25123456", "password"))?;
//! client.connect().await?;
//! let info = client.get("/info").await?;
//! println!("{info}");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod aggregator;
pub mod auth;
pub mod backoff;
mod client;
pub mod config;
mod correlator;
pub mod error;
mod tls;

pub use client::{Client, ClientEvent, ConnectionState};
pub use config::ClientConfig;
pub use error::{AuthError, ClientError, ConfigError};
pub use frames::{DecodeError, Headers, HttpMessage, MessageKind, Method, ProtocolMessage, Transport};
