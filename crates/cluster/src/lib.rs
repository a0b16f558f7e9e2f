//! # EasyCluster
//!
//! Remote object invocation over authenticated, length-framed TCP
//! connections.
//!
//! ## Overview
//!
//! A client connects to a server sharing the same key. Both sides prove
//! knowledge of the key with a challenge exchange, then trade INIT records
//! and become ready. From then on the client calls functions registered on
//! the server and works with the objects they return through proxies:
//!
//! - **Framing and integrity**: every frame carries a chained HMAC digest
//!   (see the [`protocol`] crate)
//! - **Records**: requests and responses encoded by a pluggable
//!   [`RecordCodec`], MessagePack by default
//! - **Proxies**: handles to server objects, released lazily by
//!   piggybacking garbage ids on the next request
//! - **Logical threads**: ordered per-thread execution on the server
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐            ┌──────────────────────────┐
//! │          Client          │            │          Server          │
//! │  ┌────────┐ ┌─────────┐  │  REQUEST   │  ┌────────┐ ┌─────────┐  │
//! │  │ Proxies│ │  Call   │  │ ─────────► │  │  Root  │ │ Logical │  │
//! │  │        │ │  table  │  │            │  │ object │ │ threads │  │
//! │  └────────┘ └─────────┘  │  RESPONSE  │  └────────┘ └─────────┘  │
//! │  ┌────────────────────┐  │ ◄───────── │  ┌────────────────────┐  │
//! │  │     Connection     │  │            │  │     Connection     │  │
//! │  └────────────────────┘  │            │  └────────────────────┘  │
//! └──────────────────────────┘            └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cluster::{Client, ConnectionConfig, Value};
//! use protocol::SharedKey;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let key = SharedKey::from_hex("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff")?;
//!     let client = Client::connect("127.0.0.1:11998", &key, &ConnectionConfig::default()).await?;
//!     let echoed = client.call("echo", vec![Value::from("hello")], Default::default()).await?;
//!     println!("{:?}", echoed);
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`connection`]: Handshake, framing and the receive pump
//! - [`client`]: Outbound calls and response correlation
//! - [`proxy`]: Remote object handles and proxy types
//! - [`server`]: Request execution, object table and logical threads
//! - [`codec`]: Record encoding and reference substitution
//! - [`logging`]: Tracing subscriber setup

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod exception;
pub mod logging;
pub mod object;
pub mod proxy;
pub mod record;
pub mod server;
pub mod value;

// Re-export protocol for convenience
pub use protocol;

pub use client::{CallOptions, Client, FixedThread, PendingCall, PerOsThread, ThreadIdPolicy};
pub use codec::{CodecKind, JsonCodec, MsgpackCodec, RecordCodec};
pub use config::{Config, ConfigError, ConnectionConfig, ServerConfig};
pub use connection::{Connection, ConnectionState, PeerInfo};
pub use error::{Error, Result};
pub use exception::{ErrorMode, ExceptionReporter, RemoteError, RemoteException, StderrReporter};
pub use object::{LocalObject, RemoteObject};
pub use proxy::{ProxyClassRegistry, ProxyType, RemoteProxy};
pub use record::ThreadTarget;
pub use server::{Definitions, ExportRegistry, Server};
pub use value::{Exported, Exports, Kwargs, TypeDescriptor, Value};
