//! sockpool - pooled HTTP/1.1 client transport
//!
//! Dispatches outgoing HTTP requests over pooled TCP (optionally
//! TLS-wrapped) connections to origin servers, optionally through an HTTP
//! proxy. The heart of the crate is the per-endpoint connection pool:
//! many concurrent requests multiplex over a bounded number of
//! connections, with idle reuse, FIFO waiters under the cap,
//! lifetime/idle-timeout eviction, stale-connection retry, and a
//! background reaper.
//!
//! # Architecture
//!
//! ```text
//!  +---------+      +--------------+      +------------------+
//!  | client/ | ---> | pool/manager | ---> | pool (per key)   |
//!  +---------+      +--------------+      +---------+--------+
//!                                                   |
//!                             +---------------------+---------+
//!                             |                               |
//!                      +------v------+                 +------v------+
//!                      |  connect/   |                 |    conn/    |
//!                      | dial+tunnel |                 | framing+IO  |
//!                      |   +TLS      |                 +-------------+
//!                      +-------------+
//! ```
//!
//! A request is classified into an endpoint key, routed to that key's
//! pool, and either reuses an idle connection, dials a fresh one, or
//! waits its turn. The response body streams off the connection and the
//! connection returns to the pool once the body is fully read.

mod auth;
pub mod client;
pub mod common;
pub mod config;
pub mod conn;
mod connect;
pub mod pool;

pub use client::{Client, RequestHandler};
pub use common::error::{Error, Result};
pub use config::{ConnectCallback, ConnectFuture, Credentials, FixedProxy, Options, ProxyResolver};
pub use conn::{AsyncStream, Body, ConnStream, Request, Response};
pub use pool::{PoolKey, PoolKind, PoolManager, PoolSnapshot};
