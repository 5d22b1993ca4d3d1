//! TEE3 transport to the ePA backend
//!
//! Layers, bottom up:
//! - [`protocol`]: handshake messages, key schedule and the encrypted frame
//! - [`handshake`] and [`session`]: the M1..M4 exchange and the keys it yields
//! - [`http`]: inner HTTP/1.1 requests carried inside frames
//! - [`transport`]: outer HTTPS connection pinned to one endpoint
//! - [`channel`]: a connected, authorized [`SecureChannel`]
//! - [`endpoints`], [`pool`] and [`registry`]: endpoint backoff, channel
//!   pools per host and their DNS refresh
//!
//! [`responder`] implements the server side of the protocol in process. The
//! `check-connection --self-test` command and the tests run channels against
//! it.

pub mod channel;
pub mod endpoints;
pub mod handshake;
pub mod http;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod session;
pub mod transport;

pub use crate::domain::Tee3Error;
pub use channel::{ChannelSettings, ChannelState, SecureChannel};
pub use endpoints::{DnsResolver, EndpointData, EndpointSet, FixedResolver, RefreshDiff, Resolver};
pub use http::{InnerRequest, InnerResponse};
pub use pool::{ChannelLease, ConnectionPool, PoolStatus};
pub use registry::{PoolRegistry, RegistrySettings};
pub use responder::{LoopbackTransportFactory, Responder, StaticSigner};
pub use transport::{OuterTransport, ReqwestTransportFactory, TransportFactory};
