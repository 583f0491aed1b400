//! shipindex-ship: state-history protocol client.
//!
//! - [`protocol`]: request/result frames
//! - [`transport`]: connection boundary and the websocket implementation
//! - [`window`]: prefetch window accounting
//! - [`client`]: [`StreamClient`], handshake, acknowledgement, reconnect, fork signalling
//! - [`endpoints`]: endpoint probing and chain id validation

pub mod client;
pub mod endpoints;
pub mod protocol;
pub mod transport;
pub mod window;

pub use client::{StreamClient, StreamEvent, StreamOptions, StreamRange, StreamSummary};
pub use endpoints::{healthy_endpoints, probe_endpoint, validate_endpoints};
pub use protocol::{BlocksResult, GetBlocksRequest, ShipRequest, ShipResult, StatusResult};
pub use transport::{Frame, ShipConnection, ShipTransport, WsTransport};
pub use window::PrefetchWindow;
