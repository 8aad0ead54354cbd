//! `pos-link` is the reliable client channel of a restaurant POS frontend.
//!
//! It provides two independent components:
//! - [`ApiClient`]: JSON HTTP calls with bounded retry and exponential backoff
//!   ([`ApiClient::request`]), plus typed helpers for orders, menus and sales.
//! - [`EventChannel`]: a WebSocket push channel that reconnects with capped
//!   backoff, queues outbound messages while disconnected, and dispatches
//!   inbound messages to subscribers by category.

mod api;
mod channel;
mod client;
mod error;
mod options;
mod request;
pub mod types;

pub use channel::{
    categories, ChannelState, Connection, Connector, EventChannel, InboundMessage, OrderEvent,
    SubscriptionId, WsConnector,
};
pub use client::ApiClient;
pub use error::{ChannelError, ClientError};
pub use options::{ChannelConfig, ClientOptions, ReconnectPolicy, RetryPolicy};
pub use request::Request;

pub type Result<T> = std::result::Result<T, ClientError>;
