//! Asterisk Manager Interface (AMI) client with call tracking and statsd metrics
//!
//! This crate provides an async client for Asterisk's Manager Interface,
//! correlating each submitted action with its response by `ActionID` and
//! routing unsolicited events to per-name handlers. On top of it, a
//! [`CallTracker`] follows call lifecycles and publishes concurrency, count and
//! duration measurements through a [`MetricsEmitter`].
//!
//! # Architecture
//!
//! - [`AmiClient`] (Clone + Send): connect, submit actions from any task
//! - [`AmiClient::run`]: the read loop; dispatches events to handlers and
//!   delivers responses to waiting submitters
//! - [`Supervisor`]: reconnects with a fixed back-off and keeps the session
//!   alive with `Ping`
//!
//! # Examples
//!
//! ## Submitting actions
//!
//! ```rust,no_run
//! use ami_statsd::{AmiAction, AmiClient, AmiError, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let client = AmiClient::new("admin:secret@localhost:5038".parse()?, ClientOptions::default());
//!     client.connect([("Events", "off")]).await?;
//!
//!     let runner = client.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     let response = client
//!         .submit(AmiAction::new("CoreStatus"))
//!         .await?
//!         .into_result()?;
//!     println!("{:?}", response.param("CoreCurrentCalls"));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Tracking calls
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ami_statsd::{
//!     AmiClient, CallRegistry, CallTracker, ClientOptions, MetricsEmitter, StatsdSink,
//!     Supervisor,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = StatsdSink::connect(&"127.0.0.1:8125/pbx.".parse()?).await?;
//!     let tracker = CallTracker::new(
//!         Arc::new(CallRegistry::new()),
//!         Arc::new(MetricsEmitter::new(Arc::new(sink))),
//!     );
//!
//!     let client = AmiClient::new("admin:secret@localhost".parse()?, ClientOptions::default());
//!     tracker.install(&client)?;
//!
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     Supervisor::new(client)
//!         .run(shutdown_rx)
//!         .await;
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod call;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod headers;
pub mod metrics;
pub mod registry;
pub mod supervisor;
pub mod tracker;

pub(crate) mod buffer;
pub mod constants;
pub mod protocol;
pub(crate) mod tls;

pub use action::{AmiAction, AmiResponse, ResponseStatus};
pub use call::{trunk_name, Call, CallSnapshot, Disposition, ParseDispositionError};
pub use config::{AmiTarget, ClientOptions, StatsdTarget, TlsMode, DEFAULT_STATSD_PORT};
pub use connection::{
    AmiClient, AmiEventStream, ConnectionStatus, DisconnectReason, EventHandler, PendingResponse,
};
pub use constants::DEFAULT_AMI_PORT;
pub use error::{AmiError, AmiResult, MetricsError};
pub use event::{
    AmiEvent, AmiEventType, ChannelState, ParseChannelStateError, ParseEventTypeError,
};
pub use headers::{AmiHeader, ParseAmiHeaderError};
pub use metrics::{Measure, MetricsEmitter, MetricsSink, NoopSink, StatsdSink};
pub use protocol::{AmiFrame, AmiParser};
pub use registry::CallRegistry;
pub use supervisor::Supervisor;
pub use tracker::CallTracker;
