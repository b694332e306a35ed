//! # medrepo-subscriptions
//!
//! Subscription registry and session-based notification dispatch.
//!
//! - [`SubscriptionDispatcher`]: consumes committed change events, matches
//!   them against active subscriptions and delivers notification bundles to
//!   attached sessions
//! - [`SessionTransport`]: the outbound channel of a session (the server's
//!   WebSocket writer implements it through [`ChannelTransport`])
//! - [`DeliveryQueue`]: per-session FIFO hand-off between the event loop and
//!   the session workers
//! - [`RepositoryStatusWriter`]: records a failing subscription's `error`
//!   status through the resource repository
//!
//! ## Example
//!
//! ```ignore
//! let dispatcher = SubscriptionDispatcher::new(DispatcherConfig::default());
//! let publisher = EventPublisher::new().with_sink(dispatcher.sink());
//! let repository = Arc::new(ResourceRepository::new(engine, directory, board).with_publisher(publisher));
//! dispatcher.set_status_writer(Arc::new(RepositoryStatusWriter::new(repository.clone())));
//! dispatcher.load_active(&repository).await?;
//! tokio::spawn({ let d = dispatcher.clone(); async move { d.run().await } });
//! ```

pub mod bundle;
pub mod config;
mod dispatcher;
pub mod error;
pub mod queue;
mod registry;
pub mod session;
pub mod status;
pub mod token;
pub mod transport;
pub mod types;

pub use config::DispatcherConfig;
pub use dispatcher::{Attached, SubscriptionDispatcher};
pub use error::{DispatchError, DispatchResult};
pub use queue::{DeliveryQueue, InProcessQueue};
pub use registry::SubscriptionRegistry;
pub use session::{CloseReason, SessionInfo};
pub use status::{RepositoryStatusWriter, SubscriptionStatusWriter};
pub use token::BindingToken;
pub use transport::{ChannelTransport, SessionTransport};
pub use types::{
    ActiveSubscription, Delivery, InboundMessage, OutboundMessage, SUPPORTED_INTERACTION_EXTENSION,
    SubscriptionStatus, WEBSOCKET_CHANNEL,
};
