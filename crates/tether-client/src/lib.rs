pub mod error;
pub mod handle;
mod handlers;
pub mod manager;
pub mod refresh;
pub mod state_channel;
pub mod transport;
pub mod visibility;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ChannelError, ConnectionError, RpcError, SubscriptionError, TransportError};
pub use handle::ChannelHandle;
pub use handlers::HandlerRegistration;
pub use manager::ConnectionManager;
pub use refresh::{Refresh, RefresherId};
pub use state_channel::{DeltaHandler, SnapshotHandler, StateChannel, StateChannelOptions};
pub use transport::{Hub, HubFactory, PushHandler, Subscription, Transport, TransportEvent};
pub use visibility::{HostEnvironment, HostEvent, HostEventKind, HostListener, ListenerId};
