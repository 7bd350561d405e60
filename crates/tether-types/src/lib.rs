pub mod connection;
pub mod message;
pub mod session;
pub mod settings;
pub mod sync;
pub mod system;

pub use connection::ConnectionState;
pub use message::{SdkMessage, SdkMessageKind};
pub use session::{Session, SessionPatch, SessionStatus};
pub use settings::{Settings, SettingsPatch};
pub use sync::{Delta, Entity, GlobalSnapshot, MessageBatch, MessagesSnapshot, Snapshot};
pub use system::{AuthStatus, HealthStatus, SystemStatus};
