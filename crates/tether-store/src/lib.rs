pub mod delta;
pub mod error;
pub mod global;
pub mod merge;
pub mod session;

pub use delta::{apply_delta, DeltaStats};
pub use error::StoreError;
pub use global::GlobalStore;
pub use merge::{merge_records, Record};
pub use session::SessionStore;
