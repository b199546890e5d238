pub mod error;
pub mod loader;
pub mod raw;

pub use error::ConfigError;
pub use loader::{load, Config};

use std::time::Duration;

/// How long a Processing upload intent may idle before the reaper assumes
/// its commit died and hands it back to Pending. A server constant, kept
/// well past any realistic in-flight upload.
pub const INPROGRESS_IDLE: Duration = Duration::from_secs(6 * 3600);
