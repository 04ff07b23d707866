pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{IceConfig, SessionConfig};
pub use error::{ChannelError, ConnectionError, NegotiationError, NegotiationStage, SessionError};
pub use session::{Session, SessionEvent, SessionSummary};
