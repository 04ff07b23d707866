pub mod connection;
pub mod data_channel;
pub mod endpoint;
pub mod ice;
pub mod loopback;
#[cfg(test)]
mod mock;
pub mod negotiation;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::WebRtcFactory;
pub use endpoint::{EndpointHandle, EndpointSnapshot};
pub use loopback::{Fault, LoopbackNetwork, Step};
pub use state::{ChannelState, ConnectionState, TransportState};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use types::{Candidate, Role, SdpKind, ServerConfig, SessionDescription};
