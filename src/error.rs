use crate::peer::state::ChannelState;
use crate::peer::types::Role;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Шаг согласования, на котором произошла ошибка
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateChannel,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    OrderViolation,
    Connectivity,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStage::CreateChannel => "create-channel",
            NegotiationStage::CreateOffer => "create-offer",
            NegotiationStage::CreateAnswer => "create-answer",
            NegotiationStage::SetLocalDescription => "set-local-description",
            NegotiationStage::SetRemoteDescription => "set-remote-description",
            NegotiationStage::OrderViolation => "order-violation",
            NegotiationStage::Connectivity => "connectivity",
        };
        f.write_str(name)
    }
}

/// Фатальная ошибка согласования: конечная точка переходит в `Failed`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Error)]
#[error("{role} endpoint failed at {stage}: {reason}")]
pub struct NegotiationError {
    pub role: Role,
    pub stage: NegotiationStage,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("transport rejected {0}")]
    Rejected(String),
    #[error("no data channel on this transport")]
    NoChannel,
    #[error("transport is closed")]
    Closed,
    #[error("unsupported description type {0}")]
    UnsupportedDescription(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("data channel is not open (state: {state:?})")]
    NotOpen { state: Option<ChannelState> },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Сводная ошибка `connect()`: все упавшие стороны и те, что успели подключиться.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ConnectionError {
    pub failures: Vec<NegotiationError>,
    pub connected: Vec<Role>,
}

impl ConnectionError {
    pub fn failed_roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.failures.iter().map(|f| f.role)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection failed: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        for role in &self.connected {
            write!(f, "; {role} endpoint reached connected")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyConnected,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("negotiation did not finish within {0:?}")]
    NegotiationTimeout(Duration),
    #[error("session was disconnected before negotiation finished")]
    Disconnected,
    #[error("message is empty")]
    EmptyMessage,
    #[error("message is {len} characters long, the limit is {max}")]
    MessageTooLong { len: usize, max: usize },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ice server {0} has an empty url")]
    EmptyServerUrl(String),
    #[error("turn server {0} requires username and credential")]
    MissingTurnCredentials(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("gzip: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
