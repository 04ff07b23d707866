//! Контракт транспорта: то, что конечная точка ожидает от движка соединения.
//!
//! Транспорт выполняет реальную работу (ICE, DTLS, SCTP); конечная точка только
//! вызывает его операции и получает асинхронные события через [`EventSink`].

use crate::error::TransportError;
use crate::peer::state::{ChannelState, TransportState};
use crate::peer::types::{Candidate, Role, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// найден локальный кандидат; `None` означает конец сбора
    LocalCandidate(Option<Candidate>),
    ConnectionState(TransportState),
    /// удалённая сторона открыла канал с этой меткой
    IncomingChannel(String),
    ChannelState(ChannelState),
    Message(String),
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), TransportError>;
    async fn add_candidate(&self, candidate: &Candidate) -> Result<(), TransportError>;
    async fn create_channel(&self, label: &str) -> Result<(), TransportError>;
    async fn send(&self, text: &str) -> Result<(), TransportError>;
    async fn close_channel(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Создаёт транспорт для одной конечной точки; события идут в `events`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
