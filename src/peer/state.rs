use serde::Serialize;

/// Состояние соединения конечной точки.
///
/// Переходы только вперёд; `Closed` и `Failed` терминальны.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    OfferCreated,
    DescriptionsExchanged,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::OfferCreated => 1,
            ConnectionState::DescriptionsExchanged => 2,
            ConnectionState::Connecting => 3,
            ConnectionState::Connected => 4,
            ConnectionState::Closed | ConnectionState::Failed => 5,
        }
    }

    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Состояние data-channel: Connecting → Open → Closing → Closed, без повторного открытия.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn rank(self) -> u8 {
        match self {
            ChannelState::Connecting => 0,
            ChannelState::Open => 1,
            ChannelState::Closing => 2,
            ChannelState::Closed => 3,
        }
    }

    pub fn can_advance_to(self, next: ChannelState) -> bool {
        next.rank() > self.rank()
    }
}

/// Состояние соединения, как его сообщает транспорт.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}
