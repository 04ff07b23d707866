use crate::error::{ChannelError, TransportError};
use crate::peer::state::ChannelState;
use crate::peer::transport::Transport;
use crate::peer::types::Role;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Что меняется для пользователя при смене состояния канала
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// канал открыт: можно отправлять (и принимать)
    Enabled,
    /// канал покинул Open
    Disabled,
}

/// Владелец data-channel одной конечной точки. Отправка проверяется здесь,
/// а не только отключённой кнопкой в UI.
pub struct ChannelController {
    role: Role,
    label: String,
    state: Option<ChannelState>,
    /// канал уже создан здесь или объявлен пиром
    announced: bool,
    transport: Arc<dyn Transport>,
    last_received: Option<String>,
    received: u64,
}

impl ChannelController {
    pub fn new(role: Role, label: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            role,
            label: label.into(),
            state: None,
            announced: false,
            transport,
            last_received: None,
            received: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// `None`, пока канала нет
    pub fn state(&self) -> Option<ChannelState> {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == Some(ChannelState::Open)
    }

    pub fn last_received(&self) -> Option<&str> {
        self.last_received.as_deref()
    }

    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Создаёт канал на стороне инициатора
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.state.is_some() {
            return Ok(());
        }
        self.transport.create_channel(&self.label).await?;
        self.announced = true;
        self.state = Some(ChannelState::Connecting);
        debug!(role = %self.role, label = %self.label, "data channel created");
        Ok(())
    }

    /// Канал, открытый удалённой стороной.
    ///
    /// Состояние, уже пришедшее от транспорта, не откатывается.
    pub fn on_incoming(&mut self, label: String) {
        if self.announced {
            warn!(role = %self.role, %label, "second incoming data channel ignored");
            return;
        }
        debug!(role = %self.role, %label, state = ?self.state, "incoming data channel");
        self.announced = true;
        self.label = label;
        if self.state.is_none() {
            self.state = Some(ChannelState::Connecting);
        }
    }

    pub fn on_state_changed(&mut self, next: ChannelState) -> Option<Readiness> {
        let current = match self.state {
            Some(current) => current,
            // событие open пришло раньше, чем канал был объявлен
            None if matches!(next, ChannelState::Connecting | ChannelState::Open) => {
                self.state = Some(ChannelState::Connecting);
                ChannelState::Connecting
            }
            None => return None,
        };
        if current == next || !current.can_advance_to(next) {
            debug!(role = %self.role, ?current, ?next, "channel transition ignored");
            return None;
        }

        self.state = Some(next);
        info!(role = %self.role, label = %self.label, state = ?next, "data channel state");
        match (current == ChannelState::Open, next == ChannelState::Open) {
            (false, true) => Some(Readiness::Enabled),
            (true, false) => Some(Readiness::Disabled),
            _ => None,
        }
    }

    /// Отправка без подтверждения доставки.
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen { state: self.state });
        }
        self.transport.send(text).await?;
        debug!(role = %self.role, len = text.len(), "message handed to transport");
        Ok(())
    }

    /// Последнее сообщение замещает предыдущее. false, если канал уже закрыт.
    pub fn on_message_received(&mut self, payload: String) -> bool {
        match self.state {
            None | Some(ChannelState::Closed) => {
                debug!(role = %self.role, "message on a closed channel dropped");
                false
            }
            Some(_) => {
                debug!(role = %self.role, len = payload.len(), "message received");
                self.last_received = Some(payload);
                self.received += 1;
                true
            }
        }
    }

    /// Connecting/Open → Closing; Closed придёт от транспорта. Повторный вызов ничего не делает.
    pub async fn close(&mut self) -> Result<Option<Readiness>, TransportError> {
        let was_open = match self.state {
            Some(ChannelState::Connecting) => false,
            Some(ChannelState::Open) => true,
            _ => return Ok(None),
        };
        self.state = Some(ChannelState::Closing);
        info!(role = %self.role, label = %self.label, "closing data channel");
        self.transport.close_channel().await?;
        Ok(was_open.then_some(Readiness::Disabled))
    }

    /// Транспорт закрыт целиком: подтверждения уже не будет.
    pub fn mark_closed(&mut self) {
        if self.state.is_some() {
            self.state = Some(ChannelState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{Call, MockTransport};

    fn controller(mock: &Arc<MockTransport>) -> ChannelController {
        let transport: Arc<dyn Transport> = mock.clone();
        ChannelController::new(Role::Local, "sendChannel", transport)
    }

    #[tokio::test]
    async fn send_before_open_never_reaches_transport() {
        let mock = Arc::new(MockTransport::default());
        let mut dc = controller(&mock);

        let err = dc.send("early").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotOpen { state: None }));

        dc.open().await.unwrap();
        let err = dc.send("still early").await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::NotOpen { state: Some(ChannelState::Connecting) }
        ));
        assert_eq!(mock.calls(), vec![Call::CreateChannel("sendChannel".into())]);
    }

    #[tokio::test]
    async fn open_enables_and_send_goes_through() {
        let mock = Arc::new(MockTransport::default());
        let mut dc = controller(&mock);
        dc.open().await.unwrap();

        assert_eq!(dc.on_state_changed(ChannelState::Open), Some(Readiness::Enabled));
        dc.send("hello").await.unwrap();

        assert!(mock.calls().contains(&Call::Send("hello".into())));
    }

    #[tokio::test]
    async fn closed_channel_does_not_reopen() {
        let mock = Arc::new(MockTransport::default());
        let mut dc = controller(&mock);
        dc.open().await.unwrap();
        dc.on_state_changed(ChannelState::Open);

        assert_eq!(dc.on_state_changed(ChannelState::Closed), Some(Readiness::Disabled));
        assert_eq!(dc.on_state_changed(ChannelState::Open), None);
        assert_eq!(dc.state(), Some(ChannelState::Closed));
        assert!(dc.send("late").await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mock = Arc::new(MockTransport::default());
        let mut dc = controller(&mock);
        dc.open().await.unwrap();
        dc.on_state_changed(ChannelState::Open);

        assert_eq!(dc.close().await.unwrap(), Some(Readiness::Disabled));
        assert_eq!(dc.state(), Some(ChannelState::Closing));
        dc.on_state_changed(ChannelState::Closed);
        assert_eq!(dc.close().await.unwrap(), None);

        let closes = mock.calls().into_iter().filter(|c| *c == Call::CloseChannel).count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn latest_message_wins() {
        let mock = Arc::new(MockTransport::default());
        let transport: Arc<dyn Transport> = mock.clone();
        let mut dc = ChannelController::new(Role::Remote, "", transport);
        dc.on_incoming("sendChannel".into());
        dc.on_state_changed(ChannelState::Open);

        assert!(dc.on_message_received("first".into()));
        assert!(dc.on_message_received("second".into()));

        assert_eq!(dc.last_received(), Some("second"));
        assert_eq!(dc.received_count(), 2);
        assert_eq!(dc.label(), "sendChannel");
    }

    #[tokio::test]
    async fn open_event_before_announcement_keeps_label_and_state() {
        let mock = Arc::new(MockTransport::default());
        let transport: Arc<dyn Transport> = mock.clone();
        let mut dc = ChannelController::new(Role::Remote, "", transport);

        assert_eq!(dc.on_state_changed(ChannelState::Open), Some(Readiness::Enabled));
        dc.on_incoming("sendChannel".into());

        assert_eq!(dc.label(), "sendChannel");
        assert_eq!(dc.state(), Some(ChannelState::Open));

        dc.on_incoming("extra".into());
        assert_eq!(dc.label(), "sendChannel");
    }
}
