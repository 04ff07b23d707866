//! Координатор сессии: создаёт обе конечные точки, связывает их реле
//! сигналов и отвечает за connect / disconnect / send.

use crate::config::SessionConfig;
use crate::error::{ChannelError, ConnectionError, NegotiationError, SessionError, TransportError};
use crate::peer::endpoint::{self, EndpointHandle, EndpointSnapshot};
use crate::peer::state::{ChannelState, ConnectionState};
use crate::peer::transport::TransportFactory;
use crate::peer::types::Role;
use crate::signaling::in_process_pair;
use crate::utils::random_id;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// канал стороны открылся (`true`) или покинул Open (`false`)
    ChannelReadiness { role: Role, ready: bool },
    MessageReceived { role: Role, text: String },
    EndpointFailed(NegotiationError),
    Connected,
    Disconnected,
}

/// Что доступно пользователю прямо сейчас
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub connect_button_enabled: bool,
    pub disconnect_button_enabled: bool,
    pub message_input_enabled: bool,
    pub send_button_enabled: bool,
    pub last_received_message: String,
    pub last_error: Option<String>,
}

impl SessionSummary {
    /// Чистая функция от состояния конечных точек.
    pub fn derive(
        local: Option<&EndpointSnapshot>,
        remote: Option<&EndpointSnapshot>,
        starting: bool,
        last_error: Option<&str>,
    ) -> Self {
        let finished = |s: &EndpointSnapshot| s.connection.is_terminal();
        let (negotiating, open) = match (local, remote) {
            (Some(l), Some(r)) if finished(l) || finished(r) => (false, false),
            (Some(l), Some(_)) if channel_gone(l) => (false, false),
            (Some(l), Some(_)) => (true, l.channel == Some(ChannelState::Open)),
            _ => (starting, false),
        };

        Self {
            connect_button_enabled: !negotiating,
            disconnect_button_enabled: negotiating,
            message_input_enabled: open,
            send_button_enabled: open,
            last_received_message: remote
                .and_then(|r| r.last_received.clone())
                .unwrap_or_default(),
            last_error: last_error.map(str::to_owned),
        }
    }
}

/// Канал Local закрыт и повторно не откроется.
fn channel_gone(local: &EndpointSnapshot) -> bool {
    matches!(local.channel, Some(ChannelState::Closing | ChannelState::Closed))
}

struct EndpointPair {
    generation: u64,
    local: EndpointHandle,
    remote: EndpointHandle,
    supervisor: Option<JoinHandle<()>>,
}

impl EndpointPair {
    /// Idle внутри запущенной пары означает «ещё не начала», а не «свободна».
    /// Пара, где одна сторона уже завершилась или канал Local закрыт,
    /// не считается активной.
    fn is_active(&self) -> bool {
        let local = self.local.snapshot();
        let remote = self.remote.snapshot();
        !channel_gone(&local)
            && !local.connection.is_terminal()
            && !remote.connection.is_terminal()
    }

    async fn shutdown(self, grace: Duration) {
        if let Some(supervisor) = self.supervisor {
            supervisor.abort();
        }
        tokio::join!(self.local.shutdown(grace), self.remote.shutdown(grace));
    }
}

enum Slot {
    Vacant,
    /// конечные точки создаются, `connect` ещё не вернулся
    Starting(u64),
    Running(EndpointPair),
}

struct Inner {
    generation: u64,
    slot: Slot,
    last_error: Option<String>,
}

enum Outcome {
    Ready,
    Failed(ConnectionError),
    TimedOut(Duration),
    /// сессию разобрали, пока шло согласование
    Gone,
}

pub struct Session {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            factory,
            inner: Arc::new(Mutex::new(Inner {
                generation: 0,
                slot: Slot::Vacant,
                last_error: None,
            })),
            events,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Создаёт обе стороны и ждёт, пока обе подключатся и откроют канал.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (generation, stale) = {
            let mut inner = self.inner.lock();
            match &inner.slot {
                Slot::Starting(_) => return Err(SessionError::AlreadyConnected),
                Slot::Running(pair) if pair.is_active() => {
                    return Err(SessionError::AlreadyConnected)
                }
                _ => {}
            }
            inner.generation += 1;
            inner.last_error = None;
            let generation = inner.generation;
            (generation, std::mem::replace(&mut inner.slot, Slot::Starting(generation)))
        };
        if let Slot::Running(pair) = stale {
            debug!("dropping endpoints left from a finished session");
            pair.shutdown(self.config.close_grace).await;
        }

        let session_id = random_id();
        info!(session = %session_id, generation, "connecting endpoints");
        let pair = match self.start_endpoints(generation, &session_id).await {
            Ok(pair) => pair,
            Err(err) => {
                let mut inner = self.inner.lock();
                if matches!(inner.slot, Slot::Starting(g) if g == generation) {
                    inner.slot = Slot::Vacant;
                    inner.last_error = Some(err.to_string());
                }
                return Err(err.into());
            }
        };
        let local_rx = pair.local.watch();
        let remote_rx = pair.remote.watch();

        let orphan = {
            let mut inner = self.inner.lock();
            if matches!(inner.slot, Slot::Starting(g) if g == generation) {
                pair.local.control().begin();
                inner.slot = Slot::Running(pair);
                None
            } else {
                Some(pair)
            }
        };
        if let Some(pair) = orphan {
            pair.shutdown(self.config.close_grace).await;
            return Err(SessionError::Disconnected);
        }

        let waiting = wait_ready(local_rx.clone(), remote_rx.clone());
        let outcome = match self.config.negotiation_timeout {
            Some(limit) => tokio::time::timeout(limit, waiting)
                .await
                .unwrap_or(Outcome::TimedOut(limit)),
            None => waiting.await,
        };

        match outcome {
            Outcome::Ready => {
                self.supervise(generation, local_rx, remote_rx);
                info!(session = %session_id, "session connected");
                let _ = self.events.send(SessionEvent::Connected);
                Ok(())
            }
            Outcome::Failed(err) => {
                warn!(session = %session_id, error = %err, "negotiation failed");
                self.abort(generation, err.to_string()).await;
                Err(SessionError::Connection(err))
            }
            Outcome::TimedOut(limit) => {
                let err = SessionError::NegotiationTimeout(limit);
                warn!(session = %session_id, ?limit, "negotiation timed out");
                self.abort(generation, err.to_string()).await;
                Err(err)
            }
            Outcome::Gone => {
                debug!(session = %session_id, "session torn down during negotiation");
                Err(SessionError::Disconnected)
            }
        }
    }

    /// Закрывает каналы и транспорты. Повторный вызов ничего не делает.
    pub async fn disconnect(&self) {
        let slot = {
            let mut inner = self.inner.lock();
            inner.last_error = None;
            std::mem::replace(&mut inner.slot, Slot::Vacant)
        };
        match slot {
            Slot::Running(pair) => {
                info!(generation = pair.generation, "disconnecting");
                pair.shutdown(self.config.close_grace).await;
                let _ = self.events.send(SessionEvent::Disconnected);
            }
            Slot::Starting(generation) => {
                debug!(generation, "disconnect while endpoints were being created");
            }
            Slot::Vacant => debug!("disconnect on an idle session"),
        }
    }

    /// Отправка от Local к Remote.
    pub async fn send_message(&self, text: &str) -> Result<(), SessionError> {
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let len = text.chars().count();
        if len > self.config.max_message_len {
            return Err(SessionError::MessageTooLong {
                len,
                max: self.config.max_message_len,
            });
        }

        let local = {
            let inner = self.inner.lock();
            match &inner.slot {
                Slot::Running(pair) => Some(pair.local.control()),
                _ => None,
            }
        };
        let Some(local) = local else {
            return Err(ChannelError::NotOpen { state: None }.into());
        };
        local.send(text.to_string()).await?;
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock();
        let last_error = inner.last_error.as_deref();
        match &inner.slot {
            Slot::Running(pair) => {
                let local = pair.local.snapshot();
                let remote = pair.remote.snapshot();
                SessionSummary::derive(Some(&local), Some(&remote), false, last_error)
            }
            Slot::Starting(_) => SessionSummary::derive(None, None, true, last_error),
            Slot::Vacant => SessionSummary::derive(None, None, false, last_error),
        }
    }

    pub fn last_received_message(&self) -> String {
        self.summary().last_received_message
    }

    pub fn endpoint_snapshot(&self, role: Role) -> Option<EndpointSnapshot> {
        let inner = self.inner.lock();
        match &inner.slot {
            Slot::Running(pair) => Some(match role {
                Role::Local => pair.local.snapshot(),
                Role::Remote => pair.remote.snapshot(),
            }),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        match &self.inner.lock().slot {
            Slot::Vacant => false,
            Slot::Starting(_) => true,
            Slot::Running(pair) => pair.is_active(),
        }
    }

    async fn start_endpoints(
        &self,
        generation: u64,
        session_id: &str,
    ) -> Result<EndpointPair, TransportError> {
        let (local_sink, local_events) = mpsc::unbounded_channel();
        let local_transport = self.factory.create(Role::Local, local_sink).await?;

        let (remote_sink, remote_events) = mpsc::unbounded_channel();
        let remote_transport = match self.factory.create(Role::Remote, remote_sink).await {
            Ok(transport) => transport,
            Err(err) => {
                if let Err(close_err) = local_transport.close().await {
                    debug!(error = %close_err, "closing local transport after failed start");
                }
                return Err(err);
            }
        };

        let (local_port, remote_port) = in_process_pair(session_id);
        let label = &self.config.channel_label;
        Ok(EndpointPair {
            generation,
            local: endpoint::spawn(
                Role::Local,
                local_transport,
                local_events,
                local_port,
                label,
                self.events.clone(),
            ),
            remote: endpoint::spawn(
                Role::Remote,
                remote_transport,
                remote_events,
                remote_port,
                label,
                self.events.clone(),
            ),
            supervisor: None,
        })
    }

    /// Снимает пару после фатальной ошибки и запоминает её текст.
    async fn abort(&self, generation: u64, message: String) {
        let slot = {
            let mut inner = self.inner.lock();
            if !matches!(&inner.slot, Slot::Running(p) if p.generation == generation) {
                return;
            }
            inner.last_error = Some(message);
            std::mem::replace(&mut inner.slot, Slot::Vacant)
        };
        if let Slot::Running(pair) = slot {
            pair.shutdown(self.config.close_grace).await;
        }
    }

    /// После connect: если одна из сторон упала или закрылась, закрыть обе.
    fn supervise(
        &self,
        generation: u64,
        mut local_rx: watch::Receiver<EndpointSnapshot>,
        mut remote_rx: watch::Receiver<EndpointSnapshot>,
    ) {
        let (local, remote) = {
            let inner = self.inner.lock();
            match &inner.slot {
                Slot::Running(pair) if pair.generation == generation => {
                    (pair.local.control(), pair.remote.control())
                }
                _ => return,
            }
        };
        let inner = self.inner.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            loop {
                let finished = {
                    let l = local_rx.borrow_and_update();
                    let r = remote_rx.borrow_and_update();
                    let done = l.connection.is_terminal() || r.connection.is_terminal();
                    done.then(|| l.failure.clone().or_else(|| r.failure.clone()))
                };
                if let Some(failure) = finished {
                    warn!(generation, ?failure, "endpoint finished, closing the session");
                    if let Some(err) = failure {
                        let mut inner = inner.lock();
                        if matches!(&inner.slot, Slot::Running(p) if p.generation == generation) {
                            inner.last_error = Some(err.to_string());
                        }
                    }
                    local.request_close();
                    remote.request_close();
                    let _ = events.send(SessionEvent::Disconnected);
                    return;
                }
                tokio::select! {
                    changed = local_rx.changed() => if changed.is_err() { return },
                    changed = remote_rx.changed() => if changed.is_err() { return },
                }
            }
        });

        let mut guard = self.inner.lock();
        match &mut guard.slot {
            Slot::Running(pair) if pair.generation == generation => pair.supervisor = Some(task),
            _ => task.abort(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Slot::Running(pair) = &mut inner.slot {
            debug!(generation = pair.generation, "session dropped, closing endpoints");
            if let Some(supervisor) = pair.supervisor.take() {
                supervisor.abort();
            }
            pair.local.control().request_close();
            pair.remote.control().request_close();
        }
    }
}

async fn wait_ready(
    mut local: watch::Receiver<EndpointSnapshot>,
    mut remote: watch::Receiver<EndpointSnapshot>,
) -> Outcome {
    loop {
        {
            let l = local.borrow_and_update();
            let r = remote.borrow_and_update();
            if l.failure.is_some() || r.failure.is_some() {
                return Outcome::Failed(connection_error(&[&l, &r]));
            }
            if l.is_ready() && r.is_ready() {
                return Outcome::Ready;
            }
            if l.connection.is_terminal() || r.connection.is_terminal() {
                return Outcome::Gone;
            }
        }
        tokio::select! {
            changed = local.changed() => if changed.is_err() { return Outcome::Gone },
            changed = remote.changed() => if changed.is_err() { return Outcome::Gone },
        }
    }
}

fn connection_error(snapshots: &[&EndpointSnapshot]) -> ConnectionError {
    ConnectionError {
        failures: snapshots.iter().filter_map(|s| s.failure.clone()).collect(),
        connected: snapshots
            .iter()
            .filter(|s| s.connection == ConnectionState::Connected)
            .map(|s| s.role)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NegotiationStage;
    use crate::peer::ice::CandidateStats;

    fn snapshot(
        role: Role,
        connection: ConnectionState,
        channel: Option<ChannelState>,
    ) -> EndpointSnapshot {
        EndpointSnapshot {
            role,
            connection,
            channel,
            last_received: None,
            received_count: 0,
            failure: None,
            candidates: CandidateStats::default(),
        }
    }

    #[test]
    fn idle_session_only_allows_connect() {
        let s = SessionSummary::derive(None, None, false, None);
        assert!(s.connect_button_enabled);
        assert!(!s.disconnect_button_enabled);
        assert!(!s.message_input_enabled);
        assert!(!s.send_button_enabled);
        assert_eq!(s.last_received_message, "");
    }

    #[test]
    fn negotiating_session_only_allows_disconnect() {
        let local = snapshot(
            Role::Local,
            ConnectionState::OfferCreated,
            Some(ChannelState::Connecting),
        );
        let remote = snapshot(Role::Remote, ConnectionState::Idle, None);

        let s = SessionSummary::derive(Some(&local), Some(&remote), false, None);

        assert!(!s.connect_button_enabled);
        assert!(s.disconnect_button_enabled);
        assert!(!s.send_button_enabled);
        assert_eq!(SessionSummary::derive(None, None, true, None), s);
    }

    #[test]
    fn open_channel_enables_input_and_send() {
        let local = snapshot(Role::Local, ConnectionState::Connected, Some(ChannelState::Open));
        let mut remote =
            snapshot(Role::Remote, ConnectionState::Connected, Some(ChannelState::Open));
        remote.last_received = Some("hello".into());

        let s = SessionSummary::derive(Some(&local), Some(&remote), false, None);

        assert!(!s.connect_button_enabled);
        assert!(s.disconnect_button_enabled);
        assert!(s.message_input_enabled);
        assert!(s.send_button_enabled);
        assert_eq!(s.last_received_message, "hello");
    }

    #[test]
    fn failed_side_returns_to_pre_connect_state_with_error() {
        let mut local =
            snapshot(Role::Local, ConnectionState::Failed, Some(ChannelState::Connecting));
        local.failure = Some(NegotiationError {
            role: Role::Local,
            stage: NegotiationStage::CreateOffer,
            reason: "boom".into(),
        });
        let remote = snapshot(Role::Remote, ConnectionState::Idle, None);

        let s = SessionSummary::derive(Some(&local), Some(&remote), false, Some("boom"));

        assert!(s.connect_button_enabled);
        assert!(!s.disconnect_button_enabled);
        assert_eq!(s.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn closed_channel_on_connected_pair_allows_reconnect() {
        for channel in [ChannelState::Closing, ChannelState::Closed] {
            let local = snapshot(Role::Local, ConnectionState::Connected, Some(channel));
            let mut remote =
                snapshot(Role::Remote, ConnectionState::Connected, Some(ChannelState::Closed));
            remote.last_received = Some("bye".into());

            let s = SessionSummary::derive(Some(&local), Some(&remote), false, None);

            assert!(s.connect_button_enabled, "{channel:?}");
            assert!(!s.disconnect_button_enabled, "{channel:?}");
            assert!(!s.message_input_enabled);
            assert!(!s.send_button_enabled);
            assert_eq!(s.last_received_message, "bye");
        }
    }

    #[test]
    fn connection_error_lists_failures_and_connected_sides() {
        let mut local = snapshot(Role::Local, ConnectionState::Failed, None);
        local.failure = Some(NegotiationError {
            role: Role::Local,
            stage: NegotiationStage::SetRemoteDescription,
            reason: "bad sdp".into(),
        });
        let remote = snapshot(Role::Remote, ConnectionState::Connected, Some(ChannelState::Open));

        let err = connection_error(&[&local, &remote]);

        assert_eq!(err.failed_roles().collect::<Vec<_>>(), vec![Role::Local]);
        assert_eq!(err.connected, vec![Role::Remote]);
        assert!(err.to_string().contains("set-remote-description"));
    }
}
