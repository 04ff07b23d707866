//! Конечная точка как отдельная задача tokio.
//!
//! Все изменения состояния одной стороны проходят через один цикл: команды
//! координатора, события транспорта и сигналы пира обрабатываются по очереди,
//! поэтому машина согласования и канал не нуждаются в блокировках.

use crate::error::{ChannelError, NegotiationError, NegotiationStage};
use crate::peer::data_channel::{ChannelController, Readiness};
use crate::peer::ice::CandidateStats;
use crate::peer::negotiation::NegotiationMachine;
use crate::peer::state::{ChannelState, ConnectionState, TransportState};
use crate::peer::transport::{EventStream, Transport, TransportEvent};
use crate::peer::types::Role;
use crate::session::SessionEvent;
use crate::signaling::{RelayPort, Signal, SignalReceiver};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Наблюдаемое состояние одной стороны
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub role: Role,
    pub connection: ConnectionState,
    pub channel: Option<ChannelState>,
    pub last_received: Option<String>,
    pub received_count: u64,
    pub failure: Option<NegotiationError>,
    pub candidates: CandidateStats,
}

impl EndpointSnapshot {
    fn idle(role: Role) -> Self {
        Self {
            role,
            connection: ConnectionState::Idle,
            channel: None,
            last_received: None,
            received_count: 0,
            failure: None,
            candidates: CandidateStats::default(),
        }
    }

    /// Соединение установлено и канал открыт
    pub fn is_ready(&self) -> bool {
        self.connection == ConnectionState::Connected && self.channel == Some(ChannelState::Open)
    }
}

pub(crate) enum Command {
    Begin,
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Клонируемый доступ к очереди команд конечной точки.
#[derive(Clone)]
pub(crate) struct EndpointControl {
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
}

impl EndpointControl {
    pub(crate) fn begin(&self) {
        if self.commands.send(Command::Begin).is_err() {
            warn!(role = %self.role, "begin requested for a stopped endpoint");
        }
    }

    pub(crate) async fn send(&self, text: String) -> Result<(), ChannelError> {
        let stopped = ChannelError::NotOpen {
            state: Some(ChannelState::Closed),
        };
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Send { text, reply }).is_err() {
            return Err(stopped);
        }
        rx.await.unwrap_or(Err(stopped))
    }

    /// Просит задачу закрыться, не дожидаясь ответа.
    pub(crate) fn request_close(&self) {
        let _ = self.commands.send(Command::Close { reply: None });
    }
}

pub struct EndpointHandle {
    control: EndpointControl,
    snapshot: watch::Receiver<EndpointSnapshot>,
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

impl EndpointHandle {
    pub fn role(&self) -> Role {
        self.control.role
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EndpointSnapshot> {
        self.snapshot.clone()
    }

    pub(crate) fn control(&self) -> EndpointControl {
        self.control.clone()
    }

    /// Закрывает канал и транспорт. Если задача не ответила за `grace`
    /// (например, застряла внутри вызова транспорта), она прерывается и
    /// транспорт закрывается напрямую.
    pub async fn shutdown(self, grace: Duration) {
        let role = self.control.role;
        let (reply, rx) = oneshot::channel();
        let requested = self
            .control
            .commands
            .send(Command::Close { reply: Some(reply) })
            .is_ok();
        let acknowledged = requested && matches!(tokio::time::timeout(grace, rx).await, Ok(Ok(())));

        if acknowledged {
            let _ = self.task.await;
            return;
        }

        if !self.task.is_finished() {
            warn!(role = %role, ?grace, "endpoint did not stop in time, aborting");
        }
        self.task.abort();
        let _ = self.task.await;
        if let Err(err) = self.transport.close_channel().await {
            debug!(role = %role, error = %err, "closing channel after abort");
        }
        if let Err(err) = self.transport.close().await {
            warn!(role = %role, error = %err, "failed to close transport after abort");
        }
    }
}

/// Запускает задачу конечной точки.
pub(crate) fn spawn(
    role: Role,
    transport: Arc<dyn Transport>,
    transport_events: EventStream,
    port: RelayPort,
    label: &str,
    events: broadcast::Sender<SessionEvent>,
) -> EndpointHandle {
    let RelayPort { outbound, inbound } = port;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(EndpointSnapshot::idle(role));

    let endpoint = Endpoint {
        role,
        negotiation: NegotiationMachine::new(role, transport.clone(), outbound),
        channel: ChannelController::new(role, label, transport.clone()),
        snapshot: snapshot_tx,
        events,
    };
    let task = tokio::spawn(endpoint.run(commands_rx, transport_events, inbound));
    debug!(role = %role, "endpoint task spawned");

    EndpointHandle {
        control: EndpointControl {
            role,
            commands: commands_tx,
        },
        snapshot: snapshot_rx,
        transport,
        task,
    }
}

struct Endpoint {
    role: Role,
    negotiation: NegotiationMachine,
    channel: ChannelController,
    snapshot: watch::Sender<EndpointSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl Endpoint {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: EventStream,
        mut inbound: SignalReceiver,
    ) {
        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // координатор пропал без close
                        self.shutdown().await;
                        ControlFlow::Break(())
                    }
                },
                Some(event) = transport_events.recv() => {
                    self.handle_transport_event(event).await;
                    ControlFlow::Continue(())
                }
                Some(signal) = inbound.recv() => {
                    self.handle_signal(signal).await;
                    ControlFlow::Continue(())
                }
            };
            self.publish();
            if flow.is_break() {
                break;
            }
        }
        debug!(role = %self.role, "endpoint task finished");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Begin => {
                if let Err(err) = self.channel.open().await {
                    let err = self
                        .negotiation
                        .fail(NegotiationStage::CreateChannel, err.to_string());
                    self.report(err);
                    return ControlFlow::Continue(());
                }
                if let Err(err) = self.negotiation.begin_as_offerer().await {
                    self.report(err);
                }
            }
            Command::Send { text, reply } => {
                let result = self.channel.send(&text).await;
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.shutdown().await;
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.negotiation.on_local_candidate_discovered(candidate)
            }
            TransportEvent::ConnectionState(state) => {
                if let Err(err) = self.negotiation.on_transport_state(state) {
                    self.report(err);
                }
                if state == TransportState::Closed {
                    self.channel.mark_closed();
                }
            }
            TransportEvent::IncomingChannel(label) => self.channel.on_incoming(label),
            TransportEvent::ChannelState(state) => {
                if let Some(readiness) = self.channel.on_state_changed(state) {
                    self.announce(readiness);
                }
            }
            TransportEvent::Message(text) => {
                if self.negotiation.state().is_terminal() {
                    debug!(role = %self.role, "message after teardown dropped");
                    return;
                }
                if self.channel.on_message_received(text.clone()) {
                    // подписчик события должен видеть уже обновлённый снимок
                    self.publish();
                    let _ = self.events.send(SessionEvent::MessageReceived {
                        role: self.role,
                        text,
                    });
                }
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Description(desc) => {
                if let Err(err) = self.negotiation.on_peer_description(desc).await {
                    self.report(err);
                }
            }
            Signal::Candidate(candidate) => self.negotiation.on_candidate_received(candidate).await,
        }
    }

    /// Сначала канал, потом транспорт.
    async fn shutdown(&mut self) {
        match self.channel.close().await {
            Ok(Some(readiness)) => self.announce(readiness),
            Ok(None) => {}
            Err(err) => warn!(role = %self.role, error = %err, "failed to close data channel"),
        }
        self.negotiation.close().await;
        self.channel.mark_closed();
    }

    fn announce(&self, readiness: Readiness) {
        let ready = readiness == Readiness::Enabled;
        info!(role = %self.role, ready, "channel readiness changed");
        let _ = self.events.send(SessionEvent::ChannelReadiness {
            role: self.role,
            ready,
        });
    }

    fn report(&self, err: NegotiationError) {
        let _ = self.events.send(SessionEvent::EndpointFailed(err));
    }

    fn publish(&self) {
        let next = EndpointSnapshot {
            role: self.role,
            connection: self.negotiation.state(),
            channel: self.channel.state(),
            last_received: self.channel.last_received().map(str::to_owned),
            received_count: self.channel.received_count(),
            failure: self.negotiation.failure().cloned(),
            candidates: self.negotiation.candidate_stats(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
