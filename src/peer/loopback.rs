//! Транспорт в пределах одного процесса: две конечные точки одной сети.
//!
//! Соединение считается установленным, когда у обеих сторон есть локальное и
//! удалённое описание и хотя бы один кандидат применён. Поддерживает внедрение
//! сбоев для проверки путей ошибок.

use crate::error::TransportError;
use crate::peer::state::{ChannelState, TransportState};
use crate::peer::transport::{EventSink, Transport, TransportEvent, TransportFactory};
use crate::peer::types::{Candidate, Role, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Операция транспорта, на которую можно навесить сбой
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    CreateChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    /// шаг возвращает ошибку
    Reject(Step),
    /// шаг никогда не завершается
    Stall(Step),
    /// применение этого кандидата возвращает ошибку
    RejectCandidate(String),
}

#[derive(Debug, Default)]
struct Side {
    events: Option<EventSink>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: usize,
    created_channel: Option<String>,
    incoming_channel: Option<String>,
    channel_open: bool,
    channel_done: bool,
    closed: bool,
    reached_connected: bool,
    sent: usize,
}

impl Side {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn has_channel(&self) -> bool {
        self.created_channel.is_some() || self.incoming_channel.is_some()
    }
}

#[derive(Debug)]
struct Net {
    sides: [Side; 2],
    candidates: [Vec<Candidate>; 2],
    faults: HashSet<(Role, Fault)>,
    connected: bool,
}

impl Net {
    fn side(&mut self, role: Role) -> &mut Side {
        &mut self.sides[role.index()]
    }

    fn pair_ready(&self) -> bool {
        let described = self
            .sides
            .iter()
            .all(|s| s.local.is_some() && s.remote.is_some() && !s.closed);
        let applied: usize = self.sides.iter().map(|s| s.applied).sum();
        described && applied > 0
    }

    fn evaluate(&mut self) {
        if !self.connected && self.pair_ready() {
            self.connected = true;
            for side in &mut self.sides {
                side.emit(TransportEvent::ConnectionState(TransportState::Connecting));
                side.emit(TransportEvent::ConnectionState(TransportState::Connected));
                side.reached_connected = true;
            }
        }
        if !self.connected {
            return;
        }
        for role in [Role::Local, Role::Remote] {
            let label = {
                let side = &self.sides[role.index()];
                match &side.created_channel {
                    Some(label) if !side.channel_open && !side.channel_done && !side.closed => {
                        label.clone()
                    }
                    _ => continue,
                }
            };
            let opener = self.side(role);
            opener.channel_open = true;
            opener.emit(TransportEvent::ChannelState(ChannelState::Open));

            let acceptor = self.side(role.peer());
            if acceptor.closed {
                continue;
            }
            acceptor.incoming_channel = Some(label.clone());
            acceptor.channel_open = true;
            acceptor.emit(TransportEvent::IncomingChannel(label));
            acceptor.emit(TransportEvent::ChannelState(ChannelState::Open));
        }
    }
}

/// Общая «сеть» для пары loopback-транспортов. Клонируется дёшево.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    net: Arc<Mutex<Net>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        let net = Net {
            sides: [Side::default(), Side::default()],
            candidates: [
                vec![
                    Candidate::new("candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host"),
                    Candidate::new(concat!(
                        "candidate:2 1 udp 1694498815 203.0.113.10 50000 ",
                        "typ srflx raddr 127.0.0.1 rport 50000",
                    )),
                ],
                vec![
                    Candidate::new("candidate:1 1 udp 2130706431 127.0.0.1 50001 typ host"),
                    Candidate::new(concat!(
                        "candidate:2 1 udp 1694498815 203.0.113.11 50001 ",
                        "typ srflx raddr 127.0.0.1 rport 50001",
                    )),
                ],
            ],
            faults: HashSet::new(),
            connected: false,
        };
        Self {
            net: Arc::new(Mutex::new(net)),
        }
    }

    /// Кандидаты, которые сторона «найдёт» после установки локального описания, в этом порядке.
    pub fn with_candidates(self, role: Role, candidates: Vec<Candidate>) -> Self {
        self.net.lock().candidates[role.index()] = candidates;
        self
    }

    pub fn inject(&self, role: Role, fault: Fault) {
        self.net.lock().faults.insert((role, fault));
    }

    pub fn clear_faults(&self) {
        self.net.lock().faults.clear();
    }

    pub fn remote_description(&self, role: Role) -> Option<SessionDescription> {
        self.net.lock().sides[role.index()].remote.clone()
    }

    pub fn reached_connected(&self, role: Role) -> bool {
        self.net.lock().sides[role.index()].reached_connected
    }

    pub fn applied_candidates(&self, role: Role) -> usize {
        self.net.lock().sides[role.index()].applied
    }

    /// Сколько сообщений сторона передала в канал
    pub fn sent_messages(&self, role: Role) -> usize {
        self.net.lock().sides[role.index()].sent
    }

    pub fn is_closed(&self, role: Role) -> bool {
        self.net.lock().sides[role.index()].closed
    }

    /// Сторона `role` закрывает канал по своей инициативе; соединение остаётся.
    pub fn close_channel_from(&self, role: Role) {
        let mut net = self.net.lock();
        for side in [role, role.peer()] {
            let side = net.side(side);
            if side.channel_open {
                side.channel_open = false;
                side.channel_done = true;
                side.emit(TransportEvent::ChannelState(ChannelState::Closed));
            }
        }
    }

    /// Обрыв связи после установления: сторона получает `Failed`.
    pub fn fail_connectivity(&self, role: Role) {
        let mut net = self.net.lock();
        net.side(role)
            .emit(TransportEvent::ConnectionState(TransportState::Failed));
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        role: Role,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        {
            let mut net = self.net.lock();
            net.connected = false;
            *net.side(role) = Side {
                events: Some(events),
                ..Side::default()
            };
        }
        debug!(role = %role, "loopback transport created");
        Ok(Arc::new(LoopbackTransport {
            role,
            net: self.net.clone(),
        }))
    }
}

pub struct LoopbackTransport {
    role: Role,
    net: Arc<Mutex<Net>>,
}

impl LoopbackTransport {
    async fn check(&self, step: Step) -> Result<(), TransportError> {
        let (stall, reject, closed) = {
            let net = self.net.lock();
            (
                net.faults.contains(&(self.role, Fault::Stall(step))),
                net.faults.contains(&(self.role, Fault::Reject(step))),
                net.sides[self.role.index()].closed,
            )
        };
        if closed {
            return Err(TransportError::Closed);
        }
        if stall {
            debug!(role = %self.role, ?step, "loopback step stalled");
            std::future::pending::<()>().await;
        }
        if reject {
            return Err(TransportError::Rejected(format!("{step:?}")));
        }
        Ok(())
    }

    fn fake_sdp(&self, kind: SdpKind) -> String {
        format!(
            "v=0\r\no=loopback-{} 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             a=type:{kind}\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
            self.role
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check(Step::CreateOffer).await?;
        Ok(SessionDescription::offer(self.fake_sdp(SdpKind::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.check(Step::CreateAnswer).await?;
        if self.net.lock().sides[self.role.index()].remote.is_none() {
            return Err(TransportError::Rejected("answer without remote offer".into()));
        }
        Ok(SessionDescription::answer(self.fake_sdp(SdpKind::Answer)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        self.check(Step::SetLocalDescription).await?;
        let mut net = self.net.lock();
        let gathered = net.candidates[self.role.index()].clone();
        let side = net.side(self.role);
        side.local = Some(desc.clone());
        // сбор кандидатов стартует вместе с локальным описанием
        for candidate in gathered {
            side.emit(TransportEvent::LocalCandidate(Some(candidate)));
        }
        side.emit(TransportEvent::LocalCandidate(None));
        net.evaluate();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.check(Step::SetRemoteDescription).await?;
        let mut net = self.net.lock();
        net.side(self.role).remote = Some(desc.clone());
        net.evaluate();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Candidate) -> Result<(), TransportError> {
        let mut net = self.net.lock();
        if net.sides[self.role.index()].closed {
            return Err(TransportError::Closed);
        }
        if net
            .faults
            .contains(&(self.role, Fault::RejectCandidate(candidate.candidate.clone())))
        {
            return Err(TransportError::Rejected(format!(
                "candidate {}",
                candidate.candidate
            )));
        }
        net.side(self.role).applied += 1;
        net.evaluate();
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        self.check(Step::CreateChannel).await?;
        let mut net = self.net.lock();
        net.side(self.role).created_channel = Some(label.to_string());
        net.evaluate();
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        let mut net = self.net.lock();
        let side = net.side(self.role);
        if !side.has_channel() {
            return Err(TransportError::NoChannel);
        }
        if !side.channel_open || side.closed {
            return Err(TransportError::Closed);
        }
        side.sent += 1;
        let peer = net.side(self.role.peer());
        if peer.channel_open && !peer.closed {
            peer.emit(TransportEvent::Message(text.to_string()));
        }
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        let mut net = self.net.lock();
        let side = net.side(self.role);
        if !side.has_channel() {
            return Ok(());
        }
        let was_open = side.channel_open;
        side.channel_open = false;
        side.channel_done = true;
        side.emit(TransportEvent::ChannelState(ChannelState::Closed));
        if was_open {
            let peer = net.side(self.role.peer());
            if peer.channel_open {
                peer.channel_open = false;
                peer.channel_done = true;
                peer.emit(TransportEvent::ChannelState(ChannelState::Closed));
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut net = self.net.lock();
        let side = net.side(self.role);
        if side.closed {
            return Ok(());
        }
        side.closed = true;
        side.channel_open = false;
        side.events = None;
        if net.connected {
            net.side(self.role.peer())
                .emit(TransportEvent::ConnectionState(TransportState::Disconnected));
        }
        Ok(())
    }
}
