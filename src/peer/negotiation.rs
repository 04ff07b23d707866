//! Машина согласования одной конечной точки: offer/answer и применение кандидатов.

use crate::error::{NegotiationError, NegotiationStage};
use crate::logger::dump_candidate;
use crate::peer::ice::{analyze_candidates, CandidateLedger, CandidateStats};
use crate::peer::state::{ConnectionState, TransportState};
use crate::peer::transport::Transport;
use crate::peer::types::{Candidate, Role, SdpKind, SessionDescription};
use crate::signaling::{Signal, SignalSender};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct NegotiationMachine {
    role: Role,
    state: ConnectionState,
    transport: Arc<dyn Transport>,
    outbound: SignalSender,
    has_local: bool,
    has_remote: bool,
    candidates: CandidateLedger,
    failure: Option<NegotiationError>,
    transport_closed: bool,
}

impl NegotiationMachine {
    pub fn new(role: Role, transport: Arc<dyn Transport>, outbound: SignalSender) -> Self {
        Self {
            role,
            state: ConnectionState::Idle,
            transport,
            outbound,
            has_local: false,
            has_remote: false,
            candidates: CandidateLedger::default(),
            failure: None,
            transport_closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failure(&self) -> Option<&NegotiationError> {
        self.failure.as_ref()
    }

    pub fn candidate_stats(&self) -> CandidateStats {
        self.candidates.stats()
    }

    /// Создаёт offer, ставит его локально и публикует пиру.
    pub async fn begin_as_offerer(&mut self) -> Result<(), NegotiationError> {
        if self.state != ConnectionState::Idle {
            return Err(self.fail(
                NegotiationStage::OrderViolation,
                format!("offer requested in state {:?}", self.state),
            ));
        }

        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.fail(NegotiationStage::CreateOffer, err.to_string())),
        };
        if let Err(err) = self.transport.set_local_description(&offer).await {
            return Err(self.fail(NegotiationStage::SetLocalDescription, err.to_string()));
        }
        self.has_local = true;
        self.advance(ConnectionState::OfferCreated);
        info!(role = %self.role, "offer created and set as local description");

        self.outbound.publish(Signal::Description(offer));
        Ok(())
    }

    /// Принимает offer пира, отвечает answer и публикует его.
    pub async fn begin_as_answerer(
        &mut self,
        remote_offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state != ConnectionState::Idle || self.has_remote {
            return Err(self.fail(
                NegotiationStage::OrderViolation,
                format!("offer received in state {:?}", self.state),
            ));
        }
        if remote_offer.kind != SdpKind::Offer {
            return Err(self.fail(
                NegotiationStage::OrderViolation,
                format!("expected an offer, got {}", remote_offer.kind),
            ));
        }

        if let Err(err) = self.transport.set_remote_description(&remote_offer).await {
            return Err(self.fail(NegotiationStage::SetRemoteDescription, err.to_string()));
        }
        self.has_remote = true;

        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(NegotiationStage::CreateAnswer, err.to_string())),
        };
        if let Err(err) = self.transport.set_local_description(&answer).await {
            return Err(self.fail(NegotiationStage::SetLocalDescription, err.to_string()));
        }
        self.has_local = true;
        self.advance(ConnectionState::DescriptionsExchanged);
        info!(role = %self.role, "answer created and set as local description");

        self.outbound.publish(Signal::Description(answer));
        self.flush_deferred().await;
        Ok(())
    }

    pub async fn on_peer_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            debug!(
                role = %self.role,
                kind = %desc.kind,
                "description for a finished endpoint discarded"
            );
            return Ok(());
        }

        match (desc.kind, self.state) {
            (SdpKind::Offer, ConnectionState::Idle) => self.begin_as_answerer(desc).await,
            (SdpKind::Answer, ConnectionState::OfferCreated) if !self.has_remote => {
                if let Err(err) = self.transport.set_remote_description(&desc).await {
                    return Err(self.fail(NegotiationStage::SetRemoteDescription, err.to_string()));
                }
                self.has_remote = true;
                self.advance(ConnectionState::DescriptionsExchanged);
                info!(role = %self.role, "answer applied as remote description");
                self.flush_deferred().await;
                Ok(())
            }
            (kind, state) => Err(self.fail(
                NegotiationStage::OrderViolation,
                format!("unexpected {kind} in state {state:?}"),
            )),
        }
    }

    /// Ошибка применения отдельного кандидата не фатальна.
    pub async fn on_candidate_received(&mut self, candidate: Candidate) {
        if self.state.is_terminal() {
            debug!(role = %self.role, "candidate for a finished endpoint discarded");
            return;
        }
        if candidate.is_end_of_candidates() {
            return;
        }
        if !self.candidates.admit(&candidate) {
            debug!(
                role = %self.role,
                candidate = %candidate.candidate,
                "duplicate candidate ignored"
            );
            return;
        }
        dump_candidate(self.role, "REMOTE", &candidate);

        if !(self.has_local && self.has_remote) {
            debug!(role = %self.role, "descriptions not set yet, deferring candidate");
            self.candidates.defer(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    pub fn on_local_candidate_discovered(&mut self, candidate: Option<Candidate>) {
        let candidate = match candidate {
            Some(c) if !c.is_end_of_candidates() => c,
            _ => {
                info!(role = %self.role, "ICE candidate gathering completed");
                analyze_candidates(self.role, self.candidates.local());
                return;
            }
        };
        if self.state.is_terminal() {
            return;
        }
        dump_candidate(self.role, "LOCAL", &candidate);
        self.candidates.record_local(candidate.clone());
        self.outbound.publish(Signal::Candidate(candidate));
    }

    /// Connecting/Connected приходят только от транспорта.
    pub fn on_transport_state(&mut self, state: TransportState) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        debug!(role = %self.role, ?state, "transport state changed");

        match state {
            TransportState::New => {}
            TransportState::Connecting => {
                if self.state == ConnectionState::DescriptionsExchanged {
                    self.advance(ConnectionState::Connecting);
                } else {
                    debug!(role = %self.role, current = ?self.state, "connecting signal ignored");
                }
            }
            TransportState::Connected => match self.state {
                ConnectionState::DescriptionsExchanged | ConnectionState::Connecting => {
                    self.advance(ConnectionState::Connecting);
                    self.advance(ConnectionState::Connected);
                    info!(role = %self.role, "peer connection connected");
                }
                current => {
                    warn!(
                        role = %self.role,
                        ?current,
                        "connected signal before descriptions were exchanged"
                    );
                }
            },
            TransportState::Disconnected => {
                warn!(role = %self.role, "peer connection disconnected");
            }
            TransportState::Failed => {
                return Err(self.fail(
                    NegotiationStage::Connectivity,
                    "transport reported failed connectivity".into(),
                ));
            }
            TransportState::Closed => {
                self.transport_closed = true;
                self.advance(ConnectionState::Closed);
            }
        }
        Ok(())
    }

    /// Закрывает транспорт. Повторный вызов ничего не делает.
    pub async fn close(&mut self) {
        if !self.transport_closed {
            self.transport_closed = true;
            if let Err(err) = self.transport.close().await {
                warn!(role = %self.role, error = %err, "failed to close transport");
            }
        }
        if self.advance(ConnectionState::Closed) {
            info!(role = %self.role, "endpoint closed");
        }
    }

    pub(crate) fn fail(&mut self, stage: NegotiationStage, reason: String) -> NegotiationError {
        let err = NegotiationError {
            role: self.role,
            stage,
            reason,
        };
        if !self.state.is_terminal() {
            error!(role = %self.role, %stage, reason = %err.reason, "negotiation failed");
            self.state = ConnectionState::Failed;
            self.failure = Some(err.clone());
        }
        err
    }

    fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        debug!(role = %self.role, from = ?self.state, to = ?next, "connection state");
        self.state = next;
        true
    }

    async fn flush_deferred(&mut self) {
        for candidate in self.candidates.take_pending() {
            if self.state.is_terminal() {
                break;
            }
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: Candidate) {
        match self.transport.add_candidate(&candidate).await {
            Ok(()) => self.candidates.mark_applied(),
            Err(err) => {
                warn!(
                    role = %self.role,
                    candidate = %candidate.candidate,
                    error = %err,
                    "failed to apply remote candidate"
                );
                self.candidates.mark_rejected();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::loopback::Step;
    use crate::peer::mock::{Call, MockTransport};
    use crate::signaling::{in_process_pair, RelayPort};

    fn machine(role: Role, mock: &Arc<MockTransport>) -> (NegotiationMachine, RelayPort) {
        let (ours, theirs) = in_process_pair("test");
        let transport: Arc<dyn Transport> = mock.clone();
        (NegotiationMachine::new(role, transport, ours.outbound), theirs)
    }

    fn host(n: u8) -> Candidate {
        Candidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn offerer_publishes_offer_after_setting_it_locally() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, mut peer) = machine(Role::Local, &mock);

        m.begin_as_offerer().await.unwrap();

        assert_eq!(m.state(), ConnectionState::OfferCreated);
        assert_eq!(mock.calls(), vec![Call::CreateOffer, Call::SetLocal(SdpKind::Offer)]);
        match peer.inbound.recv().await {
            Some(Signal::Description(desc)) => assert_eq!(desc.kind, SdpKind::Offer),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_offer_failure_is_fatal_and_publishes_nothing() {
        let mock = Arc::new(MockTransport::failing(Step::CreateOffer));
        let (mut m, peer) = machine(Role::Local, &mock);

        let err = m.begin_as_offerer().await.unwrap_err();

        assert_eq!(err.stage, NegotiationStage::CreateOffer);
        assert_eq!(err.role, Role::Local);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(m.failure(), Some(&err));
        drop(m);
        let mut peer = peer;
        assert_eq!(peer.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn answerer_walks_remote_then_answer_then_local() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, mut peer) = machine(Role::Remote, &mock);

        m.on_peer_description(SessionDescription::offer("v=0 offer"))
            .await
            .unwrap();

        assert_eq!(m.state(), ConnectionState::DescriptionsExchanged);
        assert_eq!(
            mock.calls(),
            vec![
                Call::SetRemote(SdpKind::Offer),
                Call::CreateAnswer,
                Call::SetLocal(SdpKind::Answer)
            ]
        );
        match peer.inbound.recv().await {
            Some(Signal::Description(desc)) => assert_eq!(desc.kind, SdpKind::Answer),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_answer_failure_names_its_stage() {
        let mock = Arc::new(MockTransport::failing(Step::CreateAnswer));
        let (mut m, _peer) = machine(Role::Remote, &mock);

        let err = m
            .begin_as_answerer(SessionDescription::offer("v=0 offer"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, NegotiationStage::CreateAnswer);
        assert_eq!(m.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn answer_before_offer_is_an_order_violation() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Local, &mock);

        let err = m
            .on_peer_description(SessionDescription::answer("v=0 early"))
            .await
            .unwrap_err();

        assert_eq!(err.stage, NegotiationStage::OrderViolation);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn duplicate_answer_is_an_order_violation() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Local, &mock);
        m.begin_as_offerer().await.unwrap();
        m.on_peer_description(SessionDescription::answer("v=0 a"))
            .await
            .unwrap();

        let err = m
            .on_peer_description(SessionDescription::answer("v=0 a"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, NegotiationStage::OrderViolation);
    }

    #[tokio::test]
    async fn candidates_wait_for_both_descriptions() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Local, &mock);

        m.on_candidate_received(host(1)).await;
        m.begin_as_offerer().await.unwrap();
        m.on_candidate_received(host(2)).await;
        assert_eq!(m.candidate_stats().deferred, 2);
        assert!(!mock.calls().iter().any(|c| matches!(c, Call::AddCandidate(_))));

        m.on_peer_description(SessionDescription::answer("v=0 a"))
            .await
            .unwrap();

        let applied: Vec<_> = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::AddCandidate(_)))
            .collect();
        assert_eq!(applied.len(), 2);
        assert_eq!(m.candidate_stats().applied, 2);
        assert_eq!(m.candidate_stats().deferred, 0);
    }

    #[tokio::test]
    async fn rejected_candidate_is_not_fatal() {
        let mock = Arc::new(MockTransport::default());
        let bad = host(1);
        mock.reject_candidate(&bad.candidate);
        let (mut m, _peer) = machine(Role::Remote, &mock);
        m.begin_as_answerer(SessionDescription::offer("v=0 o"))
            .await
            .unwrap();

        m.on_candidate_received(bad).await;
        m.on_candidate_received(host(2)).await;

        assert_eq!(m.state(), ConnectionState::DescriptionsExchanged);
        let stats = m.candidate_stats();
        assert_eq!((stats.applied, stats.rejected), (1, 1));
    }

    #[tokio::test]
    async fn same_candidate_is_applied_once() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Remote, &mock);
        m.begin_as_answerer(SessionDescription::offer("v=0 o"))
            .await
            .unwrap();

        m.on_candidate_received(host(3)).await;
        m.on_candidate_received(host(3)).await;

        assert_eq!(m.candidate_stats().applied, 1);
    }

    #[tokio::test]
    async fn finished_endpoint_discards_candidates() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Remote, &mock);
        m.close().await;

        m.on_candidate_received(host(1)).await;
        m.on_peer_description(SessionDescription::offer("v=0 late"))
            .await
            .unwrap();

        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(mock.calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_but_end_marker_is_not() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, mut peer) = machine(Role::Local, &mock);

        m.on_local_candidate_discovered(Some(host(1)));
        m.on_local_candidate_discovered(Some(Candidate::new("")));
        m.on_local_candidate_discovered(None);
        drop(m);

        assert_eq!(peer.inbound.recv().await, Some(Signal::Candidate(host(1))));
        assert_eq!(peer.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn connected_follows_transport_signal_only() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Local, &mock);
        m.begin_as_offerer().await.unwrap();

        // до обмена описаниями сигнал Connected игнорируется
        m.on_transport_state(TransportState::Connected).unwrap();
        assert_eq!(m.state(), ConnectionState::OfferCreated);

        m.on_peer_description(SessionDescription::answer("v=0 a"))
            .await
            .unwrap();
        m.on_transport_state(TransportState::Connected).unwrap();
        assert_eq!(m.state(), ConnectionState::Connected);

        // кандидаты после Connected всё ещё применяются
        m.on_candidate_received(host(7)).await;
        assert_eq!(m.candidate_stats().applied, 1);
    }

    #[tokio::test]
    async fn transport_failure_fails_the_endpoint() {
        let mock = Arc::new(MockTransport::default());
        let (mut m, _peer) = machine(Role::Local, &mock);
        m.begin_as_offerer().await.unwrap();

        let err = m.on_transport_state(TransportState::Failed).unwrap_err();
        assert_eq!(err.stage, NegotiationStage::Connectivity);
        assert_eq!(m.state(), ConnectionState::Failed);

        // терминальное состояние: повторные сигналы ничего не меняют
        m.on_transport_state(TransportState::Connected).unwrap();
        assert_eq!(m.state(), ConnectionState::Failed);
    }
}
