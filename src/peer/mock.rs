use crate::error::TransportError;
use crate::peer::loopback::Step;
use crate::peer::transport::Transport;
use crate::peer::types::{Candidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    CreateChannel(String),
    Send(String),
    CloseChannel,
    Close,
}

/// Записывает каждый вызов; выбранные шаги и кандидаты отвечают ошибкой.
#[derive(Default)]
pub(crate) struct MockTransport {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<Step>>,
    bad_candidates: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub(crate) fn failing(step: Step) -> Self {
        let mock = Self::default();
        mock.failing.lock().insert(step);
        mock
    }

    pub(crate) fn reject_candidate(&self, candidate: &str) {
        self.bad_candidates.lock().insert(candidate.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call, step: Option<Step>) -> Result<(), TransportError> {
        self.calls.lock().push(call);
        match step {
            Some(step) if self.failing.lock().contains(&step) => {
                Err(TransportError::Rejected(format!("{step:?}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer, Some(Step::CreateOffer))?;
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer, Some(Step::CreateAnswer))?;
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetLocal(desc.kind), Some(Step::SetLocalDescription))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(Call::SetRemote(desc.kind), Some(Step::SetRemoteDescription))
    }

    async fn add_candidate(&self, candidate: &Candidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate.candidate.clone()), None)?;
        if self.bad_candidates.lock().contains(&candidate.candidate) {
            return Err(TransportError::Rejected("candidate".into()));
        }
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        self.record(Call::CreateChannel(label.to_string()), Some(Step::CreateChannel))
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        self.record(Call::Send(text.to_string()), None)
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        self.record(Call::CloseChannel, None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close, None)
    }
}
