use crate::peer::types::{Candidate, CandidateKind, Role};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

/// Счётчики кандидатов одной конечной точки
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub discovered: usize,
    pub applied: usize,
    pub rejected: usize,
    pub deferred: usize,
}

/// Учёт кандидатов: удалённые применяются не более одного раза, а пришедшие
/// до установки обоих описаний откладываются.
#[derive(Debug, Default)]
pub struct CandidateLedger {
    seen: HashSet<Candidate>,
    pending: Vec<Candidate>,
    local: Vec<Candidate>,
    applied: usize,
    rejected: usize,
}

impl CandidateLedger {
    /// false, если этот кандидат уже встречался
    pub fn admit(&mut self, candidate: &Candidate) -> bool {
        self.seen.insert(candidate.clone())
    }

    pub fn defer(&mut self, candidate: Candidate) {
        self.pending.push(candidate);
    }

    pub fn take_pending(&mut self) -> Vec<Candidate> {
        std::mem::take(&mut self.pending)
    }

    pub fn record_local(&mut self, candidate: Candidate) {
        self.local.push(candidate);
    }

    pub fn local(&self) -> &[Candidate] {
        &self.local
    }

    pub fn mark_applied(&mut self) {
        self.applied += 1;
    }

    pub fn mark_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn stats(&self) -> CandidateStats {
        CandidateStats {
            discovered: self.local.len(),
            applied: self.applied,
            rejected: self.rejected,
            deferred: self.pending.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateMix {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(role: Role, candidates: &[Candidate]) -> CandidateMix {
    let mut mix = CandidateMix::default();
    for candidate in candidates {
        match candidate.kind() {
            CandidateKind::Host => mix.host += 1,
            CandidateKind::ServerReflexive => mix.srflx += 1,
            CandidateKind::Relay => mix.relay += 1,
            CandidateKind::PeerReflexive | CandidateKind::Unknown => {}
        }
    }

    info!(
        role = %role,
        "Candidate analysis: {} host, {} srflx, {} relay",
        mix.host, mix.srflx, mix.relay
    );
    if mix.relay == 0 {
        debug!(role = %role, "no TURN relay candidates, connection through symmetric NAT may fail");
    }
    mix
}
