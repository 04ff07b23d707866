use crate::peer::types::{Candidate, Role};
use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Подключает fmt-подписчик tracing. Повторные вызовы ничего не делают.
pub fn init_logging() {
    if !crate::config::LOGGING_ENABLED {
        return;
    }
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(role: Role, direction: &str, cand: &Candidate) {
    debug!(
        role = %role,
        "Trickle {direction}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}
