//! Обмен описаниями и кандидатами между конечными точками.
//!
//! Каждое сообщение упаковывается в [`SignalEnvelope`] и кодируется
//! JSON → gzip → base64, так что кадры можно передать через любой внешний
//! сигнальный канал. В одном процессе обе стороны связаны парой mpsc-очередей
//! ([`in_process_pair`]); для сети кадры перекладываются через
//! [`RelayPort::from_channels`].

use crate::error::SignalError;
use crate::peer::types::{Candidate, SessionDescription};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tracing::{debug, warn};

// Ограничиваем размер распаковываемых данных для защиты от zip-bomb
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Description(SessionDescription),
    Candidate(Candidate),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub session_id: String,
    pub ts: i64,
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(session_id: &str, signal: Signal) -> Self {
        Self {
            session_id: session_id.to_string(),
            ts: chrono::Utc::now().timestamp(),
            signal,
        }
    }
}

pub fn encode(envelope: &SignalEnvelope) -> Result<String, SignalError> {
    let json = serde_json::to_vec(envelope)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)?;
    let compressed = gz.finish()?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode(frame: &str) -> Result<SignalEnvelope, SignalError> {
    let compressed = general_purpose::STANDARD.decode(frame.trim())?;
    let mut json = Vec::new();
    GzDecoder::new(&compressed[..])
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Исходящая сторона реле. Отправка никогда не блокирует.
#[derive(Debug, Clone)]
pub struct SignalSender {
    session_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl SignalSender {
    pub fn publish(&self, signal: Signal) {
        let frame = match encode(&SignalEnvelope::new(&self.session_id, signal)) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode signal, dropping it");
                return;
            }
        };
        // получатель уже закрыт: конечная точка завершилась, сигнал просто отбрасывается
        if self.tx.send(frame).is_err() {
            debug!(session = %self.session_id, "peer endpoint is gone, signal discarded");
        }
    }
}

/// Входящая сторона реле: отдаёт только сигналы своей сессии.
#[derive(Debug)]
pub struct SignalReceiver {
    session_id: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl SignalReceiver {
    /// `None`, когда отправитель закрыт. Безопасно для `tokio::select!`.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            let frame = self.rx.recv().await?;
            match decode(&frame) {
                Ok(envelope) if envelope.session_id == self.session_id => {
                    return Some(envelope.signal)
                }
                Ok(envelope) => debug!(
                    expected = %self.session_id,
                    got = %envelope.session_id,
                    "discarding signal from another session"
                ),
                Err(err) => warn!(error = %err, "discarding undecodable signal frame"),
            }
        }
    }
}

#[derive(Debug)]
pub struct RelayPort {
    pub outbound: SignalSender,
    pub inbound: SignalReceiver,
}

impl RelayPort {
    pub fn from_channels(
        session_id: &str,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound: SignalSender {
                session_id: session_id.to_string(),
                tx: outbound,
            },
            inbound: SignalReceiver {
                session_id: session_id.to_string(),
                rx: inbound,
            },
        }
    }
}

/// Два связанных порта: всё, что опубликовано в одном, приходит в другой.
pub fn in_process_pair(session_id: &str) -> (RelayPort, RelayPort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        RelayPort::from_channels(session_id, a_tx, a_rx),
        RelayPort::from_channels(session_id, b_tx, b_rx),
    )
}
