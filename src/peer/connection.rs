//! Боевой транспорт поверх `webrtc`: один `RTCPeerConnection` на конечную точку.

use crate::config::IceConfig;
use crate::error::{ConfigError, TransportError};
use crate::peer::state::{ChannelState, TransportState};
use crate::peer::transport::{EventSink, Transport, TransportEvent, TransportFactory};
use crate::peer::types::{Candidate, Role, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Фабрика транспортов `webrtc` с общим набором ICE серверов
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice: IceConfig,
}

impl WebRtcFactory {
    pub fn new(ice: IceConfig) -> Result<Self, ConfigError> {
        ice.validate()?;
        info!(servers = ice.servers.len(), "webrtc transport factory configured");
        Ok(Self { ice })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        role: Role,
        events: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = WebRtcTransport::new(role, &self.ice, events).await?;
        Ok(Arc::new(transport))
    }
}

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct WebRtcTransport {
    role: Role,
    pc: Arc<RTCPeerConnection>,
    channel: SharedChannel,
    events: EventSink,
}

impl WebRtcTransport {
    async fn new(role: Role, ice: &IceConfig, events: EventSink) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(&ice.servers)).await?);
        let channel: SharedChannel = Arc::new(Mutex::new(None));

        // None от движка означает конец сбора
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let candidate = match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => Some(Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(err) => {
                        warn!(role = %role, error = %err, "local candidate not serializable");
                        return Box::pin(async {});
                    }
                },
                None => None,
            };
            let _ = sink.send(TransportEvent::LocalCandidate(candidate));
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(role = %role, ?state, "ICE gathering state");
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!(role = %role, state = ?st, "peer connection state changed");
            let mapped = match st {
                RTCPeerConnectionState::New => Some(TransportState::New),
                RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                _ => None,
            };
            if let Some(state) = mapped {
                let _ = sink.send(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        let slot = channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let label = dc.label().to_string();
            info!(role = %role, %label, "remote opened data channel");
            attach_channel(role, &dc, &sink);
            *slot.lock() = Some(dc);
            let _ = sink.send(TransportEvent::IncomingChannel(label));
            Box::pin(async {})
        }));

        Ok(Self {
            role,
            pc,
            channel,
            events,
        })
    }

    fn current_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        to_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        to_description(answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &Candidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<(), TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        attach_channel(self.role, &dc, &self.events);
        *self.channel.lock() = Some(dc);
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        let dc = self.current_channel().ok_or(TransportError::NoChannel)?;
        let written = dc.send_text(text.to_string()).await?;
        debug!(role = %self.role, written, "text frame sent");
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        if let Some(dc) = self.current_channel() {
            dc.close().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Обработчики open/message/close пересылают события в конечную точку.
fn attach_channel(role: Role, dc: &Arc<RTCDataChannel>, events: &EventSink) {
    let sink = events.clone();
    dc.on_open(Box::new(move || {
        debug!(role = %role, "data channel open");
        let _ = sink.send(TransportEvent::ChannelState(ChannelState::Open));
        Box::pin(async {})
    }));

    let sink = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if !msg.is_string {
            debug!(role = %role, len = msg.data.len(), "binary frame ignored");
            return Box::pin(async {});
        }
        let text = String::from_utf8_lossy(&msg.data).to_string();
        let _ = sink.send(TransportEvent::Message(text));
        Box::pin(async {})
    }));

    let sink = events.clone();
    dc.on_close(Box::new(move || {
        debug!(role = %role, "data channel closed");
        let _ = sink.send(TransportEvent::ChannelState(ChannelState::Closed));
        Box::pin(async {})
    }));
}

fn to_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::UnsupportedDescription(other.to_string())),
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp.clone();
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(rtc)
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
