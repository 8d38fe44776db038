use crate::media::{LocalMediaState, MediaChunk};
use crate::types::TrackKind;
use crate::utils::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const REMOTE_CHUNK_CAPACITY: usize = 256;

/// Cumulative transport counters for one peer link, read from the
/// underlying stats report.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub rtt_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHealth {
    Connected,
    Disconnected,
    Failed,
}

/// Incoming media from a remote participant. Chunks stop arriving when
/// the remote side stops the track or the link closes.
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub chunks: mpsc::Receiver<MediaChunk>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    LocalCandidate(String),
    Health(TransportHealth),
    RemoteTrack(RemoteTrack),
}

/// Media-plane half of a peer link. The session drives negotiation
/// through this seam; candidates and state changes flow back as
/// `TransportEvent`s tagged with the peer id.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn accept_offer(&self, sdp: &str) -> Result<String>;
    async fn accept_answer(&self, sdp: &str) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: &str) -> Result<()>;
    async fn stats(&self) -> TransportStats;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn MediaTransport>>;
}

/// Builds one peer connection per remote participant, with the local
/// tracks attached and callbacks forwarding into the session loop.
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
    media: Arc<LocalMediaState>,
    events: mpsc::Sender<(String, TransportEvent)>,
}

impl RtcTransportFactory {
    pub fn new(
        ice_servers: Vec<String>,
        media: Arc<LocalMediaState>,
        events: mpsc::Sender<(String, TransportEvent)>,
    ) -> Self {
        RtcTransportFactory {
            ice_servers,
            media,
            events,
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn MediaTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ice_transport_policy: RTCIceTransportPolicy::All,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ice_candidate_pool_size: 10,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        // The same local tracks are attached to every link; the pump
        // behind them fans out to however many connections are bound.
        for track in self.media.rtc_tracks() {
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        {
            let events = self.events.clone();
            let peer = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => match serde_json::to_string(&init) {
                                Ok(payload) => {
                                    let event = TransportEvent::LocalCandidate(payload);
                                    if events.send((peer, event)).await.is_err() {
                                        debug!("session loop gone, dropping local candidate");
                                    }
                                }
                                Err(e) => warn!("failed to encode local candidate: {}", e),
                            },
                            Err(e) => warn!("failed to serialize local candidate: {}", e),
                        }
                    }
                })
            }));
        }

        {
            let events = self.events.clone();
            let peer = peer_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let health = match state {
                        RTCPeerConnectionState::Connected => Some(TransportHealth::Connected),
                        RTCPeerConnectionState::Disconnected => Some(TransportHealth::Disconnected),
                        RTCPeerConnectionState::Failed => Some(TransportHealth::Failed),
                        _ => None,
                    };
                    if let Some(health) = health {
                        debug!("peer {} transport state changed to {:?}", peer, state);
                        let _ = events.send((peer, TransportEvent::Health(health))).await;
                    }
                })
            }));
        }

        {
            let events = self.events.clone();
            let peer = peer_id.to_string();
            let started = Instant::now();
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let kind = if track.kind() == RTPCodecType::Audio {
                        TrackKind::Audio
                    } else {
                        TrackKind::Video
                    };
                    let (chunk_tx, chunk_rx) = mpsc::channel(REMOTE_CHUNK_CAPACITY);
                    let remote = RemoteTrack {
                        id: track.id(),
                        kind,
                        chunks: chunk_rx,
                    };
                    debug!("peer {} produced a remote {:?} track", peer, kind);
                    if events
                        .send((peer.clone(), TransportEvent::RemoteTrack(remote)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    tokio::spawn(async move {
                        let mut last_arrival: Option<Instant> = None;
                        loop {
                            match track.read_rtp().await {
                                Ok((rtp_packet, _)) => {
                                    let now = Instant::now();
                                    let duration = last_arrival
                                        .map(|at| now - at)
                                        .unwrap_or(Duration::ZERO);
                                    last_arrival = Some(now);
                                    let chunk = MediaChunk {
                                        kind,
                                        timestamp_ms: started.elapsed().as_millis() as u64,
                                        duration,
                                        payload: rtp_packet.payload,
                                    };
                                    if chunk_tx.send(chunk).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!("remote track from {} ended: {}", peer, e);
                                    break;
                                }
                            }
                        }
                    });
                })
            }));
        }

        Ok(Arc::new(RtcTransport { pc }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::NegotiationFailed(format!("apply local offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let remote = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::NegotiationFailed(format!("parse remote offer: {}", e)))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("apply remote offer: {}", e)))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::NegotiationFailed(format!("apply local answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let remote = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::NegotiationFailed(format!("parse remote answer: {}", e)))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("apply remote answer: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        // Candidates arrive as the JSON init form; plain candidate
        // strings from older senders still go through.
        let init = serde_json::from_str::<RTCIceCandidateInit>(candidate).unwrap_or_else(|_| {
            RTCIceCandidateInit {
                candidate: candidate.to_string(),
                ..Default::default()
            }
        });
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::NegotiationFailed(format!("apply remote candidate: {}", e)))
    }

    async fn stats(&self) -> TransportStats {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        for (_, value) in report.reports.iter() {
            match value {
                StatsReportType::InboundRTP(inbound) => {
                    stats.packets_received += inbound.packets_received;
                    stats.bytes_received += inbound.bytes_received;
                }
                StatsReportType::OutboundRTP(outbound) => {
                    stats.packets_sent += outbound.packets_sent;
                    stats.bytes_sent += outbound.bytes_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packet_loss_pct = Some(remote.fraction_lost * 100.0);
                    if let Some(rtt) = remote.round_trip_time {
                        stats.rtt_ms = Some(rtt * 1000.0);
                    }
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if stats.rtt_ms.is_none() && pair.current_round_trip_time > 0.0 {
                        stats.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                    }
                }
                _ => {}
            }
        }
        stats
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {}", e);
        }
    }
}
