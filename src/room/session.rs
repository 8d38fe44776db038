use crate::config::RoomConfig;
use crate::media::{
    DeviceManager, LocalMediaState, LocalTrack, RecorderState, RecordingArtifact, SessionRecorder,
};
use crate::monitoring::{QualityMonitor, QualitySnapshot};
use crate::peer::link::{LinkState, PeerLink};
use crate::peer::transport::{
    MediaTransport, RemoteTrack, RtcTransportFactory, TransportEvent, TransportFactory,
    TransportHealth,
};
use crate::signaling::{ChannelEvent, SignalingChannel, SignalingMessage};
use crate::types::{DeviceKind, LinkRole, Participant, ParticipantMetadata, TrackKind, VideoSource};
use crate::utils::{Error, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

const JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSPORT_EVENT_CAPACITY: usize = 64;
// Candidates can outrun the notice that introduces their sender; they are
// held per unknown peer, bounded both ways.
const MAX_ORPHAN_PEERS: usize = 32;
const MAX_ORPHAN_CANDIDATES: usize = 64;

/// What the application observes about the room.
#[derive(Debug)]
pub enum RoomEvent {
    ParticipantJoined {
        peer_id: String,
        metadata: ParticipantMetadata,
    },
    ParticipantLeft {
        peer_id: String,
    },
    TrackReady {
        peer_id: String,
        track: RemoteTrack,
    },
    LinkStateChanged {
        peer_id: String,
        state: LinkState,
    },
    ChannelDown {
        attempt: u32,
    },
    ChannelUp,
}

/// Which local devices to open on entry. Device ids of `None` mean the
/// provider's current selection or first available.
#[derive(Debug, Clone)]
pub struct MediaSelection {
    pub audio: bool,
    pub video: bool,
    pub microphone: Option<String>,
    pub camera: Option<String>,
}

impl MediaSelection {
    pub fn audio_and_video() -> Self {
        Self {
            audio: true,
            video: true,
            microphone: None,
            camera: None,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            microphone: None,
            camera: None,
        }
    }

    pub fn none() -> Self {
        Self {
            audio: false,
            video: false,
            microphone: None,
            camera: None,
        }
    }
}

impl Default for MediaSelection {
    fn default() -> Self {
        Self::audio_and_video()
    }
}

struct RoomInner {
    local_peer_id: Option<String>,
    peers: HashMap<String, PeerLink>,
    orphan_candidates: HashMap<String, VecDeque<String>>,
    closed: bool,
}

enum OfferPlan {
    /// Known answerer link still waiting for its first offer.
    AnswerExisting(Arc<dyn MediaTransport>),
    /// Build a fresh answerer link, tearing down `old` first if present.
    Fresh {
        old: Option<Arc<dyn MediaTransport>>,
        metadata: ParticipantMetadata,
        announce: bool,
    },
    /// Glare, and our offer stands.
    Ignore,
}

enum JoinPlan {
    Offer,
    OfferAfterClose(Arc<dyn MediaTransport>),
    RefreshOnly,
}

/// One participant's presence in an interview room: the signaling channel,
/// a peer link per remote participant, local capture state, the recorder,
/// and the quality monitor. All signaling and transport events funnel
/// through a single event loop, so link state never races.
pub struct RoomSession {
    room_id: String,
    metadata: ParticipantMetadata,
    channel: Arc<SignalingChannel>,
    media: Arc<LocalMediaState>,
    devices: Arc<DeviceManager>,
    recorder: Arc<SessionRecorder>,
    monitor: Arc<QualityMonitor>,
    factory: Arc<dyn TransportFactory>,
    inner: Arc<Mutex<RoomInner>>,
    events: mpsc::UnboundedSender<RoomEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RoomEvent>>>,
    // Held so the loop's transport receiver stays open for the session's
    // whole life; the factory clones it into every link it builds.
    transport_tx: mpsc::Sender<(String, TransportEvent)>,
    shutdown: watch::Sender<bool>,
    grace: Duration,
}

impl RoomSession {
    /// Connects to signaling, opens the default microphone and camera, and
    /// joins the room. Resolves once the server acknowledges the join;
    /// fails with `DeviceUnavailable` if either capture cannot be opened.
    pub async fn enter(
        config: &RoomConfig,
        room_id: &str,
        metadata: ParticipantMetadata,
        devices: DeviceManager,
    ) -> Result<Arc<Self>> {
        Self::enter_with_media(config, room_id, metadata, devices, MediaSelection::default()).await
    }

    /// Like `enter`, but with explicit device choices. Every requested
    /// device must open or entry fails; callers that can live without a
    /// track retry with a narrower selection.
    pub async fn enter_with_media(
        config: &RoomConfig,
        room_id: &str,
        metadata: ParticipantMetadata,
        devices: DeviceManager,
        selection: MediaSelection,
    ) -> Result<Arc<Self>> {
        let devices = Arc::new(devices);
        let media = Arc::new(LocalMediaState::new());

        let opened = async {
            if selection.audio {
                let stream = devices
                    .open(DeviceKind::Microphone, selection.microphone.as_deref())
                    .await?;
                media.set_audio(LocalTrack::new(stream));
            }
            if selection.video {
                let stream = devices
                    .open(DeviceKind::Camera, selection.camera.as_deref())
                    .await?;
                media.set_video(LocalTrack::new(stream));
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = opened {
            for track in media.take_tracks() {
                track.stop().await;
            }
            return Err(e);
        }

        let channel = Arc::new(SignalingChannel::connect(config).await?);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let factory = Arc::new(RtcTransportFactory::new(
            config.ice_servers.clone(),
            Arc::clone(&media),
            transport_tx.clone(),
        ));

        let mut ack = channel.subscribe();
        let session = Self::assemble(
            room_id,
            metadata,
            channel,
            media,
            devices,
            factory,
            transport_tx,
            transport_rx,
            config,
        );
        session.channel.join(room_id, &session.metadata).await?;

        let joined = tokio::time::timeout(JOIN_ACK_TIMEOUT, async {
            loop {
                match ack.recv().await {
                    Ok(ChannelEvent::Message(SignalingMessage::Joined { .. })) => return Ok(()),
                    Ok(ChannelEvent::Message(SignalingMessage::Error { message })) => {
                        return Err(Error::Room(message))
                    }
                    Ok(ChannelEvent::Closed) => return Err(Error::SessionClosed),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::SessionClosed),
                }
            }
        })
        .await
        .map_err(|_| Error::SignalingUnreachable("no join acknowledgement".to_string()))
        .and_then(|r| r);

        if let Err(e) = joined {
            session.leave().await;
            return Err(e);
        }

        // The ack waiter and the room loop read the same broadcast; give
        // the loop a moment to apply the roster before handing out the
        // session.
        for _ in 0..100 {
            if session.local_peer_id().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        room_id: &str,
        metadata: ParticipantMetadata,
        channel: Arc<SignalingChannel>,
        media: Arc<LocalMediaState>,
        devices: Arc<DeviceManager>,
        factory: Arc<dyn TransportFactory>,
        transport_tx: mpsc::Sender<(String, TransportEvent)>,
        transport_rx: mpsc::Receiver<(String, TransportEvent)>,
        config: &RoomConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(RoomSession {
            room_id: room_id.to_string(),
            metadata,
            channel,
            media,
            devices,
            recorder: Arc::new(SessionRecorder::new(room_id)),
            monitor: Arc::new(QualityMonitor::new()),
            factory,
            inner: Arc::new(Mutex::new(RoomInner {
                local_peer_id: None,
                peers: HashMap::new(),
                orphan_candidates: HashMap::new(),
                closed: false,
            })),
            events: events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            transport_tx,
            shutdown: shutdown_tx,
            grace: config.disconnect_grace,
        });

        let channel_rx = session.channel.subscribe();
        tokio::spawn(Self::run_event_loop(
            Arc::clone(&session),
            channel_rx,
            transport_rx,
            shutdown_rx.clone(),
        ));
        spawn_sampler(
            Arc::clone(&session.inner),
            Arc::clone(&session.monitor),
            config.sample_interval,
            shutdown_rx,
        );
        session
    }

    // ---- observation ----------------------------------------------------

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.inner.lock().local_peer_id.clone()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner
            .lock()
            .peers
            .values()
            .map(|link| Participant {
                peer_id: link.peer_id.clone(),
                metadata: link.metadata.clone(),
            })
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.inner.lock().peers.get(peer_id).map(|link| link.state())
    }

    /// Descriptors of the remote tracks a peer has delivered so far. The
    /// chunk streams themselves arrive once, through `TrackReady`.
    pub fn remote_tracks(&self, peer_id: &str) -> Vec<(String, TrackKind)> {
        self.inner
            .lock()
            .peers
            .get(peer_id)
            .map(|link| link.remote_tracks().to_vec())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// The room event stream. There is exactly one; the first caller takes
    /// it and later calls get `None`.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<RoomEvent>> {
        self.events_rx.lock().take()
    }

    pub fn quality(&self) -> watch::Receiver<QualitySnapshot> {
        self.monitor.subscribe()
    }

    pub fn quality_now(&self) -> QualitySnapshot {
        self.monitor.latest()
    }

    pub fn media(&self) -> Arc<LocalMediaState> {
        Arc::clone(&self.media)
    }

    pub fn devices(&self) -> Arc<DeviceManager> {
        Arc::clone(&self.devices)
    }

    // ---- local media controls -------------------------------------------

    /// Flips the microphone mute state, returning the new enabled value.
    pub fn toggle_mic(&self) -> Result<bool> {
        self.ensure_open()?;
        self.media.toggle_audio()
    }

    pub fn toggle_camera(&self) -> Result<bool> {
        self.ensure_open()?;
        self.media.toggle_video()
    }

    /// Replaces the capture device behind a live track. The new device is
    /// opened first; on any failure the previous stream keeps running.
    pub async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> Result<()> {
        self.ensure_open()?;
        match kind {
            DeviceKind::Microphone => {
                let stream = self
                    .devices
                    .open(DeviceKind::Microphone, Some(device_id))
                    .await
                    .map_err(|e| {
                        Error::DeviceSwitchFailed(format!("microphone {}: {}", device_id, e))
                    })?;
                self.media.swap_audio(stream).await
            }
            DeviceKind::Camera => {
                if self.media.video_source() == VideoSource::Screen {
                    return Err(Error::DeviceSwitchFailed(
                        "camera switch is unavailable while screen sharing".to_string(),
                    ));
                }
                let stream = self
                    .devices
                    .open(DeviceKind::Camera, Some(device_id))
                    .await
                    .map_err(|e| {
                        Error::DeviceSwitchFailed(format!("camera {}: {}", device_id, e))
                    })?;
                self.media.swap_video(stream).await
            }
            DeviceKind::Screen => Err(Error::DeviceSwitchFailed(
                "screens are selected through share_screen".to_string(),
            )),
        }
    }

    /// Points the video track at a screen capture. Peers keep the same
    /// track; only the frames change, so nothing renegotiates.
    pub async fn share_screen(&self, screen_id: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let stream = self.devices.open(DeviceKind::Screen, screen_id).await?;
        self.media.swap_video(stream).await?;
        self.media.set_video_source(VideoSource::Screen);
        info!("Screen share started in {}", self.room_id);
        Ok(())
    }

    /// Returns the video track to the selected camera. No-op when no share
    /// is active.
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.ensure_open()?;
        if self.media.video_source() != VideoSource::Screen {
            return Ok(());
        }
        let stream = self
            .devices
            .open(DeviceKind::Camera, None)
            .await
            .map_err(|e| Error::DeviceSwitchFailed(format!("camera restore: {}", e)))?;
        self.media.swap_video(stream).await?;
        self.media.set_video_source(VideoSource::Camera);
        info!("Screen share stopped in {}", self.room_id);
        Ok(())
    }

    // ---- recording -------------------------------------------------------

    pub fn start_recording(&self) -> Result<()> {
        self.ensure_open()?;
        self.recorder
            .start(self.media.taps(), self.media.summaries())
    }

    pub async fn stop_recording(&self) -> Result<RecordingArtifact> {
        self.recorder.stop().await
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Leaves the room: local media stops, every link closes, the server
    /// gets a disconnect notice. Safe to call more than once.
    pub async fn leave(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        info!("Leaving room {}", self.room_id);

        if self.recorder.abort() {
            warn!("Discarded an in-progress recording on leave");
        }

        let transports: Vec<Arc<dyn MediaTransport>> = {
            let mut inner = self.inner.lock();
            inner.orphan_candidates.clear();
            inner
                .peers
                .drain()
                .map(|(_, mut link)| {
                    if !link.state().is_terminal() {
                        link.transition(LinkState::Closed);
                    }
                    link.transport()
                })
                .collect()
        };
        for transport in transports {
            transport.close().await;
        }

        for track in self.media.take_tracks() {
            track.stop().await;
        }

        self.channel.close().await;
        let _ = self.shutdown.send(true);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.lock().closed {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    fn emit_link_state(&self, peer_id: &str, state: LinkState) {
        self.emit(RoomEvent::LinkStateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    // ---- event loop ------------------------------------------------------

    async fn run_event_loop(
        session: Arc<RoomSession>,
        mut channel_rx: broadcast::Receiver<ChannelEvent>,
        mut transport_rx: mpsc::Receiver<(String, TransportEvent)>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = channel_rx.recv() => match event {
                    Ok(ChannelEvent::Message(msg)) => session.handle_signal(msg).await,
                    Ok(ChannelEvent::Reconnecting { attempt }) => {
                        session.emit(RoomEvent::ChannelDown { attempt });
                    }
                    Ok(ChannelEvent::Reconnected) => {
                        session.emit(RoomEvent::ChannelUp);
                    }
                    Ok(ChannelEvent::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session loop lagged, {} signaling events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some((peer_id, event)) = transport_rx.recv() => {
                    session.handle_transport_event(peer_id, event).await;
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!("Room event loop for {} stopped", session.room_id);
    }

    async fn handle_signal(&self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Joined {
                peer_id,
                participants,
            } => self.handle_joined(peer_id, participants).await,
            SignalingMessage::PeerJoined { peer_id, metadata } => {
                self.handle_peer_joined(peer_id, metadata).await
            }
            SignalingMessage::PeerLeft { peer_id } => self.handle_peer_left(&peer_id).await,
            SignalingMessage::Offer { from_peer, sdp, .. } => {
                self.handle_offer(from_peer, sdp).await
            }
            SignalingMessage::Answer { from_peer, sdp, .. } => {
                self.handle_answer(&from_peer, sdp).await
            }
            SignalingMessage::IceCandidate {
                from_peer,
                candidate,
                ..
            } => self.handle_candidate(from_peer, candidate).await,
            SignalingMessage::Error { message } => {
                warn!("Signaling server reported an error: {}", message);
            }
            other => debug!("Ignoring unexpected signaling message: {:?}", other),
        }
    }

    /// Join acknowledgement. The roster lists who was already in the room;
    /// each of them will offer to us, so we prepare answerer links. A second
    /// ack means we re-joined after a reconnect: old links are torn down and
    /// the fresh roster replaces them.
    async fn handle_joined(&self, local_id: String, participants: Vec<Participant>) {
        info!(
            "Joined {} as {} with {} participants already present",
            self.room_id,
            local_id,
            participants.len()
        );
        let stale: Vec<(String, Arc<dyn MediaTransport>)> = {
            let mut inner = self.inner.lock();
            let rejoined = inner.local_peer_id.is_some();
            inner.local_peer_id = Some(local_id.clone());
            if rejoined {
                inner.orphan_candidates.clear();
                inner
                    .peers
                    .drain()
                    .map(|(peer_id, mut link)| {
                        if !link.state().is_terminal() {
                            link.transition(LinkState::Closed);
                        }
                        (peer_id, link.transport())
                    })
                    .collect()
            } else {
                Vec::new()
            }
        };
        for (peer_id, transport) in stale {
            transport.close().await;
            self.monitor.drop_peer(&peer_id);
            self.emit(RoomEvent::LinkStateChanged {
                peer_id: peer_id.clone(),
                state: LinkState::Closed,
            });
            self.emit(RoomEvent::ParticipantLeft { peer_id });
        }

        for participant in participants {
            if participant.peer_id == local_id {
                continue;
            }
            self.create_answerer_link(participant.peer_id, participant.metadata, true)
                .await;
        }
    }

    async fn create_answerer_link(
        &self,
        peer_id: String,
        metadata: ParticipantMetadata,
        announce: bool,
    ) -> Option<Arc<dyn MediaTransport>> {
        let transport = match self.factory.create(&peer_id).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Could not prepare a link for {}: {}", peer_id, e);
                return None;
            }
        };
        let mut link = PeerLink::new(&peer_id, metadata.clone(), LinkRole::Answerer, transport.clone());
        {
            let mut inner = self.inner.lock();
            if let Some(orphans) = inner.orphan_candidates.remove(&peer_id) {
                for candidate in orphans {
                    link.buffer_candidate(candidate);
                }
            }
            inner.peers.insert(peer_id.clone(), link);
        }
        if announce {
            self.emit(RoomEvent::ParticipantJoined { peer_id, metadata });
        }
        Some(transport)
    }

    /// A newcomer arrived; existing members initiate, so we build an offerer
    /// link and send the offer. If an early offer from them already created
    /// a link, the notice only fills in their metadata.
    async fn handle_peer_joined(&self, peer_id: String, metadata: ParticipantMetadata) {
        let local_id = match self.local_peer_id() {
            Some(id) => id,
            None => {
                warn!("peer-joined for {} before our own join ack", peer_id);
                return;
            }
        };

        let plan = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(&peer_id) {
                None => JoinPlan::Offer,
                Some(link) if link.state().is_terminal() => {
                    let transport = link.transport();
                    inner.peers.remove(&peer_id);
                    JoinPlan::OfferAfterClose(transport)
                }
                Some(link) => {
                    link.metadata = metadata.clone();
                    JoinPlan::RefreshOnly
                }
            }
        };

        match plan {
            JoinPlan::RefreshOnly => {
                self.emit(RoomEvent::ParticipantJoined { peer_id, metadata });
                return;
            }
            JoinPlan::OfferAfterClose(stale) => {
                stale.close().await;
            }
            JoinPlan::Offer => {}
        }

        let transport = match self.factory.create(&peer_id).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Could not prepare a link for {}: {}", peer_id, e);
                return;
            }
        };
        let mut link = PeerLink::new(&peer_id, metadata.clone(), LinkRole::Offerer, transport.clone());
        {
            let mut inner = self.inner.lock();
            if let Some(orphans) = inner.orphan_candidates.remove(&peer_id) {
                for candidate in orphans {
                    link.buffer_candidate(candidate);
                }
            }
            inner.peers.insert(peer_id.clone(), link);
        }
        self.emit(RoomEvent::ParticipantJoined {
            peer_id: peer_id.clone(),
            metadata,
        });

        match transport.create_offer().await {
            Ok(sdp) => {
                let moved = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(&peer_id) {
                        Some(link) => link.transition(LinkState::HaveLocalOffer),
                        None => false,
                    }
                };
                if !moved {
                    return;
                }
                self.emit_link_state(&peer_id, LinkState::HaveLocalOffer);
                let offer = SignalingMessage::Offer {
                    from_peer: local_id,
                    to_peer: peer_id.clone(),
                    sdp,
                };
                if let Err(e) = self.channel.send(offer).await {
                    warn!("Could not send offer to {}: {}", peer_id, e);
                    self.fail_link(&peer_id).await;
                }
            }
            Err(e) => {
                warn!("Offer creation for {} failed: {}", peer_id, e);
                self.fail_link(&peer_id).await;
            }
        }
    }

    async fn handle_peer_left(&self, peer_id: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            inner.orphan_candidates.remove(peer_id);
            inner.peers.remove(peer_id).map(|mut link| {
                if !link.state().is_terminal() {
                    link.transition(LinkState::Closed);
                }
                link.transport()
            })
        };
        if let Some(transport) = removed {
            info!("Peer {} left {}", peer_id, self.room_id);
            self.monitor.drop_peer(peer_id);
            transport.close().await;
            self.emit_link_state(peer_id, LinkState::Closed);
            self.emit(RoomEvent::ParticipantLeft {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Remote offer. The interesting case is glare: both sides offered at
    /// once. The side with the lexicographically smaller id yields, scraps
    /// its offerer link and answers instead; the other side ignores the
    /// incoming offer and waits for its answer. Both ends pick the same
    /// winner without another round trip.
    async fn handle_offer(&self, from_peer: String, sdp: String) {
        let local_id = match self.local_peer_id() {
            Some(id) => id,
            None => {
                warn!("offer from {} before our own join ack", from_peer);
                return;
            }
        };

        let plan = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(&from_peer) {
                None => OfferPlan::Fresh {
                    old: None,
                    metadata: ParticipantMetadata::new("unknown", "participant"),
                    announce: true,
                },
                Some(link) => {
                    let offer_in_flight = link.role == LinkRole::Offerer
                        && matches!(link.state(), LinkState::New | LinkState::HaveLocalOffer);
                    if offer_in_flight {
                        if local_id.as_str() < from_peer.as_str() {
                            info!("Offer glare with {}, yielding", from_peer);
                            link.transition(LinkState::Closed);
                            let old = link.transport();
                            let metadata = link.metadata.clone();
                            inner.peers.remove(&from_peer);
                            OfferPlan::Fresh {
                                old: Some(old),
                                metadata,
                                announce: false,
                            }
                        } else {
                            info!("Offer glare with {}, ours stands", from_peer);
                            OfferPlan::Ignore
                        }
                    } else if link.role == LinkRole::Answerer && link.state() == LinkState::New {
                        OfferPlan::AnswerExisting(link.transport())
                    } else {
                        // Restart from the remote side, or a link already
                        // burned out. Either way the old link is done.
                        link.transition(LinkState::Closed);
                        let old = link.transport();
                        let metadata = link.metadata.clone();
                        inner.peers.remove(&from_peer);
                        OfferPlan::Fresh {
                            old: Some(old),
                            metadata,
                            announce: false,
                        }
                    }
                }
            }
        };

        match plan {
            OfferPlan::Ignore => {}
            OfferPlan::AnswerExisting(transport) => {
                self.answer_offer(&from_peer, transport, sdp, local_id).await;
            }
            OfferPlan::Fresh {
                old,
                metadata,
                announce,
            } => {
                if let Some(old) = old {
                    self.emit_link_state(&from_peer, LinkState::Closed);
                    old.close().await;
                }
                if let Some(transport) = self
                    .create_answerer_link(from_peer.clone(), metadata, announce)
                    .await
                {
                    self.answer_offer(&from_peer, transport, sdp, local_id).await;
                }
            }
        }
    }

    async fn answer_offer(
        &self,
        peer_id: &str,
        transport: Arc<dyn MediaTransport>,
        sdp: String,
        local_id: String,
    ) {
        let moved = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(peer_id) {
                Some(link) => link.transition(LinkState::HaveRemoteOffer),
                None => false,
            }
        };
        if !moved {
            return;
        }
        self.emit_link_state(peer_id, LinkState::HaveRemoteOffer);

        match transport.accept_offer(&sdp).await {
            Ok(answer) => {
                let drained = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(peer_id) {
                        Some(link) => {
                            link.mark_remote_description();
                            link.transition(LinkState::Negotiating);
                            link.drain_candidates()
                        }
                        None => return,
                    }
                };
                self.emit_link_state(peer_id, LinkState::Negotiating);
                self.flush_candidates(peer_id, &transport, drained).await;

                let msg = SignalingMessage::Answer {
                    from_peer: local_id,
                    to_peer: peer_id.to_string(),
                    sdp: answer,
                };
                if let Err(e) = self.channel.send(msg).await {
                    warn!("Could not send answer to {}: {}", peer_id, e);
                    self.fail_link(peer_id).await;
                }
            }
            Err(e) => {
                warn!("Could not answer offer from {}: {}", peer_id, e);
                self.fail_link(peer_id).await;
            }
        }
    }

    async fn handle_answer(&self, from_peer: &str, sdp: String) {
        let transport = {
            let inner = self.inner.lock();
            match inner.peers.get(from_peer) {
                Some(link)
                    if link.role == LinkRole::Offerer
                        && link.state() == LinkState::HaveLocalOffer =>
                {
                    Some(link.transport())
                }
                Some(link) => {
                    warn!(
                        "Ignoring answer from {} in state {:?}",
                        from_peer,
                        link.state()
                    );
                    None
                }
                None => {
                    warn!("Ignoring answer from unknown peer {}", from_peer);
                    None
                }
            }
        };
        let transport = match transport {
            Some(t) => t,
            None => return,
        };

        match transport.accept_answer(&sdp).await {
            Ok(()) => {
                let drained = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(from_peer) {
                        Some(link) => {
                            link.mark_remote_description();
                            link.transition(LinkState::Negotiating);
                            link.drain_candidates()
                        }
                        None => return,
                    }
                };
                self.emit_link_state(from_peer, LinkState::Negotiating);
                self.flush_candidates(from_peer, &transport, drained).await;
            }
            Err(e) => {
                warn!("Could not apply answer from {}: {}", from_peer, e);
                self.fail_link(from_peer).await;
            }
        }
    }

    /// Candidates apply immediately once the remote description is in;
    /// before that they buffer on the link, and before the link exists they
    /// sit in a bounded side pocket keyed by sender.
    async fn handle_candidate(&self, from_peer: String, candidate: String) {
        let apply = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(&from_peer) {
                Some(link) if link.state().is_terminal() => {
                    debug!("Dropping candidate for finished link {}", from_peer);
                    None
                }
                Some(link) if link.has_remote_description() => Some(link.transport()),
                Some(link) => {
                    link.buffer_candidate(candidate.clone());
                    None
                }
                None => {
                    let orphans = &mut inner.orphan_candidates;
                    if !orphans.contains_key(&from_peer) && orphans.len() >= MAX_ORPHAN_PEERS {
                        warn!("Dropping candidate from unknown peer {}", from_peer);
                    } else {
                        let queue = orphans.entry(from_peer.clone()).or_default();
                        if queue.len() >= MAX_ORPHAN_CANDIDATES {
                            warn!("Candidate buffer for {} is full, dropping", from_peer);
                        } else {
                            queue.push_back(candidate.clone());
                        }
                    }
                    None
                }
            }
        };
        if let Some(transport) = apply {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                warn!("Failed to apply candidate from {}: {}", from_peer, e);
            }
        }
    }

    async fn flush_candidates(
        &self,
        peer_id: &str,
        transport: &Arc<dyn MediaTransport>,
        candidates: Vec<String>,
    ) {
        if candidates.is_empty() {
            return;
        }
        debug!(
            "Applying {} buffered candidates for {}",
            candidates.len(),
            peer_id
        );
        for candidate in candidates {
            if let Err(e) = transport.add_remote_candidate(&candidate).await {
                warn!("Failed to apply buffered candidate for {}: {}", peer_id, e);
            }
        }
    }

    async fn fail_link(&self, peer_id: &str) {
        let transport = {
            let mut inner = self.inner.lock();
            match inner.peers.get_mut(peer_id) {
                Some(link) if !link.state().is_terminal() => {
                    link.transition(LinkState::Failed);
                    Some(link.transport())
                }
                _ => None,
            }
        };
        if let Some(transport) = transport {
            self.emit_link_state(peer_id, LinkState::Failed);
            self.monitor.drop_peer(peer_id);
            transport.close().await;
        }
    }

    async fn handle_transport_event(&self, peer_id: String, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let local_id = match self.local_peer_id() {
                    Some(id) => id,
                    None => return,
                };
                let live = {
                    let inner = self.inner.lock();
                    inner
                        .peers
                        .get(&peer_id)
                        .map(|link| !link.state().is_terminal())
                        .unwrap_or(false)
                };
                if !live {
                    return;
                }
                let msg = SignalingMessage::IceCandidate {
                    from_peer: local_id,
                    to_peer: peer_id.clone(),
                    candidate,
                };
                if let Err(e) = self.channel.send(msg).await {
                    warn!("Could not send candidate to {}: {}", peer_id, e);
                }
            }
            TransportEvent::Health(health) => self.handle_health(&peer_id, health).await,
            TransportEvent::RemoteTrack(track) => {
                let moved = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(&peer_id) {
                        Some(link) if !link.state().is_terminal() => {
                            link.register_remote_track(track.id.clone(), track.kind);
                            link.state() == LinkState::Negotiating
                                && link.transition(LinkState::Connected)
                        }
                        _ => {
                            debug!("Dropping remote track for finished link {}", peer_id);
                            return;
                        }
                    }
                };
                if moved {
                    self.emit_link_state(&peer_id, LinkState::Connected);
                }
                self.emit(RoomEvent::TrackReady { peer_id, track });
            }
        }
    }

    async fn handle_health(&self, peer_id: &str, health: TransportHealth) {
        match health {
            TransportHealth::Connected => {
                let moved = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(peer_id) {
                        Some(link)
                            if matches!(
                                link.state(),
                                LinkState::Negotiating | LinkState::Disconnected
                            ) =>
                        {
                            link.transition(LinkState::Connected)
                        }
                        _ => false,
                    }
                };
                if moved {
                    self.emit_link_state(peer_id, LinkState::Connected);
                }
            }
            TransportHealth::Disconnected => {
                let grace_epoch = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(peer_id) {
                        Some(link) if link.state() == LinkState::Connected => {
                            link.transition(LinkState::Disconnected);
                            Some(link.bump_epoch())
                        }
                        _ => None,
                    }
                };
                if let Some(epoch) = grace_epoch {
                    warn!(
                        "Peer {} dropped, waiting {:?} for recovery",
                        peer_id, self.grace
                    );
                    self.emit_link_state(peer_id, LinkState::Disconnected);
                    self.spawn_grace_timer(peer_id.to_string(), epoch);
                }
            }
            TransportHealth::Failed => {
                self.fail_link(peer_id).await;
            }
        }
    }

    /// Arms the disconnect grace window. The link stays in the map; if it is
    /// still in the same disconnect episode when the window ends it goes to
    /// Failed. Recovery or a newer episode makes the timer a no-op.
    fn spawn_grace_timer(&self, peer_id: String, epoch: u64) {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let monitor = Arc::clone(&self.monitor);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let transport = {
                let mut guard = inner.lock();
                match guard.peers.get_mut(&peer_id) {
                    Some(link)
                        if link.epoch() == epoch && link.state() == LinkState::Disconnected =>
                    {
                        link.transition(LinkState::Failed);
                        Some(link.transport())
                    }
                    _ => None,
                }
            };
            if let Some(transport) = transport {
                warn!("Peer {} did not recover within the grace window", peer_id);
                let _ = events.send(RoomEvent::LinkStateChanged {
                    peer_id: peer_id.clone(),
                    state: LinkState::Failed,
                });
                monitor.drop_peer(&peer_id);
                transport.close().await;
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn test_session(
        channel: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        media: Arc<LocalMediaState>,
        config: &RoomConfig,
    ) -> (Arc<Self>, mpsc::Sender<(String, TransportEvent)>) {
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let session = Self::assemble(
            "room-1",
            ParticipantMetadata::new("Local", "interviewer"),
            Arc::new(channel),
            media,
            Arc::new(DeviceManager::synthetic()),
            factory,
            transport_tx.clone(),
            transport_rx,
            config,
        );
        (session, transport_tx)
    }
}

/// Polls every connected link's transport on the configured cadence and
/// feeds the counters to the quality monitor.
fn spawn_sampler(
    inner: Arc<Mutex<RoomInner>>,
    monitor: Arc<QualityMonitor>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let targets: Vec<(String, Arc<dyn MediaTransport>)> = {
                        let guard = inner.lock();
                        guard
                            .peers
                            .iter()
                            .filter(|(_, link)| link.state() == LinkState::Connected)
                            .map(|(id, link)| (id.clone(), link.transport()))
                            .collect()
                    };
                    let mut samples = Vec::with_capacity(targets.len());
                    for (peer_id, transport) in targets {
                        samples.push((peer_id, transport.stats().await));
                    }
                    monitor.record(&samples);
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    });
}
