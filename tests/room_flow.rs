use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use interview_room::media::RecorderState;
use interview_room::signaling::{ChannelEvent, SignalingChannel, SignalingMessage};
use interview_room::types::Participant;
use interview_room::utils::Error;
use interview_room::{
    DeviceManager, MediaSelection, ParticipantMetadata, RoomConfig, RoomSession,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

type PeerSender = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;
type RoomPeers = Arc<RwLock<HashMap<String, Vec<(String, ParticipantMetadata, PeerSender)>>>>;

/// In-process stand-in for the signaling server: assigns peer ids, acks
/// joins with the roster, fans out join/leave notices and routes targeted
/// messages to their addressee.
async fn start_server() -> (String, RoomPeers) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let peers: RoomPeers = Arc::new(RwLock::new(HashMap::new()));

    let accept_peers = peers.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let peers = accept_peers.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, peers).await;
            });
        }
    });
    (url, peers)
}

async fn handle_connection(stream: TcpStream, peers: RoomPeers) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let ws_sender = Arc::new(Mutex::new(ws_sender));
    let mut current: Option<(String, String)> = None;

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let signal: SignalingMessage = match serde_json::from_str(&text) {
            Ok(signal) => signal,
            Err(_) => continue,
        };

        match &signal {
            SignalingMessage::JoinRoom { room_id, metadata } => {
                let peer_id = Uuid::new_v4().to_string();
                let roster = {
                    let mut rooms = peers.write().await;
                    let room = rooms.entry(room_id.clone()).or_insert_with(Vec::new);
                    let roster: Vec<Participant> = room
                        .iter()
                        .map(|(id, meta, _)| Participant {
                            peer_id: id.clone(),
                            metadata: meta.clone(),
                        })
                        .collect();
                    room.push((peer_id.clone(), metadata.clone(), ws_sender.clone()));
                    roster
                };
                send_to(
                    &ws_sender,
                    &SignalingMessage::Joined {
                        peer_id: peer_id.clone(),
                        participants: roster,
                    },
                )
                .await;
                broadcast_except(
                    &peers,
                    room_id,
                    &peer_id,
                    &SignalingMessage::PeerJoined {
                        peer_id: peer_id.clone(),
                        metadata: metadata.clone(),
                    },
                )
                .await;
                current = Some((room_id.clone(), peer_id));
            }
            SignalingMessage::Offer { to_peer, .. }
            | SignalingMessage::Answer { to_peer, .. }
            | SignalingMessage::IceCandidate { to_peer, .. } => {
                if let Some((room_id, _)) = &current {
                    route_to(&peers, room_id, to_peer, &signal).await;
                }
            }
            SignalingMessage::Disconnect => break,
            _ => {}
        }
    }

    if let Some((room_id, peer_id)) = current {
        {
            let mut rooms = peers.write().await;
            if let Some(room) = rooms.get_mut(&room_id) {
                room.retain(|(id, _, _)| id.as_str() != peer_id);
            }
        }
        broadcast_except(
            &peers,
            &room_id,
            &peer_id,
            &SignalingMessage::PeerLeft {
                peer_id: peer_id.clone(),
            },
        )
        .await;
    }
    Ok(())
}

async fn send_to(sender: &PeerSender, message: &SignalingMessage) {
    let text = serde_json::to_string(message).unwrap();
    let _ = sender.lock().await.send(Message::Text(text)).await;
}

async fn broadcast_except(peers: &RoomPeers, room_id: &str, skip: &str, message: &SignalingMessage) {
    let targets: Vec<PeerSender> = {
        let rooms = peers.read().await;
        match rooms.get(room_id) {
            Some(room) => room
                .iter()
                .filter(|(id, _, _)| id.as_str() != skip)
                .map(|(_, _, sender)| sender.clone())
                .collect(),
            None => Vec::new(),
        }
    };
    for sender in targets {
        send_to(&sender, message).await;
    }
}

async fn route_to(peers: &RoomPeers, room_id: &str, to_peer: &str, message: &SignalingMessage) {
    let target = {
        let rooms = peers.read().await;
        rooms.get(room_id).and_then(|room| {
            room.iter()
                .find(|(id, _, _)| id.as_str() == to_peer)
                .map(|(_, _, sender)| sender.clone())
        })
    };
    if let Some(sender) = target {
        send_to(&sender, message).await;
    }
}

async fn kick(peers: &RoomPeers, room_id: &str, peer_id: &str) {
    let sender = {
        let rooms = peers.read().await;
        rooms.get(room_id).and_then(|room| {
            room.iter()
                .find(|(id, _, _)| id.as_str() == peer_id)
                .map(|(_, _, sender)| sender.clone())
        })
    };
    if let Some(sender) = sender {
        let _ = sender.lock().await.send(Message::Close(None)).await;
    }
}

async fn room_size(peers: &RoomPeers, room_id: &str) -> usize {
    peers
        .read()
        .await
        .get(room_id)
        .map(|room| room.len())
        .unwrap_or(0)
}

async fn wait_for_room_size(peers: &RoomPeers, room_id: &str, expected: usize) {
    for _ in 0..200 {
        if room_size(peers, room_id).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "room {} never reached {} peers (has {})",
        room_id,
        expected,
        room_size(peers, room_id).await
    );
}

async fn wait_for<F>(
    events: &mut broadcast::Receiver<ChannelEvent>,
    what: &str,
    pred: F,
) -> SignalingMessage
where
    F: Fn(&SignalingMessage) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Message(msg)) if pred(&msg) => return msg,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended waiting for {}: {}", what, e),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

async fn join_room(
    channel: &SignalingChannel,
    events: &mut broadcast::Receiver<ChannelEvent>,
    room_id: &str,
    name: &str,
    role: &str,
) -> (String, Vec<Participant>) {
    channel
        .join(room_id, &ParticipantMetadata::new(name, role))
        .await
        .unwrap();
    match wait_for(events, "the join ack", |m| {
        matches!(m, SignalingMessage::Joined { .. })
    })
    .await
    {
        SignalingMessage::Joined {
            peer_id,
            participants,
        } => (peer_id, participants),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn joining_yields_an_ack_and_the_roster() {
    let (url, peers) = start_server().await;
    let config = RoomConfig::new(&url);

    let ada = SignalingChannel::connect(&config).await.unwrap();
    let mut ada_events = ada.subscribe();
    let (ada_id, roster) = join_room(&ada, &mut ada_events, "interview-1", "Ada", "interviewer").await;
    assert!(roster.is_empty());

    let ben = SignalingChannel::connect(&config).await.unwrap();
    let mut ben_events = ben.subscribe();
    let (ben_id, roster) = join_room(&ben, &mut ben_events, "interview-1", "Ben", "candidate").await;
    assert_ne!(ada_id, ben_id);
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].peer_id, ada_id);
    assert_eq!(roster[0].metadata.name, "Ada");

    // The earlier member hears about the newcomer.
    match wait_for(&mut ada_events, "the join notice", |m| {
        matches!(m, SignalingMessage::PeerJoined { .. })
    })
    .await
    {
        SignalingMessage::PeerJoined { peer_id, metadata } => {
            assert_eq!(peer_id, ben_id);
            assert_eq!(metadata.name, "Ben");
        }
        _ => unreachable!(),
    }

    wait_for_room_size(&peers, "interview-1", 2).await;
    ada.close().await;
    ben.close().await;
}

#[tokio::test]
async fn signals_route_only_to_their_addressee() {
    let (url, _peers) = start_server().await;
    let config = RoomConfig::new(&url);

    let a = SignalingChannel::connect(&config).await.unwrap();
    let mut a_events = a.subscribe();
    let (a_id, _) = join_room(&a, &mut a_events, "interview-2", "Ada", "interviewer").await;

    let b = SignalingChannel::connect(&config).await.unwrap();
    let mut b_events = b.subscribe();
    let (b_id, _) = join_room(&b, &mut b_events, "interview-2", "Ben", "candidate").await;

    let c = SignalingChannel::connect(&config).await.unwrap();
    let mut c_events = c.subscribe();
    let (_c_id, _) = join_room(&c, &mut c_events, "interview-2", "Cam", "observer").await;

    a.send(SignalingMessage::Offer {
        from_peer: a_id.clone(),
        to_peer: b_id.clone(),
        sdp: "offer-for-ben".to_string(),
    })
    .await
    .unwrap();

    match wait_for(&mut b_events, "the offer", |m| {
        matches!(m, SignalingMessage::Offer { .. })
    })
    .await
    {
        SignalingMessage::Offer { from_peer, sdp, .. } => {
            assert_eq!(from_peer, a_id);
            assert_eq!(sdp, "offer-for-ben");
        }
        _ => unreachable!(),
    }

    b.send(SignalingMessage::Answer {
        from_peer: b_id.clone(),
        to_peer: a_id.clone(),
        sdp: "answer-for-ada".to_string(),
    })
    .await
    .unwrap();
    match wait_for(&mut a_events, "the answer", |m| {
        matches!(m, SignalingMessage::Answer { .. })
    })
    .await
    {
        SignalingMessage::Answer { from_peer, sdp, .. } => {
            assert_eq!(from_peer, b_id);
            assert_eq!(sdp, "answer-for-ada");
        }
        _ => unreachable!(),
    }

    // The observer never sees traffic addressed to the others.
    tokio::time::sleep(Duration::from_millis(150)).await;
    loop {
        match c_events.try_recv() {
            Ok(ChannelEvent::Message(msg)) => panic!("observer received {:?}", msg),
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn dropped_connection_reconnects_and_replays_the_join() {
    let (url, peers) = start_server().await;
    let mut config = RoomConfig::new(&url);
    config.reconnect_delay = Duration::from_millis(50);

    let channel = SignalingChannel::connect(&config).await.unwrap();
    let mut events = channel.subscribe();
    let (old_id, _) = join_room(&channel, &mut events, "interview-3", "Ada", "interviewer").await;
    wait_for_room_size(&peers, "interview-3", 1).await;

    kick(&peers, "interview-3", &old_id).await;

    let mut saw_reconnecting = false;
    let mut saw_reconnected = false;
    let new_id = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Reconnecting { .. }) => saw_reconnecting = true,
                Ok(ChannelEvent::Reconnected) => saw_reconnected = true,
                Ok(ChannelEvent::Message(SignalingMessage::Joined { peer_id, .. })) => {
                    return peer_id
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream ended during reconnect: {}", e),
            }
        }
    })
    .await
    .expect("the join was never replayed");

    assert!(saw_reconnecting);
    assert!(saw_reconnected);
    assert_ne!(new_id, old_id);
    assert!(!channel.is_closed());

    // The ghost of the first connection gets cleaned up server-side.
    wait_for_room_size(&peers, "interview-3", 1).await;
    channel.close().await;
}

#[tokio::test]
async fn leaving_notifies_the_rest_of_the_room() {
    let (url, peers) = start_server().await;
    let config = RoomConfig::new(&url);

    let ada = SignalingChannel::connect(&config).await.unwrap();
    let mut ada_events = ada.subscribe();
    join_room(&ada, &mut ada_events, "interview-4", "Ada", "interviewer").await;

    let ben = SignalingChannel::connect(&config).await.unwrap();
    let mut ben_events = ben.subscribe();
    let (ben_id, _) = join_room(&ben, &mut ben_events, "interview-4", "Ben", "candidate").await;
    wait_for_room_size(&peers, "interview-4", 2).await;

    ben.close().await;
    assert!(ben.is_closed());
    assert!(!ada.is_closed());

    match wait_for(&mut ada_events, "the leave notice", |m| {
        matches!(m, SignalingMessage::PeerLeft { .. })
    })
    .await
    {
        SignalingMessage::PeerLeft { peer_id } => assert_eq!(peer_id, ben_id),
        _ => unreachable!(),
    }
    wait_for_room_size(&peers, "interview-4", 1).await;
    ada.close().await;
}

#[tokio::test]
async fn session_runs_a_full_solo_visit() {
    let (url, peers) = start_server().await;
    let config = RoomConfig::new(&url);

    let session = RoomSession::enter(
        &config,
        "interview-5",
        ParticipantMetadata::new("Ada", "interviewer"),
        DeviceManager::synthetic(),
    )
    .await
    .unwrap();

    assert!(session.local_peer_id().is_some());
    assert_eq!(session.peer_count(), 0);
    assert!(!session.is_closed());
    wait_for_room_size(&peers, "interview-5", 1).await;

    // Both synthetic devices opened.
    let media = session.media();
    assert_eq!(media.audio_enabled(), Some(true));
    assert_eq!(media.video_enabled(), Some(true));
    assert_eq!(session.toggle_mic().unwrap(), false);
    assert_eq!(session.toggle_mic().unwrap(), true);

    session.start_recording().unwrap();
    assert_eq!(session.recorder_state(), RecorderState::Recording);
    tokio::time::sleep(Duration::from_millis(120)).await;
    let artifact = session.stop_recording().await.unwrap();
    let metadata = artifact.metadata().unwrap();
    assert_eq!(metadata.room_id, "interview-5");
    assert_eq!(metadata.tracks.len(), 2);
    assert!(metadata.chunk_count > 0);

    // Nobody else in the room, so quality stays at its resting value.
    assert_eq!(session.quality_now().score, 100);

    session.leave().await;
    assert!(session.is_closed());
    wait_for_room_size(&peers, "interview-5", 0).await;
}

#[tokio::test]
async fn entry_rejects_a_missing_device_until_the_selection_narrows() {
    let (url, peers) = start_server().await;
    let config = RoomConfig::new(&url);

    let selection = MediaSelection {
        audio: true,
        video: false,
        microphone: Some("no-such-mic".to_string()),
        camera: None,
    };
    let result = RoomSession::enter_with_media(
        &config,
        "interview-6",
        ParticipantMetadata::new("Ada", "interviewer"),
        DeviceManager::synthetic(),
        selection,
    )
    .await;
    assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
    assert_eq!(room_size(&peers, "interview-6").await, 0);

    // Dropping the request for the broken microphone lets entry proceed.
    let session = tokio_test::assert_ok!(
        RoomSession::enter_with_media(
            &config,
            "interview-6",
            ParticipantMetadata::new("Ada", "interviewer"),
            DeviceManager::synthetic(),
            MediaSelection::none(),
        )
        .await
    );
    assert!(session.local_peer_id().is_some());
    assert_eq!(session.media().audio_enabled(), None);
    assert!(matches!(session.toggle_mic(), Err(Error::NoActiveStream)));
    session.leave().await;
}

#[tokio::test]
async fn entry_fails_cleanly_when_the_server_is_unreachable() {
    // Grab a port and release it so nothing is listening there.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = RoomConfig::new(&url);
    let result = RoomSession::enter(
        &config,
        "interview-7",
        ParticipantMetadata::new("Ada", "interviewer"),
        DeviceManager::synthetic(),
    )
    .await;
    assert!(matches!(result, Err(Error::SignalingUnreachable(_))));
}
