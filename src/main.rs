use anyhow::Result;
use clap::{Arg, Command};
use interview_room::media::RecorderState;
use interview_room::{DeviceManager, ParticipantMetadata, RoomConfig, RoomEvent, RoomSession};
use log::{info, warn};
use std::path::Path;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let matches = Command::new("interview-room")
        .about("Joins an interview room and follows it from the terminal")
        .arg(
            Arg::new("room")
                .long("room")
                .takes_value(true)
                .default_value("interview-1")
                .help("Room id to join"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .takes_value(true)
                .default_value("Guest")
                .help("Display name shown to the other participants"),
        )
        .arg(
            Arg::new("role")
                .long("role")
                .takes_value(true)
                .default_value("candidate")
                .help("interviewer, candidate or observer"),
        )
        .arg(
            Arg::new("signaling-url")
                .long("signaling-url")
                .takes_value(true)
                .help("Overrides INTERVIEW_SIGNALING_URL"),
        )
        .arg(
            Arg::new("record")
                .long("record")
                .help("Record local tracks and write the file on exit"),
        )
        .get_matches();

    let mut config = RoomConfig::from_env();
    if let Some(url) = matches.value_of("signaling-url") {
        config.signaling_url = url.to_string();
    }
    let room_id = matches.value_of("room").unwrap_or("interview-1").to_string();
    let name = matches.value_of("name").unwrap_or("Guest");
    let role = matches.value_of("role").unwrap_or("candidate");

    println!("Connecting to {} as {} ({})", config.signaling_url, name, role);
    let session = RoomSession::enter(
        &config,
        &room_id,
        ParticipantMetadata::new(name, role),
        DeviceManager::synthetic(),
    )
    .await?;
    println!(
        "Joined {} as {}",
        room_id,
        session.local_peer_id().unwrap_or_default()
    );

    if matches.is_present("record") {
        session.start_recording()?;
        println!("Recording local tracks");
    }

    if let Some(mut events) = session.events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RoomEvent::ParticipantJoined { peer_id, metadata } => {
                        println!("{} joined as {} ({})", peer_id, metadata.name, metadata.role);
                    }
                    RoomEvent::ParticipantLeft { peer_id } => {
                        println!("{} left", peer_id);
                    }
                    RoomEvent::LinkStateChanged { peer_id, state } => {
                        info!("Link to {} is now {:?}", peer_id, state);
                    }
                    RoomEvent::TrackReady { peer_id, track } => {
                        println!("Receiving {:?} from {}", track.kind, peer_id);
                        let mut chunks = track.chunks;
                        tokio::spawn(async move {
                            let mut received = 0u64;
                            while chunks.recv().await.is_some() {
                                received += 1;
                            }
                            info!("Remote track ended after {} chunks", received);
                        });
                    }
                    RoomEvent::ChannelDown { attempt } => {
                        warn!("Signaling dropped, reconnect attempt {}", attempt);
                    }
                    RoomEvent::ChannelUp => {
                        info!("Signaling reconnected");
                    }
                }
            }
        });
    }

    let mut quality = session.quality();
    tokio::spawn(async move {
        while quality.changed().await.is_ok() {
            let snapshot = quality.borrow().clone();
            info!(
                "Quality {:?} (score {}): rtt {:.0} ms, jitter {:.0} ms, loss {:.1}%, {:.0} kbps",
                snapshot.level,
                snapshot.score,
                snapshot.rtt_ms,
                snapshot.jitter_ms,
                snapshot.packet_loss_pct,
                snapshot.bitrate_kbps
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    println!();
    println!("Leaving {}", room_id);

    if session.recorder_state() == RecorderState::Recording {
        match session.stop_recording().await {
            Ok(artifact) => {
                let path = artifact.write_to(Path::new("."))?;
                println!("Recording saved to {}", path.display());
            }
            Err(e) => warn!("Recording could not be finalized: {}", e),
        }
    }
    session.leave().await;
    Ok(())
}
