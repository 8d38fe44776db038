use crate::peer::TransportStats;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// At most one snapshot reaches subscribers per window; the latest
// sample wins when several land inside it.
const COALESCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    pub fn from_score(score: u8) -> Self {
        if score >= 90 {
            QualityLevel::Excellent
        } else if score >= 70 {
            QualityLevel::Good
        } else if score >= 50 {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub level: QualityLevel,
    pub score: u8,             // 0-100
    pub participant_count: usize,
    pub session_secs: u64,
    pub bitrate_kbps: f64,
    pub rtt_ms: f64,           // worst link
    pub jitter_ms: f64,        // worst link, derived from rtt variation
    pub packet_loss_pct: f64,  // worst link
    pub sampled_at: DateTime<Utc>,
}

impl Default for QualitySnapshot {
    fn default() -> Self {
        Self {
            level: QualityLevel::Excellent,
            score: 100,
            participant_count: 0,
            session_secs: 0,
            bitrate_kbps: 0.0,
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss_pct: 0.0,
            sampled_at: Utc::now(),
        }
    }
}

impl QualitySnapshot {
    fn scored(
        rtt_ms: f64,
        jitter_ms: f64,
        packet_loss_pct: f64,
        participant_count: usize,
        session_secs: u64,
        bitrate_kbps: f64,
    ) -> Self {
        let rtt_score = if rtt_ms < 150.0 {
            40
        } else if rtt_ms < 300.0 {
            30
        } else {
            20
        };

        let jitter_score = if jitter_ms < 30.0 {
            20
        } else if jitter_ms < 50.0 {
            15
        } else {
            10
        };

        let loss_score = if packet_loss_pct < 1.0 {
            40
        } else if packet_loss_pct < 3.0 {
            30
        } else if packet_loss_pct < 5.0 {
            20
        } else {
            10
        };

        let score = (rtt_score + jitter_score + loss_score) as u8;
        Self {
            level: QualityLevel::from_score(score),
            score,
            participant_count,
            session_secs,
            bitrate_kbps,
            rtt_ms,
            jitter_ms,
            packet_loss_pct,
            sampled_at: Utc::now(),
        }
    }
}

struct PeerHistory {
    last_rtt_ms: Option<f64>,
    last_bytes: u64,
    last_at: Instant,
}

struct MonitorInner {
    history: HashMap<String, PeerHistory>,
    pending: Option<QualitySnapshot>,
    last_published: Option<Instant>,
    flush_epoch: u64,
}

struct Shared {
    inner: Mutex<MonitorInner>,
    tx: watch::Sender<QualitySnapshot>,
}

/// Aggregates per-link transport counters into one session-wide quality
/// snapshot. The session loop feeds it samples; subscribers observe the
/// coalesced result through a watch channel.
pub struct QualityMonitor {
    started_at: Instant,
    shared: Arc<Shared>,
    rx: watch::Receiver<QualitySnapshot>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(QualitySnapshot::default());
        Self {
            started_at: Instant::now(),
            shared: Arc::new(Shared {
                inner: Mutex::new(MonitorInner {
                    history: HashMap::new(),
                    pending: None,
                    last_published: None,
                    flush_epoch: 0,
                }),
                tx,
            }),
            rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QualitySnapshot> {
        self.rx.clone()
    }

    pub fn latest(&self) -> QualitySnapshot {
        self.rx.borrow().clone()
    }

    /// Folds one round of per-peer counters into a snapshot. Jitter has
    /// no direct counter, so it is taken as the swing between a link's
    /// consecutive round-trip readings.
    pub fn record(&self, samples: &[(String, TransportStats)]) {
        let now = Instant::now();
        let mut worst_rtt: f64 = 0.0;
        let mut worst_jitter: f64 = 0.0;
        let mut worst_loss: f64 = 0.0;
        let mut total_kbps: f64 = 0.0;

        {
            let mut inner = self.shared.inner.lock();
            inner
                .history
                .retain(|peer, _| samples.iter().any(|(id, _)| id == peer));
            for (peer, stats) in samples {
                let entry = inner
                    .history
                    .entry(peer.clone())
                    .or_insert_with(|| PeerHistory {
                        last_rtt_ms: None,
                        last_bytes: 0,
                        last_at: now,
                    });
                if let Some(rtt) = stats.rtt_ms {
                    if let Some(prev) = entry.last_rtt_ms {
                        worst_jitter = worst_jitter.max((rtt - prev).abs());
                    }
                    entry.last_rtt_ms = Some(rtt);
                    worst_rtt = worst_rtt.max(rtt);
                }
                if let Some(loss) = stats.packet_loss_pct {
                    worst_loss = worst_loss.max(loss);
                }
                let bytes = stats.bytes_sent + stats.bytes_received;
                let elapsed = now.duration_since(entry.last_at).as_secs_f64();
                if elapsed > 0.0 && bytes >= entry.last_bytes {
                    total_kbps += ((bytes - entry.last_bytes) as f64 * 8.0) / 1000.0 / elapsed;
                }
                entry.last_bytes = bytes;
                entry.last_at = now;
            }
        }

        let snapshot = QualitySnapshot::scored(
            worst_rtt,
            worst_jitter,
            worst_loss,
            samples.len(),
            self.started_at.elapsed().as_secs(),
            total_kbps,
        );
        self.publish(snapshot);
    }

    pub fn drop_peer(&self, peer_id: &str) {
        self.shared.inner.lock().history.remove(peer_id);
    }

    fn publish(&self, snapshot: QualitySnapshot) {
        let now = Instant::now();
        let mut inner = self.shared.inner.lock();
        let due = inner
            .last_published
            .map_or(true, |at| now.duration_since(at) >= COALESCE_WINDOW);
        inner.flush_epoch += 1;
        if due {
            inner.last_published = Some(now);
            inner.pending = None;
            drop(inner);
            let _ = self.shared.tx.send(snapshot);
            return;
        }

        let wait = match inner.last_published {
            Some(at) => COALESCE_WINDOW.saturating_sub(now.duration_since(at)),
            None => Duration::ZERO,
        };
        inner.pending = Some(snapshot);
        let epoch = inner.flush_epoch;
        drop(inner);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let mut inner = shared.inner.lock();
            if inner.flush_epoch != epoch {
                return;
            }
            if let Some(snapshot) = inner.pending.take() {
                inner.last_published = Some(Instant::now());
                drop(inner);
                debug!("publishing coalesced quality snapshot");
                let _ = shared.tx.send(snapshot);
            }
        });
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rtt_ms: Option<f64>, loss_pct: Option<f64>, bytes: u64) -> TransportStats {
        TransportStats {
            bytes_sent: bytes,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            rtt_ms,
            packet_loss_pct: loss_pct,
        }
    }

    #[test]
    fn score_bands_match_thresholds() {
        let s = QualitySnapshot::scored(100.0, 10.0, 0.5, 1, 0, 0.0);
        assert_eq!(s.score, 100);
        assert_eq!(s.level, QualityLevel::Excellent);

        let s = QualitySnapshot::scored(200.0, 40.0, 2.0, 1, 0, 0.0);
        assert_eq!(s.score, 75);
        assert_eq!(s.level, QualityLevel::Good);

        let s = QualitySnapshot::scored(350.0, 40.0, 4.0, 1, 0, 0.0);
        assert_eq!(s.score, 55);
        assert_eq!(s.level, QualityLevel::Fair);

        let s = QualitySnapshot::scored(350.0, 60.0, 6.0, 1, 0, 0.0);
        assert_eq!(s.score, 40);
        assert_eq!(s.level, QualityLevel::Poor);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_is_derived_from_rtt_variation() {
        let monitor = QualityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.record(&[("a".to_string(), stats(Some(100.0), None, 0))]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().jitter_ms, 0.0);

        tokio::time::advance(Duration::from_millis(600)).await;
        monitor.record(&[("a".to_string(), stats(Some(140.0), None, 0))]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().jitter_ms, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_inside_the_window_coalesce_to_the_latest() {
        let monitor = QualityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.record(&[("a".to_string(), stats(Some(100.0), None, 0))]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().rtt_ms, 100.0);

        // Both land inside the window; only the second survives.
        monitor.record(&[("a".to_string(), stats(Some(200.0), None, 0))]);
        monitor.record(&[("a".to_string(), stats(Some(320.0), None, 0))]);
        tokio::time::advance(Duration::from_millis(600)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().rtt_ms, 320.0);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn departed_peers_leave_the_aggregate() {
        let monitor = QualityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.record(&[
            ("a".to_string(), stats(Some(100.0), Some(0.2), 0)),
            ("b".to_string(), stats(Some(280.0), Some(4.0), 0)),
        ]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().participant_count, 2);

        tokio::time::advance(Duration::from_millis(600)).await;
        monitor.drop_peer("b");
        monitor.record(&[("a".to_string(), stats(Some(100.0), Some(0.2), 0))]);
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.participant_count, 1);
        assert_eq!(snapshot.rtt_ms, 100.0);
        assert_eq!(snapshot.packet_loss_pct, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn bitrate_comes_from_byte_deltas() {
        let monitor = QualityMonitor::new();
        let mut rx = monitor.subscribe();

        monitor.record(&[("a".to_string(), stats(Some(100.0), None, 1_000))]);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().bitrate_kbps, 0.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        monitor.record(&[("a".to_string(), stats(Some(100.0), None, 251_000))]);
        rx.changed().await.unwrap();
        // 250 kB over one second is 2000 kbps.
        assert_eq!(rx.borrow_and_update().bitrate_kbps, 2000.0);
    }
}
