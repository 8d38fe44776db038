use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::peer::transport::MediaTransport;
use crate::types::{LinkRole, ParticipantMetadata, TrackKind};

/// Negotiation lifecycle of one peer link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl LinkState {
    /// Closed and Failed never transition out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }

    pub fn can_transition_to(&self, next: &LinkState) -> bool {
        match (self, next) {
            (LinkState::Closed, _) | (LinkState::Failed, _) => false,
            (LinkState::New, LinkState::HaveLocalOffer) => true,
            (LinkState::New, LinkState::HaveRemoteOffer) => true,
            (LinkState::HaveLocalOffer, LinkState::Negotiating) => true,
            (LinkState::HaveRemoteOffer, LinkState::Negotiating) => true,
            (LinkState::Negotiating, LinkState::Connected) => true,
            (LinkState::Connected, LinkState::Disconnected) => true,
            // Recovery inside the grace window.
            (LinkState::Disconnected, LinkState::Connected) => true,
            (_, LinkState::Closed) => true,
            (_, LinkState::Failed) => true,
            _ => false,
        }
    }
}

/// One remote participant's connection: negotiation state, buffered
/// candidates, and the media transport. Owned exclusively by the session;
/// destroyed when the participant leaves or the room is exited.
pub struct PeerLink {
    pub peer_id: String,
    pub metadata: ParticipantMetadata,
    pub role: LinkRole,
    state: LinkState,
    /// Bumped on every disconnect so stale grace timers and late async
    /// results can be told apart from current ones.
    epoch: u64,
    transport: Arc<dyn MediaTransport>,
    pending_candidates: VecDeque<String>,
    remote_description_set: bool,
    /// Descriptors for remote tracks delivered so far; the live chunk
    /// streams themselves are handed to the application.
    remote_tracks: Vec<(String, TrackKind)>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

impl PeerLink {
    pub fn new(
        peer_id: &str,
        metadata: ParticipantMetadata,
        role: LinkRole,
        transport: Arc<dyn MediaTransport>,
    ) -> Self {
        let now = Utc::now();
        Self {
            peer_id: peer_id.to_string(),
            metadata,
            role,
            state: LinkState::New,
            epoch: 0,
            transport,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            remote_tracks: Vec::new(),
            created_at: now,
            state_changed_at: now,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn transport(&self) -> Arc<dyn MediaTransport> {
        self.transport.clone()
    }

    /// Applies a state change if the transition table allows it. Returns
    /// whether the state actually moved; rejected transitions are logged
    /// and leave the link untouched.
    pub fn transition(&mut self, next: LinkState) -> bool {
        if !self.state.can_transition_to(&next) {
            warn!(
                "Rejected link transition for {}: {:?} -> {:?}",
                self.peer_id, self.state, next
            );
            return false;
        }
        debug!(
            "Link {} transition: {:?} -> {:?}",
            self.peer_id, self.state, next
        );
        self.state = next;
        self.state_changed_at = Utc::now();
        true
    }

    pub fn register_remote_track(&mut self, id: String, kind: TrackKind) {
        self.remote_tracks.push((id, kind));
    }

    pub fn remote_tracks(&self) -> &[(String, TrackKind)] {
        &self.remote_tracks
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn mark_remote_description(&mut self) {
        self.remote_description_set = true;
    }

    /// Queues a candidate that arrived before the remote description.
    pub fn buffer_candidate(&mut self, candidate: String) {
        self.pending_candidates.push_back(candidate);
    }

    /// Hands back every buffered candidate in receipt order.
    pub fn drain_candidates(&mut self) -> Vec<String> {
        self.pending_candidates.drain(..).collect()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::testing::MockTransport;

    fn link(role: LinkRole) -> PeerLink {
        PeerLink::new(
            "p1",
            ParticipantMetadata::new("Ada", "candidate"),
            role,
            MockTransport::arc(),
        )
    }

    #[test]
    fn offerer_happy_path() {
        let mut link = link(LinkRole::Offerer);
        assert!(link.transition(LinkState::HaveLocalOffer));
        assert!(link.transition(LinkState::Negotiating));
        assert!(link.transition(LinkState::Connected));
        assert!(link.transition(LinkState::Disconnected));
        assert!(link.transition(LinkState::Connected));
        assert!(link.transition(LinkState::Closed));
    }

    #[test]
    fn answerer_happy_path() {
        let mut link = link(LinkRole::Answerer);
        assert!(link.transition(LinkState::HaveRemoteOffer));
        assert!(link.transition(LinkState::Negotiating));
        assert!(link.transition(LinkState::Connected));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut link = link(LinkRole::Offerer);
        assert!(!link.transition(LinkState::Connected));
        assert_eq!(link.state(), LinkState::New);
        assert!(link.transition(LinkState::HaveLocalOffer));
        assert!(!link.transition(LinkState::HaveRemoteOffer));
        assert!(!link.transition(LinkState::Disconnected));
    }

    #[test]
    fn failed_is_reachable_from_every_non_terminal_state() {
        for state in [
            LinkState::New,
            LinkState::HaveLocalOffer,
            LinkState::HaveRemoteOffer,
            LinkState::Negotiating,
            LinkState::Connected,
            LinkState::Disconnected,
        ] {
            assert!(state.can_transition_to(&LinkState::Failed), "{:?}", state);
        }
        assert!(!LinkState::Closed.can_transition_to(&LinkState::Failed));
        assert!(!LinkState::Failed.can_transition_to(&LinkState::Failed));
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut link = link(LinkRole::Offerer);
        assert!(link.transition(LinkState::Closed));
        assert!(!link.transition(LinkState::HaveLocalOffer));
        assert!(!link.transition(LinkState::Failed));
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[test]
    fn candidates_drain_in_receipt_order() {
        let mut link = link(LinkRole::Answerer);
        link.buffer_candidate("c1".to_string());
        link.buffer_candidate("c2".to_string());
        link.buffer_candidate("c3".to_string());
        assert_eq!(link.pending_candidate_count(), 3);
        assert_eq!(link.drain_candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(link.pending_candidate_count(), 0);
    }
}
