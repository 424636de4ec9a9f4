//! Offer/answer state machine for one remote participant
//!
//! [`NegotiationSession::handle`] is a pure transition: it updates the
//! session state and returns the [`Effect`]s the driver must perform. Results
//! of asynchronous effects come back as new [`SessionEvent`]s.
//!
//! Glare is resolved with fixed roles: the impolite side ignores a colliding
//! offer, the polite side rolls back its own and takes the remote one.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, error, info, warn};

use super::state::{Role, SignalingState};
use super::track::{MediaKind, Mid, PreferredCodec, QualityMode, TrackNegotiationRecord};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::events::CallEvent;
use crate::rtc::control::ControlMessage;
use crate::rtc::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription, SignalPayload};
use crate::sdp::{apply_track_parameters, OpusCodecParameters};
use crate::stats::{
    FecRecommendation, QualityAdvisor, RawStatsReport, StatsHistory, StatsRatesCalculator,
    StatsSnapshot,
};

/// Mid of the voice transceiver every session starts with
pub const DEFAULT_AUDIO_MID: &str = "0";

/// Per-session knobs, taken from the app config
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub adaptive_fec: bool,
    pub adapt_every_ticks: u32,
    pub red_loss_threshold: f64,
    pub initial: OpusCodecParameters,
    pub speech: OpusCodecParameters,
    pub music: OpusCodecParameters,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SessionSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            adaptive_fec: config.negotiation.adaptive_fec,
            adapt_every_ticks: config.negotiation.adapt_every_ticks.max(1),
            red_loss_threshold: config.negotiation.red_loss_threshold,
            initial: config.audio.initial.clone(),
            speech: config.audio.speech.clone(),
            music: config.audio.music.clone(),
        }
    }
}

/// Asynchronous transport operation, used to report failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    Rollback,
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Explicit first offer of an outbound session
    StartCall,
    /// The transport wants a renegotiation
    NegotiationNeeded,
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    LocalDescriptionApplied {
        description: SessionDescription,
        mids: Vec<(Mid, MediaKind)>,
    },
    RemoteDescriptionApplied {
        description: SessionDescription,
        mids: Vec<(Mid, MediaKind)>,
    },
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    LocalCandidate(IceCandidate),
    /// A negotiation step failed; `observed` is the transport's state afterwards
    OperationFailed {
        op: Operation,
        reason: String,
        observed: SignalingState,
    },
    DataChannelOpen,
    DataChannelClosed,
    Control(ControlMessage),
    RemoteTrack {
        mid: Mid,
        kind: MediaKind,
    },
    ConnectionStateChanged(ConnectionState),
    StatsCollected(RawStatsReport),
    ApplyCodecParameters {
        mid: Mid,
        params: OpusCodecParameters,
    },
    ApplySessionParameters {
        mid: Mid,
        codec: PreferredCodec,
        params: OpusCodecParameters,
    },
    SetPlayoutDelay {
        mid: Mid,
        seconds: f64,
    },
    SetQualityMode {
        mid: Mid,
        mode: QualityMode,
    },
    /// Add another local audio track with a label for the remote side
    AddTrack {
        label: String,
    },
    LocalTrackAdded {
        label: String,
    },
    /// The transport discarded its pending description
    RolledBack,
    Close,
}

impl SessionEvent {
    /// Route an incoming description by its type
    pub fn remote_description(description: SessionDescription) -> Option<Self> {
        match description.sdp_type {
            SdpType::Offer => Some(SessionEvent::RemoteOffer(description)),
            SdpType::Answer | SdpType::Pranswer => Some(SessionEvent::RemoteAnswer(description)),
            SdpType::Rollback => None,
        }
    }
}

/// Where an outbound signal goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRoute {
    Relay,
    /// Data channel, relay if it turns out to be unusable
    DataChannel,
}

/// Work for the driver
#[derive(Debug, Clone)]
pub enum Effect {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    /// Roll back the local offer and apply the remote one, jointly
    RollbackAndSetRemote(SessionDescription),
    /// Discard whatever description is pending
    Rollback,
    AddIceCandidate(IceCandidate),
    SetCodecPreferences {
        mid: Mid,
        codec: PreferredCodec,
    },
    SetPlayoutDelay {
        mid: Mid,
        seconds: f64,
    },
    AddLocalTrack {
        label: String,
    },
    SendSignal {
        payload: SignalPayload,
        route: SignalRoute,
    },
    SendControl(ControlMessage),
    Notify(CallEvent),
    Close,
}

/// Negotiation state of one peer-to-peer session
#[derive(Debug)]
pub struct NegotiationSession {
    participant_id: String,
    role: Role,
    state: SignalingState,
    call_started: bool,
    making_offer: bool,
    renegotiation_pending: bool,
    remote_description_set: bool,
    data_channel_open: bool,
    closed: bool,
    tracks: BTreeMap<Mid, TrackNegotiationRecord>,
    pending_candidates: Vec<IceCandidate>,
    /// Labels of tracks we added, handed out on `requestTrackName`
    unassigned_labels: VecDeque<String>,
    local_labels: HashMap<Mid, String>,
    remote_audio_tracks: usize,
    rates: StatsRatesCalculator,
    history: StatsHistory,
    advisor: QualityAdvisor,
    settings: SessionSettings,
    ticks: u64,
    /// Strongest advice seen since the last adaptation
    pending_advice: FecRecommendation,
}

impl NegotiationSession {
    pub fn new(participant_id: impl Into<String>, role: Role, settings: SessionSettings) -> Self {
        let mut tracks = BTreeMap::new();
        tracks.insert(
            DEFAULT_AUDIO_MID.to_string(),
            TrackNegotiationRecord::audio(DEFAULT_AUDIO_MID, settings.initial.clone()),
        );

        Self {
            participant_id: participant_id.into(),
            role,
            state: SignalingState::Idle,
            call_started: false,
            making_offer: false,
            renegotiation_pending: false,
            remote_description_set: false,
            data_channel_open: false,
            closed: false,
            tracks,
            pending_candidates: Vec::new(),
            unassigned_labels: VecDeque::new(),
            local_labels: HashMap::new(),
            remote_audio_tracks: 0,
            rates: StatsRatesCalculator::new(),
            history: StatsHistory::new(),
            advisor: QualityAdvisor::new(settings.red_loss_threshold),
            settings,
            ticks: 0,
            pending_advice: FecRecommendation::NoChange,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn call_started(&self) -> bool {
        self.call_started
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiation_pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn track(&self, mid: &str) -> Option<&TrackNegotiationRecord> {
        self.tracks.get(mid)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackNegotiationRecord> {
        self.tracks.values()
    }

    pub fn history(&self) -> &StatsHistory {
        &self.history
    }

    /// An own offer may start now
    fn can_offer(&self) -> bool {
        !self.closed && !self.making_offer && self.state.is_stable()
    }

    /// Apply one event and return the effects to run, in order.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        if self.closed {
            debug!("Session {} closed, dropping {:?}", self.participant_id, event);
            return Vec::new();
        }

        match event {
            SessionEvent::StartCall => self.on_start_call(),
            SessionEvent::NegotiationNeeded => self.on_negotiation_needed(),
            SessionEvent::OfferCreated(offer) => self.on_offer_created(offer),
            SessionEvent::AnswerCreated(answer) => self.on_answer_created(answer),
            SessionEvent::LocalDescriptionApplied { description, mids } => {
                self.sync_tracks(&mids);
                self.on_local_applied(description)
            }
            SessionEvent::RemoteDescriptionApplied { description, mids } => {
                self.sync_tracks(&mids);
                self.on_remote_applied(description)
            }
            SessionEvent::RemoteOffer(offer) => self.on_remote_offer(offer),
            SessionEvent::RemoteAnswer(answer) => self.on_remote_answer(answer),
            SessionEvent::RemoteCandidate(candidate) => {
                if self.remote_description_set {
                    vec![Effect::AddIceCandidate(candidate)]
                } else {
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            }
            SessionEvent::LocalCandidate(candidate) => vec![Effect::SendSignal {
                payload: SignalPayload::Candidate(candidate),
                route: SignalRoute::Relay,
            }],
            SessionEvent::OperationFailed { op, reason, observed } => {
                self.on_operation_failed(op, reason, observed)
            }
            SessionEvent::DataChannelOpen => {
                info!("Data channel to {} open", self.participant_id);
                self.data_channel_open = true;
                Vec::new()
            }
            SessionEvent::DataChannelClosed => {
                self.data_channel_open = false;
                Vec::new()
            }
            SessionEvent::Control(msg) => self.on_control(msg),
            SessionEvent::RemoteTrack { mid, kind } => self.on_remote_track(mid, kind),
            SessionEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            SessionEvent::StatsCollected(report) => self.on_stats(report),
            SessionEvent::ApplyCodecParameters { mid, params } => {
                let record = self.record_mut(&mid).with_parameters(&params);
                self.tracks.insert(mid, record);
                self.request_renegotiation()
            }
            SessionEvent::ApplySessionParameters { mid, codec, params } => {
                let mut record = self.record_mut(&mid).with_parameters(&params);
                let mut effects = Vec::new();
                if record.preferred_codec != codec {
                    record.preferred_codec = codec;
                    effects.push(Effect::SetCodecPreferences {
                        mid: mid.clone(),
                        codec,
                    });
                }
                self.tracks.insert(mid, record);
                effects.extend(self.request_renegotiation());
                effects
            }
            SessionEvent::SetPlayoutDelay { mid, seconds } => {
                self.record_mut(&mid).playout_delay = Some(seconds);
                vec![Effect::SetPlayoutDelay { mid, seconds }]
            }
            SessionEvent::SetQualityMode { mid, mode } => self.on_set_quality_mode(mid, mode),
            SessionEvent::AddTrack { label } => vec![Effect::AddLocalTrack { label }],
            SessionEvent::LocalTrackAdded { label } => {
                self.unassigned_labels.push_back(label);
                self.request_renegotiation()
            }
            SessionEvent::RolledBack => self.on_rolled_back(),
            SessionEvent::Close => {
                self.closed = true;
                vec![Effect::Close]
            }
        }
    }

    fn record_mut(&mut self, mid: &str) -> &mut TrackNegotiationRecord {
        let initial = &self.settings.initial;
        self.tracks
            .entry(mid.to_string())
            .or_insert_with(|| TrackNegotiationRecord::audio(mid, initial.clone()))
    }

    fn sync_tracks(&mut self, mids: &[(Mid, MediaKind)]) {
        for (mid, kind) in mids {
            if !self.tracks.contains_key(mid) {
                let record = match kind {
                    MediaKind::Audio => TrackNegotiationRecord::audio(mid.clone(), self.settings.initial.clone()),
                    MediaKind::Video => TrackNegotiationRecord::video(mid.clone()),
                };
                self.tracks.insert(mid.clone(), record);
            }
        }
    }

    fn begin_offer(&mut self) -> Vec<Effect> {
        self.making_offer = true;
        self.renegotiation_pending = false;
        vec![Effect::CreateOffer]
    }

    /// Renegotiate now if possible, otherwise once the session is stable again
    fn request_renegotiation(&mut self) -> Vec<Effect> {
        if !self.call_started {
            // first exchange will carry the records as they are
            return Vec::new();
        }
        if self.can_offer() {
            self.begin_offer()
        } else {
            debug!("Session {} busy, renegotiation deferred", self.participant_id);
            self.renegotiation_pending = true;
            Vec::new()
        }
    }

    fn on_start_call(&mut self) -> Vec<Effect> {
        if !self.can_offer() {
            warn!(
                "Session {} cannot start call in state {}",
                self.participant_id, self.state
            );
            return Vec::new();
        }
        info!("Starting call with {} ({})", self.participant_id, self.role);
        self.begin_offer()
    }

    fn on_negotiation_needed(&mut self) -> Vec<Effect> {
        if !self.call_started {
            debug!("Negotiation needed before call start, suppressed ({})", self.participant_id);
            return Vec::new();
        }
        if !self.can_offer() {
            debug!("Negotiation already in flight for {}, coalesced", self.participant_id);
            return Vec::new();
        }
        self.begin_offer()
    }

    /// Codec injection, applied once to every locally created description
    fn munge(&self, description: &SessionDescription) -> SessionDescription {
        let params = self
            .tracks
            .values()
            .filter(|t| t.is_audio())
            .map(|t| (t.mid.as_str(), &t.opus_params));
        let (sdp, skipped) = apply_track_parameters(&description.sdp, params);
        if !skipped.is_empty() {
            debug!(
                "Session {}: {} media section(s) left unmodified",
                self.participant_id,
                skipped.len()
            );
        }
        description.with_sdp(sdp)
    }

    fn on_offer_created(&mut self, offer: SessionDescription) -> Vec<Effect> {
        if !self.making_offer {
            debug!("Discarding stale offer for {}", self.participant_id);
            return Vec::new();
        }
        vec![Effect::SetLocalDescription(self.munge(&offer))]
    }

    fn on_answer_created(&mut self, answer: SessionDescription) -> Vec<Effect> {
        if self.state != SignalingState::HaveRemoteOffer {
            debug!("Discarding stale answer for {}", self.participant_id);
            return Vec::new();
        }
        vec![Effect::SetLocalDescription(self.munge(&answer))]
    }

    fn route(&self) -> SignalRoute {
        if self.call_started && self.data_channel_open {
            SignalRoute::DataChannel
        } else {
            SignalRoute::Relay
        }
    }

    fn on_local_applied(&mut self, description: SessionDescription) -> Vec<Effect> {
        let route = self.route();
        let send = Effect::SendSignal {
            payload: SignalPayload::Description(description.clone()),
            route,
        };

        match description.sdp_type {
            SdpType::Offer => {
                self.making_offer = false;
                self.state = SignalingState::HaveLocalOffer;
                debug!("Offer to {} sent via {:?}", self.participant_id, route);
                vec![send]
            }
            SdpType::Answer | SdpType::Pranswer => {
                let mut effects = vec![send];
                effects.extend(self.become_stable());
                effects
            }
            SdpType::Rollback => Vec::new(),
        }
    }

    fn on_remote_applied(&mut self, description: SessionDescription) -> Vec<Effect> {
        self.remote_description_set = true;
        let mut effects: Vec<Effect> = self
            .pending_candidates
            .drain(..)
            .map(Effect::AddIceCandidate)
            .collect();

        match description.sdp_type {
            SdpType::Offer => {
                self.state = SignalingState::HaveRemoteOffer;
                effects.push(Effect::CreateAnswer);
            }
            SdpType::Answer | SdpType::Pranswer => effects.extend(self.become_stable()),
            SdpType::Rollback => {}
        }
        effects
    }

    fn become_stable(&mut self) -> Vec<Effect> {
        self.state = SignalingState::Stable;
        if !self.call_started {
            info!("Call with {} started", self.participant_id);
            self.call_started = true;
        }
        if self.renegotiation_pending {
            self.begin_offer()
        } else {
            Vec::new()
        }
    }

    fn on_remote_offer(&mut self, offer: SessionDescription) -> Vec<Effect> {
        let collision = self.making_offer || !self.state.is_stable();
        if !collision {
            return vec![Effect::SetRemoteDescription(offer)];
        }

        match self.role {
            Role::Impolite => {
                let conflict = AppError::GlareConflict(self.participant_id.clone());
                info!("{}", conflict);
                Vec::new()
            }
            Role::Polite => {
                info!(
                    "Glare with {} in state {}, rolling back local offer",
                    self.participant_id, self.state
                );
                self.making_offer = false;
                self.state = SignalingState::RollbackPending;
                vec![Effect::RollbackAndSetRemote(offer)]
            }
        }
    }

    fn on_remote_answer(&mut self, answer: SessionDescription) -> Vec<Effect> {
        if self.state != SignalingState::HaveLocalOffer {
            warn!(
                "Unexpected answer from {} in state {}, ignored",
                self.participant_id, self.state
            );
            return Vec::new();
        }
        vec![Effect::SetRemoteDescription(answer)]
    }

    fn on_operation_failed(
        &mut self,
        op: Operation,
        reason: String,
        observed: SignalingState,
    ) -> Vec<Effect> {
        if op == Operation::Rollback {
            let err = AppError::RollbackFailed {
                participant: self.participant_id.clone(),
                reason,
            };
            error!("{}; round abandoned", err);
        } else {
            warn!(
                "{:?} failed for {}: {}; round abandoned",
                op, self.participant_id, reason
            );
        }

        self.making_offer = false;
        self.state = match observed {
            SignalingState::Stable | SignalingState::Idle if !self.call_started => SignalingState::Idle,
            SignalingState::Idle => SignalingState::Stable,
            other => other,
        };

        // never stay parked on an unanswered remote offer
        let answering = matches!(op, Operation::CreateAnswer | Operation::SetLocalDescription);
        if answering && self.state == SignalingState::HaveRemoteOffer {
            info!("Rolling back unanswered offer from {}", self.participant_id);
            self.state = SignalingState::RollbackPending;
            return vec![Effect::Rollback];
        }
        Vec::new()
    }

    fn on_rolled_back(&mut self) -> Vec<Effect> {
        if self.call_started {
            self.state = SignalingState::Stable;
            if self.renegotiation_pending {
                return self.begin_offer();
            }
        } else {
            self.state = SignalingState::Idle;
            self.remote_description_set = false;
        }
        Vec::new()
    }

    fn on_control(&mut self, msg: ControlMessage) -> Vec<Effect> {
        match msg {
            ControlMessage::Sdp { sdp } => match SessionEvent::remote_description(sdp) {
                Some(event) => self.handle(event),
                None => Vec::new(),
            },
            ControlMessage::MusicStart { mid } => vec![Effect::Notify(CallEvent::RemoteQualityModeChanged {
                participant_id: self.participant_id.clone(),
                mid,
                mode: QualityMode::Music,
            })],
            ControlMessage::MusicStop { mid } => vec![Effect::Notify(CallEvent::RemoteQualityModeChanged {
                participant_id: self.participant_id.clone(),
                mid,
                mode: QualityMode::Speech,
            })],
            ControlMessage::RequestTrackName { mid } => {
                let label = match self.local_labels.get(&mid) {
                    Some(label) => Some(label.clone()),
                    None => self.unassigned_labels.pop_front().inspect(|label| {
                        self.local_labels.insert(mid.clone(), label.clone());
                    }),
                };
                match label {
                    Some(cname) => vec![Effect::SendControl(ControlMessage::SendTrackName { mid, cname })],
                    None => {
                        debug!("No label for mid={} requested by {}", mid, self.participant_id);
                        Vec::new()
                    }
                }
            }
            ControlMessage::SendTrackName { mid, cname } => {
                self.record_mut(&mid).label = Some(cname.clone());
                vec![Effect::Notify(CallEvent::RemoteTrackLabeled {
                    participant_id: self.participant_id.clone(),
                    mid,
                    label: cname,
                })]
            }
        }
    }

    fn on_remote_track(&mut self, mid: Mid, kind: MediaKind) -> Vec<Effect> {
        self.sync_tracks(&[(mid.clone(), kind)]);
        let mut effects = vec![Effect::Notify(CallEvent::RemoteTrackAdded {
            participant_id: self.participant_id.clone(),
            mid: mid.clone(),
            kind,
        })];

        if kind == MediaKind::Audio {
            self.remote_audio_tracks += 1;
            // the first audio track is the voice, later ones carry a name
            if self.remote_audio_tracks > 1 && self.data_channel_open {
                effects.push(Effect::SendControl(ControlMessage::RequestTrackName { mid }));
            }
        }
        effects
    }

    fn on_connection_state(&mut self, state: ConnectionState) -> Vec<Effect> {
        let mut effects = vec![Effect::Notify(CallEvent::ConnectionStateChanged {
            participant_id: self.participant_id.clone(),
            state,
        })];

        if state.is_terminal() {
            warn!("Connection to {} {}, ending call", self.participant_id, state);
            self.closed = true;
            effects.push(Effect::Notify(CallEvent::CallEnded {
                participant_id: self.participant_id.clone(),
                reason: format!("connection {}", state),
            }));
            effects.push(Effect::Close);
        }
        effects
    }

    fn on_set_quality_mode(&mut self, mid: Mid, mode: QualityMode) -> Vec<Effect> {
        let preset = match mode {
            QualityMode::Speech => self.settings.speech.clone(),
            QualityMode::Music => self.settings.music.clone(),
        };
        let record = self.record_mut(&mid).with_quality_mode(mode, &preset);
        self.tracks.insert(mid.clone(), record);

        let mut effects = Vec::new();
        if self.data_channel_open {
            let msg = match mode {
                QualityMode::Music => ControlMessage::MusicStart { mid },
                QualityMode::Speech => ControlMessage::MusicStop { mid },
            };
            effects.push(Effect::SendControl(msg));
        }
        effects.extend(self.request_renegotiation());
        effects
    }

    fn on_stats(&mut self, report: RawStatsReport) -> Vec<Effect> {
        let rates = self.rates.add_report(report);
        let snapshot = match self.rates.current() {
            Some(current) => StatsSnapshot::from_report(current, &rates),
            None => return Vec::new(),
        };
        self.history.push(snapshot.clone());
        self.ticks += 1;

        let mut effects = vec![Effect::Notify(CallEvent::StatsUpdated {
            participant_id: self.participant_id.clone(),
            snapshot,
        })];

        if self.settings.adaptive_fec {
            let advice = self.advisor.recommend(&self.history);
            self.pending_advice = self.pending_advice.stronger(advice);
            if self.ticks % u64::from(self.settings.adapt_every_ticks) == 0 {
                effects.extend(self.adapt());
            }
        }
        effects
    }

    /// Follow the advice gathered since the last call, renegotiating when a
    /// track's FEC mode changes
    fn adapt(&mut self) -> Vec<Effect> {
        let recommendation = std::mem::replace(&mut self.pending_advice, FecRecommendation::NoChange);
        if recommendation == FecRecommendation::NoChange {
            return Vec::new();
        }

        let mut effects = Vec::new();
        let changed: Vec<TrackNegotiationRecord> = self
            .tracks
            .values()
            .filter_map(|t| t.apply_recommendation(recommendation))
            .collect();
        if changed.is_empty() {
            return effects;
        }

        for record in changed {
            info!(
                "Adapting mid={} for {} to {:?}",
                record.mid, self.participant_id, recommendation
            );
            let previous = self.tracks.insert(record.mid.clone(), record.clone());
            if previous.map(|p| p.preferred_codec) != Some(record.preferred_codec) {
                effects.push(Effect::SetCodecPreferences {
                    mid: record.mid.clone(),
                    codec: record.preferred_codec,
                });
            }
            effects.push(Effect::Notify(CallEvent::FecAdapted {
                participant_id: self.participant_id.clone(),
                mid: record.mid,
                recommendation,
            }));
        }
        effects.extend(self.request_renegotiation());
        effects
    }
}
