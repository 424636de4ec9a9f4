//! Session registry
//!
//! Maps participant ids to running session actors. Relay traffic and UI
//! commands enter here and are forwarded to the addressed session's mailbox;
//! traffic for unknown or removed participants is dropped with a log line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{SessionDriver, SessionStatus};
use super::negotiation::{NegotiationSession, SessionEvent, SessionSettings};
use super::state::Role;
use super::track::{Mid, PreferredCodec, QualityMode};
use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::events::{CallEvent, EventBus};
use crate::rtc::signaling::{MuteState, RelayMessage};
use crate::rtc::{SignalingTransport, TransportFactory};
use crate::sdp::OpusCodecParameters;

/// Session mailbox depth
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// How long a cancelled session may take to release its transport
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Valid `maxaveragebitrate` range for Opus (RFC 7587)
const OPUS_BITRATE_RANGE: std::ops::RangeInclusive<u32> = 6_000..=510_000;

/// A remote participant known to the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub id: String,
    pub display_name: String,
    pub mute_state: MuteState,
}

/// Snapshot of a registered session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub participant_id: String,
    pub status: SessionStatus,
    pub created_at: Instant,
}

struct SessionHandle {
    commands: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
    created_at: Instant,
}

impl SessionHandle {
    fn is_finished(&self) -> bool {
        self.status.borrow().closed || self.commands.is_closed()
    }

    /// Cancel the actor and wait, bounded, for it to release the transport
    async fn shutdown(&self, participant_id: &str) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("Session {} did not stop in time, aborting", participant_id);
                task.abort();
            }
        }
    }
}

/// Owns every negotiation session of this client
pub struct SessionRegistry {
    config: ConfigStore,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingTransport>,
    events: Arc<EventBus>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    participants: RwLock<HashMap<String, RemoteParticipant>>,
    local_mute: RwLock<MuteState>,
}

impl SessionRegistry {
    pub fn new(
        config: ConfigStore,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingTransport>,
        events: Arc<EventBus>,
    ) -> Self {
        let local_mute = if config.get().signaling.start_muted {
            MuteState::Muted
        } else {
            MuteState::Unmuted
        };

        Self {
            config,
            factory,
            signaling,
            events,
            sessions: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
            local_mute: RwLock::new(local_mute),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Start a call: impolite side, creates the data channel, sends the first offer
    pub async fn create_outbound(&self, participant_id: &str) -> Result<()> {
        let handle = self.spawn(participant_id, true).await?;
        handle
            .commands
            .send(SessionEvent::StartCall)
            .await
            .map_err(|_| AppError::TransportClosed(participant_id.to_string()))
    }

    /// Accept a call: polite side, waits for the remote offer
    pub async fn create_inbound(&self, participant_id: &str) -> Result<()> {
        self.spawn(participant_id, false).await.map(|_| ())
    }

    async fn spawn(
        &self,
        participant_id: &str,
        create_data_channel: bool,
    ) -> Result<Arc<SessionHandle>> {
        let config = self.config.get();
        let role = Role::for_channel_creator(create_data_channel);

        // held across transport creation: one transport per participant
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(participant_id) {
            if !existing.is_finished() {
                return Err(AppError::BadRequest(format!(
                    "Session already exists: {}",
                    participant_id
                )));
            }
            debug!("Replacing finished session {}", participant_id);
            if let Some(old) = sessions.remove(participant_id) {
                old.shutdown(participant_id).await;
            }
        }

        let max_sessions = config.negotiation.max_sessions as usize;
        if sessions.len() >= max_sessions {
            return Err(AppError::WebRtcError(format!(
                "Maximum sessions ({}) reached",
                max_sessions
            )));
        }

        let (transport, transport_events) = self
            .factory
            .create(participant_id, create_data_channel)
            .await?;

        let session = NegotiationSession::new(participant_id, role, SessionSettings::from(&*config));
        let (driver, status) = SessionDriver::new(
            session,
            transport,
            self.signaling.clone(),
            self.events.clone(),
            Duration::from_millis(u64::from(config.negotiation.stats_interval_ms.max(1))),
        );
        let driver = driver.with_display_name(config.signaling.display_name.clone());

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(command_rx, transport_events, cancel.clone()));

        let handle = Arc::new(SessionHandle {
            commands,
            cancel,
            status,
            task: Mutex::new(Some(task)),
            created_at: Instant::now(),
        });
        sessions.insert(participant_id.to_string(), handle.clone());

        info!("Session created: {} ({})", participant_id, role);
        Ok(handle)
    }

    pub async fn get(&self, participant_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.get(participant_id).map(|handle| SessionInfo {
            participant_id: participant_id.to_string(),
            status: *handle.status.borrow(),
            created_at: handle.created_at,
        })
    }

    /// Close the session's transport and forget it
    pub async fn remove(&self, participant_id: &str) -> bool {
        let handle = self.sessions.write().await.remove(participant_id);
        match handle {
            Some(handle) => {
                handle.shutdown(participant_id).await;
                info!("Session removed: {}", participant_id);
                true
            }
            None => false,
        }
    }

    /// Forward `event` to the session without waiting on its mailbox;
    /// false if there is no session or its mailbox is full
    pub async fn dispatch(&self, participant_id: &str, event: SessionEvent) -> bool {
        let handle = self.sessions.read().await.get(participant_id).cloned();
        let Some(handle) = handle else {
            let err = AppError::TransportClosed(participant_id.to_string());
            debug!("Dropping {:?}: {}", event, err);
            return false;
        };

        match handle.commands.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Session {} mailbox full, dropping {:?}", participant_id, event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session {} already stopped, event dropped", participant_id);
                false
            }
        }
    }

    /// Route one inbound relay message
    pub async fn handle_relay_message(&self, message: RelayMessage) -> Result<()> {
        match message {
            RelayMessage::ParticipantJoined {
                participant_id,
                display_name,
                initial_mute_state,
            } => {
                self.add_participant(&participant_id, &display_name, initial_mute_state)
                    .await;
                if self.get(&participant_id).await.is_some_and(|s| !s.status.closed) {
                    debug!("Session with {} already running", participant_id);
                    return Ok(());
                }
                self.create_outbound(&participant_id).await
            }
            RelayMessage::ParticipantLeft { participant_id } => {
                self.participants.write().await.remove(&participant_id);
                self.remove(&participant_id).await;
                self.events.publish(CallEvent::ParticipantLeft { participant_id });
                Ok(())
            }
            RelayMessage::Offer {
                description,
                participant_id: Some(sender),
                display_name,
                ..
            } => {
                let needs_session = self
                    .sessions
                    .read()
                    .await
                    .get(&sender)
                    .map_or(true, |h| h.is_finished());
                if needs_session {
                    let name = display_name.unwrap_or_else(|| sender.clone());
                    self.add_participant(&sender, &name, MuteState::default()).await;
                    self.create_inbound(&sender).await?;
                }
                self.dispatch(&sender, SessionEvent::RemoteOffer(description)).await;
                Ok(())
            }
            RelayMessage::Answer {
                description,
                participant_id: Some(sender),
                ..
            } => {
                self.dispatch(&sender, SessionEvent::RemoteAnswer(description)).await;
                Ok(())
            }
            RelayMessage::IceCandidate {
                candidate,
                participant_id: Some(sender),
                ..
            } => {
                self.dispatch(&sender, SessionEvent::RemoteCandidate(candidate)).await;
                Ok(())
            }
            RelayMessage::MuteStateChanged {
                participant_id: Some(sender),
                mute_state,
            } => {
                if let Some(p) = self.participants.write().await.get_mut(&sender) {
                    p.mute_state = mute_state;
                }
                self.events.publish(CallEvent::MuteStateChanged {
                    participant_id: sender,
                    state: mute_state,
                });
                Ok(())
            }
            other => {
                warn!("Ignoring relay message without sender: {:?}", other);
                Ok(())
            }
        }
    }

    async fn add_participant(&self, id: &str, display_name: &str, mute_state: MuteState) {
        let participant = RemoteParticipant {
            id: id.to_string(),
            display_name: display_name.to_string(),
            mute_state,
        };
        self.participants
            .write()
            .await
            .insert(id.to_string(), participant);
        self.events.publish(CallEvent::ParticipantJoined {
            participant_id: id.to_string(),
            display_name: display_name.to_string(),
            mute_state,
        });
    }

    pub async fn participant(&self, id: &str) -> Option<RemoteParticipant> {
        self.participants.read().await.get(id).cloned()
    }

    pub async fn participants(&self) -> Vec<RemoteParticipant> {
        self.participants.read().await.values().cloned().collect()
    }

    /// Merge `params` into the track and renegotiate
    pub async fn apply_codec_parameters(
        &self,
        participant_id: &str,
        mid: &str,
        params: OpusCodecParameters,
    ) -> Result<()> {
        validate_parameters(&params)?;
        self.dispatch(
            participant_id,
            SessionEvent::ApplyCodecParameters {
                mid: mid.to_string(),
                params,
            },
        )
        .await;
        Ok(())
    }

    /// Codec preference plus parameters in one renegotiation
    pub async fn apply_session_parameters(
        &self,
        participant_id: &str,
        mid: &str,
        codec: PreferredCodec,
        params: OpusCodecParameters,
    ) -> Result<()> {
        validate_parameters(&params)?;
        self.dispatch(
            participant_id,
            SessionEvent::ApplySessionParameters {
                mid: mid.to_string(),
                codec,
                params,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_playout_delay(&self, participant_id: &str, mid: &str, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(AppError::BadRequest(format!("Invalid playout delay: {}", seconds)));
        }
        self.dispatch(
            participant_id,
            SessionEvent::SetPlayoutDelay {
                mid: mid.to_string(),
                seconds,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_quality_mode(&self, participant_id: &str, mid: &Mid, mode: QualityMode) -> Result<()> {
        self.dispatch(
            participant_id,
            SessionEvent::SetQualityMode {
                mid: mid.clone(),
                mode,
            },
        )
        .await;
        Ok(())
    }

    /// Add a labelled audio track to the call with `participant_id`
    pub async fn add_additional_track(&self, participant_id: &str, label: &str) -> Result<()> {
        if label.trim().is_empty() {
            return Err(AppError::BadRequest("Track label must not be empty".to_string()));
        }
        self.dispatch(
            participant_id,
            SessionEvent::AddTrack {
                label: label.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Announce our microphone state to the room
    pub async fn set_local_mute(&self, state: MuteState) -> Result<()> {
        *self.local_mute.write().await = state;
        self.signaling
            .send(RelayMessage::MuteStateChanged {
                participant_id: None,
                mute_state: state,
            })
            .await
    }

    pub async fn local_mute(&self) -> MuteState {
        *self.local_mute.read().await
    }

    /// Drop sessions whose transport ended
    pub async fn cleanup_stale_sessions(&self) -> usize {
        let stale: Vec<(String, Arc<SessionHandle>)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|h| (id, h)))
                .collect()
        };

        for (id, handle) in &stale {
            debug!("Removing stale session: {}", id);
            handle.shutdown(id).await;
        }
        stale.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session
    pub async fn close_all(&self) {
        let sessions: Vec<(String, Arc<SessionHandle>)> =
            self.sessions.write().await.drain().collect();
        for (id, handle) in sessions {
            handle.shutdown(&id).await;
            debug!("Session {} closed", id);
        }
    }
}

fn validate_parameters(params: &OpusCodecParameters) -> Result<()> {
    if let Some(bitrate) = params.max_average_bitrate {
        if !OPUS_BITRATE_RANGE.contains(&bitrate) {
            return Err(AppError::BadRequest(format!(
                "maxaveragebitrate {} outside {:?}",
                bitrate, OPUS_BITRATE_RANGE
            )));
        }
    }
    if params.packet_time == Some(0) || params.max_packet_time == Some(0) {
        return Err(AppError::BadRequest("Packet time must be positive".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::signaling::{ConnectionState, SdpType, SessionDescription};
    use crate::rtc::TransportEvent;
    use crate::session::state::SignalingState;
    use crate::session::testing::{wait_until, FakeFactory, FakeSignaling, FAKE_SDP};
    use tempfile::tempdir;

    struct Fixture {
        registry: SessionRegistry,
        factory: Arc<FakeFactory>,
        signaling: Arc<FakeSignaling>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = ConfigStore::new(&dir.path().join("config.json")).await.unwrap();
        config
            .update(|c| {
                c.negotiation.max_sessions = 2;
                c.signaling.display_name = "Alice".to_string();
            })
            .await
            .unwrap();

        let factory = Arc::new(FakeFactory::default());
        let signaling = Arc::new(FakeSignaling::default());
        let registry = SessionRegistry::new(
            config,
            factory.clone(),
            signaling.clone(),
            Arc::new(EventBus::new()),
        );
        Fixture {
            registry,
            factory,
            signaling,
            _dir: dir,
        }
    }

    async fn status(registry: &SessionRegistry, id: &str) -> Option<SessionStatus> {
        registry.get(id).await.map(|info| info.status)
    }

    fn answer_from(sender: &str) -> RelayMessage {
        RelayMessage::Answer {
            description: SessionDescription::answer(FAKE_SDP),
            target_participant_id: "me".to_string(),
            participant_id: Some(sender.to_string()),
        }
    }

    #[tokio::test]
    async fn test_outbound_call_completes() {
        let f = fixture().await;
        f.registry.create_outbound("bob").await.unwrap();

        wait_until(|| f.signaling.descriptions_to("bob").len() == 1).await;
        let offer = &f.signaling.descriptions_to("bob")[0];
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("maxptime=120"));

        f.registry.handle_relay_message(answer_from("bob")).await.unwrap();
        let transport = f.factory.transport("bob").unwrap();
        wait_until(|| transport.called("set_remote:answer")).await;

        let info = f.registry.get("bob").await.unwrap();
        assert_eq!(info.status.role, Role::Impolite);
        assert!(transport.called("created:dc=true"));
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let f = fixture().await;
        f.registry.create_outbound("bob").await.unwrap();
        let err = f.registry.create_inbound("bob").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(f.registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let f = fixture().await;
        f.registry.create_inbound("a").await.unwrap();
        f.registry.create_inbound("b").await.unwrap();
        assert!(f.registry.create_inbound("c").await.is_err());
    }

    #[tokio::test]
    async fn test_late_answer_after_removal_is_dropped() {
        let f = fixture().await;
        f.registry.create_outbound("bob").await.unwrap();
        wait_until(|| f.signaling.descriptions_to("bob").len() == 1).await;

        assert!(f.registry.remove("bob").await);
        let transport = f.factory.transport("bob").unwrap();
        assert!(transport.called("close"));

        f.registry.handle_relay_message(answer_from("bob")).await.unwrap();
        assert!(!transport.called("set_remote:answer"));
        assert!(f.registry.get("bob").await.is_none());
        assert!(!f.registry.remove("bob").await);
    }

    #[tokio::test]
    async fn test_offer_from_unknown_creates_polite_session() {
        let f = fixture().await;
        f.registry
            .handle_relay_message(RelayMessage::Offer {
                description: SessionDescription::offer(FAKE_SDP),
                target_participant_id: "me".to_string(),
                participant_id: Some("carol".to_string()),
                display_name: Some("Carol".to_string()),
            })
            .await
            .unwrap();

        wait_until(|| f.signaling.descriptions_to("carol").len() == 1).await;
        assert_eq!(f.signaling.descriptions_to("carol")[0].sdp_type, SdpType::Answer);

        let info = f.registry.get("carol").await.unwrap();
        assert_eq!(info.status.role, Role::Polite);
        assert_eq!(
            f.registry.participant("carol").await.unwrap().display_name,
            "Carol"
        );
        let transport = f.factory.transport("carol").unwrap();
        assert!(transport.called("created:dc=false"));
    }

    #[tokio::test]
    async fn test_participant_join_and_leave() {
        let f = fixture().await;
        let mut events = f.registry.events().subscribe();

        f.registry
            .handle_relay_message(RelayMessage::ParticipantJoined {
                participant_id: "bob".to_string(),
                display_name: "Bob".to_string(),
                initial_mute_state: MuteState::Muted,
            })
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::ParticipantJoined { mute_state: MuteState::Muted, .. }
        ));
        assert_eq!(f.registry.session_count().await, 1);
        wait_until(|| f.signaling.descriptions_to("bob").len() == 1).await;

        f.registry
            .handle_relay_message(RelayMessage::ParticipantLeft {
                participant_id: "bob".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(f.registry.session_count().await, 0);
        assert!(f.registry.participant("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_mute_state() {
        let f = fixture().await;
        let mut events = f.registry.events().subscribe();

        f.registry.set_local_mute(MuteState::Muted).await.unwrap();
        assert_eq!(f.registry.local_mute().await, MuteState::Muted);
        assert!(matches!(
            f.signaling.sent().last(),
            Some(RelayMessage::MuteStateChanged {
                participant_id: None,
                mute_state: MuteState::Muted
            })
        ));

        f.registry
            .handle_relay_message(RelayMessage::MuteStateChanged {
                participant_id: Some("bob".to_string()),
                mute_state: MuteState::Muted,
            })
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            CallEvent::MuteStateChanged { state: MuteState::Muted, .. }
        ));
    }

    #[tokio::test]
    async fn test_cleanup_stale_sessions() {
        let f = fixture().await;
        f.registry.create_outbound("bob").await.unwrap();
        f.registry.create_inbound("carol").await.unwrap();

        f.factory
            .inject("bob", TransportEvent::ConnectionStateChanged(ConnectionState::Failed))
            .await;

        let transport = f.factory.transport("bob").unwrap();
        wait_until(|| transport.called("close")).await;
        wait_until(|| {
            f.registry
                .sessions
                .try_read()
                .map(|s| s.get("bob").map_or(false, |h| h.is_finished()))
                .unwrap_or(false)
        })
        .await;

        assert_eq!(f.registry.cleanup_stale_sessions().await, 1);
        assert_eq!(f.registry.session_count().await, 1);
        assert!(f.registry.get("carol").await.is_some());
    }

    #[tokio::test]
    async fn test_commands_reach_session() {
        let f = fixture().await;
        f.registry.create_outbound("bob").await.unwrap();
        wait_until(|| f.signaling.descriptions_to("bob").len() == 1).await;
        f.registry.handle_relay_message(answer_from("bob")).await.unwrap();

        let transport = f.factory.transport("bob").unwrap();
        wait_until(|| transport.called("set_remote:answer")).await;

        f.registry.set_playout_delay("bob", "0", 0.5).await.unwrap();
        wait_until(|| transport.called("playout:0:0.5")).await;

        f.registry
            .apply_session_parameters(
                "bob",
                "0",
                PreferredCodec::RedFec,
                OpusCodecParameters {
                    max_average_bitrate: Some(64_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        wait_until(|| transport.called("codec:0:RedFec")).await;
        wait_until(|| f.signaling.descriptions_to("bob").len() == 2).await;
        assert!(f.signaling.descriptions_to("bob")[1]
            .sdp
            .contains("maxaveragebitrate=64000"));

        f.registry.add_additional_track("bob", "Guitar").await.unwrap();
        wait_until(|| transport.called("add_track:Guitar")).await;

        assert_eq!(
            status(&f.registry, "bob").await.map(|s| s.call_started),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_invalid_commands_rejected() {
        let f = fixture().await;
        let params = OpusCodecParameters {
            max_average_bitrate: Some(1_000_000),
            ..Default::default()
        };
        assert!(f.registry.apply_codec_parameters("bob", "0", params).await.is_err());
        assert!(f.registry.set_playout_delay("bob", "0", -1.0).await.is_err());
        assert!(f.registry.add_additional_track("bob", " ").await.is_err());

        // valid command for an unknown participant is dropped, not an error
        assert!(f
            .registry
            .set_quality_mode("bob", &"0".to_string(), QualityMode::Music)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_all() {
        let f = fixture().await;
        f.registry.create_outbound("bob").await.unwrap();
        f.registry.create_inbound("carol").await.unwrap();

        f.registry.close_all().await;
        assert_eq!(f.registry.session_count().await, 0);
        assert!(f.factory.transport("bob").unwrap().called("close"));
        assert!(f.factory.transport("carol").unwrap().called("close"));
        assert_eq!(
            status(&f.registry, "bob").await.map(|s| s.state),
            None::<SignalingState>
        );
    }

    #[tokio::test]
    async fn test_remove_abandons_offer_in_flight() {
        let f = fixture().await;
        f.factory.slow_offer("bob", Duration::from_millis(300));
        f.registry.create_outbound("bob").await.unwrap();
        let transport = f.factory.transport("bob").unwrap();
        wait_until(|| transport.called("create_offer")).await;

        let started = Instant::now();
        assert!(f.registry.remove("bob").await);
        assert!(started.elapsed() < Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(f.signaling.descriptions_to("bob").is_empty());
        assert!(!transport.called("set_local:offer"));
        assert!(transport.called("close"));
    }

    #[tokio::test]
    async fn test_full_mailbox_does_not_block_other_sessions() {
        let f = fixture().await;
        f.factory.slow_offer("bob", Duration::from_secs(30));
        f.registry.create_outbound("bob").await.unwrap();
        f.registry.create_outbound("carol").await.unwrap();
        let bob = f.factory.transport("bob").unwrap();
        wait_until(|| bob.called("create_offer")).await;

        let attempts = COMMAND_CHANNEL_CAPACITY + 8;
        let accepted = tokio::time::timeout(Duration::from_secs(1), async {
            let mut accepted = 0;
            for _ in 0..attempts {
                if f.registry.dispatch("bob", SessionEvent::NegotiationNeeded).await {
                    accepted += 1;
                }
            }
            accepted
        })
        .await
        .expect("dispatch waited on a full mailbox");
        assert_eq!(accepted, COMMAND_CHANNEL_CAPACITY);

        let delivered = tokio::time::timeout(
            Duration::from_millis(200),
            f.registry.dispatch("carol", SessionEvent::NegotiationNeeded),
        )
        .await;
        assert_eq!(delivered.ok(), Some(true));

        f.registry.close_all().await;
        assert!(bob.called("close"));
    }
}
