//! Session actor
//!
//! Owns one [`NegotiationSession`] and its transport. Commands, transport
//! callbacks and the statistics timer are serialized through a single
//! `select!` loop, so the state machine never sees two events at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::negotiation::{Effect, NegotiationSession, Operation, SessionEvent, SignalRoute};
use super::state::{Role, SignalingState};
use crate::error::AppError;
use crate::events::EventBus;
use crate::rtc::control::ControlMessage;
use crate::rtc::signaling::{RelayMessage, SignalPayload};
use crate::rtc::{MediaTransport, SignalingTransport, TransportEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Externally visible session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub role: Role,
    pub state: SignalingState,
    pub call_started: bool,
    pub closed: bool,
}

impl From<&NegotiationSession> for SessionStatus {
    fn from(session: &NegotiationSession) -> Self {
        Self {
            role: session.role(),
            state: session.state(),
            call_started: session.call_started(),
            closed: session.is_closed(),
        }
    }
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::NegotiationNeeded => SessionEvent::NegotiationNeeded,
            TransportEvent::LocalCandidate(c) => SessionEvent::LocalCandidate(c),
            TransportEvent::DataChannelOpen => SessionEvent::DataChannelOpen,
            TransportEvent::DataChannelClosed => SessionEvent::DataChannelClosed,
            TransportEvent::ControlMessage(msg) => SessionEvent::Control(msg),
            TransportEvent::RemoteTrack { mid, kind } => SessionEvent::RemoteTrack { mid, kind },
            TransportEvent::ConnectionStateChanged(s) => SessionEvent::ConnectionStateChanged(s),
        }
    }
}

/// Runs effects of a [`NegotiationSession`] against real transports
pub struct SessionDriver {
    session: NegotiationSession,
    transport: Arc<dyn MediaTransport>,
    signaling: Arc<dyn SignalingTransport>,
    events: Arc<EventBus>,
    /// Sent along with offers so the callee can name us
    display_name: Option<String>,
    stats_interval: Duration,
    status_tx: watch::Sender<SessionStatus>,
    throttler: LogThrottler,
    /// Abandons the effect in flight; replaced by the token given to `run`
    cancel: CancellationToken,
}

impl SessionDriver {
    pub fn new(
        session: NegotiationSession,
        transport: Arc<dyn MediaTransport>,
        signaling: Arc<dyn SignalingTransport>,
        events: Arc<EventBus>,
        stats_interval: Duration,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let (status_tx, status_rx) = watch::channel(SessionStatus::from(&session));
        (
            Self {
                session,
                transport,
                signaling,
                events,
                display_name: None,
                stats_interval,
                status_tx,
                throttler: LogThrottler::default(),
                cancel: CancellationToken::new(),
            },
            status_rx,
        )
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Event loop; returns when cancelled, when the session closes, or when
    /// the command channel is gone.
    ///
    /// Cancellation also interrupts the effect in flight: nothing further is
    /// signalled or published for this participant.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionEvent>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        self.cancel = cancel.clone();
        let participant_id = self.session.participant_id().to_string();
        info!("Session {} started ({})", participant_id, self.session.role());

        let mut stats_timer = tokio::time::interval(self.stats_interval);
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transport_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Session {} cancelled", participant_id);
                    break;
                }

                command = commands.recv() => match command {
                    Some(event) => self.process(event).await,
                    None => {
                        debug!("Command channel for {} closed", participant_id);
                        break;
                    }
                },

                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.process(event.into()).await,
                    None => transport_open = false,
                },

                _ = stats_timer.tick() => self.poll_stats().await,
            }

            if self.session.is_closed() {
                break;
            }
        }

        if !self.session.is_closed() {
            // Close only tears the transport down
            self.session.handle(SessionEvent::Close);
            self.close_transport().await;
            self.status_tx.send_replace(SessionStatus::from(&self.session));
        }
        info!("Session {} stopped", participant_id);
    }

    async fn close_transport(&self) {
        if let Err(e) = self.transport.close().await {
            debug!("Closing transport of {}: {}", self.session.participant_id(), e);
        }
    }

    async fn poll_stats(&mut self) {
        if !self.session.call_started() {
            return;
        }
        match self.transport.get_stats().await {
            Ok(report) => self.process(SessionEvent::StatsCollected(report)).await,
            Err(e) => {
                let key = format!("stats:{}", self.session.participant_id());
                warn_throttled!(
                    self.throttler,
                    &key,
                    "Stats poll for {} skipped: {}",
                    self.session.participant_id(),
                    e
                );
            }
        }
    }

    /// Feed `event` and every follow-up event through the state machine
    ///
    /// Stops at the first effect that races a cancellation; the remaining
    /// effects are dropped.
    pub async fn process(&mut self, event: SessionEvent) {
        let cancel = self.cancel.clone();
        let mut queue = VecDeque::from([event]);
        let mut abandoned = false;

        'events: while let Some(event) = queue.pop_front() {
            for effect in self.session.handle(event) {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        abandoned = true;
                        break 'events;
                    }
                    next = self.execute(effect) => next,
                };
                if let Some(next) = next {
                    queue.push_back(next);
                }
            }
        }

        if abandoned {
            debug!(
                "Session {} cancelled, in-flight negotiation abandoned",
                self.session.participant_id()
            );
        }
        self.status_tx.send_replace(SessionStatus::from(&self.session));
    }

    async fn failed(&self, op: Operation, error: AppError) -> SessionEvent {
        SessionEvent::OperationFailed {
            op,
            reason: error.to_string(),
            observed: self.transport.signaling_state().await,
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::CreateOffer => Some(match self.transport.create_offer().await {
                Ok(offer) => SessionEvent::OfferCreated(offer),
                Err(e) => self.failed(Operation::CreateOffer, e).await,
            }),
            Effect::CreateAnswer => Some(match self.transport.create_answer().await {
                Ok(answer) => SessionEvent::AnswerCreated(answer),
                Err(e) => self.failed(Operation::CreateAnswer, e).await,
            }),
            Effect::SetLocalDescription(description) => Some(
                match self.transport.set_local_description(description.clone()).await {
                    Ok(()) => SessionEvent::LocalDescriptionApplied {
                        description,
                        mids: self.transport.transceiver_mids().await,
                    },
                    Err(e) => self.failed(Operation::SetLocalDescription, e).await,
                },
            ),
            Effect::SetRemoteDescription(description) => Some(
                match self.transport.set_remote_description(description.clone()).await {
                    Ok(()) => SessionEvent::RemoteDescriptionApplied {
                        description,
                        mids: self.transport.transceiver_mids().await,
                    },
                    Err(e) => self.failed(Operation::SetRemoteDescription, e).await,
                },
            ),
            Effect::Rollback => Some(match self.transport.rollback().await {
                Ok(()) => SessionEvent::RolledBack,
                Err(e) => self.failed(Operation::Rollback, e).await,
            }),
            Effect::RollbackAndSetRemote(description) => Some(
                match self.transport.rollback_and_set_remote(description.clone()).await {
                    Ok(()) => SessionEvent::RemoteDescriptionApplied {
                        description,
                        mids: self.transport.transceiver_mids().await,
                    },
                    Err(e) => self.failed(Operation::Rollback, e).await,
                },
            ),
            Effect::AddIceCandidate(candidate) => {
                if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                    warn!("Session {}: {}", self.session.participant_id(), e);
                }
                None
            }
            Effect::SetCodecPreferences { mid, codec } => {
                if let Err(e) = self.transport.set_codec_preferences(&mid, codec).await {
                    warn!("Session {}: {}", self.session.participant_id(), e);
                }
                None
            }
            Effect::SetPlayoutDelay { mid, seconds } => {
                if let Err(e) = self.transport.set_playout_delay(&mid, seconds).await {
                    warn!("Session {}: {}", self.session.participant_id(), e);
                }
                None
            }
            Effect::AddLocalTrack { label } => match self.transport.add_audio_track(&label).await {
                Ok(()) => Some(SessionEvent::LocalTrackAdded { label }),
                Err(e) => {
                    warn!("Session {}: {}", self.session.participant_id(), e);
                    None
                }
            },
            Effect::SendSignal { payload, route } => {
                self.send_signal(payload, route).await;
                None
            }
            Effect::SendControl(msg) => {
                if let Err(e) = self.send_control(&msg).await {
                    debug!("Control message to {} dropped: {}", self.session.participant_id(), e);
                }
                None
            }
            Effect::Notify(event) => {
                self.events.publish(event);
                None
            }
            Effect::Close => {
                self.close_transport().await;
                None
            }
        }
    }

    async fn send_control(&self, msg: &ControlMessage) -> crate::error::Result<()> {
        if !self.transport.data_channel_open() {
            return Err(AppError::TransportClosed("data channel not open".to_string()));
        }
        self.transport.send_control(msg.to_bytes()?).await
    }

    /// Deliver a description or candidate; data channel first when asked,
    /// relay otherwise or on failure
    async fn send_signal(&self, payload: SignalPayload, route: SignalRoute) {
        if route == SignalRoute::DataChannel {
            if let SignalPayload::Description(description) = &payload {
                let msg = ControlMessage::Sdp {
                    sdp: description.clone(),
                };
                match self.send_control(&msg).await {
                    Ok(()) => return,
                    Err(e) => debug!("Data channel unusable ({}), using relay", e),
                }
            }
        }

        let message = RelayMessage::addressed(
            self.session.participant_id(),
            payload,
            self.display_name.clone(),
        );
        if let Err(e) = self.signaling.send(message).await {
            warn!("Signal to {} lost: {}", self.session.participant_id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::events::CallEvent;
    use crate::rtc::signaling::{ConnectionState, SdpType, SessionDescription};
    use crate::session::negotiation::SessionSettings;
    use crate::session::testing::{wait_until, FakeSignaling, FakeTransport, FAKE_SDP};

    struct Harness {
        driver: SessionDriver,
        transport: Arc<FakeTransport>,
        signaling: Arc<FakeSignaling>,
        status: watch::Receiver<SessionStatus>,
        events: Arc<EventBus>,
    }

    fn harness(role: Role) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let signaling = Arc::new(FakeSignaling::default());
        let events = Arc::new(EventBus::new());
        let session = NegotiationSession::new("bob", role, SessionSettings::default());
        let (driver, status) = SessionDriver::new(
            session,
            transport.clone(),
            signaling.clone(),
            events.clone(),
            Duration::from_millis(300),
        );
        Harness {
            driver: driver.with_display_name("Alice"),
            transport,
            signaling,
            status,
            events,
        }
    }

    #[tokio::test]
    async fn test_start_call_sends_munged_offer() {
        let mut h = harness(Role::Impolite);
        h.driver.process(SessionEvent::StartCall).await;

        assert_eq!(h.transport.calls(), vec!["create_offer", "set_local:offer"]);
        let sent = h.signaling.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            RelayMessage::Offer {
                description,
                target_participant_id,
                display_name,
                ..
            } => {
                assert_eq!(target_participant_id, "bob");
                assert_eq!(display_name.as_deref(), Some("Alice"));
                assert!(description.sdp.contains("usedtx=1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.status.borrow().state, SignalingState::HaveLocalOffer);

        h.driver
            .process(SessionEvent::RemoteAnswer(SessionDescription::answer(FAKE_SDP)))
            .await;
        let status = *h.status.borrow();
        assert_eq!(status.state, SignalingState::Stable);
        assert!(status.call_started);
    }

    #[tokio::test]
    async fn test_polite_rollback_then_answer() {
        let mut h = harness(Role::Polite);
        h.driver.process(SessionEvent::StartCall).await;

        h.driver
            .process(SessionEvent::RemoteOffer(SessionDescription::offer(FAKE_SDP)))
            .await;

        let calls = h.transport.calls();
        assert_eq!(
            &calls[2..],
            &["rollback_and_set_remote", "create_answer", "set_local:answer"]
        );
        let answers = h.signaling.descriptions_to("bob");
        assert_eq!(answers.last().map(|d| d.sdp_type), Some(SdpType::Answer));
        assert_eq!(h.status.borrow().state, SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_failed_rollback_abandons_round() {
        let mut h = harness(Role::Polite);
        h.transport.fail_rollback.store(true, Ordering::SeqCst);
        h.driver.process(SessionEvent::StartCall).await;

        h.driver
            .process(SessionEvent::RemoteOffer(SessionDescription::offer(FAKE_SDP)))
            .await;

        assert!(!h.transport.called("create_answer"));
        assert_eq!(h.signaling.sent().len(), 1);
        assert_eq!(h.status.borrow().state, SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_renegotiation_falls_back_to_relay() {
        let mut h = harness(Role::Impolite);
        h.driver.process(SessionEvent::StartCall).await;
        h.driver
            .process(SessionEvent::RemoteAnswer(SessionDescription::answer(FAKE_SDP)))
            .await;

        // session believes the channel is open, transport says otherwise
        h.driver.process(SessionEvent::DataChannelOpen).await;
        h.driver.process(SessionEvent::NegotiationNeeded).await;
        assert_eq!(h.signaling.descriptions_to("bob").len(), 2);

        h.transport.channel_open.store(true, Ordering::SeqCst);
        h.driver
            .process(SessionEvent::RemoteAnswer(SessionDescription::answer(FAKE_SDP)))
            .await;
        h.driver.process(SessionEvent::NegotiationNeeded).await;
        assert_eq!(h.signaling.descriptions_to("bob").len(), 2);
        assert!(matches!(
            h.transport.sent_control.lock().last(),
            Some(ControlMessage::Sdp { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_loop_ends_on_failed_connection() {
        let h = harness(Role::Impolite);
        let mut events = h.events.subscribe();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (transport_tx, transport_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.driver.run(cmd_rx, transport_rx, cancel.clone()));

        cmd_tx.send(SessionEvent::StartCall).await.unwrap();
        transport_tx
            .send(TransportEvent::ConnectionStateChanged(ConnectionState::Failed))
            .await
            .unwrap();

        task.await.unwrap();
        assert!(h.transport.called("close"));
        assert!(h.status.borrow().closed);

        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            ended |= matches!(event, CallEvent::CallEnded { .. });
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn test_cancel_closes_transport() {
        let h = harness(Role::Polite);
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        let (_transport_tx, transport_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let transport = h.transport.clone();
        let task = tokio::spawn(h.driver.run(cmd_rx, transport_rx, cancel.clone()));

        cancel.cancel();
        task.await.unwrap();
        wait_until(|| transport.closed.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_failed_answer_rolls_back_to_stable() {
        let mut h = harness(Role::Impolite);
        h.driver.process(SessionEvent::StartCall).await;
        h.driver
            .process(SessionEvent::RemoteAnswer(SessionDescription::answer(FAKE_SDP)))
            .await;

        h.transport.fail_answer.store(true, Ordering::SeqCst);
        h.driver
            .process(SessionEvent::RemoteOffer(SessionDescription::offer(FAKE_SDP)))
            .await;
        let calls = h.transport.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &["set_remote:offer", "create_answer", "rollback"]
        );
        assert_eq!(h.status.borrow().state, SignalingState::Stable);

        // the next offer from the peer is answered again
        h.transport.fail_answer.store(false, Ordering::SeqCst);
        h.driver
            .process(SessionEvent::RemoteOffer(SessionDescription::offer(FAKE_SDP)))
            .await;
        assert!(h.transport.called("set_local:answer"));
        assert_eq!(h.status.borrow().state, SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_cancel_abandons_offer_in_flight() {
        let h = harness(Role::Impolite);
        *h.transport.offer_delay.lock() = Duration::from_millis(300);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (_transport_tx, transport_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let transport = h.transport.clone();
        let task = tokio::spawn(h.driver.run(cmd_rx, transport_rx, cancel.clone()));

        cmd_tx.send(SessionEvent::StartCall).await.unwrap();
        wait_until(|| transport.called("create_offer")).await;

        let started = tokio::time::Instant::now();
        cancel.cancel();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        // give a leaked offer the time it would have needed
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(h.signaling.sent().is_empty());
        assert!(!transport.called("set_local:offer"));
        assert!(transport.called("close"));
        assert!(h.status.borrow().closed);
    }
}
