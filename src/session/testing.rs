//! In-memory transports for session tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::state::SignalingState;
use super::track::{MediaKind, Mid, PreferredCodec};
use crate::error::{AppError, Result};
use crate::rtc::control::ControlMessage;
use crate::rtc::signaling::{IceCandidate, RelayMessage, SdpType, SessionDescription};
use crate::rtc::{MediaTransport, SignalingTransport, TransportEvent, TransportFactory};
use crate::stats::RawStatsReport;

pub const FAKE_SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 63\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:63 red/48000/2\r\n\
a=fmtp:63 111/111\r\n\
a=sendrecv\r\n";

/// Records every call; mimics the signaling state of a real peer connection
#[derive(Default)]
pub struct FakeTransport {
    pub calls: Mutex<Vec<String>>,
    pub sent_control: Mutex<Vec<ControlMessage>>,
    pub state: Mutex<SignalingState>,
    pub channel_open: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_answer: AtomicBool,
    pub stats: Mutex<Option<RawStatsReport>>,
    pub closed: AtomicBool,
    /// How long `create_offer` takes
    pub offer_delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.lock().iter().any(|c| c == name)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn kind(description: &SessionDescription) -> &'static str {
        match description.sdp_type {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer");
        let delay = *self.offer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(SessionDescription::offer(FAKE_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("answer rejected".to_string()));
        }
        Ok(SessionDescription::answer(FAKE_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{}", Self::kind(&description)));
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            _ => SignalingState::Stable,
        };
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{}", Self::kind(&description)));
        *self.state.lock() = match description.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            _ => SignalingState::Stable,
        };
        Ok(())
    }

    async fn rollback_and_set_remote(&self, _description: SessionDescription) -> Result<()> {
        self.record("rollback_and_set_remote");
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("rollback rejected".to_string()));
        }
        *self.state.lock() = SignalingState::HaveRemoteOffer;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record("rollback");
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("rollback rejected".to_string()));
        }
        *self.state.lock() = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.record("add_ice_candidate");
        Ok(())
    }

    async fn set_codec_preferences(&self, mid: &str, codec: PreferredCodec) -> Result<()> {
        self.record(format!("codec:{}:{:?}", mid, codec));
        Ok(())
    }

    async fn set_playout_delay(&self, mid: &str, seconds: f64) -> Result<()> {
        self.record(format!("playout:{}:{}", mid, seconds));
        Ok(())
    }

    async fn add_audio_track(&self, label: &str) -> Result<()> {
        self.record(format!("add_track:{}", label));
        Ok(())
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        if !self.channel_open.load(Ordering::SeqCst) {
            return Err(AppError::TransportClosed("data channel not open".to_string()));
        }
        let msg: ControlMessage = serde_json::from_slice(&data)?;
        self.sent_control.lock().push(msg);
        Ok(())
    }

    fn data_channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    async fn get_stats(&self) -> Result<RawStatsReport> {
        self.stats
            .lock()
            .clone()
            .ok_or_else(|| AppError::StatsUnavailable("no stats".to_string()))
    }

    async fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn transceiver_mids(&self) -> Vec<(Mid, MediaKind)> {
        vec![("0".to_string(), MediaKind::Audio)]
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Collects relay messages
#[derive(Default)]
pub struct FakeSignaling {
    pub sent: Mutex<Vec<RelayMessage>>,
}

impl FakeSignaling {
    pub fn sent(&self) -> Vec<RelayMessage> {
        self.sent.lock().clone()
    }

    /// Descriptions sent to `target`, in order
    pub fn descriptions_to(&self, target: &str) -> Vec<SessionDescription> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                RelayMessage::Offer {
                    description,
                    target_participant_id,
                    ..
                }
                | RelayMessage::Answer {
                    description,
                    target_participant_id,
                    ..
                } if target_participant_id == target => Some(description.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalingTransport for FakeSignaling {
    async fn send(&self, message: RelayMessage) -> Result<()> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps their event senders
#[derive(Default)]
pub struct FakeFactory {
    pub transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    pub event_senders: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    pub offer_delays: Mutex<HashMap<String, Duration>>,
}

impl FakeFactory {
    /// Transports created for `participant_id` take `delay` to create an offer
    pub fn slow_offer(&self, participant_id: &str, delay: Duration) {
        self.offer_delays.lock().insert(participant_id.to_string(), delay);
    }

    pub fn transport(&self, participant_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports.lock().get(participant_id).cloned()
    }

    pub async fn inject(&self, participant_id: &str, event: TransportEvent) {
        let tx = self.event_senders.lock().get(participant_id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        participant_id: &str,
        create_data_channel: bool,
    ) -> Result<(Arc<dyn MediaTransport>, mpsc::Receiver<TransportEvent>)> {
        let transport = Arc::new(FakeTransport::default());
        transport.record(format!("created:dc={}", create_data_channel));
        if let Some(delay) = self.offer_delays.lock().get(participant_id) {
            *transport.offer_delay.lock() = *delay;
        }
        let (tx, rx) = mpsc::channel(16);
        self.transports
            .lock()
            .insert(participant_id.to_string(), transport.clone());
        self.event_senders.lock().insert(participant_id.to_string(), tx);
        Ok((transport, rx))
    }
}

/// Poll `check` until it holds, panicking after two seconds
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
