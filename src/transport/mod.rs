//! Peer-to-peer session transport.
//!
//! Owns the peer connection, the "response" data channel carrying the
//! event protocol, and the local/remote audio legs. The handshake runs
//! `idle -> acquiring-audio -> fetching-credential -> negotiating ->
//! active`; any failure tears down whatever was acquired and surfaces a
//! human-readable transport error. Teardown is idempotent and safe to
//! call before the handshake finished.
//!
//! The local audio leg is declared as linear PCM (L16, 48 kHz mono);
//! capture frames and remote RTP payloads are both plain PCM16, which
//! keeps the metering path codec-free.

pub mod audio;
pub mod signaling;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::protocol::events::ClientEvent;
use audio::{AudioSink, CaptureHandle, VolumeMeter};

/// Lifecycle phase of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPhase {
    #[default]
    Idle,
    AcquiringAudio,
    FetchingCredential,
    Negotiating,
    Active,
    Stopping,
}

fn l16_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/L16".to_string(),
        clock_rate: 48_000,
        channels: 1,
        ..Default::default()
    }
}

/// An established peer session: connection, side-channel, audio legs,
/// and their worker tasks.
pub struct SessionTransport {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    audio_sender: Arc<RTCRtpSender>,
    capture: CaptureHandle,
    outbound_task: JoinHandle<()>,
    track_task: JoinHandle<()>,
    meter_task: JoinHandle<()>,
    local_meter: Arc<VolumeMeter>,
    remote_meter: Arc<VolumeMeter>,
    /// Remote RMS level, published on a fixed interval (f32 bits).
    current_volume: Arc<AtomicU32>,
    channel_open: Arc<AtomicBool>,
    phase: TransportPhase,
}

/// Cadence of the volume-publishing task.
const METER_INTERVAL: Duration = Duration::from_millis(100);

impl SessionTransport {
    /// Drive the full handshake. Inbound side-channel messages are
    /// forwarded (as raw JSON strings) to `inbound_tx`; outbound events
    /// are drained from `outbound_rx`. `on_status` receives the
    /// user-facing phase labels as the handshake progresses.
    pub async fn connect(
        config: &SessionConfig,
        inbound_tx: mpsc::UnboundedSender<String>,
        outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
        sink: Arc<dyn AudioSink>,
        on_status: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<Self> {
        on_status("Requesting microphone access...");
        let local_meter = Arc::new(VolumeMeter::new());
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(64);

        #[cfg(feature = "audio-io")]
        let capture = audio::start_capture(frame_tx, Arc::clone(&local_meter))?;
        #[cfg(not(feature = "audio-io"))]
        let capture = {
            drop(frame_tx);
            CaptureHandle::disabled()
        };

        on_status("Fetching ephemeral token...");
        let http = reqwest::Client::new();
        let token = signaling::fetch_ephemeral_token(&http, &config.credential_url).await?;

        on_status("Establishing connection...");
        let mut transport = Self::negotiate(
            config, &http, &token, capture, frame_rx, local_meter, inbound_tx, outbound_rx, sink,
        )
        .await?;
        transport.phase = TransportPhase::Active;
        tracing::info!(model = %config.model, "Peer session established");
        Ok(transport)
    }

    #[allow(clippy::too_many_arguments)]
    async fn negotiate(
        config: &SessionConfig,
        http: &reqwest::Client,
        token: &str,
        mut capture: CaptureHandle,
        frame_rx: mpsc::Receiver<Vec<u8>>,
        local_meter: Arc<VolumeMeter>,
        inbound_tx: mpsc::UnboundedSender<String>,
        outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| SessionError::transport(format!("media engine setup failed: {e}")))?;
        media
            .register_codec(
                RTCRtpCodecParameters {
                    capability: l16_capability(),
                    payload_type: 102,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| SessionError::transport(format!("codec registration failed: {e}")))?;
        let api = APIBuilder::new().with_media_engine(media).build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| SessionError::transport(format!("peer connection failed: {e}")))?,
        );

        match Self::wire_and_exchange(config, http, token, &pc, frame_rx, inbound_tx, outbound_rx, sink)
            .await
        {
            Ok((data_channel, audio_sender, outbound_task, track_task, remote_meter, channel_open)) => {
                let current_volume = Arc::new(AtomicU32::new(0));
                let meter_task = {
                    let meter = Arc::clone(&remote_meter);
                    let level = Arc::clone(&current_volume);
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(METER_INTERVAL);
                        loop {
                            ticker.tick().await;
                            level.store(meter.rms().to_bits(), Ordering::Relaxed);
                        }
                    })
                };
                Ok(Self {
                    pc,
                    data_channel,
                    audio_sender,
                    capture,
                    outbound_task,
                    track_task,
                    meter_task,
                    local_meter,
                    remote_meter,
                    current_volume,
                    channel_open,
                    phase: TransportPhase::Negotiating,
                })
            }
            Err(e) => {
                // Partial teardown: release the device and the half-open
                // connection before surfacing the error.
                capture.stop();
                if let Err(close_err) = pc.close().await {
                    tracing::debug!(error = %close_err, "Peer close after failed handshake");
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    async fn wire_and_exchange(
        config: &SessionConfig,
        http: &reqwest::Client,
        token: &str,
        pc: &Arc<RTCPeerConnection>,
        frame_rx: mpsc::Receiver<Vec<u8>>,
        inbound_tx: mpsc::UnboundedSender<String>,
        outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<(
        Arc<RTCDataChannel>,
        Arc<RTCRtpSender>,
        JoinHandle<()>,
        JoinHandle<()>,
        Arc<VolumeMeter>,
        Arc<AtomicBool>,
    )> {
        let channel_open = Arc::new(AtomicBool::new(false));
        let remote_meter = Arc::new(VolumeMeter::new());

        // Side channel for protocol events.
        let data_channel = pc
            .create_data_channel("response", None)
            .await
            .map_err(|e| SessionError::transport(format!("data channel failed: {e}")))?;

        // One-time session configuration, sent the moment the channel
        // opens: modalities + tools + transcription settings, then the
        // response-language instruction.
        let opening_events = vec![
            ClientEvent::session_update(
                config.modalities.clone(),
                config.tools.clone(),
                config.transcription_model.clone(),
            ),
            ClientEvent::user_message(config.language_prompt.clone()),
            ClientEvent::ResponseCreate,
        ];
        let opening: Vec<String> = opening_events
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SessionError::transport(format!("session config unserializable: {e}")))?;

        {
            let dc = Arc::clone(&data_channel);
            let open_flag = Arc::clone(&channel_open);
            data_channel.on_open(Box::new(move || {
                let dc = Arc::clone(&dc);
                let open_flag = Arc::clone(&open_flag);
                let opening = opening.clone();
                Box::pin(async move {
                    open_flag.store(true, Ordering::SeqCst);
                    tracing::info!("Side channel open; sending session configuration");
                    for message in opening {
                        if let Err(e) = dc.send_text(message).await {
                            tracing::error!(error = %e, "Failed to send session configuration");
                        }
                    }
                })
            }));
        }
        {
            let open_flag = Arc::clone(&channel_open);
            data_channel.on_close(Box::new(move || {
                open_flag.store(false, Ordering::SeqCst);
                tracing::info!("Side channel closed");
                Box::pin(async {})
            }));
        }
        data_channel.on_message(Box::new(move |msg| {
            let raw = String::from_utf8_lossy(&msg.data).into_owned();
            if inbound_tx.send(raw).is_err() {
                tracing::debug!("Inbound consumer gone; dropping message");
            }
            Box::pin(async {})
        }));

        // Remote audio: RTP payloads go straight to the sink and meter.
        {
            let sink = Arc::clone(&sink);
            let meter = Arc::clone(&remote_meter);
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let sink = Arc::clone(&sink);
                let meter = Arc::clone(&meter);
                tokio::spawn(async move {
                    tracing::debug!(codec = %track.codec().capability.mime_type, "Remote track started");
                    while let Ok((packet, _)) = track.read_rtp().await {
                        meter.push_pcm16(&packet.payload);
                        sink.write(&packet.payload);
                    }
                    tracing::debug!("Remote track ended");
                });
                Box::pin(async {})
            }));
        }

        // Local audio: capture frames become 20 ms samples on the track.
        let local_track = Arc::new(TrackLocalStaticSample::new(
            l16_capability(),
            "audio".to_string(),
            "medrelay".to_string(),
        ));
        let audio_sender = pc
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| SessionError::transport(format!("audio track failed: {e}")))?;

        let mut frames = frame_rx;
        let track_task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let sample = Sample {
                    data: bytes::Bytes::from(frame),
                    duration: Duration::from_millis(20),
                    ..Default::default()
                };
                if let Err(e) = local_track.write_sample(&sample).await {
                    tracing::debug!(error = %e, "Dropping capture frame");
                }
            }
        });

        // Outbound pump: protocol events onto the side channel. A closed
        // channel logs and drops; it never propagates.
        let outbound_task = {
            let dc = Arc::clone(&data_channel);
            let open_flag = Arc::clone(&channel_open);
            let mut outbound = outbound_rx;
            tokio::spawn(async move {
                while let Some(event) = outbound.recv().await {
                    let message = match serde_json::to_string(&event) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::error!(error = %e, "Outbound event unserializable");
                            continue;
                        }
                    };
                    if !open_flag.load(Ordering::SeqCst) {
                        tracing::debug!("Side channel not open; dropping outbound event");
                        continue;
                    }
                    if let Err(e) = dc.send_text(message).await {
                        tracing::debug!(error = %e, "Send on closed side channel");
                    }
                }
            })
        };

        // Standard offer/answer over the signaling endpoint.
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::transport(format!("offer failed: {e}")))?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| SessionError::transport(format!("local description failed: {e}")))?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::transport("local description missing after gather"))?;
        let answer_sdp = signaling::exchange_sdp(
            http,
            &config.realtime_url,
            &config.model,
            &config.voice,
            token,
            local.sdp,
        )
        .await?;
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| SessionError::transport(format!("answer rejected: {e}")))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| SessionError::transport(format!("remote description failed: {e}")))?;

        Ok((
            data_channel,
            audio_sender,
            outbound_task,
            track_task,
            remote_meter,
            channel_open,
        ))
    }

    pub fn phase(&self) -> TransportPhase {
        self.phase
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    /// RMS level of the captured microphone signal.
    pub fn local_volume(&self) -> f32 {
        self.local_meter.rms()
    }

    /// RMS level of the remote (played-back) signal, as last published
    /// by the metering task.
    pub fn remote_volume(&self) -> f32 {
        f32::from_bits(self.current_volume.load(Ordering::Relaxed))
    }

    /// Tear everything down. Safe to call repeatedly and at any phase;
    /// completes even when the handshake never finished.
    pub async fn close(&mut self) {
        if self.phase == TransportPhase::Idle {
            return;
        }
        self.phase = TransportPhase::Stopping;
        self.channel_open.store(false, Ordering::SeqCst);

        self.capture.stop();
        self.outbound_task.abort();
        self.track_task.abort();
        self.meter_task.abort();
        self.current_volume.store(0, Ordering::Relaxed);

        if let Err(e) = self.data_channel.close().await {
            tracing::debug!(error = %e, "Side channel close");
        }
        if let Err(e) = self.audio_sender.stop().await {
            tracing::debug!(error = %e, "Audio sender stop");
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Peer connection close");
        }

        self.local_meter.clear();
        self.remote_meter.clear();
        self.phase = TransportPhase::Idle;
        tracing::info!("Transport torn down");
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_starts_idle() {
        assert_eq!(TransportPhase::default(), TransportPhase::Idle);
    }

    #[test]
    fn local_leg_is_linear_pcm() {
        let capability = l16_capability();
        assert_eq!(capability.mime_type, "audio/L16");
        assert_eq!(capability.clock_rate, 48_000);
        assert_eq!(capability.channels, 1);
    }
}
