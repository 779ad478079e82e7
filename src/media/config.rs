#![forbid(unsafe_code)]

// Configuration for the mediasoup worker, router and WebRTC transports.
// Audio-only: the codec set is Opus at 48 kHz with DTX and in-band FEC.

use crate::config::Config;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Media-side configuration derived from the server [`Config`].
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Active-speaker threshold in dBFS.
    pub speaking_threshold: i8,
    /// Active-speaker sampling interval in milliseconds.
    pub speaking_interval_ms: u16,
}

impl MediaConfig {
    pub fn from_server_config(config: &Config) -> Self {
        Self {
            listen_ip: config.media_listen_ip,
            announced_ip: config.media_announced_ip,
            rtc_min_port: config.media_port_min,
            rtc_max_port: config.media_port_max,
            speaking_threshold: config.speaking_threshold,
            speaking_interval_ms: config.speaking_interval.as_millis().min(u16::MAX as u128) as u16,
        }
    }

    /// Worker settings: warn-level worker logging with the RTC tags, RTC port
    /// range from the environment.
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = WorkerLogLevel::Warn;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Rtcp,
        ];
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }

    /// The single supported codec: Opus, 48 kHz, stereo-capable, DTX and
    /// in-band FEC on, 20 ms frames encouraged via minptime.
    pub fn media_codecs() -> Vec<RtpCodecCapability> {
        vec![RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZeroU32::new(48_000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
                ("usedtx", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        }]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(Self::media_codecs())
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_ip.map(|ip| ip.to_string()),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    /// Transport options: UDP preferred with a TCP fallback candidate, SCTP
    /// enabled (unused by the audio path).
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let listen_infos = WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp))
            .insert(self.listen_info(Protocol::Tcp));
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.enable_sctp = true;
        options
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: None,
            rtc_min_port: 10_000,
            rtc_max_port: 59_999,
            speaking_threshold: -70,
            speaking_interval_ms: 800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_set_is_audio_only_opus() {
        let codecs = MediaConfig::media_codecs();
        assert_eq!(codecs.len(), 1);
        match &codecs[0] {
            RtpCodecCapability::Audio {
                mime_type,
                clock_rate,
                channels,
                ..
            } => {
                assert_eq!(*mime_type, MimeTypeAudio::Opus);
                assert_eq!(clock_rate.get(), 48_000);
                assert_eq!(channels.get(), 2);
            }
            other => panic!("unexpected codec: {other:?}"),
        }
    }

    #[test]
    fn worker_settings_carry_port_range() {
        let config = MediaConfig {
            rtc_min_port: 40_000,
            rtc_max_port: 40_100,
            ..Default::default()
        };
        let settings = config.to_worker_settings();
        assert_eq!(settings.rtc_port_range, 40_000..=40_100);
    }
}
