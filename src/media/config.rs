#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and WebRTC transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::ops::RangeInclusive;

/// Main media engine configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Srtp,
                WorkerLogTag::Rtcp,
            ],
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();

        if let (Some(cert), Some(key)) = (&self.dtls_certificate_file, &self.dtls_private_key_file) {
            settings.dtls_files = Some(WorkerDtlsFiles {
                certificate: cert.clone().into(),
                private_key: key.clone().into(),
            });
        }

        settings
    }
}

/// Router configuration with codec capabilities.
/// One router is created per session with these codecs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus and PCMU for audio; VP8, VP9 and H264 for video
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        let video_feedback = || {
            vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ]
        };
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap_or(NonZeroU32::MIN),
                channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
                parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Pcmu,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(8000).unwrap_or(NonZeroU32::MIN),
                channels: NonZeroU8::MIN,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp9,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
                parameters: RtpCodecParametersParameters::from([
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                    ("level-asymmetry-allowed", 1_u32.into()),
                ]),
                rtcp_feedback: video_feedback(),
            },
        ]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub port_range: RangeInclusive<u16>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            port_range: 10000..=10100,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }

    pub fn with_port_range(mut self, port_range: RangeInclusive<u16>) -> Self {
        self.port_range = port_range;
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: Some(self.port_range.clone()),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    /// Converts to WebRtcTransportOptions (UDP first, TCP as fallback)
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let first = if self.enable_udp { Protocol::Udp } else { Protocol::Tcp };
        let mut listen_infos = WebRtcTransportListenInfos::new(self.listen_info(first));
        if self.enable_udp && self.enable_tcp {
            listen_infos = listen_infos.insert(self.listen_info(Protocol::Tcp));
        }

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.enable_udp = self.enable_udp;
        options.enable_tcp = self.enable_tcp;
        options.prefer_udp = self.prefer_udp;
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codecs_cover_both_kinds() {
        let codecs = RouterConfig::default_codecs();
        let audio = codecs.iter().filter(|c| matches!(c, RtpCodecCapability::Audio { .. })).count();
        let video = codecs.iter().filter(|c| matches!(c, RtpCodecCapability::Video { .. })).count();
        assert_eq!(audio, 2);
        assert_eq!(video, 3);
    }

    #[test]
    fn test_public_ip_is_announced() {
        let config = WebRtcTransportConfig::default()
            .with_public_ip("203.0.113.7".parse().unwrap())
            .with_port_range(40000..=40100);
        assert_eq!(config.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.listen_info(Protocol::Udp).port_range, Some(40000..=40100));
    }
}
