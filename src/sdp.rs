// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Track selection from SDP, as delivered in a `DESCRIBE` response body.
//!
//! The relay doesn't interpret media beyond what the protocol state machines
//! need: which media sections to `SETUP` (one video and one audio at most,
//! chosen by a codec allow-list), each track's control URL and RTP payload
//! type, and any codec parameter sets carried in `fmtp` attributes (H.264
//! SPS/PPS, H.265 VPS/SPS/PPS, AAC config), which are surfaced to consumers
//! without waiting for RTP.

use base64::Engine as _;
use log::{debug, warn};
use sdp_types::Media;
use url::Url;

use crate::{Error, ErrorInt, MediaKind};

/// Video encodings the relay will set up. JPEG is recognized but skipped:
/// there is no depacketizer for it downstream.
const VIDEO_ENCODINGS: [&str; 3] = ["H264", "H265", "MP4V-ES"];

/// Audio encodings the relay will set up. `MPEG4-GENERIC` covers AAC.
const AUDIO_ENCODINGS: [&str; 4] = ["PCMA", "PCMU", "AMR", "MPEG4-GENERIC"];

/// One media section selected for `SETUP`.
#[derive(Clone, Debug)]
pub struct Track {
    pub kind: MediaKind,

    /// The track's control URL, already joined against the base URL.
    pub control: Url,

    /// RTP payload type from the media line, to match against received RTP.
    pub rtp_payload_type: u8,

    /// Uppercased encoding name from `rtpmap` (e.g. `H264`).
    pub encoding: String,

    /// Codec parameter sets found in the `fmtp` attribute, if any.
    pub parameter_sets: Option<ParameterSets>,
}

/// Out-of-band codec configuration extracted from `fmtp`.
#[derive(Clone, PartialEq, Eq)]
pub enum ParameterSets {
    H264 {
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    H265 {
        vps: Vec<u8>,
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    AacConfig(Vec<u8>),
}

impl std::fmt::Debug for ParameterSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterSets::H264 { sps, pps } => f
                .debug_struct("H264")
                .field("sps_len", &sps.len())
                .field("pps_len", &pps.len())
                .finish(),
            ParameterSets::H265 { vps, sps, pps } => f
                .debug_struct("H265")
                .field("vps_len", &vps.len())
                .field("sps_len", &sps.len())
                .field("pps_len", &pps.len())
                .finish(),
            ParameterSets::AacConfig(c) => f.debug_tuple("AacConfig").field(&c.len()).finish(),
        }
    }
}

/// Joins a control URL to a base URL in a non-RFC-compliant but common way,
/// matching what live555 and ffmpeg do.
fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| {
        format!(
            "unable to join base url {} with control url {:?}: {}",
            base_url, control, e
        )
    })
}

/// Parses the body of a `DESCRIBE` response and selects at most one video
/// and one audio track with a supported codec; later sections of the same
/// media type are ignored.
pub fn parse_tracks(base_url: &Url, body: &[u8]) -> Result<Vec<Track>, Error> {
    let sdp = sdp_types::Session::parse(body).map_err(|e| {
        wrap!(ErrorInt::SdpError {
            description: format!(
                "{}\n\n{:#?}",
                e,
                crate::hex::HexSnippet::new(body, 128)
            ),
        })
    })?;
    let mut tracks: Vec<Track> = Vec::new();
    for media in &sdp.medias {
        let kind = match media.media.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            o => {
                debug!("ignoring non-audio/video media section {o:?}");
                continue;
            }
        };
        if tracks.iter().any(|t| t.kind == kind) {
            continue; // already matched a track of this kind
        }
        match parse_media(base_url, kind, media) {
            Ok(Some(track)) => tracks.push(track),
            Ok(None) => {}
            Err(description) => bail!(ErrorInt::SdpError { description }),
        }
    }
    Ok(tracks)
}

fn parse_media(base_url: &Url, kind: MediaKind, media: &Media) -> Result<Option<Track>, String> {
    // "When a list of payload type numbers is given ... the first of these
    // formats SHOULD be used as the default format for the session."
    let rtp_payload_type_str = media
        .fmt
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| "media line without format".to_owned())?;
    let rtp_payload_type = rtp_payload_type_str
        .parse::<u8>()
        .map_err(|_| format!("invalid RTP payload type {rtp_payload_type_str:?}"))?;
    if (rtp_payload_type & 0x80) != 0 {
        return Err(format!("invalid RTP payload type {rtp_payload_type}"));
    }

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    for a in &media.attributes {
        if a.attribute == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "rtpmap attribute with no value".to_owned())?;
            // rtpmap-value = payload-type SP encoding-name "/" clock-rate ["/" params]
            let (rtpmap_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid rtpmap attribute".to_owned())?;
            if rtpmap_payload_type == rtp_payload_type_str {
                rtpmap = Some(v);
            }
        } else if a.attribute == "fmtp" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "fmtp attribute with no value".to_owned())?;
            let (fmtp_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid fmtp attribute".to_owned())?;
            if fmtp_payload_type == rtp_payload_type_str {
                fmtp = Some(v);
            }
        } else if a.attribute == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(base_url, c))
                .transpose()?;
        }
    }

    let encoding = match rtpmap {
        Some(rtpmap) => rtpmap
            .split_once('/')
            .ok_or_else(|| "invalid rtpmap attribute".to_owned())?
            .0
            .to_ascii_uppercase(),
        // A few static assignments matter in practice; everything else
        // needs an rtpmap to be considered.
        None => match rtp_payload_type {
            0 => "PCMU".to_owned(),
            8 => "PCMA".to_owned(),
            26 => "JPEG".to_owned(),
            o => {
                debug!("ignoring {kind} media with static payload type {o} and no rtpmap");
                return Ok(None);
            }
        },
    };

    let supported = match kind {
        MediaKind::Video => VIDEO_ENCODINGS.contains(&encoding.as_str()),
        MediaKind::Audio => AUDIO_ENCODINGS.contains(&encoding.as_str()),
    };
    if !supported {
        if encoding == "JPEG" {
            warn!("JPEG video track offered; no depacketizer exists, skipping it");
        } else {
            debug!("ignoring {kind} media with unsupported encoding {encoding:?}");
        }
        return Ok(None);
    }

    let parameter_sets = fmtp.and_then(|f| parse_parameter_sets(&encoding, f));
    let control = match control {
        Some(c) => c,
        None => base_url.clone(),
    };
    Ok(Some(Track {
        kind,
        control,
        rtp_payload_type,
        encoding,
        parameter_sets,
    }))
}

/// Extracts codec parameter sets from an `fmtp` attribute's parameter list.
fn parse_parameter_sets(encoding: &str, fmtp: &str) -> Option<ParameterSets> {
    let param = |name: &str| -> Option<String> {
        fmtp.split(';').find_map(|p| {
            let (k, v) = p.trim().split_once('=')?;
            (k.trim() == name).then(|| v.trim().to_owned())
        })
    };
    let b64 = |s: &str| base64::engine::general_purpose::STANDARD.decode(s).ok();
    match encoding {
        "H264" => {
            // sprop-parameter-sets carries SPS and PPS as comma-separated base64.
            let sets = param("sprop-parameter-sets")?;
            let mut it = sets.split(',');
            let sps = b64(it.next()?)?;
            let pps = b64(it.next()?)?;
            Some(ParameterSets::H264 { sps, pps })
        }
        "H265" => {
            let vps = b64(&param("sprop-vps")?)?;
            let sps = b64(&param("sprop-sps")?)?;
            let pps = b64(&param("sprop-pps")?)?;
            Some(ParameterSets::H265 { vps, sps, pps })
        }
        "MPEG4-GENERIC" => {
            if !param("mode")?.eq_ignore_ascii_case("aac-hbr") {
                return None;
            }
            Some(ParameterSets::AacConfig(from_hex(&param("config")?)?))
        }
        _ => None,
    }
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Finds which media section a downstream `SETUP` request addresses, by
/// comparing the request URI against each media's `control` attribute
/// relative to the `Content-Base` previously sent with the SDP.
pub(crate) fn setup_media_kind(
    sdp: &sdp_types::Session,
    content_base: &str,
    setup_uri: &str,
) -> Option<MediaKind> {
    let control_track = setup_uri.strip_prefix(content_base)?;
    for media in &sdp.medias {
        let matched = media.attributes.iter().any(|a| {
            a.attribute == "control"
                && a.value.as_deref().map(|v| {
                    v == control_track
                        || format!("/{v}") == control_track
                        || v == setup_uri
                }) == Some(true)
        });
        if matched {
            return match media.media.as_str() {
                "video" => Some(MediaKind::Video),
                "audio" => Some(MediaKind::Audio),
                _ => None,
            };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("rtsp://192.168.5.80/ch01").unwrap()
    }

    const SDP_H264_PCMA: &[u8] = b"v=0\r\n\
        o=- 0 0 IN IP4 192.168.5.80\r\n\
        s=h264+pcma\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;profile-level-id=64001f;sprop-parameter-sets=Z2QAH6zZQFAFuhAAAAMAEAAAAwPI8YMZYA==,aOvjyyLA\r\n\
        a=control:trackID=0\r\n\
        m=audio 0 RTP/AVP 8\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn selects_video_and_audio() {
        let tracks = parse_tracks(&base(), SDP_H264_PCMA).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind, MediaKind::Video);
        assert_eq!(tracks[0].encoding, "H264");
        assert_eq!(tracks[0].rtp_payload_type, 96);
        assert_eq!(
            tracks[0].control.as_str(),
            "rtsp://192.168.5.80/ch01/trackID=0"
        );
        match tracks[0].parameter_sets.as_ref().unwrap() {
            ParameterSets::H264 { sps, pps } => {
                assert!(!sps.is_empty());
                assert!(!pps.is_empty());
                assert_eq!(sps[0] & 0x1f, 7); // SPS NAL type
                assert_eq!(pps[0] & 0x1f, 8); // PPS NAL type
            }
            o => panic!("unexpected parameter sets {o:?}"),
        }
        assert_eq!(tracks[1].kind, MediaKind::Audio);
        assert_eq!(tracks[1].encoding, "PCMA");
    }

    #[test]
    fn jpeg_is_skipped() {
        let body = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=mjpeg\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 26\r\n\
            a=control:trackID=0\r\n";
        let tracks = parse_tracks(&base(), body).unwrap();
        assert!(tracks.is_empty());
    }

    #[test]
    fn only_first_video_section_is_matched() {
        let body = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=two video\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=control:trackID=0\r\n\
            m=video 0 RTP/AVP 97\r\n\
            a=rtpmap:97 H265/90000\r\n\
            a=control:trackID=1\r\n";
        let tracks = parse_tracks(&base(), body).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].rtp_payload_type, 96);
    }

    #[test]
    fn h265_parameter_sets() {
        let body = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=hevc\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 98\r\n\
            a=rtpmap:98 H265/90000\r\n\
            a=fmtp:98 sprop-vps=QAEMAf//AWAAAAMAkAAAAwAAAwB4mZgJ;sprop-sps=QgEBAWAAAAMAkAAAAwAAAwB4oAKggC4WNrkky/AIAAADAAgAAAMBlQg=;sprop-pps=RAHA8vA8kA==\r\n\
            a=control:trackID=0\r\n";
        let tracks = parse_tracks(&base(), body).unwrap();
        assert!(matches!(
            tracks[0].parameter_sets,
            Some(ParameterSets::H265 { .. })
        ));
    }

    #[test]
    fn absolute_control_url() {
        let body = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=abs\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=control:rtsp://192.168.5.80/ch01/video\r\n";
        let tracks = parse_tracks(&base(), body).unwrap();
        assert_eq!(tracks[0].control.as_str(), "rtsp://192.168.5.80/ch01/video");
    }

    #[test]
    fn setup_uri_matches_media() {
        let sdp = sdp_types::Session::parse(SDP_H264_PCMA).unwrap();
        let base = "rtsp://relay/live/cam1";
        assert_eq!(
            setup_media_kind(&sdp, base, "rtsp://relay/live/cam1/trackID=0"),
            Some(MediaKind::Video)
        );
        assert_eq!(
            setup_media_kind(&sdp, base, "rtsp://relay/live/cam1/trackID=1"),
            Some(MediaKind::Audio)
        );
        assert_eq!(
            setup_media_kind(&sdp, base, "rtsp://relay/live/cam1/trackID=9"),
            None
        );
    }

    #[test]
    fn garbage_is_an_error() {
        parse_tracks(&base(), b"not sdp at all").unwrap_err();
    }
}
