// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP/RTP relay.
//!
//! Pulls a live stream from a single upstream RTSP source (typically an IP
//! camera) and re-serves it to any number of downstream RTSP viewers,
//! multiplexing one upstream session into many downstream sessions. The
//! pieces:
//!
//! *   [`client`]: the upstream pull session (OPTIONS -> DESCRIBE -> SETUP ->
//!     PLAY, authentication, keepalive, RTCP receiver reports).
//! *   [`server`]: the downstream listener and per-viewer connection state
//!     machine.
//! *   [`relay`]: the registry that reference-counts viewers per source,
//!     owns the shared upstream session's lifecycle, and fans received
//!     buffers out to every viewer.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

mod error;
mod hex;

pub mod auth;
pub mod rtcp;
pub mod rtp;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod client;
mod conn;
pub mod ports;
pub mod relay;
pub mod sdp;
pub mod server;
pub mod source;
pub mod transport;

#[cfg(test)]
mod testutil;

use error::ErrorInt;

/// A received RTSP message: request, response, or interleaved data chunk.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) ctx: RtspMessageContext,
    pub(crate) msg: rtsp_types::Message<bytes::Bytes>,
}

/// The logical channel a relayed RTP/RTCP buffer belongs to.
///
/// On the wire this is an interleaved channel id (TCP) or a UDP port, but
/// within the relay every buffer is tagged with which of the four logical
/// flows it carries so fan-out doesn't need to know transport details.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    VideoRtp,
    VideoRtcp,
    AudioRtp,
    AudioRtcp,
}

impl ChannelKind {
    #[inline]
    pub fn media(self) -> MediaKind {
        match self {
            ChannelKind::VideoRtp | ChannelKind::VideoRtcp => MediaKind::Video,
            ChannelKind::AudioRtp | ChannelKind::AudioRtcp => MediaKind::Audio,
        }
    }

    #[inline]
    pub fn is_rtcp(self) -> bool {
        matches!(self, ChannelKind::VideoRtcp | ChannelKind::AudioRtcp)
    }
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ChannelKind::VideoRtp => "video-rtp",
            ChannelKind::VideoRtcp => "video-rtcp",
            ChannelKind::AudioRtp => "audio-rtp",
            ChannelKind::AudioRtcp => "audio-rtcp",
        })
    }
}

/// A media sub-stream: video or audio.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        })
    }
}

/// A wall time taken from the local machine's realtime clock, used in error reporting.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)<->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Context of a received message (or read error) within an RTSP connection.
///
/// When paired with a [`ConnectionContext`], this should allow picking the
/// message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    /// Time when the application parsed the message. Caveat: this may not
    /// closely match the time on a packet capture if the application is
    /// overloaded (or if `CLOCK_REALTIME` jumps).
    received_wall: WallTime,
}

impl RtspMessageContext {
    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            pos: 0,
            received_wall: WallTime::now(),
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Returns the range within `buf` that represents `subset`.
/// If `subset` is empty, returns None; otherwise panics if `subset` is not within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

pub(crate) fn to_u64(v: usize) -> u64 {
    u64::try_from(v).expect("usize fits in u64")
}
