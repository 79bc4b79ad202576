// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Video source definitions and request-URL resolution.
//!
//! Source persistence (CRUD, on-disk storage) belongs to an outer layer;
//! the relay core only needs an immutable [`VideoSource`] per relayed stream
//! and a way to find one from the URL a viewer asked for.

use std::time::Duration;

use url::Url;
use uuid::Uuid;

/// Identifies a configured upstream source.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub Uuid);

impl SourceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// One configured upstream camera/encoder, immutable for the duration of a
/// relay session.
#[derive(Clone, Debug)]
pub struct VideoSource {
    pub id: SourceId,

    /// Human-readable name; also usable as the URL token viewers request.
    pub caption: String,

    /// Upstream RTSP URL. May embed `user:pass@` credentials; the client
    /// engine strips them out before connecting.
    pub url: String,

    pub enabled: bool,

    /// Pull over TCP-interleaved transport rather than UDP.
    pub use_tcp: bool,

    /// How long a viewer may wait for the upstream session to become ready.
    pub ready_timeout: Duration,
}

impl VideoSource {
    /// Default bound on waiting for the upstream session's SDP/PLAY.
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(caption: &str, url: &str) -> Self {
        Self {
            id: SourceId::random(),
            caption: caption.to_owned(),
            url: url.to_owned(),
            enabled: true,
            use_tcp: true,
            ready_timeout: Self::DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Maps the URL a downstream viewer requested to a configured source.
///
/// Implemented outside the protocol core (typically backed by the source
/// store); [`PathResolver`] is the stock rule.
pub trait SourceResolver: Send + Sync + 'static {
    fn resolve(&self, request_url: &Url) -> Option<VideoSource>;
}

/// Resolves `rtsp://host/live/<token>` where `<token>` is a source id or,
/// failing that, a source caption.
pub struct PathResolver {
    sources: Vec<VideoSource>,
}

impl PathResolver {
    pub fn new(sources: Vec<VideoSource>) -> Self {
        Self { sources }
    }

    fn token(url: &Url) -> Option<&str> {
        let mut segments = url.path_segments()?;
        if segments.next() != Some("live") {
            return None;
        }
        match segments.next() {
            Some(t) if !t.is_empty() => Some(t),
            _ => None,
        }
    }
}

impl SourceResolver for PathResolver {
    fn resolve(&self, request_url: &Url) -> Option<VideoSource> {
        let token = Self::token(request_url)?;
        if let Ok(id) = token.parse::<Uuid>() {
            if let Some(s) = self.sources.iter().find(|s| s.id == SourceId(id)) {
                return Some(s.clone());
            }
        }
        self.sources.iter().find(|s| s.caption == token).cloned()
    }
}
