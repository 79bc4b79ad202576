// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Upstream RTSP client engine.
//!
//! One engine pulls one source. [`spawn`] opens the TCP connection and
//! drives the session on its own task: `OPTIONS` -> `DESCRIBE` -> one `SETUP`
//! per supported track (strictly sequential; some cameras depend on
//! session-id continuity) -> `PLAY`, then a receive loop which forwards every
//! RTP/RTCP buffer to the owner's event channel, answers Sender Reports with
//! Receiver Reports, and sends periodic keepalives.
//!
//! Authentication follows the retry discipline cameras tolerate: a `401`
//! response to a request that did not carry `Authorization` is answered once
//! with freshly computed credentials; a `401` to a request that already
//! carried them is a hard failure, never a loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Data, Message, Method, Request, Response, StatusCode, Version};
use tokio::sync::{mpsc, watch};
use url::{Host, Url};

use crate::conn::Connection;
use crate::ports::{UdpPair, UdpPortPool};
use crate::sdp::{ParameterSets, Track};
use crate::source::{SourceId, VideoSource};
use crate::transport::TransportSpec;
use crate::{auth, rtcp, rtp, sdp};
use crate::{ChannelKind, Error, ErrorInt, MediaKind};

/// Default duration between keepalive requests; shortened to half of the
/// server-granted session timeout when that is smaller.
pub const KEEPALIVE_DURATION: Duration = Duration::from_secs(20);

/// How long a commanded stop waits for the `TEARDOWN` response before
/// closing the connection anyway.
const TEARDOWN_RESPONSE_GRACE: Duration = Duration::from_secs(1);

/// Hard budget of authorization resends per engine lifetime.
const MAX_RESEND_TRIES: usize = 1;

/// SSRC the engine stamps on its synthesized receiver reports.
const RECEIVER_SSRC: u32 = 12345;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Lower transport to propose in `SETUP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Udp,
    Multicast,
}

#[derive(Clone)]
pub struct ClientOptions {
    /// Local address UDP sockets bind to.
    pub bind_ip: IpAddr,

    /// Pool unicast UDP port pairs are drawn from.
    pub ports: UdpPortPool,

    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            ports: UdpPortPool::default(),
            user_agent: "rtsp-relay".to_owned(),
        }
    }
}

/// Why an engine stopped. `Command` is the only orderly reason; everything
/// else means the upstream session is unhealthy and viewers must not stay
/// attached to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The owner asked for the stop.
    Command,
    ConnectionFailed,
    ConnectionLost,
    AuthorizationFailed,
    SessionFailed,
    /// The server ended the session.
    SessionClosed,
}

/// Events delivered to the engine owner's channel, in order.
#[derive(Debug)]
pub enum ClientEvent {
    /// Codec parameter sets discovered in the SDP, surfaced at `DESCRIBE`
    /// time without waiting for RTP.
    ParameterSets(ParameterSets),

    /// A received RTP or RTCP buffer, tagged with its logical channel.
    Media { channel: ChannelKind, data: Bytes },

    /// The engine has stopped; always the final event.
    Stopped(StopReason),
}

enum ClientCmd {
    Stop(StopReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Negotiating,
    Playing,
    Stopped,
}

struct ClientShared {
    source_id: SourceId,
    ready_timeout: Duration,
    sdp: Mutex<Option<Bytes>>,
    phase: watch::Receiver<Phase>,
    running: AtomicBool,
}

/// Owner's handle to a running engine. Cloneable; all clones observe the
/// same session.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<ClientShared>,
    cmd_tx: mpsc::Sender<ClientCmd>,
}

impl ClientHandle {
    pub fn source_id(&self) -> SourceId {
        self.shared.source_id
    }

    /// Requests a stop. Idempotent and safe to call concurrently with
    /// arriving data; with [`StopReason::Command`] the engine first attempts
    /// an orderly `TEARDOWN`.
    pub fn stop(&self, reason: StopReason) {
        let _ = self.cmd_tx.try_send(ClientCmd::Stop(reason));
    }

    /// Waits (bounded by the source's ready timeout) until the session is
    /// playing with SDP available, or has failed. Returns whether it is
    /// ready; a `false` return distinguishes failure from success.
    pub async fn wait_ready(&self) -> bool {
        let mut phase = self.shared.phase.clone();
        let ready = tokio::time::timeout(self.shared.ready_timeout, async {
            loop {
                match *phase.borrow() {
                    Phase::Playing => return true,
                    Phase::Stopped => return false,
                    Phase::Negotiating => {}
                }
                if phase.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        matches!(ready, Ok(true)) && self.sdp_data().is_some()
    }

    /// The SDP delivered by the source's `DESCRIBE` response, once known.
    pub fn sdp_data(&self) -> Option<Bytes> {
        self.shared.sdp.lock().expect("sdp lock poisoned").clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }
}

/// Starts an engine for `source`, delivering [`ClientEvent`]s to `events`.
pub fn spawn(
    source: VideoSource,
    options: ClientOptions,
    events: mpsc::Sender<ClientEvent>,
) -> ClientHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let (phase_tx, phase_rx) = watch::channel(Phase::Negotiating);
    let shared = Arc::new(ClientShared {
        source_id: source.id,
        ready_timeout: source.ready_timeout,
        sdp: Mutex::new(None),
        phase: phase_rx,
        running: AtomicBool::new(false),
    });
    tokio::spawn(run(source, options, events, shared.clone(), phase_tx, cmd_rx));
    ClientHandle { shared, cmd_tx }
}

async fn run(
    source: VideoSource,
    options: ClientOptions,
    events: mpsc::Sender<ClientEvent>,
    shared: Arc<ClientShared>,
    phase_tx: watch::Sender<Phase>,
    mut cmd_rx: mpsc::Receiver<ClientCmd>,
) {
    info!("start rtsp client for source {}", source.id);
    let mode = if source.use_tcp {
        TransportMode::Tcp
    } else {
        TransportMode::Udp
    };
    let (udp_tx, mut udp_rx) = mpsc::channel(64);
    let mut st =
        match SessionInner::connect(&source, mode, options, events.clone(), shared.clone(), udp_tx)
            .await
        {
            Ok(st) => st,
            Err(e) => {
                warn!("{}: connecting to source failed: {}", source.id, e);
                finish(&shared, &phase_tx, &events, StopReason::ConnectionFailed).await;
                return;
            }
        };
    shared.running.store(true, Ordering::Relaxed);

    // Negotiation is bounded by the ready timeout so a mute server can't pin
    // the task, and interruptible by a stop command.
    let negotiated = tokio::select! {
        r = tokio::time::timeout(source.ready_timeout, st.negotiate()) => match r {
            Ok(Ok(())) => None,
            Ok(Err((reason, e))) => {
                if let Some(e) = e {
                    warn!("{}: session setup failed: {}", source.id, e);
                }
                Some(reason)
            }
            Err(_) => {
                warn!("{}: session setup timed out", source.id);
                Some(StopReason::SessionFailed)
            }
        },
        cmd = cmd_rx.recv() => {
            let reason = match cmd {
                Some(ClientCmd::Stop(r)) => r,
                None => StopReason::Command,
            };
            if reason == StopReason::Command {
                st.teardown_with_grace().await;
            }
            Some(reason)
        }
    };

    let reason = match negotiated {
        Some(reason) => reason,
        None => {
            let _ = phase_tx.send(Phase::Playing);
            st.play_loop(&mut cmd_rx, &mut udp_rx).await
        }
    };
    finish(&shared, &phase_tx, &events, reason).await;
}

async fn finish(
    shared: &ClientShared,
    phase_tx: &watch::Sender<Phase>,
    events: &mpsc::Sender<ClientEvent>,
    reason: StopReason,
) {
    shared.running.store(false, Ordering::Relaxed);
    let _ = phase_tx.send(Phase::Stopped);
    info!("stop rtsp client for source {}: {:?}", shared.source_id, reason);
    let _ = events.send(ClientEvent::Stopped(reason)).await;
}

/// Interleaved channel ids assigned per media, as confirmed (or overridden;
/// some cameras return different numbers than requested) by `SETUP` replies.
#[derive(Default)]
struct TcpChannelMap {
    video: Option<(u8, u8)>,
    audio: Option<(u8, u8)>,
}

impl TcpChannelMap {
    fn assign(&mut self, kind: MediaKind, channels: (u8, u8)) {
        match kind {
            MediaKind::Video => self.video = Some(channels),
            MediaKind::Audio => self.audio = Some(channels),
        }
    }

    fn lookup(&self, channel_id: u8) -> Option<ChannelKind> {
        match (self.video, self.audio) {
            (Some((rtp, _)), _) if rtp == channel_id => Some(ChannelKind::VideoRtp),
            (Some((_, rtcp)), _) if rtcp == channel_id => Some(ChannelKind::VideoRtcp),
            (_, Some((rtp, _))) if rtp == channel_id => Some(ChannelKind::AudioRtp),
            (_, Some((_, rtcp))) if rtcp == channel_id => Some(ChannelKind::AudioRtcp),
            _ => None,
        }
    }

    fn rtcp_channel(&self, media: MediaKind) -> Option<u8> {
        match media {
            MediaKind::Video => self.video.map(|(_, rtcp)| rtcp),
            MediaKind::Audio => self.audio.map(|(_, rtcp)| rtcp),
        }
    }
}

/// UDP sockets serving one track, unicast (pool-reserved) or multicast.
struct UdpTrack {
    rtp_socket: Arc<tokio::net::UdpSocket>,
    rtcp_socket: Arc<tokio::net::UdpSocket>,

    /// Keeps the pool reservation alive; `None` for multicast sockets.
    _reservation: Option<UdpPair>,

    /// Where receiver reports go: the server's control port, learned from
    /// the `SETUP` reply's `server_port`.
    peer_rtcp: Option<SocketAddr>,
}

struct SessionInner {
    source_id: SourceId,
    mode: TransportMode,
    options: ClientOptions,
    events: mpsc::Sender<ClientEvent>,
    shared: Arc<ClientShared>,
    conn: Connection,

    /// Source URL with any embedded userinfo stripped out.
    url: Url,
    creds: Option<Credentials>,
    challenge: Option<auth::Challenge>,
    resend_tries: usize,
    next_cseq: u32,
    session_id: Option<String>,
    keepalive_period: Duration,
    keepalive_cseq: Option<u32>,
    get_parameter_supported: bool,
    set_parameter_supported: bool,
    tcp_channels: TcpChannelMap,
    video_udp: Option<UdpTrack>,
    audio_udp: Option<UdpTrack>,
    udp_tx: mpsc::Sender<(ChannelKind, Bytes)>,
}

impl SessionInner {
    async fn connect(
        source: &VideoSource,
        mode: TransportMode,
        options: ClientOptions,
        events: mpsc::Sender<ClientEvent>,
        shared: Arc<ClientShared>,
        udp_tx: mpsc::Sender<(ChannelKind, Bytes)>,
    ) -> Result<Self, Error> {
        let mut url = Url::parse(&source.url)
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(format!("bad source url: {e}"))))?;
        if url.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidArgument(format!(
                "only rtsp urls are supported, got {:?}",
                url.scheme()
            )));
        }
        let creds = if !url.username().is_empty() {
            let creds = Credentials {
                username: url.username().to_owned(),
                password: url.password().unwrap_or("").to_owned(),
            };
            let _ = url.set_username("");
            let _ = url.set_password(None);
            Some(creds)
        } else {
            None
        };
        let host = url
            .host()
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("no host in url {url}"))))?
            .to_owned();
        let port = url.port().unwrap_or(554);
        debug!("{} connecting to {}:{}", source.id, host, port);
        let conn = Connection::connect(host_as_ref(&host), port)
            .await
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        Ok(Self {
            source_id: source.id,
            mode,
            options,
            events,
            shared,
            conn,
            url,
            creds,
            challenge: None,
            resend_tries: 0,
            next_cseq: 1,
            session_id: None,
            keepalive_period: KEEPALIVE_DURATION,
            keepalive_cseq: None,
            get_parameter_supported: false,
            set_parameter_supported: false,
            tcp_channels: TcpChannelMap::default(),
            video_udp: None,
            audio_udp: None,
            udp_tx,
        })
    }

    /// Fills out `CSeq`, `User-Agent`, and (when a challenge is cached and
    /// credentials exist) `Authorization` headers. Returns the `CSeq`.
    fn fill_req(&mut self, req: &mut Request<Bytes>) -> u32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        req.insert_header(headers::CSEQ, cseq.to_string());
        req.insert_header(headers::USER_AGENT, self.options.user_agent.clone());
        if let (Some(challenge), Some(creds)) = (&self.challenge, &self.creds) {
            let method = req.method();
            let authorization = auth::generate_authorization(
                &creds.username,
                &creds.password,
                challenge.scheme,
                challenge.realm.as_deref().unwrap_or(""),
                challenge.nonce.as_deref(),
                self.url.as_str(),
                method.into(),
            );
            if let Some(authorization) = authorization {
                req.insert_header(headers::AUTHORIZATION, authorization);
            }
        }
        cseq
    }

    /// Sends a request and waits for its (CSeq-matched) response,
    /// transparently performing the single allowed authorization resend.
    /// Data messages arriving in between are forwarded, not dropped.
    async fn send(
        &mut self,
        req: &mut Request<Bytes>,
    ) -> Result<Response<Bytes>, (StopReason, Error)> {
        loop {
            let cseq = self.fill_req(req);
            let had_authorization = req.header(&headers::AUTHORIZATION).is_some();
            self.conn
                .send_msg(Message::Request(req.clone()))
                .await
                .map_err(|e| (StopReason::ConnectionLost, e))?;
            let (resp, msg_ctx) = loop {
                let msg = match self.conn.next_msg().await {
                    None => {
                        let e = wrap!(ErrorInt::RtspReadError {
                            conn_ctx: *self.conn.ctx(),
                            msg_ctx: self.conn.eof_ctx(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "EOF while waiting for response",
                            ),
                        });
                        return Err((StopReason::ConnectionLost, e));
                    }
                    Some(Err(e)) => return Err((StopReason::ConnectionLost, e)),
                    Some(Ok(msg)) => msg,
                };
                match msg.msg {
                    Message::Response(r) => {
                        if get_cseq(&r) == Some(cseq) {
                            break (r, msg.ctx);
                        }
                        trace!("{} ignoring response with unrelated CSeq", self.source_id);
                    }
                    Message::Data(data) => {
                        if self.handle_data(data).await.is_err() {
                            return Err((
                                StopReason::Command,
                                wrap!(ErrorInt::FailedPrecondition(
                                    "event consumer went away".to_owned()
                                )),
                            ));
                        }
                    }
                    Message::Request(r) => {
                        debug!(
                            "{} ignoring {:?} request from server",
                            self.source_id,
                            r.method()
                        );
                    }
                }
            };
            if resp.status() == StatusCode::Unauthorized {
                let method = req.method();
                if had_authorization {
                    // Our credentials were actually rejected; a second
                    // resend could only loop.
                    return Err((
                        StopReason::AuthorizationFailed,
                        response_err(
                            self.conn.ctx(),
                            msg_ctx,
                            method.clone(),
                            cseq,
                            &resp,
                            "authorization failed with supplied credentials",
                        ),
                    ));
                }
                if self.resend_tries >= MAX_RESEND_TRIES {
                    return Err((
                        StopReason::SessionFailed,
                        response_err(
                            self.conn.ctx(),
                            msg_ctx,
                            method.clone(),
                            cseq,
                            &resp,
                            "out of authorization retries",
                        ),
                    ));
                }
                let www_authenticate = match resp.header(&headers::WWW_AUTHENTICATE) {
                    Some(h) => h.as_str().to_owned(),
                    None => {
                        return Err((
                            StopReason::SessionFailed,
                            response_err(
                                self.conn.ctx(),
                                msg_ctx,
                                method.clone(),
                                cseq,
                                &resp,
                                "Unauthorized without WWW-Authenticate",
                            ),
                        ));
                    }
                };
                self.challenge = auth::parse_challenge(&www_authenticate);
                if self.challenge.is_none() {
                    return Err((
                        StopReason::SessionFailed,
                        response_err(
                            self.conn.ctx(),
                            msg_ctx,
                            method.clone(),
                            cseq,
                            &resp,
                            "unparseable WWW-Authenticate challenge",
                        ),
                    ));
                }
                debug!(
                    "{} got auth challenge; resending {:?}",
                    self.source_id, method
                );
                self.resend_tries += 1;
                continue;
            }
            if !resp.status().is_success() {
                let method = req.method();
                return Err((
                    StopReason::SessionFailed,
                    response_err(
                        self.conn.ctx(),
                        msg_ctx,
                        method.clone(),
                        cseq,
                        &resp,
                        "unexpected status",
                    ),
                ));
            }
            return Ok(resp);
        }
    }

    async fn negotiate(&mut self) -> Result<(), (StopReason, Option<Error>)> {
        let failed = |e: Error| (StopReason::SessionFailed, Some(e));
        let request_err = |(reason, e): (StopReason, Error)| (reason, Some(e));

        // OPTIONS: learn which keepalive method the server advertises.
        let mut req = Request::builder(Method::Options, Version::V1_0)
            .request_uri(self.url.clone())
            .build(Bytes::new());
        let resp = self.send(&mut req).await.map_err(request_err)?;
        if let Some(public) = resp.header(&headers::PUBLIC) {
            for method in public.as_str().split(',') {
                match method.trim().to_ascii_uppercase().as_str() {
                    "GET_PARAMETER" => self.get_parameter_supported = true,
                    "SET_PARAMETER" => self.set_parameter_supported = true,
                    _ => {}
                }
            }
        }
        trace!(
            "{} server advertises GET_PARAMETER={} SET_PARAMETER={}",
            self.source_id,
            self.get_parameter_supported,
            self.set_parameter_supported
        );

        // DESCRIBE: select tracks and surface parameter sets right away.
        let mut req = Request::builder(Method::Describe, Version::V1_0)
            .request_uri(self.url.clone())
            .header(headers::ACCEPT, "application/sdp")
            .build(Bytes::new());
        let resp = self.send(&mut req).await.map_err(request_err)?;
        let base_url = resp
            .header(&headers::CONTENT_BASE)
            .or_else(|| resp.header(&headers::CONTENT_LOCATION))
            .and_then(|v| Url::parse(v.as_str()).ok())
            .unwrap_or_else(|| self.url.clone());
        let sdp_body = resp.body().clone();
        let tracks = sdp::parse_tracks(&base_url, &sdp_body).map_err(failed)?;
        if tracks.is_empty() {
            return Err(failed(wrap!(ErrorInt::FailedPrecondition(format!(
                "no supported tracks in SDP from {}",
                self.url
            )))));
        }
        debug!("{} matched tracks: {:?}", self.source_id, tracks);
        *self.shared.sdp.lock().expect("sdp lock poisoned") = Some(sdp_body);
        for track in &tracks {
            if let Some(sets) = &track.parameter_sets {
                if self
                    .events
                    .send(ClientEvent::ParameterSets(sets.clone()))
                    .await
                    .is_err()
                {
                    return Err((StopReason::Command, None));
                }
            }
        }

        // SETUP, one track at a time. Pipelining these is not an option:
        // each subsequent request must adopt the previous reply's session id.
        let mut next_channel = 0u8;
        for track in &tracks {
            self.setup_track(track, &mut next_channel).await?;
        }

        // PLAY.
        let session_id = match &self.session_id {
            Some(s) => s.clone(),
            None => {
                return Err(failed(wrap!(ErrorInt::FailedPrecondition(
                    "no session id granted by SETUP".to_owned()
                ))))
            }
        };
        let mut req = Request::builder(Method::Play, Version::V1_0)
            .request_uri(self.url.clone())
            .header(headers::SESSION, session_id)
            .header(headers::RANGE, "npt=0.000-")
            .build(Bytes::new());
        self.send(&mut req).await.map_err(request_err)?;
        debug!("{} playing", self.source_id);
        Ok(())
    }

    async fn setup_track(
        &mut self,
        track: &Track,
        next_channel: &mut u8,
    ) -> Result<(), (StopReason, Option<Error>)> {
        let proposal = match self.mode {
            TransportMode::Tcp => {
                let channels = (*next_channel, *next_channel + 1);
                *next_channel += 2;
                self.tcp_channels.assign(track.kind, channels);
                TransportSpec::tcp_interleaved(channels.0, channels.1)
            }
            TransportMode::Udp => {
                let pair = self
                    .options
                    .ports
                    .allocate(self.options.bind_ip)
                    .map_err(|e| (StopReason::SessionFailed, Some(e)))?;
                let spec = TransportSpec::udp_unicast((pair.rtp_port, pair.rtcp_port()));
                self.install_udp_track(
                    track.kind,
                    UdpTrack {
                        rtp_socket: pair.rtp_socket.clone(),
                        rtcp_socket: pair.rtcp_socket.clone(),
                        _reservation: Some(pair),
                        peer_rtcp: None,
                    },
                );
                spec
            }
            TransportMode::Multicast => TransportSpec::udp_multicast(),
        };
        let mut builder = Request::builder(Method::Setup, Version::V1_0)
            .request_uri(track.control.clone())
            .header(headers::TRANSPORT, proposal.to_string());
        if let Some(s) = &self.session_id {
            builder = builder.header(headers::SESSION, s.clone());
        }
        let mut req = builder.build(Bytes::new());
        let resp = self
            .send(&mut req)
            .await
            .map_err(|(reason, e)| (reason, Some(e)))?;

        // Adopt the server's session identity for all subsequent requests.
        // A granted timeout shorter than twice the keepalive period would
        // expire the session between keepalives; halve it.
        if let Some(session) = resp.header(&headers::SESSION) {
            let (id, timeout) = parse_session_header(session.as_str());
            self.session_id = Some(id);
            if let Some(timeout) = timeout {
                let half = timeout / 2;
                if half < self.keepalive_period {
                    self.keepalive_period = half;
                }
            }
        }

        if let Some(transport) = resp.header(&headers::TRANSPORT) {
            match TransportSpec::parse(transport.as_str()) {
                Ok(reply) => self
                    .apply_transport_reply(track.kind, reply)
                    .map_err(|e| (StopReason::SessionFailed, Some(e)))?,
                Err(description) => {
                    warn!(
                        "{} ignoring unparseable SETUP Transport reply: {}",
                        self.source_id, description
                    );
                }
            }
        }
        Ok(())
    }

    fn apply_transport_reply(&mut self, kind: MediaKind, reply: TransportSpec) -> Result<(), Error> {
        if reply.is_multicast() {
            let destination = reply.destination.ok_or_else(|| {
                wrap!(ErrorInt::FailedPrecondition(
                    "multicast SETUP reply without destination".to_owned()
                ))
            })?;
            let ports = reply.port.ok_or_else(|| {
                wrap!(ErrorInt::FailedPrecondition(
                    "multicast SETUP reply without port pair".to_owned()
                ))
            })?;
            return self.join_multicast(kind, destination, ports);
        }
        if reply.is_tcp() {
            // Trust the reply's channel numbers over our own proposal; at
            // least one camera vendor renumbers them.
            if let Some(channels) = reply.interleaved {
                self.tcp_channels.assign(kind, channels);
            }
            return Ok(());
        }
        // Unicast UDP: note where receiver reports should go.
        if let Some((_, server_rtcp)) = reply.server_port {
            let peer_ip = self.conn.ctx().peer_addr().ip();
            if let Some(track) = self.udp_track_mut(kind) {
                track.peer_rtcp = Some(SocketAddr::new(peer_ip, server_rtcp));
            }
        }
        Ok(())
    }

    fn join_multicast(
        &mut self,
        kind: MediaKind,
        destination: IpAddr,
        ports: (u16, u16),
    ) -> Result<(), Error> {
        let bind = |port: u16| -> std::io::Result<Arc<tokio::net::UdpSocket>> {
            let s = std::net::UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                port,
            ))?;
            s.set_nonblocking(true)?;
            Ok(Arc::new(tokio::net::UdpSocket::from_std(s)?))
        };
        let join = |s: &tokio::net::UdpSocket| -> std::io::Result<()> {
            match destination {
                IpAddr::V4(group) => s.join_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(group) => s.join_multicast_v6(&group, 0),
            }
        };
        let rtp_socket = bind(ports.0).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let rtcp_socket = bind(ports.1).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        join(&rtp_socket).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        join(&rtcp_socket).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        debug!(
            "{} joined multicast group {} ports {}-{}",
            self.source_id, destination, ports.0, ports.1
        );
        self.install_udp_track(
            kind,
            UdpTrack {
                rtp_socket,
                rtcp_socket,
                _reservation: None,
                peer_rtcp: None,
            },
        );
        Ok(())
    }

    fn install_udp_track(&mut self, kind: MediaKind, track: UdpTrack) {
        let (rtp_channel, rtcp_channel) = match kind {
            MediaKind::Video => (ChannelKind::VideoRtp, ChannelKind::VideoRtcp),
            MediaKind::Audio => (ChannelKind::AudioRtp, ChannelKind::AudioRtcp),
        };
        spawn_udp_reader(track.rtp_socket.clone(), rtp_channel, self.udp_tx.clone());
        spawn_udp_reader(track.rtcp_socket.clone(), rtcp_channel, self.udp_tx.clone());
        match kind {
            MediaKind::Video => self.video_udp = Some(track),
            MediaKind::Audio => self.audio_udp = Some(track),
        }
    }

    fn udp_track_mut(&mut self, kind: MediaKind) -> Option<&mut UdpTrack> {
        match kind {
            MediaKind::Video => self.video_udp.as_mut(),
            MediaKind::Audio => self.audio_udp.as_mut(),
        }
    }

    /// The steady state: forward data, answer sender reports, keep the
    /// session alive, until an error or a stop command.
    async fn play_loop(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<ClientCmd>,
        udp_rx: &mut mpsc::Receiver<(ChannelKind, Bytes)>,
    ) -> StopReason {
        let mut keepalive = tokio::time::interval(self.keepalive_period);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let reason = match cmd {
                        Some(ClientCmd::Stop(r)) => r,
                        None => StopReason::Command,
                    };
                    if reason == StopReason::Command {
                        self.teardown_with_grace().await;
                    }
                    return reason;
                }
                msg = self.conn.next_msg() => match msg {
                    None => return StopReason::ConnectionLost,
                    Some(Err(e)) => {
                        warn!("{} read failed: {}", self.source_id, e);
                        return StopReason::ConnectionLost;
                    }
                    Some(Ok(msg)) => match msg.msg {
                        Message::Data(data) => {
                            if self.handle_data(data).await.is_err() {
                                return StopReason::Command;
                            }
                        }
                        Message::Response(resp) => {
                            if let Err(reason) = self.handle_response_playing(resp) {
                                return reason;
                            }
                        }
                        Message::Request(req) => {
                            debug!(
                                "{} ignoring {:?} request from server",
                                self.source_id,
                                req.method()
                            );
                        }
                    }
                },
                received = udp_rx.recv() => {
                    if let Some((channel, data)) = received {
                        if self.process_buffer(channel, data).await.is_err() {
                            return StopReason::Command;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.send_keepalive().await {
                        warn!("{} keepalive write failed: {}", self.source_id, e);
                        return StopReason::ConnectionLost;
                    }
                }
            }
        }
    }

    async fn handle_data(&mut self, data: Data<Bytes>) -> Result<(), ()> {
        let channel_id = data.channel_id();
        let channel = match self.tcp_channels.lookup(channel_id) {
            Some(c) => c,
            None => {
                debug!(
                    "{} data on unassigned interleaved channel {}",
                    self.source_id, channel_id
                );
                return Ok(());
            }
        };
        self.process_buffer(channel, data.into_body()).await
    }

    /// Forwards a buffer to the owner; RTCP additionally gets walked for
    /// sender reports to answer. Errors only when the owner went away.
    async fn process_buffer(&mut self, channel: ChannelKind, data: Bytes) -> Result<(), ()> {
        if channel.is_rtcp() {
            self.process_rtcp(channel, &data).await;
        } else if let Err(e) = rtp::RawPacket::new(data.clone()) {
            debug!("{} malformed RTP on {}: {}", self.source_id, channel, e.reason);
        }
        self.events
            .send(ClientEvent::Media { channel, data })
            .await
            .map_err(|_| ())
    }

    /// Walks the concatenated packets of an RTCP buffer; each sender report
    /// is answered with a minimal receiver report over the same transport
    /// the data arrived on.
    async fn process_rtcp(&mut self, channel: ChannelKind, data: &Bytes) {
        let mut rest = &data[..];
        while !rest.is_empty() {
            let (pkt, after) = match rtcp::PacketRef::parse(rest) {
                Ok(parsed) => parsed,
                Err(description) => {
                    debug!("{} bad RTCP packet: {}", self.source_id, description);
                    return;
                }
            };
            rest = after;
            match pkt.as_sender_report() {
                Ok(Some(sr)) => {
                    trace!(
                        "{} SR on {}: ssrc={:08x} rtp_ts={}",
                        self.source_id,
                        channel,
                        sr.ssrc(),
                        sr.rtp_timestamp()
                    );
                    self.send_receiver_report(channel.media()).await;
                }
                Ok(None) => {}
                Err(description) => {
                    debug!("{} bad RTCP SR: {}", self.source_id, description);
                }
            }
        }
    }

    async fn send_receiver_report(&mut self, media: MediaKind) {
        let report = rtcp::ReceiverReportBuilder { ssrc: RECEIVER_SSRC }.build();
        match self.mode {
            TransportMode::Tcp => {
                if let Some(channel) = self.tcp_channels.rtcp_channel(media) {
                    if let Err(e) = self.conn.send_data(channel, report).await {
                        debug!("{} error writing receiver report: {}", self.source_id, e);
                    }
                }
            }
            TransportMode::Udp | TransportMode::Multicast => {
                let track = match media {
                    MediaKind::Video => self.video_udp.as_ref(),
                    MediaKind::Audio => self.audio_udp.as_ref(),
                };
                if let Some(track) = track {
                    if let Some(peer) = track.peer_rtcp {
                        if let Err(e) = track.rtcp_socket.send_to(&report, peer).await {
                            debug!("{} error sending receiver report: {}", self.source_id, e);
                        }
                    }
                }
            }
        }
    }

    fn handle_response_playing(&mut self, resp: Response<Bytes>) -> Result<(), StopReason> {
        let cseq = get_cseq(&resp);
        if cseq.is_some() && cseq == self.keepalive_cseq {
            self.keepalive_cseq = None;
            if resp.status() == StatusCode::Unauthorized {
                // Keepalives carry Authorization whenever a challenge is
                // cached, so a 401 here means rejected credentials.
                if self.challenge.is_some() {
                    return Err(StopReason::AuthorizationFailed);
                }
                return Err(StopReason::SessionFailed);
            }
            return Ok(());
        }
        debug!(
            "{} unexpected {} response in play state",
            self.source_id,
            resp.status()
        );
        Ok(())
    }

    async fn send_keepalive(&mut self) -> Result<(), Error> {
        let method = if self.get_parameter_supported {
            Method::GetParameter
        } else {
            Method::Options
        };
        let mut builder = Request::builder(method, Version::V1_0).request_uri(self.url.clone());
        if let Some(s) = &self.session_id {
            builder = builder.header(headers::SESSION, s.clone());
        }
        let mut req = builder.build(Bytes::new());
        let cseq = self.fill_req(&mut req);
        self.keepalive_cseq = Some(cseq);
        self.conn.send_msg(Message::Request(req)).await
    }

    /// Attempts an orderly `TEARDOWN` so the server can release its own
    /// resources, bounded by a short grace window.
    async fn teardown_with_grace(&mut self) {
        let session_id = match &self.session_id {
            Some(s) => s.clone(),
            None => return,
        };
        let mut req = Request::builder(Method::Teardown, Version::V1_0)
            .request_uri(self.url.clone())
            .header(headers::SESSION, session_id)
            .build(Bytes::new());
        let cseq = self.fill_req(&mut req);
        if let Err(e) = self.conn.send_msg(Message::Request(req)).await {
            debug!("{} error sending TEARDOWN: {}", self.source_id, e);
            return;
        }
        let deadline = tokio::time::Instant::now() + TEARDOWN_RESPONSE_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, self.conn.next_msg()).await {
                Err(_) => {
                    trace!("{} no TEARDOWN response within grace", self.source_id);
                    return;
                }
                Ok(None) | Ok(Some(Err(_))) => return,
                Ok(Some(Ok(msg))) => {
                    if let Message::Response(resp) = msg.msg {
                        if get_cseq(&resp) == Some(cseq) {
                            trace!("{} TEARDOWN acknowledged", self.source_id);
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn response_err(
    conn_ctx: &crate::ConnectionContext,
    msg_ctx: crate::RtspMessageContext,
    method: Method,
    cseq: u32,
    resp: &Response<Bytes>,
    description: &str,
) -> Error {
    wrap!(ErrorInt::RtspResponseError {
        conn_ctx: *conn_ctx,
        msg_ctx,
        method,
        cseq,
        status: resp.status(),
        description: description.to_owned(),
    })
}

fn spawn_udp_reader(
    socket: Arc<tokio::net::UdpSocket>,
    channel: ChannelKind,
    tx: mpsc::Sender<(ChannelKind, Bytes)>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, _from)) => {
                    if tx
                        .send((channel, Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break; // session ended
                    }
                }
                Err(e) => {
                    debug!("UDP receive error on {channel}: {e}");
                    break;
                }
            }
        }
    });
}

fn host_as_ref(host: &Host<String>) -> Host<&str> {
    match host {
        Host::Domain(d) => Host::Domain(d.as_str()),
        Host::Ipv4(ip) => Host::Ipv4(*ip),
        Host::Ipv6(ip) => Host::Ipv6(*ip),
    }
}

/// Returns the `CSeq` of an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &Response<Bytes>) -> Option<u32> {
    response
        .header(&headers::CSEQ)
        .and_then(|cseq| cseq.as_str().trim().parse().ok())
}

/// Splits a `Session` header value into the id and the optional
/// `timeout=<seconds>` parameter.
pub(crate) fn parse_session_header(value: &str) -> (String, Option<Duration>) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or("").trim().to_owned();
    let timeout = parts.find_map(|p| {
        p.trim()
            .strip_prefix("timeout=")
            .and_then(|t| t.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    });
    (id, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn session_header() {
        assert_eq!(
            parse_session_header("23456789;timeout=60"),
            ("23456789".to_owned(), Some(Duration::from_secs(60)))
        );
        assert_eq!(
            parse_session_header("23456789"),
            ("23456789".to_owned(), None)
        );
    }

    #[test]
    fn channel_map_prefers_reply_numbers() {
        let mut map = TcpChannelMap::default();
        map.assign(MediaKind::Video, (0, 1));
        map.assign(MediaKind::Audio, (2, 3));
        // A camera that renumbers video to 4-5 in its reply.
        map.assign(MediaKind::Video, (4, 5));
        assert_eq!(map.lookup(4), Some(ChannelKind::VideoRtp));
        assert_eq!(map.lookup(5), Some(ChannelKind::VideoRtcp));
        assert_eq!(map.lookup(0), None);
        assert_eq!(map.lookup(2), Some(ChannelKind::AudioRtp));
        assert_eq!(map.rtcp_channel(MediaKind::Video), Some(5));
    }

    #[tokio::test]
    async fn tcp_session_reaches_ready_and_forwards_rtp() {
        testutil::init_logging();
        let (fake, fake_state) =
            testutil::FakeCamera::start(testutil::FakeCameraBehavior::Normal).await;
        let mut source = VideoSource::new("cam", &fake.url());
        source.ready_timeout = Duration::from_secs(5);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let handle = spawn(source, ClientOptions::default(), events_tx);

        assert!(handle.wait_ready().await);
        assert!(handle.sdp_data().is_some());
        assert!(handle.is_running());

        // Parameter sets come from the SDP, before any RTP.
        match events_rx.recv().await.unwrap() {
            ClientEvent::ParameterSets(ParameterSets::H264 { sps, pps }) => {
                assert!(!sps.is_empty());
                assert!(!pps.is_empty());
            }
            o => panic!("expected parameter sets, got {o:?}"),
        }
        match events_rx.recv().await.unwrap() {
            ClientEvent::Media { channel, data } => {
                assert_eq!(channel, ChannelKind::VideoRtp);
                let (pkt, _) = rtp::RawPacket::new(data).unwrap();
                assert_eq!(pkt.payload_type(), 96);
            }
            o => panic!("expected media, got {o:?}"),
        }

        handle.stop(StopReason::Command);
        loop {
            match events_rx.recv().await.unwrap() {
                ClientEvent::Stopped(reason) => {
                    assert_eq!(reason, StopReason::Command);
                    break;
                }
                _ => continue,
            }
        }
        // The fake server saw an orderly TEARDOWN.
        assert!(fake_state.saw_teardown());
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn udp_session_receives_rtp() {
        testutil::init_logging();
        let (fake, _fake_state) =
            testutil::FakeCamera::start(testutil::FakeCameraBehavior::Normal).await;
        let mut source = VideoSource::new("cam", &fake.url());
        source.use_tcp = false;
        source.ready_timeout = Duration::from_secs(5);
        let options = ClientOptions {
            bind_ip: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            ports: UdpPortPool::new(52_000..52_020),
            ..ClientOptions::default()
        };
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let handle = spawn(source, options, events_tx);
        assert!(handle.wait_ready().await);
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .expect("timed out waiting for UDP media")
                .unwrap()
            {
                ClientEvent::Media { channel, data } => {
                    assert_eq!(channel, ChannelKind::VideoRtp);
                    let (pkt, _) = rtp::RawPacket::new(data).unwrap();
                    assert_eq!(pkt.sequence_number(), 1);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn digest_challenge_is_answered_once() {
        testutil::init_logging();
        let (fake, fake_state) =
            testutil::FakeCamera::start(testutil::FakeCameraBehavior::RequireDigestAuth {
                username: "admin",
                password: "pw",
            })
            .await;
        let url = fake.url().replace("rtsp://", "rtsp://admin:pw@");
        let mut source = VideoSource::new("cam", &url);
        source.ready_timeout = Duration::from_secs(5);
        let (events_tx, _events_rx) = mpsc::channel(64);
        let handle = spawn(source, ClientOptions::default(), events_tx);
        assert!(handle.wait_ready().await);
        assert!(fake_state.saw_authorized_request());
    }

    #[tokio::test]
    async fn rejected_credentials_fail_hard() {
        testutil::init_logging();
        let (fake, _fake_state) =
            testutil::FakeCamera::start(testutil::FakeCameraBehavior::RejectAllAuth).await;
        let url = fake.url().replace("rtsp://", "rtsp://admin:wrong@");
        let mut source = VideoSource::new("cam", &url);
        source.ready_timeout = Duration::from_secs(5);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let handle = spawn(source, ClientOptions::default(), events_tx);
        assert!(!handle.wait_ready().await);
        loop {
            match events_rx.recv().await.unwrap() {
                ClientEvent::Stopped(reason) => {
                    // The first 401 triggers the single resend with
                    // Authorization; the second 401 is terminal.
                    assert_eq!(reason, StopReason::AuthorizationFailed);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn connect_refused_stops_with_connection_failed() {
        testutil::init_logging();
        // Bind a listener to learn a free port, then close it.
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        let mut source = VideoSource::new("cam", &format!("rtsp://127.0.0.1:{port}/ch0"));
        source.ready_timeout = Duration::from_secs(5);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let handle = spawn(source, ClientOptions::default(), events_tx);
        match events_rx.recv().await.unwrap() {
            ClientEvent::Stopped(reason) => assert_eq!(reason, StopReason::ConnectionFailed),
            o => panic!("expected stop, got {o:?}"),
        }
        assert!(!handle.wait_ready().await);
    }
}
