// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Downstream RTSP server: the listener and one state machine per viewer.
//!
//! Each accepted TCP connection gets its own task owning the framer, the
//! negotiated per-track transports, and a bounded command channel the
//! registry uses to push relayed buffers ([`ConnectionCmd::Media`]) or force
//! a disconnect. The request side mirrors the upstream client in reverse:
//! `OPTIONS` resolves the asked-for source and announces the viewer to the
//! registry, `DESCRIBE` serves the upstream SDP (waiting for the upstream
//! session to become ready), `SETUP` negotiates TCP-interleaved or unicast
//! UDP transport per sub-stream, and `PLAY`/`PAUSE` gate delivery.
//!
//! Viewers on UDP transports must prove liveness (an RTSP request or an RTCP
//! packet within 70 seconds) or delivery force-closes the connection;
//! TCP-interleaved viewers are exempt since a dead socket reports itself.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rand::Rng as _;
use rtsp_types::{headers, Message, Method, Request, Response, StatusCode, Version};
use tokio::sync::mpsc;

use crate::auth::{AuthScheme, Authentication};
use crate::client::{parse_session_header, Credentials};
use crate::conn::Connection;
use crate::ports::{UdpPair, UdpPortPool};
use crate::relay::{ConnectionCmd, ConnectionId, RelayHandle, ViewerHandle};
use crate::sdp;
use crate::source::{SourceResolver, VideoSource};
use crate::transport::{LowerTransport, TransportSpec};
use crate::{ChannelKind, Error, ErrorInt, MediaKind};

/// SSRC advertised in `Transport` replies to viewers.
const GLOBAL_SSRC: u32 = 0x4321_FADE;

/// A viewer on a non-TCP transport must show an RTSP or RTCP sign of life
/// this often, or delivery closes the connection.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(70);

const SUPPORTED_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, GET_PARAMETER, TEARDOWN";

pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,

    /// When set, every request must authenticate (Digest, MD5).
    pub credentials: Option<Credentials>,

    pub realm: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 8554,
            credentials: None,
            realm: "rtsp-relay".to_owned(),
        }
    }
}

/// The downstream listener. Binding is fatal on failure (there is no relay
/// without a listening socket); accepted connections live on their own tasks
/// and their failures stay their own.
pub struct RtspServer {
    listener: tokio::net::TcpListener,
    resolver: Arc<dyn SourceResolver>,
    relay: RelayHandle,
    ports: UdpPortPool,
    auth: Option<Arc<Authentication>>,
    next_id: AtomicU64,
}

impl RtspServer {
    pub async fn bind(
        config: ServerConfig,
        resolver: Arc<dyn SourceResolver>,
        relay: RelayHandle,
        ports: UdpPortPool,
    ) -> Result<Self, Error> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        info!(
            "rtsp server listening on {}",
            listener.local_addr().unwrap_or(addr)
        );
        // One Authentication instance for the server's whole lifetime; the
        // nonce is minted here, not per challenge.
        let auth = config.credentials.as_ref().map(|c| {
            Arc::new(Authentication::new(
                &c.username,
                &c.password,
                &config.realm,
                AuthScheme::Digest,
            ))
        });
        Ok(Self {
            listener,
            resolver,
            relay,
            ports,
            auth,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))
    }

    /// Accepts viewers forever; returns only on listener failure.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
            let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let conn = match Connection::from_stream(stream) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("{} dropping connection from {}: {}", id, peer, e);
                    continue;
                }
            };
            info!("connection {} opened from {}", id, peer);
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let connection = ServerConnection {
                id,
                conn,
                relay: self.relay.clone(),
                resolver: self.resolver.clone(),
                auth: self.auth.clone(),
                ports: self.ports.clone(),
                cmd_tx,
                source: None,
                announced: false,
                content_base: None,
                sdp: None,
                play: false,
                video: None,
                audio: None,
                video_session_id: None,
                audio_session_id: None,
                video_seq: 1,
                audio_seq: 1,
                last_rtsp: Instant::now(),
                last_rtcp: Instant::now(),
            };
            tokio::spawn(connection.run(cmd_rx));
        }
    }
}

/// Transport state for one negotiated sub-stream (video or audio).
struct StreamEndpoint {
    /// The viewer's (first) transport offer.
    client_transport: TransportSpec,

    /// What we answered.
    reply: TransportSpec,

    /// Server-side socket pair; unicast UDP only.
    udp: Option<UdpPair>,
}

struct ServerConnection {
    id: ConnectionId,
    conn: Connection,
    relay: RelayHandle,
    resolver: Arc<dyn SourceResolver>,
    auth: Option<Arc<Authentication>>,
    ports: UdpPortPool,

    /// Sending half of our own command channel, handed to the registry.
    cmd_tx: mpsc::Sender<ConnectionCmd>,

    source: Option<VideoSource>,

    /// Whether the registry has been told about this viewer. A connection
    /// only becomes meaningful once its requested URL resolves.
    announced: bool,

    content_base: Option<String>,
    sdp: Option<sdp_types::Session>,
    play: bool,
    video: Option<StreamEndpoint>,
    audio: Option<StreamEndpoint>,
    video_session_id: Option<String>,
    audio_session_id: Option<String>,
    video_seq: u16,
    audio_seq: u16,
    last_rtsp: Instant,
    last_rtcp: Instant,
}

impl ServerConnection {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnectionCmd>) {
        let reason: &str = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnectionCmd::Media { channel, data }) => {
                        if let Some(reason) = self.send_media(channel, data).await {
                            break reason;
                        }
                    }
                    Some(ConnectionCmd::ForceClose) | None => break "forced",
                },
                msg = self.conn.next_msg() => match msg {
                    None => break "disconnected",
                    Some(Err(e)) => {
                        debug!("{} read failed: {}", self.id, e);
                        break "socket error";
                    }
                    Some(Ok(msg)) => match msg.msg {
                        Message::Request(req) => match self.handle_request(req).await {
                            Ok(None) => {}
                            Ok(Some(reason)) => break reason,
                            Err(e) => {
                                debug!("{} write failed: {}", self.id, e);
                                break "write error";
                            }
                        },
                        Message::Data(_) => {
                            // Interleaved RTCP from the viewer counts as life.
                            self.last_rtcp = Instant::now();
                        }
                        Message::Response(_) => {}
                    }
                },
            }
        };
        self.close(reason).await;
    }

    async fn close(mut self, reason: &str) {
        self.play = false;
        // Dropping the endpoints closes UDP sockets and returns their port
        // reservations to the pool.
        self.video = None;
        self.audio = None;
        info!("connection {} closed: {}", self.id, reason);
        if let (Some(source), true) = (&self.source, self.announced) {
            self.relay.connection_removed(self.id, source.id).await;
        }
    }

    fn reply(&self, req: &Request<Bytes>, status: StatusCode) -> rtsp_types::ResponseBuilder {
        let mut builder = Response::builder(Version::V1_0, status);
        if let Some(cseq) = req.header(&headers::CSEQ) {
            builder = builder.header(headers::CSEQ, cseq.as_str().to_owned());
        }
        if let Some(session) = req.header(&headers::SESSION) {
            builder = builder.header(headers::SESSION, session.as_str().to_owned());
        }
        builder
    }

    /// Dispatches one request. `Ok(Some(reason))` closes the connection.
    async fn handle_request(
        &mut self,
        req: Request<Bytes>,
    ) -> Result<Option<&'static str>, Error> {
        self.last_rtsp = Instant::now();
        trace!("{} received {:?}", self.id, req.method());

        // Authorization gate, ahead of any method-specific handling. A
        // request with a bad header gets one challenge and the socket is
        // closed; a request with no header just gets the challenge.
        if let Some(auth) = self.auth.clone() {
            let method = req.method();
            let method_str: &str = method.into();
            let supplied = req
                .header(&headers::AUTHORIZATION)
                .map(|h| h.as_str().to_owned());
            match supplied {
                None => {
                    let resp = self
                        .reply(&req, StatusCode::Unauthorized)
                        .header(headers::WWW_AUTHENTICATE, auth.challenge_header())
                        .build(Bytes::new());
                    self.conn.send_msg(Message::Response(resp)).await?;
                    return Ok(None);
                }
                Some(h) if !auth.is_valid(&h, method_str) => {
                    let resp = self
                        .reply(&req, StatusCode::Unauthorized)
                        .header(headers::WWW_AUTHENTICATE, auth.challenge_header())
                        .build(Bytes::new());
                    self.conn.send_msg(Message::Response(resp)).await?;
                    return Ok(Some("unauthorized"));
                }
                Some(_) => {}
            }
        }

        match req.method() {
            Method::Options => self.handle_options(req).await.map(|()| None),
            Method::Describe => self.handle_describe(req).await.map(|()| None),
            Method::Setup => self.handle_setup(req).await,
            Method::Play => self.handle_play(req).await.map(|()| None),
            Method::Pause => self.handle_pause(req).await.map(|()| None),
            Method::GetParameter => {
                let resp = self.reply(&req, StatusCode::Ok).build(Bytes::new());
                self.conn.send_msg(Message::Response(resp)).await?;
                Ok(None)
            }
            Method::Teardown => {
                let resp = self.reply(&req, StatusCode::Ok).build(Bytes::new());
                self.conn.send_msg(Message::Response(resp)).await?;
                Ok(Some("teardown"))
            }
            _ => {
                let resp = self
                    .reply(&req, StatusCode::MethodNotAllowed)
                    .build(Bytes::new());
                self.conn.send_msg(Message::Response(resp)).await?;
                Ok(None)
            }
        }
    }

    async fn handle_options(&mut self, req: Request<Bytes>) -> Result<(), Error> {
        if let Some(url) = req.request_uri() {
            if self.source.is_none() {
                self.source = self.resolver.resolve(url);
                match &self.source {
                    Some(source) => info!(
                        "connection {} requested source {} ({:?})",
                        self.id, source.id, source.caption
                    ),
                    None => info!("connection {} requested unknown url {}", self.id, url),
                }
            }
            // The connection starts counting against the source only once
            // the URL resolves.
            if let (Some(source), false) = (&self.source, self.announced) {
                self.announced = true;
                let viewer = ViewerHandle {
                    id: self.id,
                    tx: self.cmd_tx.clone(),
                };
                self.relay.connection_added(viewer, source.clone()).await;
            }
        }
        let resp = self
            .reply(&req, StatusCode::Ok)
            .header(headers::PUBLIC, SUPPORTED_METHODS)
            .build(Bytes::new());
        self.conn.send_msg(Message::Response(resp)).await
    }

    async fn handle_describe(&mut self, req: Request<Bytes>) -> Result<(), Error> {
        let source = match &self.source {
            Some(s) => s.clone(),
            None => {
                let resp = self
                    .reply(&req, StatusCode::MethodNotValidInThisState)
                    .build(Bytes::new());
                return self.conn.send_msg(Message::Response(resp)).await;
            }
        };
        // Bounded by the source's ready timeout inside the registry.
        let sdp_data = self.relay.provide_sdp(source.id).await;
        match sdp_data {
            Some(body) => {
                let requested_url = req
                    .request_uri()
                    .map(|u| u.as_str().trim_end_matches('/').to_owned())
                    .unwrap_or_default();
                self.sdp = sdp_types::Session::parse(&body).ok();
                if self.sdp.is_none() {
                    warn!("{} upstream SDP for {} is unparseable", self.id, source.id);
                }
                self.content_base = Some(requested_url.clone());
                let resp = self
                    .reply(&req, StatusCode::Ok)
                    .header(headers::CONTENT_BASE, requested_url)
                    .header(headers::CONTENT_TYPE, "application/sdp")
                    .build(body);
                self.conn.send_msg(Message::Response(resp)).await
            }
            None => {
                debug!("{} no SDP available for source {}", self.id, source.id);
                let resp = self
                    .reply(&req, StatusCode::MethodNotValidInThisState)
                    .build(Bytes::new());
                self.conn.send_msg(Message::Response(resp)).await
            }
        }
    }

    async fn handle_setup(&mut self, req: Request<Bytes>) -> Result<Option<&'static str>, Error> {
        let offer = req
            .header(&headers::TRANSPORT)
            .map(|h| TransportSpec::parse(h.as_str()));
        let offer = match offer {
            Some(Ok(o)) => o,
            Some(Err(description)) => {
                debug!("{} unparseable Transport offer: {}", self.id, description);
                let resp = self.reply(&req, StatusCode::BadRequest).build(Bytes::new());
                self.conn.send_msg(Message::Response(resp)).await?;
                return Ok(None);
            }
            None => {
                let resp = self.reply(&req, StatusCode::BadRequest).build(Bytes::new());
                self.conn.send_msg(Message::Response(resp)).await?;
                return Ok(None);
            }
        };

        // Multicast delivery to viewers is deliberately unimplemented;
        // reject rather than guess.
        if offer.is_multicast() {
            let resp = self
                .reply(&req, StatusCode::UnsupportedTransport)
                .build(Bytes::new());
            self.conn.send_msg(Message::Response(resp)).await?;
            return Ok(None);
        }

        // Which sub-stream is being set up, by control attribute. An
        // unmatched URI (or SETUP before DESCRIBE) is treated as video.
        let kind = match (&self.sdp, &self.content_base, req.request_uri()) {
            (Some(sdp), Some(base), Some(uri)) => {
                sdp::setup_media_kind(sdp, base, uri.as_str()).unwrap_or(MediaKind::Video)
            }
            _ => MediaKind::Video,
        };

        let mut reply_spec = TransportSpec {
            lower: offer.lower,
            ssrc: Some(GLOBAL_SSRC),
            ..TransportSpec::default()
        };
        let mut udp = None;
        match offer.lower {
            Some(LowerTransport::Tcp) => {
                let channels = match offer.interleaved {
                    Some(c) => c,
                    None => {
                        let resp =
                            self.reply(&req, StatusCode::BadRequest).build(Bytes::new());
                        self.conn.send_msg(Message::Response(resp)).await?;
                        return Ok(None);
                    }
                };
                reply_spec.interleaved = Some(channels);
            }
            Some(LowerTransport::UdpUnicast) => {
                let local_ip = match self.conn.ctx().peer_addr().ip() {
                    IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
                };
                let pair = match self.ports.allocate(local_ip) {
                    Ok(p) => p,
                    Err(e) => {
                        // Surfaced as a failure of this session, not a
                        // silent downgrade to another transport.
                        warn!("{} can't serve UDP: {}", self.id, e);
                        let resp = self
                            .reply(&req, StatusCode::InternalServerError)
                            .build(Bytes::new());
                        self.conn.send_msg(Message::Response(resp)).await?;
                        return Ok(Some("udp allocation failed"));
                    }
                };
                reply_spec.client_port = offer.client_port;
                reply_spec.server_port = Some((pair.rtp_port, pair.rtcp_port()));
                udp = Some(pair);
            }
            Some(LowerTransport::UdpMulticast) | None => unreachable!("rejected above"),
        }

        // Mint a session id for this sub-stream unless the viewer supplied
        // one to echo.
        let session_id = match req.header(&headers::SESSION) {
            Some(h) => parse_session_header(h.as_str()).0,
            None => rand::thread_rng()
                .gen_range(100_000_000..=999_999_999u32)
                .to_string(),
        };
        let endpoint = StreamEndpoint {
            client_transport: offer,
            reply: reply_spec.clone(),
            udp,
        };
        match kind {
            MediaKind::Video => {
                self.video = Some(endpoint);
                self.video_session_id = Some(session_id.clone());
            }
            MediaKind::Audio => {
                self.audio = Some(endpoint);
                self.audio_session_id = Some(session_id.clone());
            }
        }
        debug!(
            "{} set up {} over {}; session {}",
            self.id, kind, reply_spec, session_id
        );
        let resp = self
            .reply(&req, StatusCode::Ok)
            .header(headers::TRANSPORT, reply_spec.to_string())
            .header(
                headers::SESSION,
                format!("{};timeout={}", session_id, LIVENESS_TIMEOUT.as_secs()),
            )
            .build(Bytes::new());
        self.conn.send_msg(Message::Response(resp)).await?;
        Ok(None)
    }

    async fn handle_play(&mut self, req: Request<Bytes>) -> Result<(), Error> {
        self.play = true;
        self.relay.notify_play(self.id).await;
        info!("connection {} play started", self.id);
        let rtp_info = req
            .request_uri()
            .map(|u| format!("url={};seq={}", u, self.video_seq))
            .unwrap_or_default();
        let resp = self
            .reply(&req, StatusCode::Ok)
            .header(headers::RANGE, "npt=0-")
            .header(headers::RTP_INFO, rtp_info)
            .build(Bytes::new());
        self.conn.send_msg(Message::Response(resp)).await
    }

    async fn handle_pause(&mut self, req: Request<Bytes>) -> Result<(), Error> {
        if let Some(h) = req.header(&headers::SESSION) {
            let (id, _) = parse_session_header(h.as_str());
            let matches = self.video_session_id.as_deref() == Some(id.as_str())
                || self.audio_session_id.as_deref() == Some(id.as_str());
            if matches {
                self.play = false;
                self.relay.notify_stop(self.id).await;
                info!("connection {} paused", self.id);
            }
        }
        let resp = self.reply(&req, StatusCode::Ok).build(Bytes::new());
        self.conn.send_msg(Message::Response(resp)).await
    }

    /// Delivers one relayed buffer. Returns a close reason when the
    /// connection must die (liveness timeout or write failure).
    async fn send_media(&mut self, channel: ChannelKind, data: Bytes) -> Option<&'static str> {
        let media = channel.media();
        let peer_ip = self.conn.ctx().peer_addr().ip();
        let endpoint = match media {
            MediaKind::Video => self.video.as_mut(),
            MediaKind::Audio => self.audio.as_mut(),
        }?;

        // RTCP from the viewer arrives on our control socket; receipt is a
        // liveness signal.
        if let Some(pair) = &endpoint.udp {
            let mut buf = [0u8; 1500];
            while pair.rtcp_socket.try_recv_from(&mut buf).is_ok() {
                self.last_rtcp = Instant::now();
            }
        }

        // Viewers fed over their own UDP sockets can vanish silently; the
        // single TCP socket reports its own death.
        let via_tcp = endpoint.client_transport.is_tcp();
        if !via_tcp {
            let now = Instant::now();
            if now.duration_since(self.last_rtsp) > LIVENESS_TIMEOUT
                && now.duration_since(self.last_rtcp) > LIVENESS_TIMEOUT
            {
                info!("connection {} timed out (no keepalive or RTCP)", self.id);
                return Some("timeout");
            }
        }

        if !self.play {
            return None;
        }

        match endpoint.reply.lower {
            Some(LowerTransport::Tcp) => {
                let (rtp_channel, rtcp_channel) = endpoint.reply.interleaved?;
                let channel_id = if channel.is_rtcp() {
                    rtcp_channel
                } else {
                    rtp_channel
                };
                if let Err(e) = self.conn.send_data(channel_id, data).await {
                    debug!("{} interleaved write failed: {}", self.id, e);
                    return Some("write error");
                }
            }
            Some(LowerTransport::UdpUnicast) => {
                let (rtp_port, rtcp_port) = endpoint.client_transport.client_port?;
                let pair = endpoint.udp.as_ref()?;
                let (socket, port) = if channel.is_rtcp() {
                    (&pair.rtcp_socket, rtcp_port)
                } else {
                    (&pair.rtp_socket, rtp_port)
                };
                if let Err(e) = socket.send_to(&data, SocketAddr::new(peer_ip, port)).await {
                    debug!("{} UDP write failed: {}", self.id, e);
                    return Some("write error");
                }
            }
            Some(LowerTransport::UdpMulticast) | None => return None,
        }

        if !channel.is_rtcp() {
            match media {
                MediaKind::Video => self.video_seq = self.video_seq.wrapping_add(1),
                MediaKind::Audio => self.audio_seq = self.audio_seq.wrapping_add(1),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayMsg;
    use crate::source::PathResolver;
    use crate::testutil;
    use url::{Host, Url};

    /// Answers `ProvideSdp` with the canned SDP and records viewer
    /// registrations/removals.
    fn stub_registry() -> (
        RelayHandle,
        mpsc::Receiver<ViewerHandle>,
        mpsc::Receiver<ConnectionId>,
    ) {
        let (handle, mut rx) = RelayHandle::test_pair();
        let (viewers_tx, viewers_rx) = mpsc::channel(8);
        let (removed_tx, removed_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    RelayMsg::ProvideSdp { reply, .. } => {
                        let _ = reply.send(Some(Bytes::from_static(testutil::FAKE_SDP)));
                    }
                    RelayMsg::ConnectionAdded { viewer, .. } => {
                        let _ = viewers_tx.send(viewer).await;
                    }
                    RelayMsg::ConnectionRemoved { connection, .. } => {
                        let _ = removed_tx.send(connection).await;
                    }
                    _ => {}
                }
            }
        });
        (handle, viewers_rx, removed_rx)
    }

    async fn start_server(
        credentials: Option<Credentials>,
    ) -> (
        SocketAddr,
        mpsc::Receiver<ViewerHandle>,
        mpsc::Receiver<ConnectionId>,
    ) {
        let (relay, viewers_rx, removed_rx) = stub_registry();
        let resolver = Arc::new(PathResolver::new(vec![VideoSource::new(
            "cam1",
            "rtsp://upstream/ch0",
        )]));
        let server = RtspServer::bind(
            ServerConfig {
                bind_addr: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port: 0,
                credentials,
                realm: "rtsp-relay".to_owned(),
            },
            resolver,
            relay,
            UdpPortPool::default(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, viewers_rx, removed_rx)
    }

    async fn connect(addr: SocketAddr) -> Connection {
        Connection::connect(Host::Domain("127.0.0.1"), addr.port())
            .await
            .unwrap()
    }

    async fn roundtrip(
        conn: &mut Connection,
        method: Method,
        uri: &str,
        cseq: u32,
        extra: &[(rtsp_types::HeaderName, String)],
    ) -> Response<Bytes> {
        let mut builder = Request::builder(method, Version::V1_0)
            .request_uri(Url::parse(uri).unwrap())
            .header(headers::CSEQ, cseq.to_string());
        for (name, value) in extra {
            builder = builder.header(name.clone(), value.clone());
        }
        conn.send_msg(Message::Request(builder.build(Bytes::new())))
            .await
            .unwrap();
        loop {
            match conn.next_msg().await.unwrap().unwrap().msg {
                Message::Response(r) => return r,
                _ => continue,
            }
        }
    }

    async fn recv_data(conn: &mut Connection) -> (u8, Bytes) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), conn.next_msg())
                .await
                .expect("timed out waiting for interleaved data")
                .expect("connection closed")
                .expect("read error")
                .msg
            {
                Message::Data(d) => return (d.channel_id(), d.into_body()),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn viewer_session_end_to_end() {
        testutil::init_logging();
        let (addr, mut viewers_rx, mut removed_rx) = start_server(None).await;
        let mut conn = connect(addr).await;
        let base = format!("rtsp://127.0.0.1:{}/live/cam1", addr.port());

        let resp = roundtrip(&mut conn, Method::Options, &base, 1, &[]).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert!(resp
            .header(&headers::PUBLIC)
            .unwrap()
            .as_str()
            .contains("SETUP"));
        let viewer = viewers_rx.recv().await.unwrap();

        let resp = roundtrip(&mut conn, Method::Describe, &base, 2, &[]).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(&resp.body()[..], testutil::FAKE_SDP);
        assert_eq!(
            resp.header(&headers::CONTENT_BASE).unwrap().as_str(),
            base.as_str()
        );

        let resp = roundtrip(
            &mut conn,
            Method::Setup,
            &format!("{base}/trackID=0"),
            3,
            &[(
                headers::TRANSPORT,
                "RTP/AVP/TCP;unicast;interleaved=0-1".to_owned(),
            )],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        let transport = resp.header(&headers::TRANSPORT).unwrap().as_str();
        assert!(transport.contains("interleaved=0-1"), "{transport}");
        assert!(transport.contains("ssrc=4321FADE"), "{transport}");
        let session = resp.header(&headers::SESSION).unwrap().as_str();
        let (session_id, timeout) = parse_session_header(session);
        assert_eq!(timeout, Some(LIVENESS_TIMEOUT));

        // Not playing yet: delivery is gated.
        let rtp = crate::rtp::RawPacketBuilder {
            sequence_number: 7,
            timestamp: 1000,
            payload_type: 96,
            ssrc: 0xabcd_ef01,
            mark: true,
        }
        .build(b"frame".iter().copied())
        .unwrap();
        viewer
            .tx
            .send(ConnectionCmd::Media {
                channel: ChannelKind::VideoRtp,
                data: rtp.clone(),
            })
            .await
            .unwrap();

        let resp = roundtrip(
            &mut conn,
            Method::Play,
            &base,
            4,
            &[(headers::SESSION, session_id.clone())],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert!(resp
            .header(&headers::RTP_INFO)
            .unwrap()
            .as_str()
            .starts_with("url="));

        viewer
            .tx
            .send(ConnectionCmd::Media {
                channel: ChannelKind::VideoRtp,
                data: rtp.clone(),
            })
            .await
            .unwrap();
        let (channel_id, body) = recv_data(&mut conn).await;
        assert_eq!(channel_id, 0);
        assert_eq!(body, rtp);

        // PAUSE with the right session id gates delivery again.
        let resp = roundtrip(
            &mut conn,
            Method::Pause,
            &base,
            5,
            &[(headers::SESSION, session_id.clone())],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        viewer
            .tx
            .send(ConnectionCmd::Media {
                channel: ChannelKind::VideoRtp,
                data: rtp.clone(),
            })
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), conn.next_msg())
                .await
                .is_err(),
            "paused connection must not receive data"
        );

        let resp = roundtrip(
            &mut conn,
            Method::Teardown,
            &base,
            6,
            &[(headers::SESSION, session_id)],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert!(
            conn.next_msg().await.is_none(),
            "socket closes after TEARDOWN"
        );
        assert_eq!(removed_rx.recv().await.unwrap(), viewer.id);
    }

    #[tokio::test]
    async fn multicast_setup_is_rejected() {
        testutil::init_logging();
        let (addr, _viewers_rx, _removed_rx) = start_server(None).await;
        let mut conn = connect(addr).await;
        let base = format!("rtsp://127.0.0.1:{}/live/cam1", addr.port());
        roundtrip(&mut conn, Method::Options, &base, 1, &[]).await;
        roundtrip(&mut conn, Method::Describe, &base, 2, &[]).await;
        let resp = roundtrip(
            &mut conn,
            Method::Setup,
            &format!("{base}/trackID=0"),
            3,
            &[(headers::TRANSPORT, "RTP/AVP;multicast".to_owned())],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UnsupportedTransport);
    }

    #[tokio::test]
    async fn udp_setup_allocates_server_ports() {
        testutil::init_logging();
        let (addr, _viewers_rx, _removed_rx) = start_server(None).await;
        let mut conn = connect(addr).await;
        let base = format!("rtsp://127.0.0.1:{}/live/cam1", addr.port());
        roundtrip(&mut conn, Method::Options, &base, 1, &[]).await;
        roundtrip(&mut conn, Method::Describe, &base, 2, &[]).await;
        let resp = roundtrip(
            &mut conn,
            Method::Setup,
            &format!("{base}/trackID=0"),
            3,
            &[(
                headers::TRANSPORT,
                "RTP/AVP;unicast;client_port=9000-9001".to_owned(),
            )],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Ok);
        let reply =
            TransportSpec::parse(resp.header(&headers::TRANSPORT).unwrap().as_str()).unwrap();
        assert_eq!(reply.client_port, Some((9000, 9001)));
        let (server_rtp, server_rtcp) = reply.server_port.unwrap();
        assert_eq!(server_rtp % 2, 0);
        assert_eq!(server_rtcp, server_rtp + 1);
    }

    #[tokio::test]
    async fn credentials_are_enforced() {
        testutil::init_logging();
        let (addr, _viewers_rx, _removed_rx) = start_server(Some(Credentials {
            username: "viewer".to_owned(),
            password: "pw".to_owned(),
        }))
        .await;
        let base = format!("rtsp://127.0.0.1:{}/live/cam1", addr.port());

        // No Authorization: challenged, connection stays open.
        let mut conn = connect(addr).await;
        let resp = roundtrip(&mut conn, Method::Options, &base, 1, &[]).await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
        let challenge = crate::auth::parse_challenge(
            resp.header(&headers::WWW_AUTHENTICATE).unwrap().as_str(),
        )
        .unwrap();

        // A correct Digest answer passes.
        let authorization = crate::auth::generate_authorization(
            "viewer",
            "pw",
            challenge.scheme,
            challenge.realm.as_deref().unwrap(),
            challenge.nonce.as_deref(),
            &base,
            "OPTIONS",
        )
        .unwrap();
        let resp = roundtrip(
            &mut conn,
            Method::Options,
            &base,
            2,
            &[(headers::AUTHORIZATION, authorization)],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Ok);

        // An invalid Authorization header closes the connection.
        let mut conn = connect(addr).await;
        let resp = roundtrip(
            &mut conn,
            Method::Options,
            &base,
            1,
            &[(headers::AUTHORIZATION, "Digest username=\"x\"".to_owned())],
        )
        .await;
        assert_eq!(resp.status(), StatusCode::Unauthorized);
        assert!(conn.next_msg().await.is_none());
    }
}
