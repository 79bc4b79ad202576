// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared test helpers: logging setup and a scripted fake RTSP camera.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rtsp_types::{headers, Message, Method, Request, Response, StatusCode, Version};

use crate::auth::{AuthScheme, Authentication};
use crate::conn::Connection;
use crate::transport::TransportSpec;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An H.264 video track with in-band parameter sets, as a camera would
/// describe itself.
pub(crate) const FAKE_SDP: &[u8] = b"v=0\r\n\
    o=- 2208988800 2208988800 IN IP4 127.0.0.1\r\n\
    s=fake camera\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z2QAH6zZQFAFuhAAAAMAEAAAAwPI8YMZYA==,aOvjyyLA\r\n\
    a=control:trackID=0\r\n";

pub(crate) enum FakeCameraBehavior {
    /// Answer everything, send one RTP frame after `PLAY`.
    Normal,

    /// Challenge unauthenticated requests with Digest, then behave normally.
    RequireDigestAuth {
        username: &'static str,
        password: &'static str,
    },

    /// Challenge every request with 401, even authorized ones.
    RejectAllAuth,
}

/// Observations made by the fake, for assertions after the fact.
#[derive(Clone, Default)]
pub(crate) struct FakeCameraState(Arc<FakeCameraStateInner>);

#[derive(Default)]
struct FakeCameraStateInner {
    teardown: AtomicBool,
    authorized: AtomicBool,
}

impl FakeCameraState {
    pub(crate) fn saw_teardown(&self) -> bool {
        self.0.teardown.load(Ordering::SeqCst)
    }

    pub(crate) fn saw_authorized_request(&self) -> bool {
        self.0.authorized.load(Ordering::SeqCst)
    }
}

/// A single-connection scripted RTSP server on a loopback port.
pub(crate) struct FakeCamera {
    port: u16,
}

impl FakeCamera {
    pub(crate) async fn start(behavior: FakeCameraBehavior) -> (FakeCamera, FakeCameraState) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = FakeCameraState::default();
        tokio::spawn(serve(listener, behavior, state.clone()));
        (FakeCamera { port }, state)
    }

    pub(crate) fn url(&self) -> String {
        format!("rtsp://127.0.0.1:{}/ch0", self.port)
    }
}

fn reply(req: &Request<Bytes>, status: StatusCode) -> rtsp_types::ResponseBuilder {
    let mut builder = Response::builder(Version::V1_0, status);
    if let Some(cseq) = req.header(&headers::CSEQ) {
        builder = builder.header(headers::CSEQ, cseq.as_str().to_owned());
    }
    if let Some(session) = req.header(&headers::SESSION) {
        builder = builder.header(headers::SESSION, session.as_str().to_owned());
    }
    builder
}

async fn serve(
    listener: tokio::net::TcpListener,
    behavior: FakeCameraBehavior,
    state: FakeCameraState,
) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut conn = Connection::from_stream(stream).unwrap();
    // Set when the client asks for UDP delivery.
    let mut udp_socket: Option<tokio::net::UdpSocket> = None;
    let mut udp_target: Option<SocketAddr> = None;
    let auth = match &behavior {
        FakeCameraBehavior::RequireDigestAuth { username, password } => Some(Authentication::new(
            username,
            password,
            "fake-cam",
            AuthScheme::Digest,
        )),
        _ => None,
    };
    while let Some(Ok(msg)) = conn.next_msg().await {
        let req = match msg.msg {
            Message::Request(r) => r,
            _ => continue,
        };
        let method = req.method();
        let method_str: &str = method.into();
        let authorization = req.header(&headers::AUTHORIZATION).map(|v| v.as_str().to_owned());

        match &behavior {
            FakeCameraBehavior::RejectAllAuth => {
                let resp = reply(&req, StatusCode::Unauthorized)
                    .header(
                        headers::WWW_AUTHENTICATE,
                        "Digest realm=\"fake-cam\", nonce=\"123456789\"",
                    )
                    .build(Bytes::new());
                conn.send_msg(Message::Response(resp)).await.unwrap();
                continue;
            }
            FakeCameraBehavior::RequireDigestAuth { .. } => {
                let auth = auth.as_ref().unwrap();
                let ok = authorization
                    .as_deref()
                    .map(|h| auth.is_valid(h, method_str))
                    .unwrap_or(false);
                if !ok {
                    let resp = reply(&req, StatusCode::Unauthorized)
                        .header(headers::WWW_AUTHENTICATE, auth.challenge_header())
                        .build(Bytes::new());
                    conn.send_msg(Message::Response(resp)).await.unwrap();
                    continue;
                }
                state.0.authorized.store(true, Ordering::SeqCst);
            }
            FakeCameraBehavior::Normal => {}
        }

        match method {
            Method::Options => {
                let resp = reply(&req, StatusCode::Ok)
                    .header(
                        headers::PUBLIC,
                        "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, GET_PARAMETER, TEARDOWN",
                    )
                    .build(Bytes::new());
                conn.send_msg(Message::Response(resp)).await.unwrap();
            }
            Method::Describe => {
                let uri = req.request_uri().unwrap().to_string();
                let resp = reply(&req, StatusCode::Ok)
                    .header(headers::CONTENT_BASE, uri)
                    .header(headers::CONTENT_TYPE, "application/sdp")
                    .build(Bytes::from_static(FAKE_SDP));
                conn.send_msg(Message::Response(resp)).await.unwrap();
            }
            Method::Setup => {
                let transport = req
                    .header(&headers::TRANSPORT)
                    .map(|v| v.as_str().to_owned())
                    .unwrap_or_default();
                let offer = TransportSpec::parse(&transport).ok();
                let reply_transport = match offer.as_ref().and_then(|o| o.client_port) {
                    Some((rtp_port, rtcp_port)) => {
                        // UDP delivery: remember where frames go and answer
                        // with a server port pair.
                        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
                        let server_port = sock.local_addr().unwrap().port();
                        udp_target = Some(SocketAddr::new("127.0.0.1".parse().unwrap(), rtp_port));
                        udp_socket = Some(sock);
                        format!(
                            "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                            rtp_port,
                            rtcp_port,
                            server_port,
                            server_port + 1
                        )
                    }
                    None => transport,
                };
                let resp = reply(&req, StatusCode::Ok)
                    .header(headers::SESSION, "23456789;timeout=60")
                    .header(headers::TRANSPORT, reply_transport)
                    .build(Bytes::new());
                conn.send_msg(Message::Response(resp)).await.unwrap();
            }
            Method::Play => {
                let resp = reply(&req, StatusCode::Ok).build(Bytes::new());
                conn.send_msg(Message::Response(resp)).await.unwrap();
                let rtp = crate::rtp::RawPacketBuilder {
                    sequence_number: 1,
                    timestamp: 90_000,
                    payload_type: 96,
                    ssrc: 0x6642_6ae1,
                    mark: true,
                }
                .build(b"fake frame".iter().copied())
                .unwrap();
                match (&udp_socket, udp_target) {
                    (Some(sock), Some(target)) => {
                        sock.send_to(&rtp, target).await.unwrap();
                    }
                    _ => conn.send_data(0, rtp).await.unwrap(),
                }
            }
            Method::Teardown => {
                state.0.teardown.store(true, Ordering::SeqCst);
                let resp = reply(&req, StatusCode::Ok).build(Bytes::new());
                conn.send_msg(Message::Response(resp)).await.unwrap();
                break;
            }
            _ => {
                let resp = reply(&req, StatusCode::Ok).build(Bytes::new());
                conn.send_msg(Message::Response(resp)).await.unwrap();
            }
        }
    }
}
