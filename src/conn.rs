// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP wire framing over a single TCP stream.
//!
//! The stream interleaves two record kinds: textual RTSP requests/responses
//! and binary RTP/RTCP chunks prefixed with `$`, a channel byte, and a
//! big-endian length. [`Connection`] turns the byte stream into a sequence of
//! [`ReceivedMessage`]s (in strict arrival order) and serializes outgoing
//! messages; it is driven by exactly one task per connection, which gives
//! one reader loop and one writer section per socket.
//!
//! Any I/O or framing failure poisons the connection: the error is surfaced
//! once, and every later operation fails fast with a closed-connection error
//! instead of retrying I/O.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rtsp_types::{Data, Message};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Host;

use crate::{ConnectionContext, Error, ErrorInt, ReceivedMessage, RtspMessageContext, WallTime};

pub(crate) struct Connection {
    inner: Framed<TcpStream, Codec>,
    poisoned: bool,
}

impl Connection {
    pub(crate) async fn connect(host: Host<&str>, port: u16) -> Result<Self, std::io::Error> {
        let stream = match host {
            Host::Domain(h) => TcpStream::connect((h, port)).await,
            Host::Ipv4(h) => TcpStream::connect((h, port)).await,
            Host::Ipv6(h) => TcpStream::connect((h, port)).await,
        }?;
        Self::from_stream(stream)
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Result<Self, std::io::Error> {
        let established_wall = WallTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            inner: Framed::new(
                stream,
                Codec {
                    ctx: ConnectionContext {
                        local_addr,
                        peer_addr,
                        established_wall,
                    },
                    read_pos: 0,
                },
            ),
            poisoned: false,
        })
    }

    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.inner.codec().ctx
    }

    /// The position at which the stream ended, for read-error context.
    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.inner.codec().read_pos + crate::to_u64(self.inner.read_buffer().remaining()),
            received_wall: WallTime::now(),
        }
    }

    /// Reads the next message, or `None` on clean EOF.
    pub(crate) async fn next_msg(&mut self) -> Option<Result<ReceivedMessage, Error>> {
        if self.poisoned {
            return Some(Err(wrap!(ErrorInt::ConnectionClosed {
                conn_ctx: *self.ctx(),
            })));
        }
        let item = self.inner.next().await;
        match item {
            Some(Ok(msg)) => Some(Ok(msg)),
            Some(Err(e)) => {
                self.poisoned = true;
                Some(Err(self.wrap_read_err(e)))
            }
            None => None,
        }
    }

    /// Serializes and flushes a request/response/data message.
    pub(crate) async fn send_msg(&mut self, msg: Message<Bytes>) -> Result<(), Error> {
        if self.poisoned {
            bail!(ErrorInt::ConnectionClosed {
                conn_ctx: *self.ctx(),
            });
        }
        if let Err(e) = self.inner.send(msg).await {
            self.poisoned = true;
            return Err(self.wrap_write_err(e));
        }
        Ok(())
    }

    /// Writes an interleaved `$`-framed binary chunk.
    pub(crate) async fn send_data(&mut self, channel_id: u8, payload: Bytes) -> Result<(), Error> {
        self.send_msg(Message::Data(Data::new(channel_id, payload))).await
    }

    fn wrap_read_err(&self, e: CodecError) -> Error {
        wrap!(match e {
            CodecError::Io(source) => ErrorInt::RtspReadError {
                conn_ctx: *self.ctx(),
                msg_ctx: self.eof_ctx(),
                source,
            },
            CodecError::Parse { description, pos } => ErrorInt::RtspFramingError {
                conn_ctx: *self.ctx(),
                msg_ctx: RtspMessageContext {
                    pos,
                    received_wall: WallTime::now(),
                },
                description,
            },
        })
    }

    fn wrap_write_err(&self, e: CodecError) -> Error {
        wrap!(match e {
            CodecError::Io(source) => ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            },
            CodecError::Parse { .. } => unreachable!("encoding never parses"),
        })
    }
}

/// Encodes and decodes RTSP messages and interleaved data chunks.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because [`Framed`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    Io(std::io::Error),
    Parse { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl Codec {
    fn parse_msg(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        // Skip leading CRLF pairs, as `rtsp_types` does when parsing. This
        // must also happen here or the interleaved-data fast path below would
        // miss a `$` preceded by stray CRLF.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        if !src.is_empty() && src[0] == b'$' {
            // Interleaved binary chunk: channel byte, u16 length, payload.
            // Handled without going through `rtsp_types` so the payload stays
            // a zero-copy slice of the read buffer.
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let len = 4 + usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut chunk = src.split_to(len);
            chunk.advance(4);
            return Ok(Some((
                len,
                Message::Data(Data::new(channel_id, chunk.freeze())),
            )));
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(CodecError::Parse {
                    description: format!(
                        "Invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::HexSnippet::new(&src[..], 128),
                    ),
                    pos: self.read_pos,
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        };

        // Replace the parsed message's borrowed body with an owned `Bytes`
        // slice of the read buffer, then drain the consumed bytes. Bodies are
        // swapped out in two steps because the parsed message borrows `src`
        // until its body is replaced.
        let msg = match msg {
            Message::Request(req) => {
                let body_range = crate::as_range(src, req.body());
                let req = req.replace_body(rtsp_types::Empty);
                match body_range {
                    Some(r) => {
                        let mut raw = src.split_to(len);
                        raw.advance(r.start);
                        raw.truncate(r.len());
                        Message::Request(req.replace_body(raw.freeze()))
                    }
                    None => {
                        src.advance(len);
                        Message::Request(req.replace_body(Bytes::new()))
                    }
                }
            }
            Message::Response(resp) => {
                let body_range = crate::as_range(src, resp.body());
                let resp = resp.replace_body(rtsp_types::Empty);
                match body_range {
                    Some(r) => {
                        let mut raw = src.split_to(len);
                        raw.advance(r.start);
                        raw.truncate(r.len());
                        Message::Response(resp.replace_body(raw.freeze()))
                    }
                    None => {
                        src.advance(len);
                        Message::Response(resp.replace_body(Bytes::new()))
                    }
                }
            }
            Message::Data(_) => unreachable!("data is handled on the fast path above"),
        };
        Ok(Some((len, msg)))
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (len, msg) = match self.parse_msg(src)? {
            None => return Ok(None),
            Some((len, msg)) => (len, msg),
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext {
                pos: self.read_pos,
                received_wall: WallTime::now(),
            },
        };
        self.read_pos += crate::to_u64(len);
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Message<Bytes>, mut dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(&mut (&mut dst).writer())
            .expect("BufMut Writer is infallible");
        Ok(())
    }
}
