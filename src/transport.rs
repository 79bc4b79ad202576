// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP `Transport` header, as described in
//! [RFC 2326 section 12.39](https://datatracker.ietf.org/doc/html/rfc2326#section-12.39).
//!
//! Only the `RTP/AVP` profile is modeled, in the three lower-transport
//! shapes the relay negotiates: TCP-interleaved, UDP unicast, and UDP
//! multicast. TCP carries an interleaved channel pair; unicast UDP carries
//! client/server port pairs; multicast carries a destination plus a port
//! pair and TTL.

use std::fmt::Display;
use std::net::IpAddr;

/// Lower transport of an RTP stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LowerTransport {
    Tcp,
    UdpUnicast,
    UdpMulticast,
}

/// A parsed/parseable `Transport` header value (a single transport spec).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportSpec {
    pub lower: Option<LowerTransport>,

    /// Interleaved (RTP, RTCP) channel ids; TCP only.
    pub interleaved: Option<(u8, u8)>,

    /// Client (RTP, RTCP) port pair; unicast UDP only.
    pub client_port: Option<(u16, u16)>,

    /// Server (RTP, RTCP) port pair; unicast UDP only.
    pub server_port: Option<(u16, u16)>,

    /// Multicast destination address.
    pub destination: Option<IpAddr>,

    /// Multicast (RTP, RTCP) port pair.
    pub port: Option<(u16, u16)>,

    pub ttl: Option<u8>,

    /// Synchronization source, 8 hex digits on the wire.
    pub ssrc: Option<u32>,
}

impl TransportSpec {
    pub fn tcp_interleaved(rtp_channel: u8, rtcp_channel: u8) -> Self {
        Self {
            lower: Some(LowerTransport::Tcp),
            interleaved: Some((rtp_channel, rtcp_channel)),
            ..Self::default()
        }
    }

    pub fn udp_unicast(client_port: (u16, u16)) -> Self {
        Self {
            lower: Some(LowerTransport::UdpUnicast),
            client_port: Some(client_port),
            ..Self::default()
        }
    }

    pub fn udp_multicast() -> Self {
        Self {
            lower: Some(LowerTransport::UdpMulticast),
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.lower == Some(LowerTransport::Tcp)
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.lower == Some(LowerTransport::UdpMulticast)
    }

    /// Parses the first transport spec of a `Transport` header value.
    ///
    /// Clients may offer several comma-separated alternatives; like most
    /// servers we consider only the first.
    pub fn parse(header: &str) -> Result<Self, String> {
        let spec = header.split(',').next().unwrap_or("").trim();
        let mut params = spec.split(';');
        let proto = params
            .next()
            .ok_or_else(|| "empty Transport header".to_owned())?
            .trim();
        let mut out = TransportSpec::default();
        out.lower = Some(match proto {
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::UdpUnicast,
            o => return Err(format!("unsupported transport protocol {o:?}")),
        });
        for param in params {
            let param = param.trim();
            let (key, value) = match param.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (param, None),
            };
            match (key, value) {
                ("unicast", None) => {}
                ("multicast", None) => out.lower = Some(LowerTransport::UdpMulticast),
                ("interleaved", Some(v)) => out.interleaved = Some(parse_pair(v)?),
                ("client_port", Some(v)) => out.client_port = Some(parse_pair(v)?),
                ("server_port", Some(v)) => out.server_port = Some(parse_pair(v)?),
                ("port", Some(v)) => out.port = Some(parse_pair(v)?),
                ("destination", Some(v)) => {
                    out.destination =
                        Some(v.parse().map_err(|_| format!("bad destination {v:?}"))?)
                }
                ("ttl", Some(v)) => {
                    out.ttl = Some(v.parse().map_err(|_| format!("bad ttl {v:?}"))?)
                }
                ("ssrc", Some(v)) => {
                    out.ssrc =
                        Some(u32::from_str_radix(v, 16).map_err(|_| format!("bad ssrc {v:?}"))?)
                }
                _ => {} // unknown parameters (mode=, etc.) are ignored
            }
        }
        if out.is_tcp() && out.client_port.is_some() {
            return Err(format!("TCP transport with client_port: {spec:?}"));
        }
        if !out.is_tcp() && out.interleaved.is_some() {
            return Err(format!("UDP transport with interleaved channels: {spec:?}"));
        }
        Ok(out)
    }
}

fn parse_pair<T: std::str::FromStr + Copy>(v: &str) -> Result<(T, T), String> {
    // "0-1" is the common form; a lone "n" implicitly assigns n and n+1,
    // which callers model by passing the same value twice.
    let (first, second) = match v.split_once('-') {
        Some((f, s)) => (f, s),
        None => (v, v),
    };
    let first = first
        .parse()
        .map_err(|_| format!("bad port/channel pair {v:?}"))?;
    let second = second
        .parse()
        .map_err(|_| format!("bad port/channel pair {v:?}"))?;
    Ok((first, second))
}

impl Display for TransportSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lower {
            Some(LowerTransport::Tcp) => write!(f, "RTP/AVP/TCP")?,
            Some(LowerTransport::UdpUnicast) => write!(f, "RTP/AVP;unicast")?,
            Some(LowerTransport::UdpMulticast) => write!(f, "RTP/AVP;multicast")?,
            None => write!(f, "RTP/AVP")?,
        }
        if let Some(d) = self.destination {
            write!(f, ";destination={d}")?;
        }
        if let Some((rtp, rtcp)) = self.interleaved {
            write!(f, ";interleaved={rtp}-{rtcp}")?;
        }
        if let Some((rtp, rtcp)) = self.port {
            write!(f, ";port={rtp}-{rtcp}")?;
        }
        if let Some((rtp, rtcp)) = self.client_port {
            write!(f, ";client_port={rtp}-{rtcp}")?;
        }
        if let Some((rtp, rtcp)) = self.server_port {
            write!(f, ";server_port={rtp}-{rtcp}")?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={ssrc:08X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_interleaved() {
        let t = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(t.lower, Some(LowerTransport::Tcp));
        assert_eq!(t.interleaved, Some((0, 1)));
        assert_eq!(t.client_port, None);
        assert_eq!(
            TransportSpec::tcp_interleaved(0, 1).to_string(),
            "RTP/AVP/TCP;interleaved=0-1"
        );
    }

    #[test]
    fn udp_unicast() {
        let t =
            TransportSpec::parse("RTP/AVP;unicast;client_port=8000-8001;server_port=50000-50001")
                .unwrap();
        assert_eq!(t.lower, Some(LowerTransport::UdpUnicast));
        assert_eq!(t.client_port, Some((8000, 8001)));
        assert_eq!(t.server_port, Some((50000, 50001)));
        assert_eq!(
            TransportSpec::udp_unicast((8000, 8001)).to_string(),
            "RTP/AVP;unicast;client_port=8000-8001"
        );
    }

    #[test]
    fn multicast_reply() {
        let t = TransportSpec::parse("RTP/AVP;multicast;destination=224.1.2.3;port=7000-7001;ttl=5")
            .unwrap();
        assert_eq!(t.lower, Some(LowerTransport::UdpMulticast));
        assert_eq!(t.destination, Some("224.1.2.3".parse().unwrap()));
        assert_eq!(t.port, Some((7000, 7001)));
        assert_eq!(t.ttl, Some(5));
    }

    #[test]
    fn first_of_several_offers() {
        let t = TransportSpec::parse(
            "RTP/AVP;unicast;client_port=9000-9001,RTP/AVP/TCP;interleaved=0-1",
        )
        .unwrap();
        assert_eq!(t.lower, Some(LowerTransport::UdpUnicast));
        assert_eq!(t.client_port, Some((9000, 9001)));
    }

    #[test]
    fn ssrc_hex() {
        let t = TransportSpec::parse("RTP/AVP/TCP;interleaved=2-3;ssrc=4321FADE").unwrap();
        assert_eq!(t.ssrc, Some(0x4321_FADE));
        assert!(t.to_string().contains("ssrc=4321FADE"));
    }

    #[test]
    fn rejects_mismatched_parameters() {
        TransportSpec::parse("RTP/AVP/TCP;client_port=8000-8001").unwrap_err();
        TransportSpec::parse("RTP/AVP;unicast;interleaved=0-1").unwrap_err();
        TransportSpec::parse("HTTP/1.1").unwrap_err();
    }
}
