// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process-wide allocator of even/odd UDP port pairs for RTP/RTCP.
//!
//! Unlike an ambient singleton, the pool is an explicitly constructed value;
//! clone it to share it between the upstream engine and the downstream
//! server. A reserved pair is released when its [`UdpPair`] is dropped, so a
//! port can never stay marked busy after its sockets are closed, even on
//! error paths.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::{Error, ErrorInt};

/// Default allocation range, 500 even/odd pairs.
pub const DEFAULT_PORT_RANGE: Range<u16> = 50_000..51_000;

#[derive(Clone)]
pub struct UdpPortPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    range: Range<u16>,

    /// Even (RTP) ports currently handed out, per local IP.
    reserved: Mutex<BTreeSet<(IpAddr, u16)>>,
}

impl Default for UdpPortPool {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE)
    }
}

impl UdpPortPool {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                range,
                reserved: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Reserves and binds an even/odd pair of UDP sockets on `ip`.
    ///
    /// Ports which are reserved here but bound elsewhere on the machine are
    /// skipped and left unreserved. Must be called within a tokio runtime.
    pub fn allocate(&self, ip: IpAddr) -> Result<UdpPair, Error> {
        let mut reserved = self.inner.reserved.lock().expect("port pool lock poisoned");
        let start = self.inner.range.start;
        let mut rtp_port = start.saturating_add(start & 1);
        while rtp_port.checked_add(1).map_or(false, |rtcp| rtcp < self.inner.range.end) {
            if !reserved.contains(&(ip, rtp_port)) {
                if let Some((rtp_socket, rtcp_socket)) = try_bind_pair(ip, rtp_port) {
                    reserved.insert((ip, rtp_port));
                    trace!("reserved UDP pair {}:{}-{}", ip, rtp_port, rtp_port + 1);
                    return Ok(UdpPair {
                        rtp_port,
                        rtp_socket: Arc::new(rtp_socket),
                        rtcp_socket: Arc::new(rtcp_socket),
                        ip,
                        pool: self.inner.clone(),
                    });
                }
            }
            rtp_port = match rtp_port.checked_add(2) {
                Some(p) => p,
                None => break,
            };
        }
        bail!(ErrorInt::PortPoolExhausted {
            ip,
            range: self.inner.range.clone(),
        })
    }
}

fn try_bind_pair(ip: IpAddr, rtp_port: u16) -> Option<(tokio::net::UdpSocket, tokio::net::UdpSocket)> {
    let bind = |port| -> std::io::Result<tokio::net::UdpSocket> {
        let s = std::net::UdpSocket::bind(SocketAddr::new(ip, port))?;
        s.set_nonblocking(true)?;
        tokio::net::UdpSocket::from_std(s)
    };
    let rtp_socket = bind(rtp_port).ok()?;
    let rtcp_socket = bind(rtp_port + 1).ok()?;
    Some((rtp_socket, rtcp_socket))
}

/// A reserved pair of local UDP sockets used for RTP and RTCP.
///
/// The RTP port is always even and the RTCP port is the following odd
/// integer. Dropping the pair closes the sockets and releases the
/// reservation.
pub struct UdpPair {
    pub rtp_port: u16,
    pub rtp_socket: Arc<tokio::net::UdpSocket>,
    pub rtcp_socket: Arc<tokio::net::UdpSocket>,
    ip: IpAddr,
    pool: Arc<PoolInner>,
}

impl UdpPair {
    #[inline]
    pub fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }
}

impl Drop for UdpPair {
    fn drop(&mut self) {
        let mut reserved = self.pool.reserved.lock().expect("port pool lock poisoned");
        reserved.remove(&(self.ip, self.rtp_port));
        trace!(
            "released UDP pair {}:{}-{}",
            self.ip,
            self.rtp_port,
            self.rtp_port + 1
        );
    }
}

impl std::fmt::Debug for UdpPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpPair({}:{}-{})", self.ip, self.rtp_port, self.rtp_port + 1)
    }
}
