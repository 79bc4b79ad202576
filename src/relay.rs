// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The connection registry: N downstream viewers of one source cost one
//! upstream pull.
//!
//! The registry is a single actor task owning the source -> viewers mapping
//! and each source's upstream [`client`] engine. Everything reaches it as a
//! message on one bounded channel: viewer arrivals/departures from the
//! [`crate::server`], buffers and lifecycle events from upstream engines,
//! and deferred-teardown timer firings. That makes ordering explicit and
//! keeps the registry free of locks.
//!
//! Losing the last viewer of a source does not stop the upstream engine
//! immediately: a cancellable grace timer (generation-tagged, so a viewer
//! reconnecting during the window invalidates it) debounces brief reconnect
//! churn without renegotiating the whole upstream session.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::client::{self, ClientEvent, ClientHandle, ClientOptions, StopReason};
use crate::source::{SourceId, VideoSource};
use crate::ChannelKind;

/// Default delay between last-viewer-removed and upstream teardown.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(30);

/// Identifies one accepted downstream connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Commands the registry sends a downstream connection.
#[derive(Debug)]
pub enum ConnectionCmd {
    /// Deliver a relayed buffer over the viewer's negotiated transport.
    Media { channel: ChannelKind, data: Bytes },

    /// The upstream died (or an operator intervened); close now.
    ForceClose,
}

/// A downstream connection as the registry sees it: an id and the sending
/// half of its command channel.
#[derive(Clone, Debug)]
pub struct ViewerHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<ConnectionCmd>,
}

/// Registry lifecycle events, for an admin surface to observe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelayNotification {
    ConnectionAdded {
        connection: ConnectionId,
        source: SourceId,
    },
    ConnectionRemoved {
        connection: ConnectionId,
        source: SourceId,
    },
    Play {
        connection: ConnectionId,
    },
    Stop {
        connection: ConnectionId,
    },
}

pub struct RelayOptions {
    /// `None` stops the upstream engine synchronously when the last viewer
    /// goes away, for deterministic tests.
    pub teardown_grace: Option<Duration>,

    pub client: ClientOptions,

    /// Where lifecycle notifications go, if anywhere.
    pub notifications: Option<mpsc::Sender<RelayNotification>>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            teardown_grace: Some(TEARDOWN_GRACE),
            client: ClientOptions::default(),
            notifications: None,
        }
    }
}

pub(crate) enum RelayMsg {
    ConnectionAdded {
        viewer: ViewerHandle,
        source: VideoSource,
    },
    ConnectionRemoved {
        connection: ConnectionId,
        source: SourceId,
    },
    ProvideSdp {
        source: SourceId,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Play {
        connection: ConnectionId,
    },
    Stop {
        connection: ConnectionId,
    },
    ClientEvent {
        source: SourceId,
        /// Which engine incarnation sent this; events from a superseded
        /// engine are ignored.
        client_gen: u64,
        event: ClientEvent,
    },
    TeardownTimer {
        source: SourceId,
        generation: u64,
    },
    ConnectionIds {
        source: SourceId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    HasClient {
        source: SourceId,
        reply: oneshot::Sender<bool>,
    },
    IsClientRunning {
        source: SourceId,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to a running registry.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayMsg>,
}

impl RelayHandle {
    /// Starts a registry actor with the given options.
    pub fn spawn(options: RelayOptions) -> RelayHandle {
        let (tx, rx) = mpsc::channel(256);
        let relay = Relay {
            options,
            entries: HashMap::new(),
            tx: tx.clone(),
            next_client_gen: 0,
        };
        tokio::spawn(relay.run(rx));
        RelayHandle { tx }
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (RelayHandle, mpsc::Receiver<RelayMsg>) {
        let (tx, rx) = mpsc::channel(32);
        (RelayHandle { tx }, rx)
    }

    /// Registers a viewer of `source`, lazily starting its upstream engine.
    pub async fn connection_added(&self, viewer: ViewerHandle, source: VideoSource) {
        let _ = self.tx.send(RelayMsg::ConnectionAdded { viewer, source }).await;
    }

    pub async fn connection_removed(&self, connection: ConnectionId, source: SourceId) {
        let _ = self
            .tx
            .send(RelayMsg::ConnectionRemoved { connection, source })
            .await;
    }

    /// Obtains the source's SDP, waiting (bounded by the source's ready
    /// timeout) for the upstream session if necessary. `None` when no
    /// upstream engine exists or it failed to become ready.
    pub async fn provide_sdp(&self, source: SourceId) -> Option<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayMsg::ProvideSdp { source, reply })
            .await
            .ok()?;
        rx.await.unwrap_or(None)
    }

    pub async fn notify_play(&self, connection: ConnectionId) {
        let _ = self.tx.send(RelayMsg::Play { connection }).await;
    }

    pub async fn notify_stop(&self, connection: ConnectionId) {
        let _ = self.tx.send(RelayMsg::Stop { connection }).await;
    }

    /// Current viewer ids of a source, in insertion order.
    pub async fn server_connection_ids(&self, source: SourceId) -> Vec<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::ConnectionIds { source, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn has_client(&self, source: SourceId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::HasClient { source, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn is_client_running(&self, source: SourceId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::IsClientRunning { source, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

struct SourceEntry {
    source: VideoSource,
    viewers: Vec<ViewerHandle>,
    client: Option<ClientHandle>,

    /// Bumped on every viewer arrival/departure; a pending teardown timer
    /// only fires if its generation is still current.
    generation: u64,

    /// The running engine's incarnation, unique across all sources, so a
    /// stopping engine's final events can't be mistaken for its successor's.
    client_gen: u64,
}

struct Relay {
    options: RelayOptions,
    entries: HashMap<SourceId, SourceEntry>,
    tx: mpsc::Sender<RelayMsg>,
    next_client_gen: u64,
}

impl Relay {
    async fn run(mut self, mut rx: mpsc::Receiver<RelayMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
    }

    async fn notify(&self, notification: RelayNotification) {
        if let Some(tx) = &self.options.notifications {
            let _ = tx.send(notification).await;
        }
    }

    async fn handle(&mut self, msg: RelayMsg) {
        match msg {
            RelayMsg::ConnectionAdded { viewer, source } => {
                let connection = viewer.id;
                let source_id = source.id;
                let entry = self.entries.entry(source.id).or_insert_with(|| SourceEntry {
                    source,
                    viewers: Vec::new(),
                    client: None,
                    generation: 0,
                    client_gen: 0,
                });
                entry.generation += 1; // cancels any pending teardown
                entry.viewers.push(viewer);
                trace!(
                    "{} viewer added for source {}; count {}",
                    connection,
                    source_id,
                    entry.viewers.len()
                );
                if entry.client.is_none() {
                    Self::start_client(
                        &self.options,
                        &self.tx,
                        &mut self.next_client_gen,
                        entry,
                    );
                }
                self.notify(RelayNotification::ConnectionAdded {
                    connection,
                    source: source_id,
                })
                .await;
            }
            RelayMsg::ConnectionRemoved { connection, source } => {
                let Some(entry) = self.entries.get_mut(&source) else {
                    return;
                };
                let before = entry.viewers.len();
                entry.viewers.retain(|v| v.id != connection);
                if entry.viewers.len() == before {
                    return; // unknown viewer; e.g. already force-disconnected
                }
                trace!(
                    "{} viewer removed for source {}; count {}",
                    connection,
                    source,
                    entry.viewers.len()
                );
                entry.generation += 1;
                if entry.viewers.is_empty() && entry.client.is_some() {
                    match self.options.teardown_grace {
                        None => {
                            Self::stop_client(entry);
                            self.entries.remove(&source);
                        }
                        Some(grace) => {
                            let tx = self.tx.clone();
                            let generation = entry.generation;
                            tokio::spawn(async move {
                                tokio::time::sleep(grace).await;
                                let _ = tx
                                    .send(RelayMsg::TeardownTimer { source, generation })
                                    .await;
                            });
                        }
                    }
                }
                self.notify(RelayNotification::ConnectionRemoved { connection, source })
                    .await;
            }
            RelayMsg::TeardownTimer { source, generation } => {
                if let Some(entry) = self.entries.get_mut(&source) {
                    if entry.generation == generation && entry.viewers.is_empty() {
                        debug!("source {} idle past grace period", source);
                        Self::stop_client(entry);
                        self.entries.remove(&source);
                    }
                }
            }
            RelayMsg::ProvideSdp { source, reply } => {
                match self.entries.get(&source).and_then(|e| e.client.clone()) {
                    Some(client) => {
                        // Waiting for readiness can take a while; never block
                        // the registry loop on it.
                        tokio::spawn(async move {
                            let ready = client.wait_ready().await;
                            let _ = reply.send(if ready { client.sdp_data() } else { None });
                        });
                    }
                    None => {
                        let _ = reply.send(None);
                    }
                }
            }
            RelayMsg::Play { connection } => {
                self.notify(RelayNotification::Play { connection }).await;
            }
            RelayMsg::Stop { connection } => {
                self.notify(RelayNotification::Stop { connection }).await;
            }
            RelayMsg::ClientEvent {
                source,
                client_gen,
                event,
            } => self.handle_client_event(source, client_gen, event),
            RelayMsg::ConnectionIds { source, reply } => {
                let ids = self
                    .entries
                    .get(&source)
                    .map(|e| e.viewers.iter().map(|v| v.id).collect())
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
            RelayMsg::HasClient { source, reply } => {
                let _ = reply.send(
                    self.entries
                        .get(&source)
                        .map(|e| e.client.is_some())
                        .unwrap_or(false),
                );
            }
            RelayMsg::IsClientRunning { source, reply } => {
                let _ = reply.send(
                    self.entries
                        .get(&source)
                        .and_then(|e| e.client.as_ref())
                        .map(|c| c.is_running())
                        .unwrap_or(false),
                );
            }
        }
    }

    fn handle_client_event(&mut self, source: SourceId, client_gen: u64, event: ClientEvent) {
        let Some(entry) = self.entries.get_mut(&source) else {
            return;
        };
        if client_gen != entry.client_gen {
            // A stopping engine racing a viewer reconnect: these events
            // belong to the superseded engine, not its replacement.
            return;
        }
        match event {
            ClientEvent::Media { channel, data } => {
                // Each dispatch is independent: a slow viewer's full queue
                // loses this buffer rather than stalling the others or the
                // upstream read loop.
                for viewer in &entry.viewers {
                    match viewer.tx.try_send(ConnectionCmd::Media {
                        channel,
                        data: data.clone(),
                    }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!("viewer {} lagging; dropping {} buffer", viewer.id, channel);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
            ClientEvent::ParameterSets(sets) => {
                debug!("source {} parameter sets discovered: {:?}", source, sets);
            }
            ClientEvent::Stopped(reason) => {
                entry.client = None;
                if reason != StopReason::Command {
                    warn!(
                        "source {} upstream stopped ({:?}); disconnecting {} viewer(s)",
                        source,
                        reason,
                        entry.viewers.len()
                    );
                    for viewer in entry.viewers.drain(..) {
                        let _ = viewer.tx.try_send(ConnectionCmd::ForceClose);
                    }
                }
                if entry.viewers.is_empty() {
                    self.entries.remove(&source);
                }
            }
        }
    }

    fn start_client(
        options: &RelayOptions,
        tx: &mpsc::Sender<RelayMsg>,
        next_client_gen: &mut u64,
        entry: &mut SourceEntry,
    ) {
        let source_id = entry.source.id;
        info!("starting upstream client for source {}", source_id);
        *next_client_gen += 1;
        let client_gen = *next_client_gen;
        entry.client_gen = client_gen;
        let (ev_tx, mut ev_rx) = mpsc::channel(64);
        let handle = client::spawn(entry.source.clone(), options.client.clone(), ev_tx);
        entry.client = Some(handle);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = ev_rx.recv().await {
                if tx
                    .send(RelayMsg::ClientEvent {
                        source: source_id,
                        client_gen,
                        event,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn stop_client(entry: &mut SourceEntry) {
        if let Some(client) = entry.client.take() {
            info!("stopping upstream client for source {}", entry.source.id);
            client.stop(StopReason::Command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::time::Duration;

    fn viewer(id: u64) -> (ViewerHandle, mpsc::Receiver<ConnectionCmd>) {
        let (tx, rx) = mpsc::channel(64);
        (
            ViewerHandle {
                id: ConnectionId(id),
                tx,
            },
            rx,
        )
    }

    async fn recv_media(rx: &mut mpsc::Receiver<ConnectionCmd>) -> (ChannelKind, Bytes) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for media")
                .expect("viewer channel closed")
            {
                ConnectionCmd::Media { channel, data } => return (channel, data),
                ConnectionCmd::ForceClose => panic!("unexpected force close"),
            }
        }
    }

    #[tokio::test]
    async fn one_client_per_source_with_fan_out() {
        testutil::init_logging();
        let (fake, fake_state) =
            testutil::FakeCamera::start(testutil::FakeCameraBehavior::Normal).await;
        let mut source = VideoSource::new("cam", &fake.url());
        source.ready_timeout = Duration::from_secs(5);
        let source_id = source.id;
        let (notifications_tx, mut notifications_rx) = mpsc::channel(32);
        let relay = RelayHandle::spawn(RelayOptions {
            teardown_grace: None,
            notifications: Some(notifications_tx),
            ..RelayOptions::default()
        });

        assert!(!relay.has_client(source_id).await);
        assert!(relay.server_connection_ids(source_id).await.is_empty());

        let (v1, mut v1_rx) = viewer(1);
        let (v2, mut v2_rx) = viewer(2);
        relay.connection_added(v1, source.clone()).await;
        relay.connection_added(v2, source.clone()).await;
        assert_eq!(
            notifications_rx.recv().await.unwrap(),
            RelayNotification::ConnectionAdded {
                connection: ConnectionId(1),
                source: source_id,
            }
        );
        assert!(relay.has_client(source_id).await);
        assert_eq!(
            relay.server_connection_ids(source_id).await,
            vec![ConnectionId(1), ConnectionId(2)]
        );

        // The single upstream session's RTP reaches both viewers.
        let (c1, d1) = recv_media(&mut v1_rx).await;
        let (c2, d2) = recv_media(&mut v2_rx).await;
        assert_eq!(c1, ChannelKind::VideoRtp);
        assert_eq!(c2, ChannelKind::VideoRtp);
        assert_eq!(d1, d2);
        assert!(relay.is_client_running(source_id).await);

        // A viewer added after dispatch doesn't receive that buffer.
        let (v3, mut v3_rx) = viewer(3);
        relay.connection_added(v3, source.clone()).await;
        assert!(v3_rx.try_recv().is_err());

        relay.connection_removed(ConnectionId(1), source_id).await;
        assert_eq!(
            relay.server_connection_ids(source_id).await,
            vec![ConnectionId(2), ConnectionId(3)]
        );
        assert!(relay.has_client(source_id).await);

        relay.connection_removed(ConnectionId(2), source_id).await;
        relay.connection_removed(ConnectionId(3), source_id).await;
        // Immediate mode: the upstream client is stopped synchronously.
        assert!(!relay.has_client(source_id).await);

        // Upstream saw an orderly TEARDOWN.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !fake_state.saw_teardown() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no TEARDOWN reached the fake camera");
    }

    #[tokio::test]
    async fn teardown_grace_debounces_reconnect() {
        testutil::init_logging();
        let (fake, _fake_state) =
            testutil::FakeCamera::start(testutil::FakeCameraBehavior::Normal).await;
        let mut source = VideoSource::new("cam", &fake.url());
        source.ready_timeout = Duration::from_secs(5);
        let source_id = source.id;
        let relay = RelayHandle::spawn(RelayOptions {
            teardown_grace: Some(Duration::from_millis(200)),
            ..RelayOptions::default()
        });

        let (v1, _v1_rx) = viewer(1);
        relay.connection_added(v1, source.clone()).await;
        assert!(relay.has_client(source_id).await);

        // Viewer leaves, then comes back within the grace period.
        relay.connection_removed(ConnectionId(1), source_id).await;
        assert!(relay.has_client(source_id).await);
        let (v2, _v2_rx) = viewer(2);
        relay.connection_added(v2, source.clone()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(relay.has_client(source_id).await, "reconnect must cancel teardown");

        // Viewer leaves for good; the timer fires this time.
        relay.connection_removed(ConnectionId(2), source_id).await;
        assert!(relay.has_client(source_id).await, "stop is deferred");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!relay.has_client(source_id).await);
    }

    #[tokio::test]
    async fn upstream_failure_force_disconnects_viewers() {
        testutil::init_logging();
        // A port with nothing listening: the upstream client stops with
        // ConnectionFailed shortly after starting.
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        let mut source = VideoSource::new("cam", &format!("rtsp://127.0.0.1:{port}/ch0"));
        source.ready_timeout = Duration::from_secs(5);
        let source_id = source.id;
        let relay = RelayHandle::spawn(RelayOptions::default());

        let (v1, mut v1_rx) = viewer(1);
        relay.connection_added(v1, source.clone()).await;
        match tokio::time::timeout(Duration::from_secs(5), v1_rx.recv())
            .await
            .expect("timed out waiting for force close")
        {
            Some(ConnectionCmd::ForceClose) => {}
            o => panic!("expected force close, got {o:?}"),
        }
        assert!(!relay.has_client(source_id).await);
        assert!(relay.server_connection_ids(source_id).await.is_empty());
    }
}
