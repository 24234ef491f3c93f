//! In-page duplex channel.
//!
//! Scripts sharing a page talk over a broadcast medium where every listener
//! sees every message (the page's `postMessage`). [`PageBus`] models that
//! medium; [`PagePort`] builds a point-to-point port on top of it by tagging
//! each envelope with the channel name, a per-connection nonce and the
//! direction, and ignoring everything else.
//!
//! # Connection Flow
//!
//! 1. Server side calls [`PageBus::listen`] for a channel name
//! 2. Client calls [`PageBus::connect`], which broadcasts `Connect`
//! 3. The acceptor subscribes a new port, then answers `Accepted`
//! 4. Both ends exchange `Data` envelopes until one sends `Disconnect`
//!
//! The client only returns from `connect` after `Accepted`, so no data is
//! sent before the accepting end is subscribed.
//!
//! Every subscriber has its own unbounded queue, so a slow reader never
//! loses envelopes. Publishing fans out under one lock, which gives all
//! subscribers the same order.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::port::{DisconnectHandler, MessageHandler, Port, PortCore};

// ============================================================================
// Constants
// ============================================================================

/// How long `connect` waits for an acceptor.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Envelope
// ============================================================================

/// Direction of an envelope relative to the connecting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    fn reverse(self) -> Self {
        match self {
            Self::ToServer => Self::ToClient,
            Self::ToClient => Self::ToServer,
        }
    }
}

/// Envelope body.
#[derive(Debug, Clone)]
enum Body {
    Connect,
    Accepted,
    Data(Arc<Vec<u8>>),
    Disconnect,
}

/// One message on the page bus.
#[derive(Debug, Clone)]
struct Envelope {
    channel: Arc<str>,
    nonce: Uuid,
    direction: Direction,
    body: Body,
}

// ============================================================================
// PageBus
// ============================================================================

/// Shared broadcast medium of one page.
#[derive(Clone)]
pub struct PageBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Envelope>>>>,
}

impl fmt::Debug for PageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBus")
            .field("listeners", &self.subscribers.lock().len())
            .finish()
    }
}

impl Default for PageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers `envelope` to every live subscriber, pruning dropped ones.
    ///
    /// Returns `false` if nobody is listening.
    fn publish(&self, envelope: &Envelope) -> bool {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
        !subscribers.is_empty()
    }

    /// Starts accepting connections on `name`.
    #[must_use]
    pub fn listen(&self, name: impl Into<String>) -> PageAcceptor {
        PageAcceptor {
            bus: self.clone(),
            channel: Arc::from(name.into()),
            rx: self.subscribe(),
        }
    }

    /// Connects to the acceptor listening on `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeTimeout`] if no acceptor answers within 5s
    /// - [`Error::ConnectionClosed`] if the bus goes away first
    pub async fn connect(&self, name: impl Into<String>) -> Result<Arc<PagePort>> {
        let channel: Arc<str> = Arc::from(name.into());
        let nonce = Uuid::new_v4();
        let mut rx = self.subscribe();

        self.publish(&Envelope {
            channel: Arc::clone(&channel),
            nonce,
            direction: Direction::ToServer,
            body: Body::Connect,
        });

        let accepted = timeout(CONNECT_TIMEOUT, async {
            loop {
                match rx.recv().await {
                    Some(env)
                        if env.nonce == nonce
                            && env.direction == Direction::ToClient
                            && matches!(env.body, Body::Accepted) =>
                    {
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => return Err(Error::ConnectionClosed),
                }
            }
        })
        .await
        .map_err(|_| Error::handshake_timeout(CONNECT_TIMEOUT.as_millis() as u64))?;
        accepted?;

        debug!(channel = %channel, %nonce, "Page port connected");
        Ok(PagePort::start(
            self.clone(),
            channel,
            nonce,
            Direction::ToServer,
            rx,
        ))
    }
}

// ============================================================================
// PageAcceptor
// ============================================================================

/// Accepting side of a page channel.
pub struct PageAcceptor {
    bus: PageBus,
    channel: Arc<str>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl fmt::Debug for PageAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAcceptor")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl PageAcceptor {
    /// Waits for the next connecting client.
    ///
    /// Returns `None` when the bus is gone.
    pub async fn accept(&mut self) -> Option<Arc<PagePort>> {
        loop {
            match self.rx.recv().await {
                Some(env)
                    if env.channel == self.channel
                        && env.direction == Direction::ToServer
                        && matches!(env.body, Body::Connect) =>
                {
                    let rx = self.bus.subscribe();
                    let port = PagePort::start(
                        self.bus.clone(),
                        Arc::clone(&self.channel),
                        env.nonce,
                        Direction::ToClient,
                        rx,
                    );
                    port.send_body(Body::Accepted);
                    debug!(channel = %self.channel, nonce = %env.nonce, "Page port accepted");
                    return Some(port);
                }
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

// ============================================================================
// PagePort
// ============================================================================

/// One end of an in-page channel.
pub struct PagePort {
    core: Arc<PortCore>,
    bus: PageBus,
    channel: Arc<str>,
    nonce: Uuid,
    /// Direction of envelopes this end sends.
    outgoing: Direction,
}

impl fmt::Debug for PagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePort")
            .field("channel", &self.channel)
            .field("nonce", &self.nonce)
            .field("connected", &self.core.is_connected())
            .finish()
    }
}

impl PagePort {
    /// Creates the port and spawns its bus reader.
    fn start(
        bus: PageBus,
        channel: Arc<str>,
        nonce: Uuid,
        outgoing: Direction,
        rx: mpsc::UnboundedReceiver<Envelope>,
    ) -> Arc<Self> {
        let core = PortCore::new(channel.to_string());
        tokio::spawn(Self::read_loop(
            rx,
            Arc::clone(&core),
            nonce,
            outgoing.reverse(),
        ));
        Arc::new(Self {
            core,
            bus,
            channel,
            nonce,
            outgoing,
        })
    }

    /// Forwards matching envelopes into `core` until disconnect.
    async fn read_loop(
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        core: Arc<PortCore>,
        nonce: Uuid,
        incoming: Direction,
    ) {
        while let Some(env) = rx.recv().await {
            if env.nonce == nonce && env.direction == incoming {
                match env.body {
                    Body::Data(data) => {
                        core.deliver(Arc::try_unwrap(data).unwrap_or_else(|d| (*d).clone()));
                    }
                    Body::Disconnect => break,
                    Body::Connect | Body::Accepted => {}
                }
            }
            if !core.is_connected() {
                return;
            }
        }
        if core.close() {
            debug!(port = %core.name(), "Page peer disconnected");
        }
    }

    /// Broadcasts an envelope from this end.
    fn send_body(&self, body: Body) -> bool {
        self.bus.publish(&Envelope {
            channel: Arc::clone(&self.channel),
            nonce: self.nonce,
            direction: self.outgoing,
            body,
        })
    }
}

impl Port for PagePort {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn post_message(&self, message: Vec<u8>) -> Result<()> {
        if !self.core.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        if self.send_body(Body::Data(Arc::new(message))) {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        self.core.set_message_handler(handler);
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.core.add_disconnect_handler(handler);
    }

    fn disconnect(&self) {
        if self.core.is_connected() {
            self.send_body(Body::Disconnect);
        }
        self.core.close();
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::oneshot;

    async fn connected(bus: &PageBus, name: &str) -> (Arc<PagePort>, Arc<PagePort>) {
        let mut acceptor = bus.listen(name);
        let accept = tokio::spawn(async move { acceptor.accept().await });
        let client = bus.connect(name).await.expect("connect");
        let server = accept.await.expect("join").expect("accepted");
        (client, server)
    }

    #[tokio::test]
    async fn test_round_trip_between_ends() {
        let bus = PageBus::new();
        let (client, server) = connected(&bus, "main-world").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_message(Box::new(move |m| {
            let _ = tx.send(m);
        }));

        client.post_message(b"ping".to_vec()).expect("post");
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("in time")
            .expect("message");
        assert_eq!(got, b"ping");
    }

    #[tokio::test]
    async fn test_ports_ignore_other_connections() {
        let bus = PageBus::new();
        let (client_a, server_a) = connected(&bus, "main-world").await;
        let (_client_b, server_b) = connected(&bus, "main-world").await;

        let b_seen = Arc::new(Mutex::new(Vec::new()));
        let b_clone = Arc::clone(&b_seen);
        server_b.on_message(Box::new(move |m| b_clone.lock().push(m)));

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        server_a.on_message(Box::new(move |m| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(m);
            }
        }));

        client_a.post_message(vec![7]).expect("post");
        let got = timeout(Duration::from_secs(1), rx)
            .await
            .expect("in time")
            .expect("message");
        assert_eq!(got, vec![7]);
        assert!(b_seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_burst_is_delivered_in_order() {
        const BURST: usize = 5_000;

        let bus = PageBus::new();
        let (client, server) = connected(&bus, "main-world").await;
        let (_other_client, _other_server) = connected(&bus, "main-world").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_message(Box::new(move |m| {
            let _ = tx.send(m);
        }));

        for i in 0..BURST {
            client
                .post_message((i as u32).to_le_bytes().to_vec())
                .expect("post");
        }

        for i in 0..BURST {
            let got = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("in time")
                .expect("message");
            assert_eq!(got, (i as u32).to_le_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_connect_without_acceptor_fails() {
        let bus = PageBus::new();
        let result = bus.connect("nobody").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_propagates() {
        let bus = PageBus::new();
        let (client, server) = connected(&bus, "main-world").await;

        let (tx, rx) = oneshot::channel();
        server.on_disconnect(Box::new(move || {
            let _ = tx.send(());
        }));

        client.disconnect();
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("in time")
            .expect("signal");
        assert!(!server.is_connected());
        assert!(client.post_message(vec![1]).is_err());
    }
}
