//! Connections and envelope delivery
//!
//! Each connection runs as its own task: frames are read in order and handed
//! to the [`Dispatcher`], and a companion writer task drains the
//! connection's outbound queue. Every outbound message is stamped with our
//! protocol version and signed here.

use crate::dispatcher::{malformed_reply, Dispatcher};
use crate::error::{NodeError, Result};
use psu_crypto::NodeIdentity;
use psu_protocol::{
    read_frame, write_frame, Message, NodeId, Payload, PeerInfo, PendingRequests, ProtocolError,
};
use psu_transfer::TransferEvent;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Messages queued per connection before senders wait
const OUTBOUND_QUEUE: usize = 256;

/// Sending half of one connection
#[derive(Debug, Clone)]
pub struct PeerLink {
    address: SocketAddr,
    outbound: mpsc::Sender<Message>,
}

impl PeerLink {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// All open connections of a node
pub struct Network {
    identity: Arc<NodeIdentity>,
    protocol_version: u8,
    pending: PendingRequests,
    request_timeout: Duration,
    by_address: RwLock<HashMap<SocketAddr, PeerLink>>,
    by_node: RwLock<HashMap<NodeId, PeerLink>>,
    dispatcher: OnceLock<Arc<Dispatcher>>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl Network {
    pub fn new(
        identity: Arc<NodeIdentity>,
        protocol_version: u8,
        pending: PendingRequests,
        request_timeout: Duration,
        events: Option<mpsc::UnboundedSender<TransferEvent>>,
    ) -> Self {
        Self {
            identity,
            protocol_version,
            pending,
            request_timeout,
            by_address: RwLock::new(HashMap::new()),
            by_node: RwLock::new(HashMap::new()),
            dispatcher: OnceLock::new(),
            events,
        }
    }

    /// Install the dispatcher inbound messages are handed to
    pub fn attach(&self, dispatcher: Arc<Dispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            warn!("Dispatcher already attached");
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn connection_count(&self) -> usize {
        self.by_address.read().await.len()
    }

    pub async fn is_connected(&self, node_id: &NodeId) -> bool {
        self.by_node
            .read()
            .await
            .get(node_id)
            .is_some_and(|link| !link.is_closed())
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, address) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Cannot set TCP_NODELAY for {}: {}", address, e);
            }
            debug!("Accepted connection from {}", address);
            self.spawn_connection(stream, address).await;
        }
    }

    /// Open (or reuse) a connection to `address`
    pub async fn connect(self: &Arc<Self>, address: SocketAddr) -> Result<PeerLink> {
        if let Some(link) = self.by_address.read().await.get(&address) {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }
        let stream = match timeout(self.request_timeout, TcpStream::connect(address)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(NodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {}", address),
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY for {}: {}", address, e);
        }
        info!("Connected to {}", address);
        Ok(self.spawn_connection(stream, address).await)
    }

    /// Run the reader and writer tasks for an established stream
    pub async fn spawn_connection<S>(self: &Arc<Self>, stream: S, address: SocketAddr) -> PeerLink
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut queue) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let link = PeerLink { address, outbound };
        self.by_address.write().await.insert(address, link.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    debug!("Write to {} failed: {}", address, e);
                    break;
                }
            }
        });

        let network = self.clone();
        let reader_link = link.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(message) => network.on_message(message, &reader_link).await,
                    Err(e) if e.is_fatal_to_connection() => {
                        debug!("Connection to {} ended: {}", address, e);
                        break;
                    }
                    Err(ProtocolError::MalformedPayload {
                        message_type,
                        reason,
                        message_id: Some(request_id),
                    }) => {
                        warn!(
                            "Malformed {:?} payload from {}: {}",
                            message_type, address, reason
                        );
                        if let Some(reply) = malformed_reply(message_type, request_id, &reason) {
                            if let Err(e) = network.send_on(&reader_link, reply).await {
                                debug!("Error reply to {} not sent: {}", address, e);
                            }
                        }
                    }
                    Err(e) => warn!("Dropping undecodable frame from {}: {}", address, e),
                }
            }
            writer_task.abort();
            network.forget(address).await;
        });

        link
    }

    async fn forget(&self, address: SocketAddr) {
        self.by_address.write().await.remove(&address);
        self.by_node
            .write()
            .await
            .retain(|_, link| link.address != address);
        info!("Disconnected from {}", address);
    }

    async fn on_message(&self, message: Message, link: &PeerLink) {
        trace!("{:?} from {}", message.message_type(), link.address);
        let Some(dispatcher) = self.dispatcher.get() else {
            warn!("No dispatcher attached, dropping message from {}", link.address);
            return;
        };
        let dispatch = dispatcher.dispatch(message, link.address).await;

        if let Some(sender) = dispatch.sender {
            let mut by_node = self.by_node.write().await;
            let known = by_node
                .get(&sender)
                .is_some_and(|existing| existing.address == link.address && !existing.is_closed());
            if !known {
                debug!("{} is reachable over {}", sender, link.address);
                by_node.insert(sender, link.clone());
            }
        }
        for reply in dispatch.replies {
            if let Err(e) = self.send_on(link, reply).await {
                debug!("Reply to {} not sent: {}", link.address, e);
            }
        }
        for (target, message) in dispatch.forwards {
            if let Err(e) = self.send_to(&target, message).await {
                warn!("Cannot forward to {}: {}", target, e);
            }
        }
        if let Some(events) = &self.events {
            for event in dispatch.events {
                let _ = events.send(event);
            }
        }
    }

    fn seal(&self, mut message: Message) -> Result<Message> {
        message.version = self.protocol_version;
        message.sign(&self.identity)?;
        Ok(message)
    }

    /// Sign and queue `message` on `link`
    pub async fn send_on(&self, link: &PeerLink, message: Message) -> Result<()> {
        let message = self.seal(message)?;
        link.outbound
            .send(message)
            .await
            .map_err(|_| NodeError::ConnectionClosed(link.address))
    }

    /// Sign and queue `message` to a connected peer
    pub async fn send_to(&self, node_id: &NodeId, message: Message) -> Result<()> {
        let link = self
            .by_node
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or(NodeError::NotConnected(*node_id))?;
        self.send_on(&link, message).await
    }

    /// Connection to `peer`, dialing its address when not connected
    pub async fn link_for(self: &Arc<Self>, peer: &PeerInfo) -> Result<PeerLink> {
        if let Some(link) = self.by_node.read().await.get(&peer.node_id) {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }
        let link = self.connect(peer.address).await?;
        self.by_node.write().await.insert(peer.node_id, link.clone());
        Ok(link)
    }

    /// Send a request to `peer` and wait for its correlated response
    ///
    /// `Error` responses are returned as payloads.
    pub async fn request(self: &Arc<Self>, peer: &PeerInfo, payload: Payload) -> Result<Payload> {
        let link = self.link_for(peer).await?;
        self.request_on(&link, payload).await
    }

    /// Like [`Network::request`], addressed by socket address only
    pub async fn request_at(self: &Arc<Self>, address: SocketAddr, payload: Payload) -> Result<Payload> {
        let link = self.connect(address).await?;
        self.request_on(&link, payload).await
    }

    async fn request_on(&self, link: &PeerLink, payload: Payload) -> Result<Payload> {
        let message = self.seal(Message::new(payload))?;
        let handle = self.pending.register(&message).await?;
        let request_id = message.message_id;

        if link.outbound.send(message).await.is_err() {
            self.pending.cancel(&request_id).await;
            return Err(NodeError::ConnectionClosed(link.address));
        }
        let response = handle.wait(self.request_timeout).await?;
        Ok(response.payload)
    }

    /// Like [`Network::request`], with `Error` responses as errors
    pub async fn call(self: &Arc<Self>, peer: &PeerInfo, payload: Payload) -> Result<Payload> {
        match self.request(peer, payload).await? {
            Payload::Error(error) => Err(NodeError::Remote {
                code: error.code,
                message: error.message,
            }),
            other => Ok(other),
        }
    }
}
