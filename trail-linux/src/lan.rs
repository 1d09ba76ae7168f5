//! LAN radio: UDP multicast discovery, TCP streams as the link channel.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use trail_core::wire::{decode_frame, encode_frame};
use trail_core::{Advertisement, DeviceAddress, Message};

use crate::radio::{DiscoveryEvent, Radio};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LanRadio {
    local: Advertisement,
    discovery_port: u16,
    window: Duration,
    /// Link endpoints learned from beacons and responses.
    peers: Mutex<HashMap<DeviceAddress, SocketAddr>>,
    listener: OnceCell<TcpListener>,
}

impl LanRadio {
    pub fn new(local: Advertisement, discovery_port: u16, window: Duration) -> Self {
        Self {
            local,
            discovery_port,
            window,
            peers: Mutex::new(HashMap::new()),
            listener: OnceCell::new(),
        }
    }

    /// Record where `device` accepts links.
    pub async fn remember(&self, device: DeviceAddress, addr: SocketAddr) {
        self.peers.lock().await.insert(device, addr);
    }

    /// Bind the link listener if needed and return its address.
    pub async fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.listener().await?.local_addr()
    }

    async fn listener(&self) -> io::Result<&TcpListener> {
        self.listener
            .get_or_try_init(|| TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.local.listen_port)))
            .await
    }

    /// Answer beacons from devices of the same service so they can find us.
    /// Runs until the socket fails.
    pub async fn run_responder(self: Arc<Self>) -> io::Result<()> {
        let socket = make_multicast_socket(self.discovery_port)?;
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if let Some(reply) = self.answer(&buf[..n], from).await {
                if let Err(e) = socket.send_to(&reply, from).await {
                    debug!(%from, "discovery response not sent: {}", e);
                }
            }
        }
    }

    /// Handle one datagram on the multicast socket; returns the response to
    /// send back, if any.
    async fn answer(&self, datagram: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let (msg, _) = decode_frame(datagram).ok()?;
        let ad = match &msg {
            Message::Beacon(ad) => ad,
            Message::DiscoveryResponse(_) => return None,
        };
        if !ad.is_peer_of(&self.local.service_id, &self.local.address) {
            return None;
        }
        trace!(peer = %ad.address, %from, "beacon");
        self.remember(ad.address, SocketAddr::new(from.ip(), ad.listen_port))
            .await;
        encode_frame(&Message::DiscoveryResponse(self.local.clone())).ok()
    }

    /// Handle one datagram on the discovery socket; returns the advertisement
    /// of a newly heard peer.
    async fn learn(&self, datagram: &[u8], from: SocketAddr) -> Option<Advertisement> {
        let (msg, _) = decode_frame(datagram).ok()?;
        let ad = match msg {
            Message::DiscoveryResponse(ad) => ad,
            Message::Beacon(_) => return None,
        };
        if !ad.is_peer_of(&self.local.service_id, &self.local.address) {
            return None;
        }
        self.remember(ad.address, SocketAddr::new(from.ip(), ad.listen_port))
            .await;
        Some(ad)
    }

    async fn discovery_pass(&self, events: &mpsc::UnboundedSender<DiscoveryEvent>) -> io::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        let beacon = encode_frame(&Message::Beacon(self.local.clone()))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let dest = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        let deadline = Instant::now() + self.window;
        let mut resend = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = resend.tick() => {
                    socket.send_to(&beacon, dest).await?;
                }
                r = socket.recv_from(&mut buf) => {
                    let (n, from) = r?;
                    if let Some(ad) = self.learn(&buf[..n], from).await {
                        let _ = events.send(DiscoveryEvent::Found(ad.device()));
                    }
                }
            }
        }
    }

    async fn device_at(&self, addr: SocketAddr) -> Option<DeviceAddress> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .find(|(_, a)| a.ip() == addr.ip())
            .map(|(device, _)| *device)
    }
}

#[async_trait]
impl Radio for LanRadio {
    type Channel = TcpStream;

    async fn discover(&self, events: mpsc::UnboundedSender<DiscoveryEvent>) -> io::Result<()> {
        let _ = events.send(DiscoveryEvent::Started);
        match self.discovery_pass(&events).await {
            Ok(()) => {
                let _ = events.send(DiscoveryEvent::Finished);
                Ok(())
            }
            Err(e) => {
                warn!("discovery failed: {}", e);
                let _ = events.send(DiscoveryEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn connect(&self, device: DeviceAddress) -> io::Result<TcpStream> {
        let addr = self.peers.lock().await.get(&device).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no known endpoint for {}", device))
        })?;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn accept(&self) -> io::Result<(TcpStream, Option<DeviceAddress>)> {
        let (stream, from) = self.listener().await?.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, self.device_at(from).await))
    }
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
