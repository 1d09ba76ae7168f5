//! The radio the link runs over: device discovery plus client/server channel
//! factories. Everything above this trait only sees byte streams.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use trail_core::{Device, DeviceAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Started,
    Found(Device),
    Finished,
    Failed(String),
}

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Bidirectional point-to-point byte stream.
    type Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Run one discovery pass, reporting progress on `events`.
    /// Returns after `Finished` (or `Failed`) has been sent. Dropping the
    /// future stops the pass early.
    async fn discover(&self, events: mpsc::UnboundedSender<DiscoveryEvent>) -> io::Result<()>;

    /// Open a channel to `device`.
    async fn connect(&self, device: DeviceAddress) -> io::Result<Self::Channel>;

    /// Wait for one inbound channel. The peer address is reported when the
    /// radio can tell.
    async fn accept(&self) -> io::Result<(Self::Channel, Option<DeviceAddress>)>;
}
