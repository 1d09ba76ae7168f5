// Trail-talk Linux daemon: pairs with a nearby peer and carries half-duplex
// voice (raw PCM on stdin/stdout) plus periodic position updates.

mod audio;
mod config;
mod lan;
mod manager;
mod radio;
mod session;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use trail_core::{
    Advertisement, Coordinate, DeviceAddress, LinkState, TalkState, TransmissionMonitor, PROTOCOL_VERSION,
};

use crate::config::Config;
use crate::lan::LanRadio;
use crate::manager::{DisconnectReason, LinkEvent, LinkManager};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("trail-linux {}", VERSION);
            return Ok(());
        }
    }

    // stdout carries audio, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    let result = rt.block_on(run(cfg));
    // The stdin reader sits on a blocking thread that never returns on its own.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let address = match cfg.device_address.as_deref().map(str::parse::<DeviceAddress>) {
        Some(Ok(a)) => a,
        Some(Err(e)) => {
            warn!("{}; using a random address", e);
            DeviceAddress::random()
        }
        None => DeviceAddress::random(),
    };
    let peer = match cfg.peer.as_deref().map(str::parse::<DeviceAddress>) {
        Some(Ok(p)) => Some(p),
        Some(Err(e)) => {
            warn!("ignoring peer: {}", e);
            None
        }
        None => None,
    };

    let local = Advertisement {
        protocol_version: PROTOCOL_VERSION,
        service_id: cfg.service_id,
        address,
        name: cfg.device_name.clone(),
        listen_port: cfg.transport_port,
    };
    info!(%address, name = %cfg.device_name, version = VERSION, "trail-linux starting");

    let radio = Arc::new(LanRadio::new(local, cfg.discovery_port, cfg.discovery_window()));
    let listen_addr = radio.listen_addr().await.context("binding link listener")?;
    info!(addr = %listen_addr, "accepting links");
    tokio::spawn({
        let radio = radio.clone();
        async move {
            if let Err(e) = radio.run_responder().await {
                error!("discovery responder stopped: {}", e);
            }
        }
    });

    let (manager, link, mut events) =
        LinkManager::new(radio, cfg.buffer_size).context("invalid buffer_size")?;
    let manager_task = tokio::spawn(manager.run());

    let (talk_tx, talk_rx) = watch::channel(TalkState::Busy);
    let playback = audio::spawn_playback(tokio::io::stdout());
    tokio::spawn({
        let link = link.clone();
        let chunk_size = cfg.buffer_size;
        async move {
            let sent = audio::run_capture(tokio::io::stdin(), chunk_size, talk_rx, move |chunk| {
                link.send(chunk).is_ok()
            });
            if let Err(e) = sent.await {
                warn!("capture stopped: {}", e);
            }
        }
    });

    link.listen()?;
    link.start_discovery()?;

    let mut monitor = TransmissionMonitor::new(cfg.silence_threshold(), Instant::now());
    let mut tracker = PeerTracker::new(cfg.position);
    let mut connected = false;
    let mut link_state = LinkState::Idle;
    let mut discovering = false;
    let mut talk_tick = tokio::time::interval(cfg.talk_poll());
    let mut location_tick = tokio::time::interval(cfg.location_interval());
    let every = cfg.rediscover_interval();
    let mut rediscover_tick = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                break;
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    LinkEvent::StateChanged(state) => {
                        info!(%state, "link state");
                        link_state = state;
                    }
                    LinkEvent::DeviceFound(device) => {
                        if !connected && should_connect(address, peer, device.address) {
                            link.connect(device.address)?;
                        }
                    }
                    LinkEvent::Connected { session, peer } => {
                        info!(%session, peer = ?peer, "link up");
                        connected = true;
                        tracker.reset();
                        monitor = TransmissionMonitor::new(cfg.silence_threshold(), Instant::now());
                        location_tick.reset();
                    }
                    LinkEvent::Disconnected { session: Some(session), reason } => {
                        info!(%session, ?reason, "link down");
                        if reason == DisconnectReason::Replaced {
                            continue;
                        }
                        connected = false;
                        tracker.reset();
                        set_talk(&talk_tx, TalkState::Busy);
                        if cfg.auto_listen {
                            link.listen()?;
                            link.start_discovery()?;
                        }
                    }
                    LinkEvent::Disconnected { session: None, .. } => debug!("send dropped, no link"),
                    LinkEvent::ConnectFailed { device, reason } => {
                        warn!(%device, "connect failed: {}; listening instead", reason);
                        link.listen()?;
                    }
                    LinkEvent::AlreadyConnected(device) => debug!(%device, "already connected"),
                    LinkEvent::ListenFailed(reason) => error!("cannot accept links: {}", reason),
                    LinkEvent::DiscoveryStarted => {
                        debug!("discovery started");
                        discovering = true;
                    }
                    LinkEvent::DiscoveryFinished => {
                        debug!("discovery finished");
                        discovering = false;
                    }
                    LinkEvent::DiscoveryFailed(reason) => {
                        warn!("discovery failed: {}", reason);
                        discovering = false;
                    }
                    LinkEvent::Audio(chunk) => {
                        monitor.record_audio(Instant::now());
                        set_talk(&talk_tx, TalkState::Busy);
                        let _ = playback.send(chunk);
                    }
                    LinkEvent::PeerLocation(position) => {
                        if let Some(metres) = tracker.update_peer(position) {
                            info!("peer is {:.1} m away", metres);
                        } else {
                            debug!(?position, "peer position");
                        }
                    }
                }
            }
            _ = talk_tick.tick() => {
                let state = if connected { monitor.poll(Instant::now()) } else { TalkState::Busy };
                set_talk(&talk_tx, state);
            }
            _ = rediscover_tick.tick() => {
                if rediscovery_due(connected, discovering, link_state) {
                    debug!("no link yet, discovering again");
                    link.start_discovery()?;
                }
            }
            _ = location_tick.tick(), if connected => {
                if let Some(record) = tracker.outbound_record() {
                    debug!(distance_m = ?tracker.distance(), "sending position");
                    link.send(record)?;
                }
            }
        }
    }

    let _ = link.stop_discovery();
    let _ = link.stop_listening();
    let _ = link.disconnect();
    let _ = link.shutdown();
    let _ = manager_task.await;
    Ok(())
}

fn set_talk(tx: &watch::Sender<TalkState>, state: TalkState) {
    let changed = tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            *current = state;
            true
        }
    });
    if changed {
        debug!(?state, "talk state");
    }
}

/// A configured peer is connected to when seen. Without one, the lower
/// address connects and the higher one waits to be accepted, so two daemons
/// do not dial each other at once.
fn should_connect(local: DeviceAddress, configured: Option<DeviceAddress>, found: DeviceAddress) -> bool {
    match configured {
        Some(peer) => peer == found,
        None => local < found,
    }
}

/// Another discovery pass is due when no link is up or being dialled and no
/// pass is running. A peer that came up after our last pass ended is only
/// heard through a new pass.
fn rediscovery_due(connected: bool, discovering: bool, state: LinkState) -> bool {
    !connected && !discovering && state != LinkState::ConnectingClient
}

/// Own position and the last known distance to the peer on the current link.
struct PeerTracker {
    own: Option<Coordinate>,
    distance: Option<f64>,
}

impl PeerTracker {
    fn new(own: Option<Coordinate>) -> Self {
        Self { own, distance: None }
    }

    fn reset(&mut self) {
        self.distance = None;
    }

    fn distance(&self) -> Option<f64> {
        self.distance
    }

    /// Returns the new distance in metres when the own position is known.
    fn update_peer(&mut self, position: Coordinate) -> Option<f64> {
        self.distance = self.own.map(|own| own.distance_to(&position));
        self.distance
    }

    fn outbound_record(&self) -> Option<Vec<u8>> {
        self.own?.to_record().ok()
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::from_bytes([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn configured_peer_only() {
        assert!(should_connect(addr(9), Some(addr(3)), addr(3)));
        assert!(!should_connect(addr(1), Some(addr(3)), addr(4)));
    }

    #[test]
    fn lower_address_dials() {
        assert!(should_connect(addr(1), None, addr(2)));
        assert!(!should_connect(addr(2), None, addr(1)));
    }

    #[test]
    fn rediscovers_only_while_unlinked_and_not_searching() {
        assert!(rediscovery_due(false, false, LinkState::Idle));
        assert!(rediscovery_due(false, false, LinkState::ListeningServer));
        assert!(!rediscovery_due(false, true, LinkState::ListeningServer));
        assert!(!rediscovery_due(false, false, LinkState::ConnectingClient));
        assert!(!rediscovery_due(true, false, LinkState::Connected));
    }

    #[test]
    fn tracker_distance_needs_own_position() {
        let mut blind = PeerTracker::new(None);
        assert_eq!(blind.update_peer(Coordinate::new(0.0, 1.0)), None);
        assert!(blind.outbound_record().is_none());

        let mut t = PeerTracker::new(Some(Coordinate::new(0.0, 0.0)));
        let d = t.update_peer(Coordinate::new(0.0, 1.0)).unwrap();
        assert!((d - 111_319.49).abs() < 1.0);
        assert!(t.outbound_record().unwrap().starts_with(b"start"));

        assert_eq!(t.distance(), Some(d));
        t.reset();
        assert!(t.distance().is_none());
    }
}
