use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mavlink::error::MessageReadError;
use mavlink::{MavHeader, MavlinkVersion};
use tokio_serial::SerialPort;
use tracing::{debug, info};

use crate::dialect::{
    MavAutopilot, MavCmd, MavDataStream, MavMessage, MavModeFlag, MavState, MavType,
    COMMAND_LONG_DATA, HEARTBEAT_DATA, REQUEST_DATA_STREAM_DATA,
};
use crate::handshake::Peer;
use crate::VehicleError;

pub type Frame = (MavHeader, MavMessage);

const MAX_FRAME: usize = 280;

const STX_V1: u8 = 0xFE;
const STX_V2: u8 = 0xFD;

/// Duplex, message-oriented channel to one vehicle.
pub trait Link: Send {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> io::Result<()>;

    /// `Ok(None)` when nothing arrived within `timeout`.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Frame>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Bind locally; the peer address is learned from the first datagram.
    UdpIn(String),
    /// Send to a known peer address.
    UdpOut(String),
    Serial { dev: String, baud: Option<u32> },
}

impl FromStr for Endpoint {
    type Err = VehicleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || VehicleError::Endpoint(s.to_string());
        let host_port = |rest: &str| -> Result<String, VehicleError> {
            match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(rest.to_string()),
                _ => Err(bad()),
            }
        };

        if let Some(rest) = s.strip_prefix("udpin:").or_else(|| s.strip_prefix("udp:")) {
            return Ok(Endpoint::UdpIn(host_port(rest)?));
        }
        if let Some(rest) = s.strip_prefix("udpout:") {
            return Ok(Endpoint::UdpOut(host_port(rest)?));
        }
        let serial = s.strip_prefix("serial:").or_else(|| s.starts_with('/').then_some(s));
        if let Some(rest) = serial {
            let (dev, baud) = match rest.rsplit_once(':') {
                Some((dev, baud)) => match baud.parse::<u32>() {
                    Ok(b) => (dev, Some(b)),
                    Err(_) => (rest, None),
                },
                None => (rest, None),
            };
            if dev.is_empty() {
                return Err(bad());
            }
            return Ok(Endpoint::Serial { dev: dev.to_string(), baud });
        }
        Err(bad())
    }
}

fn encode(version: MavlinkVersion, header: &MavHeader, msg: &MavMessage) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(MAX_FRAME);
    mavlink::write_versioned_msg(&mut buf, version, *header, msg)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("mavlink encode: {:?}", e)))?;
    Ok(buf)
}

/// Skip to the next start marker and decode the frame in the version it
/// announces.
fn read_frame<R: Read>(r: &mut R) -> Result<(MavlinkVersion, Frame), MessageReadError> {
    let mut stx = [0u8; 1];
    loop {
        r.read_exact(&mut stx).map_err(MessageReadError::Io)?;
        let version = match stx[0] {
            STX_V2 => MavlinkVersion::V2,
            STX_V1 => MavlinkVersion::V1,
            _ => continue,
        };
        let mut framed = Read::chain(&stx[..], &mut *r);
        let frame = mavlink::read_versioned_msg::<MavMessage, _>(&mut framed, version)?;
        return Ok((version, frame));
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub struct UdpLink {
    socket: UdpSocket,
    connected: bool,
    peer: Option<SocketAddr>,
    /// Outgoing frames follow the version the peer last spoke.
    version: MavlinkVersion,
    pending: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl UdpLink {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self::with_socket(socket, false))
    }

    pub fn connect(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(Self::with_socket(socket, true))
    }

    fn with_socket(socket: UdpSocket, connected: bool) -> Self {
        Self {
            socket,
            connected,
            peer: None,
            version: MavlinkVersion::V2,
            pending: VecDeque::new(),
            buf: vec![0u8; 65_536],
        }
    }
}

impl Link for UdpLink {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> io::Result<()> {
        let bytes = encode(self.version, header, msg)?;
        if self.connected {
            self.socket.send(&bytes)?;
        } else {
            let peer = self.peer.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "peer address not learned yet")
            })?;
            self.socket.send_to(&bytes, peer)?;
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let n = match self.socket.recv_from(&mut self.buf) {
            Ok((n, from)) => {
                if !self.connected && self.peer != Some(from) {
                    debug!(%from, "udp peer address learned");
                    self.peer = Some(from);
                }
                n
            }
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        // one datagram may carry several frames
        let mut reader = Cursor::new(&self.buf[..n]);
        while let Ok((version, frame)) = read_frame(&mut reader) {
            self.version = version;
            self.pending.push_back(frame);
        }
        Ok(self.pending.pop_front())
    }
}

/// Serial port reader whose timeout can be changed per receive.
struct TimedPort {
    port: Box<dyn SerialPort>,
    timeout_ms: Arc<AtomicU64>,
}

impl Read for TimedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let t = Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed).max(1));
        if self.port.timeout() != t {
            self.port.set_timeout(t).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
        self.port.read(buf)
    }
}

pub struct SerialLink {
    reader: TimedPort,
    writer: Box<dyn SerialPort>,
    timeout_ms: Arc<AtomicU64>,
    version: MavlinkVersion,
}

impl SerialLink {
    pub fn open(dev: &str, baud: u32) -> io::Result<Self> {
        let port = tokio_serial::new(dev, baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("open serial {}: {}", dev, e)))?;
        let writer = port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("clone serial {}: {}", dev, e)))?;
        let timeout_ms = Arc::new(AtomicU64::new(100));
        let reader = TimedPort { port, timeout_ms: timeout_ms.clone() };
        Ok(Self { reader, writer, timeout_ms, version: MavlinkVersion::V2 })
    }
}

impl Link for SerialLink {
    fn send(&mut self, header: &MavHeader, msg: &MavMessage) -> io::Result<()> {
        let bytes = encode(self.version, header, msg)?;
        io::Write::write_all(&mut self.writer, &bytes)
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Frame>> {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
        match read_frame(&mut self.reader) {
            Ok((version, frame)) => {
                self.version = version;
                Ok(Some(frame))
            }
            Err(MessageReadError::Io(e)) if is_timeout(&e) => Ok(None),
            Err(MessageReadError::Io(e)) => Err(e),
            // unknown id or corrupt frame: drop it
            Err(MessageReadError::Parse(_)) => Ok(None),
        }
    }
}

pub fn open_link(endpoint: &Endpoint, default_baud: u32) -> Result<Box<dyn Link>, VehicleError> {
    let link: Box<dyn Link> = match endpoint {
        Endpoint::UdpIn(addr) => Box::new(UdpLink::bind(addr)?),
        Endpoint::UdpOut(addr) => Box::new(UdpLink::connect(addr)?),
        Endpoint::Serial { dev, baud } => Box::new(SerialLink::open(dev, baud.unwrap_or(default_baud))?),
    };
    info!(?endpoint, "link opened");
    Ok(link)
}

/// A link plus the MAVLink addressing used on it.
///
/// Only reachable through [`crate::LinkArbiter`], so whoever holds a
/// `&mut LinkSession` owns the link for the whole exchange.
pub struct LinkSession {
    link: Box<dyn Link>,
    hdr: MavHeader,
    peer: Peer,
    keep_alive: Option<Duration>,
    last_hb: Option<Instant>,
}

impl LinkSession {
    pub fn new(link: Box<dyn Link>, sys_id: u8, comp_id: u8, peer: Peer) -> Self {
        Self {
            link,
            hdr: MavHeader { system_id: sys_id, component_id: comp_id, sequence: 0 },
            peer,
            keep_alive: None,
            last_hb: None,
        }
    }

    /// Emit a GCS heartbeat every `every` from inside any receive, so long
    /// exclusive exchanges keep the ground station visible to the vehicle.
    pub fn keep_alive(&mut self, every: Duration) {
        self.keep_alive = Some(every);
    }

    fn heartbeat_if_due(&mut self) {
        let Some(every) = self.keep_alive else { return };
        if self.last_hb.map_or(false, |t| t.elapsed() < every) {
            return;
        }
        if let Err(e) = self.send_heartbeat() {
            debug!(error = %e, "gcs heartbeat not sent");
            self.last_hb = Some(Instant::now());
        }
    }

    /// Longest single wait that does not overrun the next heartbeat.
    fn wait_slice(&self, left: Duration) -> Duration {
        match (self.keep_alive, self.last_hb) {
            (Some(every), Some(t)) => left.min(every.saturating_sub(t.elapsed()).max(Duration::from_millis(1))),
            _ => left,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn target_system(&self) -> u8 {
        self.peer.system_id
    }

    pub fn target_component(&self) -> u8 {
        self.peer.component_id
    }

    pub fn send(&mut self, msg: MavMessage) -> Result<(), VehicleError> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.link.send(&self.hdr, &msg)?;
        Ok(())
    }

    pub fn recv(&mut self, timeout: Duration) -> Result<Option<MavMessage>, VehicleError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.heartbeat_if_due();
            let left = deadline.saturating_duration_since(Instant::now());
            if let Some((_, msg)) = self.link.recv(self.wait_slice(left))? {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Receive until `pick` accepts a message or `timeout` elapses.
    /// Messages `pick` declines are dropped.
    pub fn recv_match<T>(
        &mut self,
        timeout: Duration,
        mut pick: impl FnMut(&MavMessage) -> Option<T>,
    ) -> Result<Option<T>, VehicleError> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            if let Some(msg) = self.recv(left)? {
                if let Some(v) = pick(&msg) {
                    return Ok(Some(v));
                }
            }
        }
    }

    /// Discard whatever is already queued, for at most `window`.
    pub fn drain(&mut self, window: Duration) -> Result<usize, VehicleError> {
        let deadline = Instant::now() + window;
        let mut dropped = 0;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.recv(left.min(Duration::from_millis(20)))? {
                Some(_) => dropped += 1,
                None => break,
            }
        }
        if dropped > 0 {
            debug!(dropped, "drained stale frames");
        }
        Ok(dropped)
    }

    pub fn send_heartbeat(&mut self) -> Result<(), VehicleError> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(MavMessage::HEARTBEAT(hb))?;
        self.last_hb = Some(Instant::now());
        Ok(())
    }

    pub fn request_data_stream(&mut self, stream: MavDataStream, rate_hz: u16) -> Result<(), VehicleError> {
        let req = REQUEST_DATA_STREAM_DATA {
            req_message_rate: rate_hz,
            target_system: self.target_system(),
            target_component: self.target_component(),
            req_stream_id: stream as u8,
            start_stop: 1,
        };
        self.send(MavMessage::REQUEST_DATA_STREAM(req))
    }

    pub fn command_long(&mut self, command: MavCmd, params: [f32; 7]) -> Result<(), VehicleError> {
        let [param1, param2, param3, param4, param5, param6, param7] = params;
        let cmd = COMMAND_LONG_DATA {
            target_system: self.target_system(),
            target_component: self.target_component(),
            command,
            confirmation: 0,
            param1,
            param2,
            param3,
            param4,
            param5,
            param6,
            param7,
        };
        debug!(?command, "sending COMMAND_LONG");
        self.send(MavMessage::COMMAND_LONG(cmd))
    }
}
