//! proxy.rs
//! MSP command dispatch and the links that carry it.
//!
//! Three deployments share the same decoder:
//! - flight-controller proxy: a real board on a serial device (or a TCP
//!   peer) is polled for its RC channels and RSSI, which drive the virtual
//!   receiver
//! - RC-source UART: an external tool connects to a virtual UART and pushes
//!   MSP RC frames into the receiver
//! - plain passthrough: a virtual UART's TCP client is wired byte-for-byte
//!   to the serial device, no decoding

use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, bounded};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::error::{Result, SitlError};
use crate::fc::RcSink;
use crate::msp::decoder::{DecoderStats, MspDecoder};
use crate::msp::frame::{Direction, MspFrame, RX_CONFIG_SIZE, command, encode_request};
use crate::serial::{SerialPort, VirtualSerialPort};

/// Offset of `maxcheck` inside the RX configuration block.
const RX_CONFIG_MAXCHECK_OFFSET: usize = 1;
/// Offset of `mincheck` inside the RX configuration block.
const RX_CONFIG_MINCHECK_OFFSET: usize = 5;
/// Outside the 1000..2000 stick range so stick commands never fire on the proxied board.
pub const SIM_MAXCHECK: u16 = 2100;
pub const SIM_MINCHECK: u16 = 900;

/// Offset of the RSSI field inside the `ANALOG` reply.
const ANALOG_RSSI_OFFSET: usize = 3;

const LINK_READ_TIMEOUT_MS: u64 = 5;
const LINK_RETRY_MS: u64 = 1_000;
const RX_CONFIG_RETRY_POLLS: u32 = 50;
const BRIDGE_QUEUE: usize = 4096;

/// What a received command means to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    RcChannels,
    Analog,
    RxConfig,
    SetRxConfig,
    Other(u16),
}

impl From<u16> for CommandKind {
    fn from(code: u16) -> Self {
        match code {
            command::RC => CommandKind::RcChannels,
            command::ANALOG => CommandKind::Analog,
            command::RX_CONFIG => CommandKind::RxConfig,
            command::SET_RX_CONFIG => CommandKind::SetRxConfig,
            other => CommandKind::Other(other),
        }
    }
}

/// Decoder plus command table feeding the virtual receiver.
pub struct MspProxy {
    decoder: MspDecoder,
    receiver: Arc<dyn RcSink>,
    swap34: bool,
    rx_config: Option<[u8; RX_CONFIG_SIZE]>,
    rx_config_acked: bool,
}

impl MspProxy {
    pub fn new(receiver: Arc<dyn RcSink>, swap34: bool) -> Self {
        Self {
            decoder: MspDecoder::new(),
            receiver,
            swap34,
            rx_config: None,
            rx_config_acked: false,
        }
    }

    /// Decode `data`, dispatch complete frames and return the requests to send back.
    pub fn process(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let frames = self.decoder.decode(data);
        frames.iter().filter_map(|f| self.dispatch(f)).collect()
    }

    /// Run one verified frame through the command table.
    pub fn dispatch(&mut self, frame: &MspFrame) -> Option<Vec<u8>> {
        if frame.direction == Direction::Error {
            debug!("[MSP] device rejected command {}", frame.command);
            return None;
        }

        match CommandKind::from(frame.command) {
            CommandKind::RcChannels => {
                let channels = rc_channels(&frame.payload, self.swap34);
                trace!("[MSP] RC {:?}", channels);
                self.receiver.set_channels(&channels);
                None
            }
            CommandKind::Analog => {
                match frame.read_u16(ANALOG_RSSI_OFFSET) {
                    Some(rssi) => self.receiver.set_rssi(rssi),
                    None => debug!("[MSP] short ANALOG payload ({} bytes)", frame.payload.len()),
                }
                None
            }
            CommandKind::RxConfig => {
                let block: [u8; RX_CONFIG_SIZE] = match frame.payload.as_slice().try_into() {
                    Ok(b) => b,
                    Err(_) => {
                        warn!(
                            "[MSP] RX_CONFIG has {} bytes, expected {}",
                            frame.payload.len(),
                            RX_CONFIG_SIZE
                        );
                        return None;
                    }
                };
                let patched = patch_rx_config(block);
                self.rx_config = Some(patched);
                info!(
                    "[MSP] RX config received, writing back mincheck={} maxcheck={}",
                    SIM_MINCHECK, SIM_MAXCHECK
                );
                match encode_request(command::SET_RX_CONFIG, &patched) {
                    Ok(req) => Some(req),
                    Err(e) => {
                        error!("[MSP] cannot encode SET_RX_CONFIG: {}", e);
                        None
                    }
                }
            }
            CommandKind::SetRxConfig => {
                if !self.rx_config_acked {
                    info!("[MSP] RX config write acknowledged");
                }
                self.rx_config_acked = true;
                None
            }
            CommandKind::Other(code) => {
                trace!("[MSP] ignoring command {}", code);
                None
            }
        }
    }

    /// The patched RX configuration block, once one has been received.
    pub fn rx_config(&self) -> Option<[u8; RX_CONFIG_SIZE]> {
        self.rx_config
    }

    pub fn rx_config_acked(&self) -> bool {
        self.rx_config_acked
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }
}

/// Little-endian u16 channel values, with channels 3 and 4 exchanged when asked.
pub fn rc_channels(payload: &[u8], swap34: bool) -> Vec<u16> {
    let mut channels: Vec<u16> = payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    if swap34 && channels.len() >= 4 {
        channels.swap(2, 3);
    }
    channels
}

/// Overwrite the stick-check thresholds with simulation-safe values.
pub fn patch_rx_config(mut block: [u8; RX_CONFIG_SIZE]) -> [u8; RX_CONFIG_SIZE] {
    block[RX_CONFIG_MAXCHECK_OFFSET..RX_CONFIG_MAXCHECK_OFFSET + 2]
        .copy_from_slice(&SIM_MAXCHECK.to_le_bytes());
    block[RX_CONFIG_MINCHECK_OFFSET..RX_CONFIG_MINCHECK_OFFSET + 2]
        .copy_from_slice(&SIM_MINCHECK.to_le_bytes());
    block
}

// ============================================================================
// Links
// ============================================================================

/// Byte pipe to whatever sits behind the proxy.
pub trait ProxyLink: Send {
    fn describe(&self) -> String;
    fn send(&mut self, data: &[u8]) -> Result<()>;
    /// Read what is available; `Ok(0)` when nothing arrived within the link's timeout.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Re-establish the link after a hard error.
    fn reopen(&mut self) -> Result<()>;
}

/// Serial line settings for the proxied board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
}

/// Real flight controller on a serial device.
pub struct SerialDeviceLink {
    settings: SerialSettings,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialDeviceLink {
    pub fn open(settings: SerialSettings) -> Result<Self> {
        let port = open_serial(&settings)?;
        info!(
            "[MSP] opened {} at {} baud ({:?}, {:?})",
            settings.device, settings.baud, settings.parity, settings.stop_bits
        );
        Ok(Self { settings, port })
    }
}

fn open_serial(settings: &SerialSettings) -> Result<Box<dyn serialport::SerialPort>> {
    let port = serialport::new(&settings.device, settings.baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(LINK_READ_TIMEOUT_MS))
        .open()?;
    Ok(port)
}

impl ProxyLink for SerialDeviceLink {
    fn describe(&self) -> String {
        self.settings.device.clone()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn reopen(&mut self) -> Result<()> {
        self.port = open_serial(&self.settings)?;
        Ok(())
    }
}

/// Proxy through a TCP peer instead of a local serial device.
pub struct TcpPeerLink {
    addr: SocketAddr,
    stream: TcpStream,
}

impl TcpPeerLink {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = connect_peer(addr)?;
        info!("[MSP] connected to TCP peer {}", addr);
        Ok(Self { addr, stream })
    }
}

fn connect_peer(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(1)).map_err(|source| {
        SitlError::Connect {
            target: addr.to_string(),
            source,
        }
    })?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(LINK_READ_TIMEOUT_MS)))?;
    Ok(stream)
}

impl ProxyLink for TcpPeerLink {
    fn describe(&self) -> String {
        self.addr.to_string()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(SitlError::Disconnected),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn reopen(&mut self) -> Result<()> {
        self.stream = connect_peer(self.addr)?;
        Ok(())
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Poll a proxied flight controller for RC and RSSI every `period`.
///
/// RX_CONFIG is requested first (and again every few polls until answered);
/// its reply triggers the patched write-back from the dispatcher.
pub fn spawn_fc_poller(
    mut link: Box<dyn ProxyLink>,
    mut proxy: MspProxy,
    period: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("msp-proxy".into()).spawn(move || {
        info!("[MSP] polling {} every {:?}", link.describe(), period);
        let mut buf = [0u8; 512];
        let mut next_poll = Instant::now();
        let mut polls: u32 = 0;

        loop {
            if Instant::now() >= next_poll {
                let mut commands = vec![command::RC, command::ANALOG];
                if proxy.rx_config().is_none() && polls % RX_CONFIG_RETRY_POLLS == 0 {
                    commands.insert(0, command::RX_CONFIG);
                }
                for req in commands.into_iter().filter_map(|c| encode_request(c, &[]).ok()) {
                    if let Err(e) = link.send(&req) {
                        warn!("[MSP] send to {} failed: {}", link.describe(), e);
                        break;
                    }
                }
                polls = polls.wrapping_add(1);
                next_poll += period;
                if next_poll < Instant::now() {
                    next_poll = Instant::now() + period;
                }
            }

            match link.recv(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for out in proxy.process(&buf[..n]) {
                        if let Err(e) = link.send(&out) {
                            warn!("[MSP] send to {} failed: {}", link.describe(), e);
                        }
                    }
                }
                Err(e) => {
                    warn!("[MSP] link {} lost: {}", link.describe(), e);
                    reopen_until_ok(link.as_mut());
                }
            }
        }
    })
}

fn reopen_until_ok(link: &mut dyn ProxyLink) {
    loop {
        thread::sleep(Duration::from_millis(LINK_RETRY_MS));
        match link.reopen() {
            Ok(()) => {
                info!("[MSP] link {} re-established", link.describe());
                return;
            }
            Err(e) => debug!("[MSP] reopen {} failed: {}", link.describe(), e),
        }
    }
}

/// Decode MSP frames arriving on a virtual UART straight into the receiver.
///
/// Requests produced by the dispatcher go back out through the same UART.
pub fn attach_rc_source(port: &Arc<VirtualSerialPort>, proxy: MspProxy) -> Arc<Mutex<MspProxy>> {
    let proxy = Arc::new(Mutex::new(proxy));
    let shared = proxy.clone();
    let weak: Weak<VirtualSerialPort> = Arc::downgrade(port);
    port.set_rx_callback(Box::new(move |byte| {
        let replies = shared.lock().process(std::slice::from_ref(&byte));
        if replies.is_empty() {
            return;
        }
        if let Some(port) = weak.upgrade() {
            for reply in replies {
                port.write(&reply);
            }
        }
    }));
    info!("[MSP] UART{} carries MSP RC input", port.uart());
    proxy
}

/// A running UART-to-link passthrough.
pub struct UartBridge {
    handle: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

impl UartBridge {
    /// Bytes from the UART client lost because the link fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Wire a virtual UART's TCP client byte-for-byte to `link`.
pub fn spawn_uart_bridge(
    port: Arc<VirtualSerialPort>,
    mut link: Box<dyn ProxyLink>,
) -> std::io::Result<UartBridge> {
    let (tx, rx): (_, Receiver<u8>) = bounded(BRIDGE_QUEUE);
    let dropped = Arc::new(AtomicU64::new(0));
    let counter = dropped.clone();
    let uart = port.uart();
    port.set_rx_callback(Box::new(move |byte| {
        if tx.try_send(byte).is_err() && counter.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("[UART{}] bridge queue full, dropping bytes", uart);
        }
    }));

    let handle = thread::Builder::new()
        .name(format!("uart{}-bridge", uart))
        .spawn(move || {
            info!("[MSP] UART{} bridged to {}", port.uart(), link.describe());
            let mut buf = [0u8; 512];
            let mut out = Vec::with_capacity(BRIDGE_QUEUE);
            loop {
                out.extend(rx.try_iter());
                if !out.is_empty() {
                    if let Err(e) = link.send(&out) {
                        warn!("[MSP] bridge send failed: {}", e);
                    }
                    out.clear();
                }

                match link.recv(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => port.write(&buf[..n]),
                    Err(e) => {
                        error!("[MSP] bridge link {} lost: {}", link.describe(), e);
                        reopen_until_ok(link.as_mut());
                    }
                }
            }
        })?;
    Ok(UartBridge { handle, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fc::VirtualReceiver;
    use crate::msp::frame::{MspVersion, encode_v1, encode_v2};

    fn proxy() -> (Arc<VirtualReceiver>, MspProxy) {
        let rx = Arc::new(VirtualReceiver::new());
        let p = MspProxy::new(rx.clone(), true);
        (rx, p)
    }

    #[test]
    fn rc_swap_exchanges_third_and_fourth() {
        let payload: Vec<u8> = [1100u16, 1200, 1300, 1400, 1500]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(rc_channels(&payload, true), vec![1100, 1200, 1400, 1300, 1500]);
        assert_eq!(rc_channels(&payload, false), vec![1100, 1200, 1300, 1400, 1500]);
    }

    #[test]
    fn rc_frame_reaches_receiver() {
        let (rx, mut p) = proxy();
        let payload: Vec<u8> = [1000u16, 2000, 1600, 1700]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let out = p.process(&encode_v1(Direction::FromDevice, command::RC as u8, &payload).unwrap());
        assert!(out.is_empty());
        assert_eq!(&rx.channels()[..4], &[1000, 2000, 1700, 1600]);
    }

    #[test]
    fn analog_sets_rssi() {
        let (rx, mut p) = proxy();
        let payload = [0x7E, 0x00, 0x00, 0x10, 0x02, 0x00, 0x00];
        p.process(&encode_v1(Direction::FromDevice, command::ANALOG as u8, &payload).unwrap());
        assert_eq!(rx.rssi(), 0x0210);
    }

    #[test]
    fn rx_config_is_patched_and_written_back() {
        let (_rx, mut p) = proxy();
        let mut block = [0u8; RX_CONFIG_SIZE];
        block[0] = 7;
        block[1..3].copy_from_slice(&1900u16.to_le_bytes());
        block[5..7].copy_from_slice(&1100u16.to_le_bytes());
        block[23] = 2;

        let out = p.process(&encode_v2(Direction::FromDevice, 0, command::RX_CONFIG, &block).unwrap());
        assert_eq!(out.len(), 1);

        let mut dec = MspDecoder::new();
        let sent = dec.decode(&out[0]);
        assert_eq!(sent.len(), 1);
        let req = &sent[0];
        assert_eq!(req.version, MspVersion::V2);
        assert_eq!(req.direction, Direction::ToDevice);
        assert_eq!(req.command, command::SET_RX_CONFIG);
        assert_eq!(req.read_u16(1), Some(SIM_MAXCHECK));
        assert_eq!(req.read_u16(5), Some(SIM_MINCHECK));
        assert_eq!(req.payload[0], 7);
        assert_eq!(req.payload[23], 2);
        assert_eq!(p.rx_config(), Some(req.payload.as_slice().try_into().unwrap()));
    }

    #[test]
    fn short_rx_config_is_ignored() {
        let (_rx, mut p) = proxy();
        let out = p.process(&encode_v2(Direction::FromDevice, 0, command::RX_CONFIG, &[0; 10]).unwrap());
        assert!(out.is_empty());
        assert!(p.rx_config().is_none());
    }

    #[test]
    fn error_direction_is_not_dispatched() {
        let (rx, mut p) = proxy();
        let payload = 1234u16.to_le_bytes();
        p.process(&encode_v1(Direction::Error, command::RC as u8, &payload).unwrap());
        assert_eq!(rx.frame_count(), 0);
    }

    #[test]
    fn set_rx_config_ack_is_recorded() {
        let (_rx, mut p) = proxy();
        p.process(&encode_v2(Direction::FromDevice, 0, command::SET_RX_CONFIG, &[]).unwrap());
        assert!(p.rx_config_acked());
    }
}
