//! tcp_port.rs
//! TCP-backed virtual UART.
//!
//! - `open` binds `base_port + (uart - 1)` and spawns one receive worker per port
//! - the worker accepts a single client, copies its bytes into the ring under
//!   the port's own lock (or hands them to a callback) and goes back to
//!   accepting once the client goes away
//! - `write` with no client attached silently drops the data

use std::{
    collections::HashSet,
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, SitlError};
use crate::serial::{PortMode, PortOptions, RX_BUFFER_SIZE, RingBuffer, SerialPort};

const RECV_CHUNK: usize = 256;
const ACCEPT_RETRY_MS: u64 = 100;

/// Byte callback replacing the ring buffer for a port.
pub type RxCallback = Box<dyn Fn(u8) + Send + Sync>;

/// Hands out TCP port numbers for virtual UARTs and refuses duplicates.
///
/// Ports can also be reserved up front (for instance the simulator port when
/// it runs on localhost) so a UART never shadows them.
#[derive(Debug)]
pub struct PortRegistry {
    base_port: u16,
    claimed: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// TCP port for a 1-based UART index.
    pub fn port_for(&self, uart: u8) -> Result<u16> {
        if uart == 0 {
            return Err(SitlError::PortOutOfRange {
                base: self.base_port,
                uart,
            });
        }
        self.base_port
            .checked_add(u16::from(uart) - 1)
            .ok_or(SitlError::PortOutOfRange {
                base: self.base_port,
                uart,
            })
    }

    pub fn reserve(&self, port: u16) -> Result<()> {
        if self.claimed.lock().insert(port) {
            Ok(())
        } else {
            Err(SitlError::PortCollision(port))
        }
    }

    fn claim(&self, uart: u8) -> Result<u16> {
        let port = self.port_for(uart)?;
        self.reserve(port)?;
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.claimed.lock().remove(&port);
    }
}

/// One virtual UART.
pub struct VirtualSerialPort {
    uart: u8,
    tcp_port: u16,
    baud: u32,
    mode: PortMode,
    options: PortOptions,
    rx: Mutex<RingBuffer>,
    client: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    rx_callback: RwLock<Option<RxCallback>>,
    rx_dropped: AtomicU64,
}

impl VirtualSerialPort {
    /// Bind the listening socket for `uart` and start its receive worker.
    ///
    /// Returns `None` (after logging why) if the port number collides, is out
    /// of range or the bind/listen fails. Other UARTs are unaffected.
    pub fn open(
        registry: &PortRegistry,
        uart: u8,
        baud: u32,
        mode: PortMode,
        options: PortOptions,
    ) -> Option<Arc<Self>> {
        let tcp_port = match registry.claim(uart) {
            Ok(p) => p,
            Err(e) => {
                error!("[UART{}] {}", uart, e);
                return None;
            }
        };

        let listener = match bind_listener(tcp_port) {
            Ok(l) => l,
            Err(e) => {
                error!("[UART{}] {}", uart, e);
                registry.release(tcp_port);
                return None;
            }
        };

        let port = Arc::new(Self {
            uart,
            tcp_port,
            baud,
            mode,
            options,
            rx: Mutex::new(RingBuffer::new(RX_BUFFER_SIZE)),
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
            rx_callback: RwLock::new(None),
            rx_dropped: AtomicU64::new(0),
        });

        let worker = port.clone();
        let spawned = thread::Builder::new()
            .name(format!("uart{}", uart))
            .spawn(move || worker.receive_loop(listener));
        if let Err(e) = spawned {
            error!("[UART{}] failed to spawn receive worker: {}", uart, e);
            registry.release(tcp_port);
            return None;
        }

        info!("[UART{}] bind port {} for UART{}", uart, tcp_port, uart);
        Some(port)
    }

    pub fn uart(&self) -> u8 {
        self.uart
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn mode(&self) -> PortMode {
        self.mode
    }

    pub fn options(&self) -> PortOptions {
        self.options
    }

    /// Bytes dropped because the ring was full when they arrived.
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }

    /// Route received bytes to `callback` instead of the ring buffer.
    pub fn set_rx_callback(&self, callback: RxCallback) {
        *self.rx_callback.write() = Some(callback);
    }

    pub fn clear_rx_callback(&self) {
        *self.rx_callback.write() = None;
    }

    /// Accept/receive worker. Runs for the lifetime of the process.
    fn receive_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("[UART{}] accept failed: {}", self.uart, e);
                    thread::sleep(Duration::from_millis(ACCEPT_RETRY_MS));
                    continue;
                }
            };

            if let Err(e) = self.attach(&stream) {
                warn!("[UART{}] could not attach client {}: {}", self.uart, peer, e);
                continue;
            }
            info!("[UART{}] client {} connected", self.uart, peer);

            self.pump(stream);

            self.detach();
            info!("[UART{}] client {} disconnected", self.uart, peer);
        }
    }

    fn attach(&self, stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        *self.client.lock() = Some(writer);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn detach(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = self.client.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Read until the peer closes or resets the connection.
    fn pump(&self, mut stream: TcpStream) {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.deliver(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("[UART{}] receive error: {}", self.uart, e);
                    break;
                }
            }
        }
    }

    /// Hand received bytes to the callback or the ring, in arrival order.
    pub(crate) fn deliver(&self, data: &[u8]) {
        if !self.mode.can_receive() {
            return;
        }

        let callback = self.rx_callback.read();
        if let Some(cb) = callback.as_ref() {
            for &b in data {
                cb(b);
            }
            return;
        }
        drop(callback);

        let stored = self.rx.lock().push_slice(data);
        let dropped = data.len() - stored;
        if dropped > 0 {
            self.rx_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            trace!("[UART{}] rx ring full, dropped {} bytes", self.uart, dropped);
        }
    }
}

impl SerialPort for VirtualSerialPort {
    fn write(&self, data: &[u8]) {
        if !self.mode.can_transmit() || data.is_empty() {
            return;
        }
        let mut client = self.client.lock();
        let Some(stream) = client.as_mut() else {
            return;
        };
        if let Err(e) = stream.write_all(data) {
            debug!("[UART{}] send failed, dropping client: {}", self.uart, e);
            let _ = stream.shutdown(Shutdown::Both);
            *client = None;
            self.connected.store(false, Ordering::Release);
        }
    }

    fn bytes_pending(&self) -> usize {
        self.rx.lock().pending()
    }

    fn read_byte(&self) -> u8 {
        self.rx.lock().pop().unwrap_or(0)
    }

    fn tx_bytes_free(&self) -> usize {
        // The socket buffers for us; report a full UART FIFO's worth of room.
        RX_BUFFER_SIZE
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let bind_err = |source| SitlError::Bind { port, source };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1).map_err(bind_err)?;
    Ok(socket.into())
}
