//! Virtual serial transport.
//!
//! Every logical UART of the firmware is exposed as a TCP server socket; one
//! client at a time may connect and its bytes flow straight into the UART's
//! receive ring. There is no framing at this layer.

pub mod ring_buffer;
pub mod tcp_port;

pub use ring_buffer::RingBuffer;
pub use tcp_port::{PortRegistry, RxCallback, VirtualSerialPort};

/// Default receive ring size per virtual UART.
pub const RX_BUFFER_SIZE: usize = 1024;

/// Default first TCP port; UART1 listens here, UART2 on the next one, and so on.
pub const DEFAULT_BASE_PORT: u16 = 5760;

/// Direction(s) a port was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    Rx,
    Tx,
    RxTx,
}

impl PortMode {
    pub fn can_receive(self) -> bool {
        matches!(self, PortMode::Rx | PortMode::RxTx)
    }

    pub fn can_transmit(self) -> bool {
        matches!(self, PortMode::Tx | PortMode::RxTx)
    }
}

/// Line options the firmware asks for. Meaningless over TCP but kept so the
/// port reports back what it was opened with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortOptions {
    pub inverted: bool,
    pub two_stop_bits: bool,
    pub parity_even: bool,
    pub half_duplex: bool,
}

/// The firmware-facing serial interface.
///
/// `read_byte` on an empty port returns 0; callers check `bytes_pending` first.
pub trait SerialPort: Send + Sync {
    fn write(&self, data: &[u8]);
    fn bytes_pending(&self) -> usize;
    fn read_byte(&self) -> u8;
    fn tx_bytes_free(&self) -> usize;
    fn is_connected(&self) -> bool;
    fn baud_rate(&self) -> u32;
}
