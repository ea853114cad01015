//! error.rs
//! Error type shared by the transports, the MSP proxy and the simulator clients.
//!
//! Nothing here crosses into the flight-control side: workers log these and
//! either retry or leave the last good value in place.

/// Errors raised inside the SITL bridge.
#[derive(Debug, thiserror::Error)]
pub enum SitlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind TCP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("TCP port {0} already claimed by another virtual UART")]
    PortCollision(u16),

    #[error("base port {base} + UART{uart} does not fit a TCP port number")]
    PortOutOfRange { base: u16, uart: u8 },

    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serial device error: {0}")]
    SerialDevice(String),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("peer disconnected")]
    Disconnected,
}

impl SitlError {
    /// True for errors that only mean "nothing arrived this cycle".
    pub fn is_timeout(&self) -> bool {
        match self {
            SitlError::Timeout(_) => true,
            SitlError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<serialport::Error> for SitlError {
    fn from(e: serialport::Error) -> Self {
        SitlError::SerialDevice(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SitlError>;
