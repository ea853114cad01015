//! MSP proxy: frame codec, decoder state machine and command dispatch.

pub mod crc;
pub mod decoder;
pub mod frame;
pub mod proxy;

pub use decoder::{DecoderState, DecoderStats, MspDecoder};
pub use frame::{Direction, MspFrame, MspVersion, command, encode_request, encode_v1, encode_v2};
pub use proxy::{
    CommandKind, MspProxy, ProxyLink, SerialDeviceLink, SerialSettings, TcpPeerLink,
    UartBridge, attach_rc_source, spawn_fc_poller, spawn_uart_bridge,
};
