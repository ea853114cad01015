//! config.rs
//! Command line options and the immutable configuration built from them.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, ValueEnum};

use crate::error::{Result, SitlError};
use crate::msp::SerialSettings;
use crate::serial::DEFAULT_BASE_PORT;
use crate::sim::{OutputMapping, adumsim, realflight, xplane};

const DEFAULT_PROXY_PERIOD_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimulatorKind {
    /// X-Plane over UDP
    #[value(name = "xp")]
    XPlane,
    /// RealFlight Link over HTTP/SOAP
    #[value(name = "rf")]
    RealFlight,
    /// Semicolon line protocol over TCP
    Adumsim,
}

impl SimulatorKind {
    pub fn default_port(self) -> u16 {
        match self {
            SimulatorKind::XPlane => xplane::DEFAULT_PORT,
            SimulatorKind::RealFlight => realflight::DEFAULT_PORT,
            SimulatorKind::Adumsim => adumsim::DEFAULT_PORT,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            SimulatorKind::XPlane => xplane::CHANNELS,
            SimulatorKind::RealFlight => realflight::CHANNELS,
            SimulatorKind::Adumsim => adumsim::CHANNELS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ParityArg {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StopBitsArg {
    One,
    Two,
}

/// SITL bridge: virtual UARTs, MSP receiver proxy and simulator link.
#[derive(Parser, Debug)]
#[command(name = "sitl")]
#[command(version)]
pub struct SitlArgs {
    /// Simulator backend
    #[arg(long, value_enum)]
    pub sim: Option<SimulatorKind>,

    /// Simulator address
    #[arg(long, default_value = "127.0.0.1")]
    pub simip: IpAddr,

    /// Simulator port (default depends on the backend)
    #[arg(long)]
    pub simport: Option<u16>,

    /// Feed simulator accelerometer and gyro directly instead of deriving them from attitude
    #[arg(long)]
    pub useimu: bool,

    /// Output mapping, e.g. "M01-01,S01-02" (M motor, S servo, output-channel, 1-based)
    #[arg(long, default_value = "")]
    pub chanmap: String,

    /// TCP port of UART1; UARTn listens on baseport + n - 1
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    pub baseport: u16,

    /// UARTs to expose as TCP servers
    #[arg(long, value_delimiter = ',', default_value = "1,2")]
    pub uarts: Vec<u8>,

    /// Serial device of a real flight controller to proxy
    #[arg(long)]
    pub serialport: Option<String>,

    #[arg(long, default_value_t = 115_200)]
    pub baudrate: u32,

    #[arg(long, value_enum, default_value = "one")]
    pub stopbits: StopBitsArg,

    #[arg(long, value_enum, default_value = "none")]
    pub parity: ParityArg,

    /// UART bridged byte-for-byte to the serial proxy target
    #[arg(long, default_value_t = 3)]
    pub serialuart: u8,

    /// Use the proxied flight controller as RC receiver
    #[arg(long)]
    pub fcproxy: bool,

    /// Proxy through a TCP peer (host:port) instead of a serial device
    #[arg(long)]
    pub proxytcp: Option<SocketAddr>,

    /// UART on which an external tool sends MSP RC frames
    #[arg(long)]
    pub rcuart: Option<u8>,

    /// Exchange trace CSV
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Exchange RC channels 3 and 4 in proxied RC frames
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub swap34: bool,
}

/// Where the MSP proxy talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    Serial(SerialSettings),
    Tcp(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    pub kind: SimulatorKind,
    pub addr: SocketAddr,
    pub use_imu: bool,
}

/// Effective configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitlConfig {
    pub base_port: u16,
    pub uarts: Vec<u8>,
    pub simulator: Option<SimulatorConfig>,
    pub mapping: OutputMapping,
    pub proxy: Option<ProxyTarget>,
    /// UART bridged to the proxy target when the proxy is not feeding the receiver.
    pub proxy_uart: u8,
    pub fc_proxy: bool,
    pub proxy_period: Duration,
    pub rc_uart: Option<u8>,
    pub swap34: bool,
    pub trace: Option<PathBuf>,
}

impl SitlConfig {
    pub fn from_args(args: SitlArgs) -> Result<Self> {
        let mapping: OutputMapping = args.chanmap.parse()?;

        let simulator = match args.sim {
            Some(kind) => {
                mapping.check_channels(kind.channels())?;
                Some(SimulatorConfig {
                    kind,
                    addr: SocketAddr::new(args.simip, args.simport.unwrap_or(kind.default_port())),
                    use_imu: args.useimu,
                })
            }
            None => None,
        };

        let proxy = match (args.proxytcp, args.serialport) {
            (Some(_), Some(_)) => {
                return Err(SitlError::Config(
                    "--proxytcp and --serialport are mutually exclusive".into(),
                ));
            }
            (Some(addr), None) => Some(ProxyTarget::Tcp(addr)),
            (None, Some(device)) => Some(ProxyTarget::Serial(SerialSettings {
                device,
                baud: args.baudrate,
                parity: match args.parity {
                    ParityArg::None => serialport::Parity::None,
                    ParityArg::Even => serialport::Parity::Even,
                    ParityArg::Odd => serialport::Parity::Odd,
                },
                stop_bits: match args.stopbits {
                    StopBitsArg::One => serialport::StopBits::One,
                    StopBitsArg::Two => serialport::StopBits::Two,
                },
            })),
            (None, None) => None,
        };

        if args.fcproxy && proxy.is_none() {
            return Err(SitlError::Config(
                "--fcproxy needs --serialport or --proxytcp".into(),
            ));
        }
        if args.uarts.contains(&0) || args.serialuart == 0 || args.rcuart == Some(0) {
            return Err(SitlError::Config("UART numbers start at 1".into()));
        }
        if args.rcuart.is_some() && args.fcproxy {
            return Err(SitlError::Config(
                "--rcuart and --fcproxy both drive the receiver".into(),
            ));
        }
        if proxy.is_some() && !args.fcproxy && args.rcuart == Some(args.serialuart) {
            return Err(SitlError::Config(format!(
                "UART{} cannot be both the RC UART and the proxy bridge",
                args.serialuart
            )));
        }

        let mut uarts = args.uarts;
        uarts.sort_unstable();
        uarts.dedup();

        Ok(Self {
            base_port: args.baseport,
            uarts,
            simulator,
            mapping,
            proxy,
            proxy_uart: args.serialuart,
            fc_proxy: args.fcproxy,
            proxy_period: Duration::from_millis(DEFAULT_PROXY_PERIOD_MS),
            rc_uart: args.rcuart,
            swap34: args.swap34,
            trace: args.trace,
        })
    }

    /// Whether simulator joystick axes should drive the receiver.
    pub fn joystick_rc(&self) -> bool {
        !self.fc_proxy && self.rc_uart.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<SitlConfig> {
        let args = SitlArgs::try_parse_from(std::iter::once("sitl").chain(argv.iter().copied()))
            .map_err(|e| SitlError::Config(e.to_string()))?;
        SitlConfig::from_args(args)
    }

    #[test]
    fn defaults() {
        let c = parse(&[]).unwrap();
        assert_eq!(c.base_port, 5760);
        assert_eq!(c.uarts, vec![1, 2]);
        assert!(c.simulator.is_none());
        assert!(c.proxy.is_none());
        assert!(c.swap34);
        assert!(c.joystick_rc());
    }

    #[test]
    fn simulator_port_defaults_per_backend() {
        let c = parse(&["--sim", "rf", "--simip", "10.0.0.2"]).unwrap();
        let sim = c.simulator.unwrap();
        assert_eq!(sim.kind, SimulatorKind::RealFlight);
        assert_eq!(sim.addr, "10.0.0.2:18083".parse().unwrap());

        let c = parse(&["--sim", "xp", "--simport", "49001"]).unwrap();
        assert_eq!(c.simulator.unwrap().addr.port(), 49001);

        let c = parse(&["--sim", "adumsim"]).unwrap();
        assert_eq!(c.simulator.unwrap().addr.port(), 5555);
    }

    #[test]
    fn serial_proxy_settings() {
        let c = parse(&[
            "--serialport", "/dev/ttyACM0", "--baudrate", "57600", "--parity", "even",
            "--stopbits", "two", "--fcproxy", "--swap34", "false",
        ])
        .unwrap();
        assert!(c.fc_proxy);
        assert!(!c.swap34);
        assert!(!c.joystick_rc());
        match c.proxy.unwrap() {
            ProxyTarget::Serial(s) => {
                assert_eq!(s.device, "/dev/ttyACM0");
                assert_eq!(s.baud, 57600);
                assert_eq!(s.parity, serialport::Parity::Even);
                assert_eq!(s.stop_bits, serialport::StopBits::Two);
            }
            other => panic!("unexpected proxy {:?}", other),
        }
    }

    #[test]
    fn invalid_combinations() {
        assert!(parse(&["--fcproxy"]).is_err());
        assert!(parse(&["--serialport", "/dev/x", "--proxytcp", "127.0.0.1:5761"]).is_err());
        assert!(parse(&["--uarts", "0,1"]).is_err());
        assert!(parse(&["--sim", "xp", "--chanmap", "M01-05"]).is_err());
        assert!(parse(&["--chanmap", "Q01-01"]).is_err());
    }

    #[test]
    fn rc_uart_must_differ_from_bridged_uart() {
        assert!(parse(&["--rcuart", "3", "--serialport", "/dev/x"]).is_err());
        assert!(parse(&["--rcuart", "2", "--serialuart", "2", "--proxytcp", "127.0.0.1:5761"]).is_err());

        let c = parse(&["--rcuart", "4", "--serialport", "/dev/x"]).unwrap();
        assert_eq!((c.rc_uart, c.proxy_uart), (Some(4), 3));
        // without a proxy target nothing is bridged
        assert!(parse(&["--rcuart", "3"]).is_ok());
    }

    #[test]
    fn uart_list_is_normalised() {
        let c = parse(&["--uarts", "3,1,3"]).unwrap();
        assert_eq!(c.uarts, vec![1, 3]);
    }
}
