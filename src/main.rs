//! # SITL Bridge Entry Point
//!
//! Wires the virtual peripherals, the MSP proxy and one simulator backend
//! around a stand-in control loop.
//!
//! ## Threads
//! - **UART workers (1 per port):** accept one TCP client, fill the port's ring.
//! - **MSP proxy:** polls a real flight controller for RC/RSSI, or bridges a UART to it.
//! - **Simulator exchange:** one round trip per tick, releases the tick gate.
//! - **RealFlight prefetch:** keeps one fresh connection ready.
//! - **Main:** 1 ms control loop; steps only when the gate can be taken
//!   (free-runs on wall-clock time when no simulator is configured).
//!
//! Shutdown is abrupt: the process exits, nothing is drained.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use clap::Parser;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use spin_sleep::{SpinSleeper, SpinStrategy};

use sitl_bridge::{
    config::{ProxyTarget, SimulatorKind, SitlArgs, SitlConfig},
    error::Result,
    fc::{FakeSensors, FcLinks, OutputBank, VirtualReceiver, rc_passthrough},
    msp::{
        MspProxy, ProxyLink, SerialDeviceLink, TcpPeerLink, UartBridge, attach_rc_source,
        spawn_fc_poller, spawn_uart_bridge,
    },
    serial::{PortMode, PortOptions, PortRegistry, VirtualSerialPort},
    sim::{
        AdumsimBackend, RealFlightBackend, SimulatorBackend, SimulatorSession, XPlaneBackend,
        spawn_exchange_loop, ExchangeContext,
    },
    sync::SimGate,
    utils::metrics::{Metrics, SharedMetrics, TraceRecorder},
};

const UART_BAUD: u32 = 115_200;
const CONTROL_PERIOD: Duration = Duration::from_millis(1);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

type Ports = BTreeMap<u8, Arc<VirtualSerialPort>>;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SitlConfig::from_args(SitlArgs::parse()) {
        Ok(c) => c,
        Err(e) => {
            error!("[Main] {}", e);
            std::process::exit(2);
        }
    };
    info!("=== SITL START ===");
    debug!("[Main] {:?}", config);

    let sensors = Arc::new(FakeSensors::new());
    let receiver = Arc::new(VirtualReceiver::new());
    let outputs = Arc::new(OutputBank::new());

    let registry = PortRegistry::new(config.base_port);
    if let Some(sim) = &config.simulator {
        if sim.addr.ip().is_loopback() {
            // a UART must not shadow a simulator listening on this host
            let _ = registry.reserve(sim.addr.port());
        }
    }
    let ports = open_uarts(&registry, &config);

    let bridge = match start_proxy(&config, &ports, receiver.clone()) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("[Main] MSP proxy disabled: {}", e);
            None
        }
    };

    let gate = SimGate::new();
    let metrics: SharedMetrics = Arc::new(Mutex::new(Metrics::default()));
    let trace = start_trace(&config);

    let links = FcLinks {
        sensors: sensors.clone(),
        receiver: receiver.clone(),
        outputs: outputs.clone(),
    };
    let sim_handle = start_simulator(&config, links, gate.clone(), metrics.clone(), trace);

    let reporter = Reporter {
        metrics: &metrics,
        receiver: &receiver,
        ports: &ports,
        bridge: bridge.as_ref(),
    };
    run_control_loop(&gate, sim_handle, &receiver, &outputs, &reporter);
}

/// Open every UART the configuration needs. Failures are logged and skipped.
fn open_uarts(registry: &PortRegistry, config: &SitlConfig) -> Ports {
    let mut wanted: BTreeSet<u8> = config.uarts.iter().copied().collect();
    if let Some(uart) = config.rc_uart {
        wanted.insert(uart);
    }
    if config.proxy.is_some() && !config.fc_proxy {
        wanted.insert(config.proxy_uart);
    }

    wanted
        .into_iter()
        .filter_map(|uart| {
            VirtualSerialPort::open(registry, uart, UART_BAUD, PortMode::RxTx, PortOptions::default())
                .map(|p| (uart, p))
        })
        .collect()
}

fn open_link(target: &ProxyTarget) -> Result<Box<dyn ProxyLink>> {
    Ok(match target {
        ProxyTarget::Serial(settings) => Box::new(SerialDeviceLink::open(settings.clone())?),
        ProxyTarget::Tcp(addr) => Box::new(TcpPeerLink::connect(*addr)?),
    })
}

/// Start the RC source and the proxy. Returns the UART bridge when one runs.
fn start_proxy(
    config: &SitlConfig,
    ports: &Ports,
    receiver: Arc<VirtualReceiver>,
) -> Result<Option<UartBridge>> {
    if let Some(uart) = config.rc_uart {
        match ports.get(&uart) {
            Some(port) => {
                attach_rc_source(port, MspProxy::new(receiver.clone(), config.swap34));
            }
            None => warn!("[Main] RC UART{} is not open", uart),
        }
    }

    let Some(target) = &config.proxy else {
        return Ok(None);
    };
    let link = open_link(target)?;

    if config.fc_proxy {
        let proxy = MspProxy::new(receiver, config.swap34);
        spawn_fc_poller(link, proxy, config.proxy_period)?;
        info!("[Main] RC input proxied from {:?}", target);
        return Ok(None);
    }
    match ports.get(&config.proxy_uart) {
        Some(port) => Ok(Some(spawn_uart_bridge(port.clone(), link)?)),
        None => {
            warn!("[Main] proxy UART{} is not open", config.proxy_uart);
            Ok(None)
        }
    }
}

fn start_trace(config: &SitlConfig) -> Option<TraceRecorder> {
    let path = config.trace.as_ref()?;
    let recorder = TraceRecorder::new();
    match recorder.start_exporter(path.to_string_lossy().into_owned()) {
        Ok(_) => {
            info!("[Main] tracing exchanges to {}", path.display());
            Some(recorder)
        }
        Err(e) => {
            error!("[Main] trace export disabled: {}", e);
            None
        }
    }
}

fn start_simulator(
    config: &SitlConfig,
    links: FcLinks,
    gate: SimGate,
    metrics: SharedMetrics,
    trace: Option<TraceRecorder>,
) -> Option<JoinHandle<()>> {
    let sim = config.simulator.as_ref()?;
    let backend: Box<dyn SimulatorBackend> = match sim.kind {
        SimulatorKind::XPlane => Box::new(XPlaneBackend::new(sim.addr)),
        SimulatorKind::RealFlight => Box::new(RealFlightBackend::new(sim.addr)),
        SimulatorKind::Adumsim => Box::new(AdumsimBackend::new(sim.addr)),
    };
    let session = SimulatorSession::new(links, config.mapping.clone(), sim.use_imu)
        .with_joystick_rc(config.joystick_rc());
    info!(
        "[Main] simulator {} at {} (mapping '{}', {} IMU)",
        backend.name(),
        sim.addr,
        config.mapping,
        if sim.use_imu { "simulator" } else { "synthesised" }
    );

    let ctx = ExchangeContext {
        gate,
        metrics,
        trace,
    };
    match spawn_exchange_loop(backend, session, ctx) {
        Ok(h) => Some(h),
        Err(e) => {
            error!("[Main] failed to spawn simulator exchange loop: {}", e);
            None
        }
    }
}

/// Pace control steps to simulator ticks, or to wall-clock time without one.
fn run_control_loop(
    gate: &SimGate,
    mut sim_handle: Option<JoinHandle<()>>,
    receiver: &VirtualReceiver,
    outputs: &OutputBank,
    reporter: &Reporter<'_>,
) -> ! {
    let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
    let mut next_tick = Instant::now() + CONTROL_PERIOD;
    let mut next_summary = Instant::now() + SUMMARY_INTERVAL;

    loop {
        let now = Instant::now();
        if now < next_tick {
            sleeper.sleep(next_tick - now);
        }
        next_tick += CONTROL_PERIOD;
        if next_tick < Instant::now() {
            next_tick = Instant::now() + CONTROL_PERIOD;
        }

        if sim_handle.as_ref().is_some_and(|h| h.is_finished()) {
            warn!("[Main] simulator exchange stopped, continuing on wall-clock time");
            sim_handle = None;
        }

        let step = sim_handle.is_none() || gate.try_acquire();
        if step {
            rc_passthrough(receiver, outputs);
            reporter.metrics.lock().control_steps += 1;
        }

        if Instant::now() >= next_summary {
            next_summary += SUMMARY_INTERVAL;
            reporter.log_summary();
        }
    }
}

/// What the periodic summary reports on.
struct Reporter<'a> {
    metrics: &'a SharedMetrics,
    receiver: &'a VirtualReceiver,
    ports: &'a Ports,
    bridge: Option<&'a UartBridge>,
}

impl Reporter<'_> {
    fn log_summary(&self) {
        info!("[Main] {}", self.metrics.lock().summary());
        let rc_age = self
            .receiver
            .age()
            .map_or_else(|| "never".to_string(), |a| format!("{:?} ago", a));
        info!(
            "[Main] RC frames={} last={} rssi={}",
            self.receiver.frame_count(),
            rc_age,
            self.receiver.rssi()
        );
        for (uart, port) in self.ports {
            let dropped = port.rx_dropped();
            if dropped > 0 {
                warn!("[UART{}] {} bytes dropped on full ring", uart, dropped);
            }
        }
        if let Some(bridge) = self.bridge {
            if bridge.is_finished() {
                warn!("[Main] MSP UART bridge stopped");
            }
            let dropped = bridge.dropped();
            if dropped > 0 {
                warn!("[Main] {} bytes dropped on full bridge queue", dropped);
            }
        }
    }
}
