//! RealFlight backend against a fake SOAP server, through the prefetch mailbox.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use sitl_bridge::fc::{FakeSensors, FcLinks, OutputBank, OutputKind, VirtualReceiver};
use sitl_bridge::sim::{OutputMapping, RealFlightBackend, SimulatorBackend, SimulatorSession};

const STATE: &str = "<?xml version='1.0'?><SOAP-ENV:Envelope><SOAP-ENV:Body>\
<ReturnData><m-aircraftState>\
<m-currentPhysicsTime-SEC>3.5</m-currentPhysicsTime-SEC>\
<m-altitudeASL-MTR>512.5</m-altitudeASL-MTR>\
<m-roll-DEG>4</m-roll-DEG>\
<m-aircraftPositionX-MTR>0</m-aircraftPositionX-MTR>\
<m-aircraftPositionY-MTR>0</m-aircraftPositionY-MTR>\
<m-batteryVoltage-VOLTS>12.3</m-batteryVoltage-VOLTS>\
<m-resetButtonHasBeenPressed>false</m-resetButtonHasBeenPressed>\
</m-aircraftState></ReturnData></SOAP-ENV:Body></SOAP-ENV:Envelope>";

#[derive(Debug, Clone)]
struct Seen {
    action: String,
    body: String,
}

/// Read one HTTP request (head plus content-length bytes).
fn read_request(stream: &mut TcpStream) -> Option<Seen> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw).into_owned();
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            continue;
        };
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length: "))
            .and_then(|v| v.trim().parse().ok())?;
        if body.len() < length {
            continue;
        }
        let action = head
            .lines()
            .find_map(|l| l.strip_prefix("soapaction: "))?
            .trim_matches('\'')
            .to_string();
        return Some(Seen { action, body: body.to_string() });
    }
}

/// Serve every connection on its own thread; the prefetcher keeps one idle.
fn fake_realflight() -> (std::net::SocketAddr, Arc<Mutex<Vec<Seen>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let log = log.clone();
            thread::spawn(move || {
                let Some(req) = read_request(&mut stream) else { return };
                let reply = if req.action == "ExchangeData" { STATE } else { "<ok/>" };
                log.lock().push(req);
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    reply.len(),
                    reply
                );
            });
        }
    });
    (addr, seen)
}

#[test]
fn connect_injects_then_exchanges_state() {
    let (addr, seen) = fake_realflight();

    let sensors = Arc::new(FakeSensors::new());
    let outputs = Arc::new(OutputBank::new());
    outputs.set(OutputKind::Motor, 0, 1750);
    let links = FcLinks {
        sensors: sensors.clone(),
        receiver: Arc::new(VirtualReceiver::new()),
        outputs,
    };
    let mut session = SimulatorSession::new(links, "M01-03".parse::<OutputMapping>().unwrap(), true);

    let mut backend = RealFlightBackend::new(addr);
    backend.connect().unwrap();
    backend.exchange(&mut session).unwrap();
    session.publish();

    let actions: Vec<String> = seen.lock().iter().map(|s| s.action.clone()).collect();
    assert_eq!(
        actions,
        ["RestoreOriginalControllerDevice", "InjectUAVControllerInterface", "ExchangeData"]
    );

    // third channel carries motor 1, unmapped channels sit at mid scale
    let body = seen.lock()[2].body.clone();
    let items: Vec<&str> = body
        .split("<item>")
        .skip(1)
        .map(|s| s.split('<').next().unwrap())
        .collect();
    assert_eq!(items.len(), 12);
    assert_eq!(items[2], "0.7500");
    assert_eq!(items[0], "0.5000");

    assert_eq!(session.state.alt_msl_m, 512.5);
    assert_eq!(session.state.roll_deg, 4.0);
    let snap = sensors.snapshot();
    assert!(snap.simulator_mode);
    assert_eq!(snap.attitude.roll_ddeg, 40);
    assert_eq!(snap.battery.voltage_cv, 1230);
    assert_eq!(snap.gps.lat_e7, 473_977_000);
    assert_eq!(snap.gps.lon_e7, 85_456_000);
}

#[test]
fn unreachable_simulator_times_out() {
    // grab a free port, then close it so nothing listens there
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let mut backend = RealFlightBackend::new(addr);
    let err = backend.connect().unwrap_err();
    assert!(err.is_timeout(), "{err}");
}
