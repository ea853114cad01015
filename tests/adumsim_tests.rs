//! Adumsim backend against a fake line-protocol server.

use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use sitl_bridge::fc::{FakeSensors, FcLinks, OutputBank, VirtualReceiver};
use sitl_bridge::sim::{AdumsimBackend, OutputMapping, SimulatorBackend, SimulatorSession};

/// Answer every output line with `<n>;47;8;100`, `n` counting requests.
/// The first reply is held back for `first_delay`.
fn fake_adumsim(first_delay: Duration) -> (SocketAddr, Arc<AtomicU64>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicU64::new(0));
    let count = requests.clone();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        for line in BufReader::new(stream).lines() {
            if line.is_err() {
                return;
            }
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                thread::sleep(first_delay);
            }
            if writeln!(writer, "{};47;8;100", n).is_err() {
                return;
            }
        }
    });
    (addr, requests)
}

fn session() -> SimulatorSession {
    let links = FcLinks {
        sensors: Arc::new(FakeSensors::new()),
        receiver: Arc::new(VirtualReceiver::new()),
        outputs: Arc::new(OutputBank::new()),
    };
    SimulatorSession::new(links, OutputMapping::default(), true)
}

#[test]
fn replies_track_requests() {
    let (addr, requests) = fake_adumsim(Duration::ZERO);
    let mut backend = AdumsimBackend::new(addr);
    let mut session = session();
    backend.connect().unwrap();

    for tick in 1..=5 {
        backend.exchange(&mut session).unwrap();
        assert_eq!(session.state.sim_time_s, tick as f64);
        assert_eq!(requests.load(Ordering::SeqCst), tick);
    }
    assert!(session.state.position_valid);
    assert_eq!(session.state.alt_msl_m, 100.0);
}

#[test]
fn late_reply_does_not_lag_later_ticks() {
    let (addr, requests) = fake_adumsim(Duration::from_millis(1300));
    let mut backend = AdumsimBackend::new(addr);
    let mut session = session();
    backend.connect().unwrap();

    let err = backend.exchange(&mut session).unwrap_err();
    assert!(err.is_timeout(), "{err}");

    for _ in 2..=5 {
        backend.exchange(&mut session).unwrap();
        let sent = requests.load(Ordering::SeqCst);
        assert_eq!(session.state.sim_time_s, sent as f64);
    }
    // the held tick is skipped, not resent
    assert_eq!(requests.load(Ordering::SeqCst), 4);
}
