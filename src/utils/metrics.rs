//! Exchange metrics and per-tick trace recording.
//!
//! Two independent paths:
//! - **Metrics:** shared buffer of exchange and connect latencies (bounded to
//!   1000 points each) plus fault counters, summarised by the main loop.
//! - **TraceRecorder:** lock-free queue of per-tick sensor rows drained to CSV
//!   by a background thread.

use std::{
    collections::VecDeque,
    fs::File,
    io::BufWriter,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_queue::ArrayQueue;
use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;

pub const MAX_POINTS: usize = 1_000;

const TRACE_QUEUE_CAPACITY: usize = 16_384;
const EXPORT_POLL_MS: u64 = 10;
const FLUSH_EVERY: u64 = 256;

/// Faults the exchange loop can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeFault {
    /// No reply within the per-request timeout; last values kept.
    Timeout,
    /// Hard error; the loop reconnected.
    Reconnect,
    /// Hard error; the loop gave up.
    Fatal,
}

#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub backend: Option<&'static str>,

    /// Round trip per completed exchange (microseconds)
    pub exchange_us: VecDeque<u64>,
    /// Time from first connect attempt to a usable session (microseconds)
    pub connect_us: VecDeque<u64>,

    pub ticks: u64,
    pub timeouts: u64,
    pub reconnects: u64,
    pub fatal: u64,

    /// Control steps the main loop ran after acquiring the gate
    pub control_steps: u64,
}

impl Metrics {
    pub fn record_exchange(&mut self, rtt_us: u64) {
        self.ticks += 1;
        push_capped_u64(&mut self.exchange_us, rtt_us);
    }

    pub fn record_connect(&mut self, elapsed_us: u64) {
        push_capped_u64(&mut self.connect_us, elapsed_us);
    }

    pub fn record_fault(&mut self, fault: ExchangeFault) {
        match fault {
            ExchangeFault::Timeout => self.timeouts += 1,
            ExchangeFault::Reconnect => self.reconnects += 1,
            ExchangeFault::Fatal => self.fatal += 1,
        }
    }

    /// One-line summary for the periodic log.
    pub fn summary(&self) -> String {
        let rtt = match calculate_stats_u64(&self.exchange_us) {
            Some(s) => format!("rtt min/mean/max {:.0}/{:.0}/{:.0} us", s.min, s.mean, s.max),
            None => "rtt n/a".to_string(),
        };
        format!(
            "{} ticks={} steps={} timeouts={} reconnects={} {}",
            self.backend.unwrap_or("none"),
            self.ticks,
            self.control_steps,
            self.timeouts,
            self.reconnects,
            rtt
        )
    }
}

pub type SharedMetrics = Arc<Mutex<Metrics>>;

/// Appends u64 value to metrics buffer; removes oldest if at capacity.
#[inline]
pub fn push_capped_u64(buf: &mut VecDeque<u64>, val: u64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Statistics summary for a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

/// Computes min, max, mean for u64 buffer (cast to f64).
pub fn calculate_stats_u64(data: &VecDeque<u64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().map(|&x| x as f64).fold(f64::INFINITY, f64::min);
    let max = data.iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().map(|&x| x as f64).sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}

// ============================================================================
// Trace export
// ============================================================================

/// One exchange tick as written to the trace CSV.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceRow {
    pub tick: u64,
    pub ts_us: u64,
    pub rtt_us: u64,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: f64,
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub acc_x: f32,
    pub acc_y: f32,
    pub acc_z: f32,
    pub airspeed_ms: f32,
    pub baro_pa: f64,
    pub out_1: f32,
    pub out_2: f32,
    pub out_3: f32,
    pub out_4: f32,
}

/// Non-blocking trace recorder with a background CSV writer.
///
/// `record` never blocks the exchange loop; rows are dropped (and counted)
/// when the queue is full.
#[derive(Clone)]
pub struct TraceRecorder {
    queue: Arc<ArrayQueue<TraceRow>>,
    dropped: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    run_start: Instant,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(TRACE_QUEUE_CAPACITY)),
            dropped: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
            run_start: Instant::now(),
        }
    }

    #[inline]
    pub fn record(&self, row: TraceRow) {
        if self.queue.push(row).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Microseconds since the recorder was created.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.run_start.elapsed().as_micros() as u64
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the writer to drain what is queued and exit.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Spawn the thread draining the queue into `output_csv`.
    pub fn start_exporter(&self, output_csv: String) -> std::io::Result<JoinHandle<()>> {
        let queue = self.queue.clone();
        let finished = self.finished.clone();

        thread::Builder::new().name("trace-export".into()).spawn(move || {
            let file = match File::create(&output_csv) {
                Ok(f) => f,
                Err(e) => {
                    error!("[Trace] failed to create {}: {}", output_csv, e);
                    return;
                }
            };
            let mut writer = csv::Writer::from_writer(BufWriter::new(file));
            let mut written: u64 = 0;
            let mut unflushed = false;

            loop {
                match queue.pop() {
                    Some(row) => {
                        if let Err(e) = writer.serialize(&row) {
                            error!("[Trace] write failed: {}", e);
                            break;
                        }
                        written += 1;
                        unflushed = true;
                        if written % FLUSH_EVERY == 0 {
                            let _ = writer.flush();
                            unflushed = false;
                        }
                    }
                    None => {
                        // an idle queue means the file is current; the process may exit at any time
                        if unflushed {
                            let _ = writer.flush();
                            unflushed = false;
                        }
                        if finished.load(Ordering::Acquire) && queue.is_empty() {
                            break;
                        }
                        thread::sleep(Duration::from_millis(EXPORT_POLL_MS));
                    }
                }
            }

            let _ = writer.flush();
            info!("[Trace] {} rows written to {}", written, output_csv);
        })
    }
}
