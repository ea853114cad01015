//! realflight.rs
//! RealFlight Link client: SOAP-over-HTTP, one TCP connection per request.
//!
//! Connections are opened ahead of time by a prefetch thread so the exchange
//! loop only pays for the request/response round trip.

use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, info, warn};

use super::geo::{self, GeoPoint};
use super::{SimulatorBackend, SimulatorSession, mps2_to_g};
use crate::error::{Result, SitlError};
use crate::sync::{MailboxConsumer, mailbox, spawn_prefetcher};

pub const DEFAULT_PORT: u16 = 18083;
/// RealFlight exposes twelve controller channels.
pub const CHANNELS: usize = 12;
/// Bit mask selecting all twelve channels.
const SELECTED_CHANNELS: u32 = 4095;
/// Local position origin; RealFlight only reports offsets from its airport.
pub const ORIGIN: GeoPoint = GeoPoint::new(47.3977, 8.5456);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PREFETCH_BACKOFF: Duration = Duration::from_millis(200);
const MAX_RESPONSE: usize = 64 * 1024;

// ============================================================================
// SOAP envelope
// ============================================================================

pub fn soap_envelope(action: &str, body: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='UTF-8'?>\
<soap:Envelope xmlns:soap='http://schemas.xmlsoap.org/soap/envelope/' \
xmlns:xsd='http://www.w3.org/2001/XMLSchema' \
xmlns:xsi='http://www.w3.org/2001/XMLSchema-instance'>\
<soap:Body><{action}>{body}</{action}></soap:Body></soap:Envelope>"
    )
}

pub fn http_request(action: &str, body: &str) -> String {
    let xml = soap_envelope(action, body);
    format!(
        "POST / HTTP/1.1\r\n\
soapaction: '{action}'\r\n\
content-length: {}\r\n\
content-type: text/xml;charset='UTF-8'\r\n\
Connection: Keep-Alive\r\n\
\r\n\
{xml}",
        xml.len()
    )
}

/// `ExchangeData` body carrying channel values on a 0..1 scale.
pub fn exchange_body(values: &[f32]) -> String {
    let mut items = String::with_capacity(values.len() * 24);
    for v in values {
        items.push_str(&format!("<item>{:.4}</item>", v.clamp(0.0, 1.0)));
    }
    format!(
        "<pControlInputs><m-selectedChannels>{}</m-selectedChannels>\
<m-channelValues-0to1>{}</m-channelValues-0to1></pControlInputs>",
        SELECTED_CHANNELS, items
    )
}

/// Text between `<name>` and the next `<`.
pub fn xml_field<'a>(doc: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let start = doc.find(&open)? + open.len();
    let rest = &doc[start..];
    let end = rest.find('<')?;
    Some(rest[..end].trim())
}

pub fn xml_number(doc: &str, name: &str) -> Option<f64> {
    xml_field(doc, name)?.parse().ok()
}

pub fn xml_bool(doc: &str, name: &str) -> Option<bool> {
    match xml_field(doc, name)? {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Body of an HTTP response once `content-length` bytes have arrived.
///
/// `Ok(None)` means keep reading. A declared length beyond
/// `MAX_RESPONSE` is refused before any of it is awaited.
fn response_body(raw: &[u8]) -> Result<Option<&[u8]>> {
    let Some(head_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let head_end = head_end + 4;
    let Ok(head) = std::str::from_utf8(&raw[..head_end]) else {
        return Ok(None);
    };
    let Some(length) = head.lines().find_map(|l| {
        let (k, v) = l.split_once(':')?;
        if k.trim().eq_ignore_ascii_case("content-length") {
            v.trim().parse::<usize>().ok()
        } else {
            None
        }
    }) else {
        return Ok(None);
    };
    match head_end.checked_add(length) {
        Some(end) if end <= MAX_RESPONSE => Ok(raw.get(head_end..end)),
        _ => Err(SitlError::Protocol(format!("content-length {} too large", length))),
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct RealFlightBackend {
    addr: SocketAddr,
    origin: GeoPoint,
    connections: Option<MailboxConsumer<TcpStream>>,
    prefetcher: Option<JoinHandle<()>>,
    inject_pending: bool,
    last_physics_time: Option<f64>,
}

impl RealFlightBackend {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            origin: ORIGIN,
            connections: None,
            prefetcher: None,
            inject_pending: true,
            last_physics_time: None,
        }
    }

    pub fn with_origin(mut self, origin: GeoPoint) -> Self {
        self.origin = origin;
        self
    }

    fn ensure_prefetcher(&mut self) -> Result<()> {
        let alive = self.prefetcher.as_ref().is_some_and(|h| !h.is_finished());
        if alive && self.connections.is_some() {
            return Ok(());
        }
        let (producer, consumer) = mailbox();
        let addr = self.addr;
        let handle = spawn_prefetcher(
            "rf-prefetch",
            producer,
            move || {
                let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|source| {
                    SitlError::Connect {
                        target: addr.to_string(),
                        source,
                    }
                })?;
                stream.set_nodelay(true)?;
                Ok(stream)
            },
            PREFETCH_BACKOFF,
        )?;
        self.connections = Some(consumer);
        self.prefetcher = Some(handle);
        Ok(())
    }

    /// One action on one prefetched connection; returns the response body.
    fn request(&mut self, action: &str, body: &str) -> Result<String> {
        let consumer = self.connections.as_ref().ok_or(SitlError::Disconnected)?;
        let mut stream = consumer.take_timeout(REQUEST_TIMEOUT)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;
        stream.write_all(http_request(action, body).as_bytes())?;

        let mut raw = Vec::with_capacity(4096);
        let mut buf = [0u8; 4096];
        loop {
            if let Some(body) = response_body(&raw)? {
                return Ok(String::from_utf8_lossy(body).into_owned());
            }
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    raw.extend_from_slice(&buf[..n]);
                    if raw.len() > MAX_RESPONSE {
                        return Err(SitlError::Protocol(format!("{} response too large", action)));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // closed without a usable content-length
        let text = String::from_utf8_lossy(&raw);
        match text.split_once("\r\n\r\n") {
            Some((_, body)) if !body.is_empty() => Ok(body.to_string()),
            _ => Err(SitlError::Disconnected),
        }
    }

    fn inject_controller(&mut self) -> Result<()> {
        self.request("RestoreOriginalControllerDevice", "<a>1</a><b>2</b>")?;
        self.request("InjectUAVControllerInterface", "<a>1</a><b>2</b>")?;
        self.inject_pending = false;
        info!("[RealFlight] controller interface injected");
        Ok(())
    }

    /// Decode an `ExchangeData` response into the session. Missing fields keep their values.
    pub fn apply_response(&mut self, doc: &str, session: &mut SimulatorSession) {
        let s = &mut session.state;
        let f = |name: &str| xml_number(doc, name);

        if let Some(t) = f("m-currentPhysicsTime-SEC") {
            if let (Some(prev), Some(amps)) = (self.last_physics_time, f("m-batteryCurrentDraw-AMPS")) {
                let dt = t - prev;
                if dt > 0.0 && dt < 1.0 {
                    s.consumed_mah += (amps * dt / 3.6) as f32;
                }
            }
            self.last_physics_time = Some(t);
            s.sim_time_s = t;
        }

        if let Some(alt) = f("m-altitudeASL-MTR") {
            s.alt_msl_m = alt;
        }
        if let Some(agl) = f("m-altitudeAGL-MTR") {
            s.agl_m = Some(agl);
        }
        if let Some(v) = f("m-airspeed-MPS") {
            s.airspeed_ms = v as f32;
        }
        if let (Some(p), Some(q), Some(r)) = (
            f("m-rollRate-DEGpSEC"),
            f("m-pitchRate-DEGpSEC"),
            f("m-yawRate-DEGpSEC"),
        ) {
            s.rate_dps = [p as f32, q as f32, r as f32];
        }
        if let Some(v) = f("m-roll-DEG") {
            s.roll_deg = v as f32;
        }
        if let Some(v) = f("m-inclination-DEG") {
            s.pitch_deg = v as f32;
        }
        if let Some(v) = f("m-azimuth-DEG") {
            s.yaw_deg = v as f32;
        }
        if let (Some(ax), Some(ay), Some(az)) = (
            f("m-accelerationBodyAX-MPS2"),
            f("m-accelerationBodyAY-MPS2"),
            f("m-accelerationBodyAZ-MPS2"),
        ) {
            s.accel_g = [
                -mps2_to_g(ax as f32),
                -mps2_to_g(ay as f32),
                -mps2_to_g(az as f32),
            ];
        }
        if let (Some(u), Some(v), Some(w)) = (
            f("m-velocityWorldU-MPS"),
            f("m-velocityWorldV-MPS"),
            f("m-velocityWorldW-MPS"),
        ) {
            s.vel_ned_ms = [u as f32, v as f32, w as f32];
        }
        if let (Some(east), Some(north)) = (f("m-aircraftPositionX-MTR"), f("m-aircraftPositionY-MTR")) {
            let p = geo::offset(self.origin, north, east);
            s.lat_deg = p.lat_deg;
            s.lon_deg = p.lon_deg;
            s.position_valid = true;
        }
        if let Some(v) = f("m-batteryVoltage-VOLTS") {
            s.battery_v = Some(v as f32);
        }
        if let Some(a) = f("m-batteryCurrentDraw-AMPS") {
            s.battery_a = a as f32;
        }

        if xml_bool(doc, "m-resetButtonHasBeenPressed") == Some(true) {
            info!("[RealFlight] reset pressed, re-injecting controller");
            self.inject_pending = true;
        }
    }
}

impl SimulatorBackend for RealFlightBackend {
    fn name(&self) -> &'static str {
        "RealFlight"
    }

    fn connect(&mut self) -> Result<()> {
        self.ensure_prefetcher()?;
        self.inject_controller()
    }

    fn exchange(&mut self, session: &mut SimulatorSession) -> Result<()> {
        if self.inject_pending {
            self.inject_controller()?;
        }
        let body = exchange_body(&session.actuators_unit(CHANNELS));
        let doc = self.request("ExchangeData", &body)?;
        if !doc.contains("ReturnData") {
            warn!("[RealFlight] unexpected ExchangeData response ({} bytes)", doc.len());
            debug!("[RealFlight] {}", doc);
        }
        self.apply_response(&doc, session);
        Ok(())
    }
}
