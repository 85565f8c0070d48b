//! SNTP reference clock.
//!
//! One RFC 4330 client exchange per resync, run on a short-lived background
//! thread so [`ReferenceClock::begin_resync`] never blocks the engine. The
//! measured offset converts local wall-clock readings into server time;
//! failed exchanges keep whatever offset the last success produced.

use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use slate_clock::ReferenceClock;
use slate_core::UnixTime;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
pub const NTP_UNIX_OFFSET: u32 = 2_208_988_800;

const PACKET_LEN: usize = 48;
const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const FRAC_SCALE: f64 = 4_294_967_296.0;

#[derive(Debug, Error)]
pub enum SntpError {
    #[error("short packet ({0} bytes)")]
    ShortPacket(usize),
    #[error("not a server response (mode {0})")]
    NotAServer(u8),
    #[error("kiss-o'-death from server")]
    KissOfDeath,
    #[error("stratum {0} out of range")]
    BadStratum(u8),
    #[error("originate timestamp does not echo our request")]
    OriginateMismatch,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SntpConfig {
    /// Server in host:port form; port 123 is the conventional one.
    pub server: String,
    /// Socket read timeout for the single exchange.
    pub timeout: Duration,
}

impl SntpConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timeout: Duration::from_secs(2),
        }
    }
}

impl Default for SntpConfig {
    fn default() -> Self {
        Self::new("pool.ntp.org:123")
    }
}

/// A 64-bit NTP timestamp: seconds since 1900 plus a binary fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpTimestamp {
    pub secs: u32,
    pub frac: u32,
}

impl NtpTimestamp {
    pub fn from_unix(t: UnixTime) -> Self {
        let total = t.as_secs() + NTP_UNIX_OFFSET as f64;
        let secs = total.floor();
        let frac = ((total - secs) * FRAC_SCALE).round();
        Self {
            secs: secs as u32,
            frac: frac as u32,
        }
    }

    pub fn to_unix_secs(self) -> f64 {
        (self.secs as f64 - NTP_UNIX_OFFSET as f64) + self.frac as f64 / FRAC_SCALE
    }
}

/// The fields of a server response this client cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SntpResponse {
    pub stratum: u8,
    pub originate: NtpTimestamp,
    pub receive: NtpTimestamp,
    pub transmit: NtpTimestamp,
}

/// Outcome of one client exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SntpSample {
    /// Server time minus local time.
    pub offset_secs: f64,
    /// Round-trip delay of the exchange.
    pub delay: Duration,
}

/// Client request with the transmit timestamp set to `now`.
pub fn build_request(now: UnixTime) -> [u8; PACKET_LEN] {
    let mut packet = [0_u8; PACKET_LEN];
    // LI 0, VN 4, Mode 3.
    packet[0] = (4 << 3) | MODE_CLIENT;
    put_timestamp(&mut packet, 40, NtpTimestamp::from_unix(now));
    packet
}

/// Validate a server packet and pull out its timestamps.
pub fn parse_response(bytes: &[u8]) -> Result<SntpResponse, SntpError> {
    if bytes.len() < PACKET_LEN {
        return Err(SntpError::ShortPacket(bytes.len()));
    }
    let mode = bytes[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(SntpError::NotAServer(mode));
    }
    let stratum = bytes[1];
    if stratum == 0 {
        return Err(SntpError::KissOfDeath);
    }
    if stratum > 15 {
        return Err(SntpError::BadStratum(stratum));
    }
    Ok(SntpResponse {
        stratum,
        originate: read_timestamp(bytes, 24),
        receive: read_timestamp(bytes, 32),
        transmit: read_timestamp(bytes, 40),
    })
}

/// Textbook NTP offset and delay from the four exchange timestamps.
pub fn offset_and_delay(t1: f64, t2: f64, t3: f64, t4: f64) -> (f64, Duration) {
    let offset = ((t2 - t1) + (t3 - t4)) / 2.0;
    let delay = ((t4 - t1) - (t3 - t2)).max(0.0);
    (offset, Duration::from_secs_f64(delay))
}

/// One blocking client exchange against `server`.
pub fn query(server: &str, timeout: Duration) -> Result<SntpSample, SntpError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_read_timeout(Some(timeout))?;
    // Filters inbound traffic down to the server we asked.
    socket.connect(server)?;

    let t1 = UnixTime::now();
    socket.send(&build_request(t1))?;

    let mut buf = [0_u8; 128];
    let len = socket.recv(&mut buf)?;
    let t4 = UnixTime::now();

    let response = parse_response(&buf[..len])?;
    if response.originate != NtpTimestamp::from_unix(t1) {
        return Err(SntpError::OriginateMismatch);
    }
    let (offset_secs, delay) = offset_and_delay(
        t1.as_secs(),
        response.receive.to_unix_secs(),
        response.transmit.to_unix_secs(),
        t4.as_secs(),
    );
    Ok(SntpSample { offset_secs, delay })
}

#[derive(Debug, Default)]
struct SyncState {
    offset_secs: Option<f64>,
    last_sync: Option<UnixTime>,
    in_flight: bool,
}

/// [`ReferenceClock`] backed by SNTP exchanges.
#[derive(Debug)]
pub struct SntpClock {
    config: SntpConfig,
    shared: Arc<Mutex<SyncState>>,
    worker: Option<JoinHandle<()>>,
}

impl SntpClock {
    pub fn new(config: SntpConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Mutex::new(SyncState::default())),
            worker: None,
        }
    }

    /// The most recent measured offset, if any exchange has succeeded.
    pub fn offset_secs(&self) -> Option<f64> {
        let state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state.offset_secs
    }
}

impl Drop for SntpClock {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ReferenceClock for SntpClock {
    fn corrected(&self, local_now: UnixTime) -> Option<UnixTime> {
        let state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state
            .offset_secs
            .map(|offset| UnixTime::from_secs(local_now.as_secs() + offset))
    }

    fn last_sync_age(&self, local_now: UnixTime) -> Option<Duration> {
        let state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state.last_sync.map(|at| local_now.saturating_since(at))
    }

    fn begin_resync(&mut self, _local_now: UnixTime) {
        {
            let mut state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_flight {
                debug!("sntp resync already in flight");
                return;
            }
            state.in_flight = true;
        }
        // The previous worker has already cleared in_flight, so this join
        // only reaps an exited thread.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let shared = Arc::clone(&self.shared);
        let server = self.config.server.clone();
        let timeout = self.config.timeout;
        self.worker = Some(thread::spawn(move || {
            let result = query(&server, timeout);
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(sample) => {
                    state.offset_secs = Some(sample.offset_secs);
                    state.last_sync = Some(UnixTime::now());
                    info!(
                        offset_ms = (sample.offset_secs * 1000.0) as i64,
                        delay_ms = sample.delay.as_millis() as u64,
                        "sntp sync complete"
                    );
                }
                Err(error) => {
                    warn!(%error, "sntp sync failed, keeping previous offset");
                }
            }
            state.in_flight = false;
        }));
    }

    fn resync_in_flight(&self) -> bool {
        let state = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight
    }
}

fn put_timestamp(buf: &mut [u8], at: usize, t: NtpTimestamp) {
    buf[at..at + 4].copy_from_slice(&t.secs.to_be_bytes());
    buf[at + 4..at + 8].copy_from_slice(&t.frac.to_be_bytes());
}

fn read_timestamp(buf: &[u8], at: usize) -> NtpTimestamp {
    let mut secs = [0_u8; 4];
    let mut frac = [0_u8; 4];
    secs.copy_from_slice(&buf[at..at + 4]);
    frac.copy_from_slice(&buf[at + 4..at + 8]);
    NtpTimestamp {
        secs: u32::from_be_bytes(secs),
        frac: u32::from_be_bytes(frac),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use slate_clock::ReferenceClock;
    use slate_core::UnixTime;

    use super::{
        build_request, offset_and_delay, parse_response, put_timestamp, NtpTimestamp,
        SntpClock, SntpConfig, SntpError, MODE_SERVER, NTP_UNIX_OFFSET, PACKET_LEN,
    };

    #[test]
    fn request_sets_version_mode_and_transmit() {
        let now = UnixTime::from_secs(1_700_000_000.125);
        let packet = build_request(now);
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(packet[0], 0x23);
        // Header and reference fields stay zero.
        assert!(packet[1..40].iter().all(|b| *b == 0));

        let want = NtpTimestamp::from_unix(now);
        assert_eq!(&packet[40..44], &want.secs.to_be_bytes());
        assert_eq!(&packet[44..48], &want.frac.to_be_bytes());
    }

    #[test]
    fn timestamp_conversion_round_trips() {
        for secs in [0.0, 0.5, 1_700_000_000.128, 1_234_567.000001] {
            let t = NtpTimestamp::from_unix(UnixTime::from_secs(secs));
            assert!(
                (t.to_unix_secs() - secs).abs() < 1e-9,
                "round trip of {secs}"
            );
        }
        let epoch = NtpTimestamp::from_unix(UnixTime::from_secs(0.0));
        assert_eq!(epoch.secs, NTP_UNIX_OFFSET);
        assert_eq!(epoch.frac, 0);
    }

    #[test]
    fn parse_rejects_bad_packets() {
        assert!(matches!(
            parse_response(&[0_u8; 20]),
            Err(SntpError::ShortPacket(20))
        ));

        let mut client_mode = [0_u8; PACKET_LEN];
        client_mode[0] = 0x23;
        assert!(matches!(
            parse_response(&client_mode),
            Err(SntpError::NotAServer(3))
        ));

        let mut kod = [0_u8; PACKET_LEN];
        kod[0] = (4 << 3) | MODE_SERVER;
        assert!(matches!(parse_response(&kod), Err(SntpError::KissOfDeath)));

        let mut bad_stratum = kod;
        bad_stratum[1] = 16;
        assert!(matches!(
            parse_response(&bad_stratum),
            Err(SntpError::BadStratum(16))
        ));

        let mut good = kod;
        good[1] = 2;
        let response = parse_response(&good).expect("valid packet should parse");
        assert_eq!(response.stratum, 2);
    }

    #[test]
    fn offset_math_matches_the_reference_formula() {
        let (offset, delay) = offset_and_delay(100.0, 105.4, 105.6, 101.0);
        assert!((offset - 5.0).abs() < 1e-9);
        assert!((delay.as_secs_f64() - 0.8).abs() < 1e-9);

        // Symmetric exchange with no skew.
        let (offset, delay) = offset_and_delay(10.0, 10.1, 10.1, 10.2);
        assert!(offset.abs() < 1e-9);
        assert!((delay.as_secs_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn syncs_against_a_local_server() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").expect("server bind");
        let server_addr = server.local_addr().expect("server addr");
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("server timeout");

        // A server living 5 s in our future.
        let responder = std::thread::spawn(move || {
            let mut buf = [0_u8; 128];
            let (len, from) = server.recv_from(&mut buf).expect("request should arrive");
            assert!(len >= PACKET_LEN);

            let mut response = [0_u8; PACKET_LEN];
            response[0] = (4 << 3) | MODE_SERVER;
            response[1] = 2;
            response[24..32].copy_from_slice(&buf[40..48]);
            let skewed = UnixTime::from_secs(UnixTime::now().as_secs() + 5.0);
            let stamp = NtpTimestamp::from_unix(skewed);
            put_timestamp(&mut response, 32, stamp);
            put_timestamp(&mut response, 40, stamp);
            server
                .send_to(&response, from)
                .expect("response should send");
        });

        let mut clock = SntpClock::new(SntpConfig {
            server: server_addr.to_string(),
            timeout: Duration::from_secs(2),
        });
        assert!(clock.needs_resync(UnixTime::now()));
        clock.begin_resync(UnixTime::now());

        let deadline = Instant::now() + Duration::from_secs(3);
        while clock.resync_in_flight() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        responder.join().expect("responder should finish");

        let now = UnixTime::now();
        let corrected = clock.corrected(now).expect("sync should have landed");
        let measured = corrected.as_secs() - now.as_secs();
        assert!(
            (measured - 5.0).abs() < 0.5,
            "measured offset {measured}"
        );
        assert!(!clock.needs_resync(now));
        assert!(clock.offset_secs().is_some());
    }

    #[test]
    fn failed_exchange_keeps_previous_state() {
        // A bound socket that never answers.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
        let addr = silent.local_addr().expect("addr");

        let mut clock = SntpClock::new(SntpConfig {
            server: addr.to_string(),
            timeout: Duration::from_millis(100),
        });
        clock.begin_resync(UnixTime::now());

        let deadline = Instant::now() + Duration::from_secs(2);
        while clock.resync_in_flight() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(clock.corrected(UnixTime::now()).is_none());
        assert!(clock.needs_resync(UnixTime::now()));
    }
}
