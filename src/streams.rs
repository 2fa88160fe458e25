//! Test-connection streams: TEST_PREPARE parameter parsing and the
//! multi-stream download/upload engine.
//!
//! The engine is split in two steps so the protocol can interleave control
//! messages between them: `connect_streams` opens every test connection and
//! suspends, handing back a resume closure; invoking the closure starts the
//! actual transfer and reports the locally measured speed when it ends.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::report::Entry;
use crate::transport::{Transport, DEFAULT_TIMEOUT};
use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const UPLOAD_CHUNK: usize = 8192;
const MIN_SNAPS_DELAY_MS: u64 = 250;
const DEFAULT_SNAPS_DELAY_MS: u64 = 500;
const DEFAULT_DURATION_MS: u64 = 10_000;
const MAX_DURATION_MS: u64 = 60_000;
const MAX_STREAMS: usize = 8;

/// Transfer parameters decoded from a TEST_PREPARE payload.
///
/// The payload is a whitespace-separated token list; only the positions we
/// understand are interpreted, the rest are ignored:
/// `<port> <duration-ms> _ <snaps-delay-ms> _ <num-streams>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Params {
    pub port: u16,
    pub duration: Duration,
    pub snaps_delay: Duration,
    pub num_streams: usize,
}

impl Params {
    pub fn parse(payload: &str) -> Result<Params> {
        let tokens: Vec<&str> = payload.split_whitespace().collect();
        let port = tokens
            .first()
            .and_then(|raw| raw.parse::<u16>().ok())
            .filter(|&p| p != 0)
            .ok_or(Error::InvalidPort)?;
        let duration_ms = match tokens.get(1) {
            None => DEFAULT_DURATION_MS,
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|&ms| ms <= MAX_DURATION_MS)
                .ok_or(Error::InvalidDuration)?,
        };
        let snaps_ms = match tokens.get(3) {
            None => DEFAULT_SNAPS_DELAY_MS,
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|&ms| ms >= MIN_SNAPS_DELAY_MS)
                .ok_or(Error::InvalidSnapsDelay)?,
        };
        let num_streams = match tokens.get(5) {
            None => 1,
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|&n| (1..=MAX_STREAMS).contains(&n))
                .ok_or(Error::InvalidNumStreams)?,
        };
        Ok(Params {
            port,
            duration: Duration::from_millis(duration_ms),
            snaps_delay: Duration::from_millis(snaps_ms),
            num_streams,
        })
    }

    /// Fresh per-invocation report record seeded with these parameters.
    pub fn to_record(&self) -> Entry {
        let mut record = Entry::new();
        record.set_nested("params", "port", self.port);
        record.set_nested("params", "duration_ms", self.duration.as_millis() as u64);
        record.set_nested("params", "snaps_delay_ms", self.snaps_delay.as_millis() as u64);
        record.set_nested("params", "num_streams", self.num_streams as u64);
        record
    }
}

/// Aggregate byte counter with a fixed origin.
pub(crate) struct SpeedMeter {
    start: Instant,
    total: u64,
}

impl SpeedMeter {
    pub fn new(start: Instant) -> Self {
        SpeedMeter { start, total: 0 }
    }

    pub fn add(&mut self, bytes: u64) {
        self.total += bytes;
    }

    /// Restarts the measurement window at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.start = now;
        self.total = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Average speed in kbit/s from the origin to `now`.
    pub fn speed_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.total as f64) * 8.0 / 1000.0 / elapsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Download,
    Upload,
}

/// Callback receiving the locally measured speed (kbit/s) once every stream
/// has ended.
pub(crate) type StreamsDone = Box<dyn FnOnce(Result<f64>)>;

/// Suspended transfer: invoking it starts moving data.
pub(crate) type StreamsResume = Box<dyn FnOnce(StreamsDone)>;

struct ConnectState {
    pending: usize,
    txps: Vec<Transport>,
    failed: Option<Error>,
    cb: Option<Box<dyn FnOnce(Result<StreamsResume>)>>,
}

/// Opens `params.num_streams` connections to the test port. All-or-nothing:
/// a single failed connect closes the others and fails the whole step. Each
/// stream's connect time lands in `record`, and on success `cb` receives the
/// resume closure.
pub(crate) fn connect_streams<F>(
    ctx: &Ctx,
    direction: Direction,
    params: Params,
    record: Rc<RefCell<Entry>>,
    cb: F,
) where
    F: FnOnce(Result<StreamsResume>) + 'static,
{
    let (reactor, address) = {
        let c = ctx.borrow();
        (c.reactor.clone(), c.address.clone())
    };
    let state = Rc::new(RefCell::new(ConnectState {
        pending: params.num_streams,
        txps: Vec::new(),
        failed: None,
        cb: Some(Box::new(cb)),
    }));
    let started = Instant::now();
    for _ in 0..params.num_streams {
        let state = Rc::clone(&state);
        let record = Rc::clone(&record);
        let resume_reactor = reactor.clone();
        Transport::connect(&reactor, &address, params.port, DEFAULT_TIMEOUT, move |res| {
            let finished = {
                let mut s = state.borrow_mut();
                s.pending -= 1;
                match res {
                    Ok(txp) => {
                        record
                            .borrow_mut()
                            .push("connect_times", json!(started.elapsed().as_secs_f64()));
                        s.txps.push(txp);
                    }
                    Err(err) => {
                        if s.failed.is_none() {
                            s.failed = Some(err);
                        }
                    }
                }
                if s.pending == 0 {
                    Some((s.cb.take(), std::mem::take(&mut s.txps), s.failed.take()))
                } else {
                    None
                }
            };
            if let Some((cb, txps, failed)) = finished {
                let cb = match cb {
                    Some(cb) => cb,
                    None => return,
                };
                match failed {
                    Some(err) => {
                        for txp in txps {
                            txp.close();
                        }
                        cb(Err(Error::ConnectTestConnection(Box::new(err))));
                    }
                    None => {
                        let resume: StreamsResume = Box::new(move |done| {
                            start_transfer(resume_reactor, direction, params, record, txps, done);
                        });
                        cb(Ok(resume));
                    }
                }
            }
        });
    }
}

struct Transfer {
    reactor: Reactor,
    record: Rc<RefCell<Entry>>,
    direction: Direction,
    params: Params,
    streams: Vec<Transport>,
    /// Whole-transfer accumulator; yields the final average speed.
    meter: SpeedMeter,
    /// Per-window accumulator; reset after every snapshot sample.
    snap: SpeedMeter,
    open: usize,
    start: Instant,
    finished: bool,
    done: Option<StreamsDone>,
}

type TransferRef = Rc<RefCell<Transfer>>;

fn start_transfer(
    reactor: Reactor,
    direction: Direction,
    params: Params,
    record: Rc<RefCell<Entry>>,
    txps: Vec<Transport>,
    done: StreamsDone,
) {
    let start = Instant::now();
    let transfer: TransferRef = Rc::new(RefCell::new(Transfer {
        reactor,
        record,
        direction,
        params,
        streams: txps.clone(),
        meter: SpeedMeter::new(start),
        snap: SpeedMeter::new(start),
        open: txps.len(),
        start,
        finished: false,
        done: Some(done),
    }));
    // Allow for a stalled peer but not an endless one.
    let silence_guard = params.duration + DEFAULT_TIMEOUT;
    match direction {
        Direction::Download => {
            for txp in &txps {
                txp.set_timeout(silence_guard);
                let t = Rc::clone(&transfer);
                txp.on_data(move |chunk| {
                    let mut b = t.borrow_mut();
                    b.meter.add(chunk.len() as u64);
                    b.snap.add(chunk.len() as u64);
                });
                let t = Rc::clone(&transfer);
                let handle = txp.clone();
                txp.on_error(move |err| stream_ended(&t, &handle, err));
                txp.resume_reading();
            }
            schedule_sample(&transfer);
        }
        Direction::Upload => {
            let chunk: Rc<Vec<u8>> = Rc::new(
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(UPLOAD_CHUNK)
                    .collect(),
            );
            for txp in &txps {
                txp.set_timeout(silence_guard);
                let t = Rc::clone(&transfer);
                let handle = txp.clone();
                let payload = Rc::clone(&chunk);
                txp.on_flush(move || {
                    let keep_going = {
                        let mut b = t.borrow_mut();
                        b.meter.add(payload.len() as u64);
                        b.snap.add(payload.len() as u64);
                        !b.finished && b.start.elapsed() < b.params.duration
                    };
                    if keep_going {
                        handle.write(&payload);
                    } else {
                        stream_ended(&t, &handle, Error::Eof);
                    }
                });
                let t = Rc::clone(&transfer);
                let handle = txp.clone();
                txp.on_error(move |err| stream_ended(&t, &handle, upload_end(err)));
                txp.write(&chunk);
            }
            schedule_sample(&transfer);
        }
    }
}

/// The server tears its side down when the upload window closes, so a reset
/// mid-write is a normal end of stream.
fn upload_end(err: Error) -> Error {
    match &err {
        Error::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            Error::Eof
        }
        _ => err,
    }
}

fn stream_ended(t: &TransferRef, txp: &Transport, err: Error) {
    txp.close();
    let single = {
        let b = t.borrow();
        b.params.num_streams == 1
    };
    if !err.is_eof() {
        if single {
            finish(t, Err(err));
            return;
        }
        warn!("test stream failed, continuing with the others: {err}");
    }
    let all_ended = {
        let mut b = t.borrow_mut();
        if b.finished {
            return;
        }
        b.open -= 1;
        b.open == 0
    };
    if all_ended {
        finish(t, Ok(()));
    }
}

fn finish(t: &TransferRef, result: Result<()>) {
    let (done, speed) = {
        let mut b = t.borrow_mut();
        if b.finished {
            return;
        }
        b.finished = true;
        for txp in &b.streams {
            txp.close();
        }
        debug!("transfer moved {} bytes", b.meter.total());
        (b.done.take(), b.meter.speed_at(Instant::now()))
    };
    if let Some(done) = done {
        done(result.map(|()| speed));
    }
}

/// Periodic speed snapshot, running while every stream is still open.
/// Each sample is `[elapsed-seconds, kbit/s]` over the window since the
/// previous sample, appended under `receiver_data` for downloads and
/// `sender_data` for uploads.
fn schedule_sample(t: &TransferRef) {
    let (reactor, delay) = {
        let b = t.borrow();
        (b.reactor.clone(), b.params.snaps_delay)
    };
    let t = Rc::clone(t);
    reactor.call_later(delay, move || {
        let sample = {
            let mut b = t.borrow_mut();
            if b.finished || b.open < b.params.num_streams {
                None
            } else {
                let now = Instant::now();
                let speed = b.snap.speed_at(now);
                b.snap.reset(now);
                Some((b.direction, b.start.elapsed().as_secs_f64(), speed))
            }
        };
        if let Some((direction, elapsed, speed)) = sample {
            let (label, key) = match direction {
                Direction::Download => ("download", "receiver_data"),
                Direction::Upload => ("upload", "sender_data"),
            };
            info!("{label} speed: {speed:.2} kbit/s");
            t.borrow()
                .record
                .borrow_mut()
                .push(key, json!([elapsed, speed]));
            schedule_sample(&t);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_prepare_payload() {
        let params = Params::parse("3010 5000 x 500 x 4").unwrap();
        assert_eq!(params.port, 3010);
        assert_eq!(params.duration, Duration::from_secs(5));
        assert_eq!(params.snaps_delay, Duration::from_millis(500));
        assert_eq!(params.num_streams, 4);
    }

    #[test]
    fn parse_port_only_uses_defaults() {
        let params = Params::parse("3002").unwrap();
        assert_eq!(params.port, 3002);
        assert_eq!(params.duration, Duration::from_secs(10));
        assert_eq!(params.snaps_delay, Duration::from_millis(500));
        assert_eq!(params.num_streams, 1);
    }

    #[test]
    fn snaps_delay_below_the_floor_is_rejected() {
        assert!(matches!(
            Params::parse("3010 5000 x 100 x 2"),
            Err(Error::InvalidSnapsDelay)
        ));
        let params = Params::parse("3010 5000 x 250 x 2").unwrap();
        assert_eq!(params.snaps_delay, Duration::from_millis(250));
    }

    #[test]
    fn eight_streams_accepted_nine_rejected() {
        assert_eq!(Params::parse("3010 5000 x 500 x 8").unwrap().num_streams, 8);
        assert!(matches!(
            Params::parse("3010 5000 x 500 x 9"),
            Err(Error::InvalidNumStreams)
        ));
        assert!(matches!(
            Params::parse("3010 5000 x 500 x 0"),
            Err(Error::InvalidNumStreams)
        ));
    }

    #[test]
    fn params_record_carries_the_parameters() {
        let record = Params::parse("3010 5000 x 500 x 4").unwrap().to_record();
        let json = record.as_json();
        assert_eq!(json["params"]["port"], 3010);
        assert_eq!(json["params"]["duration_ms"], 5000);
        assert_eq!(json["params"]["snaps_delay_ms"], 500);
        assert_eq!(json["params"]["num_streams"], 4);
    }

    #[test]
    fn invalid_tokens_map_to_distinct_errors() {
        assert!(matches!(Params::parse(""), Err(Error::InvalidPort)));
        assert!(matches!(Params::parse("0"), Err(Error::InvalidPort)));
        assert!(matches!(Params::parse("port"), Err(Error::InvalidPort)));
        assert!(matches!(
            Params::parse("3010 70000"),
            Err(Error::InvalidDuration)
        ));
        assert!(matches!(
            Params::parse("3010 5000 x nope"),
            Err(Error::InvalidSnapsDelay)
        ));
    }

    #[test]
    fn meter_reports_kbits_per_second() {
        let origin = Instant::now();
        let mut meter = SpeedMeter::new(origin);
        meter.add(125_000); // one megabit
        let speed = meter.speed_at(origin + Duration::from_secs(1));
        assert!((speed - 1000.0).abs() < 1.0, "got {speed}");
        assert_eq!(meter.total(), 125_000);
    }

    #[test]
    fn reset_meter_forgets_earlier_windows() {
        let origin = Instant::now();
        let mut meter = SpeedMeter::new(origin);
        meter.add(125_000);
        let boundary = origin + Duration::from_millis(500);
        assert!(meter.speed_at(boundary) > 0.0);
        meter.reset(boundary);
        // A silent window measures zero, not the old running average.
        assert_eq!(meter.speed_at(boundary + Duration::from_millis(500)), 0.0);
        assert_eq!(meter.total(), 0);
    }
}
