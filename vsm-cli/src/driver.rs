//! Driver loop
//!
//! Owns the single blocking point of the process: wait for the earlier of
//! the next input line or the next engine deadline. Input lines arrive
//! through a channel fed by a reader thread, so transport stays serialized
//! into the engine from one place. All engine interaction uses logical
//! milliseconds produced by [`LogicalClock`]; during replay the clock runs
//! scaled, which is the only place the replay rate exists.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use vsm_policy::capture::{format_signal_line, PREFIX_INCOMING, PREFIX_OUTGOING};
use vsm_policy::{CaptureWriter, EngineEvent, Millis, PolicyEngine, ReplayEvent, Value};

/// Maps wall-clock time to logical engine milliseconds.
///
/// `rate` is a percentage: 100 tracks real time, 50 runs at half speed,
/// 200 at double. The engine only ever sees the logical side.
struct LogicalClock {
    start: Instant,
    rate: f64,
}

impl LogicalClock {
    fn new(rate: f64) -> Self {
        Self {
            start: Instant::now(),
            rate,
        }
    }

    fn now_ms(&self) -> Millis {
        Self::to_logical(self.start.elapsed(), self.rate)
    }

    /// Wall-clock duration until the given logical time arrives
    fn wall_until(&self, logical_ms: Millis) -> Duration {
        Self::wall_delta(self.now_ms(), logical_ms, self.rate)
    }

    fn to_logical(elapsed: Duration, rate: f64) -> Millis {
        (elapsed.as_millis() as f64 * rate / 100.0) as Millis
    }

    fn wall_delta(now_ms: Millis, logical_ms: Millis, rate: f64) -> Duration {
        if logical_ms <= now_ms {
            return Duration::ZERO;
        }
        Duration::from_millis(((logical_ms - now_ms) as f64 * 100.0 / rate).ceil() as u64)
    }
}

pub struct Driver {
    engine: PolicyEngine,
    clock: LogicalClock,
    replay: VecDeque<ReplayEvent>,
    capture: Option<CaptureWriter<File>>,
    violation_log: Option<File>,
}

impl Driver {
    pub fn new(
        engine: PolicyEngine,
        rate: f64,
        replay: Vec<ReplayEvent>,
        capture_path: Option<&Path>,
        violation_path: Option<&Path>,
    ) -> Result<Self> {
        let capture = match capture_path {
            Some(path) => Some(CaptureWriter::new(
                File::create(path)
                    .with_context(|| format!("failed to create capture log {:?}", path))?,
            )),
            None => None,
        };
        let violation_log = match violation_path {
            Some(path) => Some(
                File::create(path)
                    .with_context(|| format!("failed to create log file {:?}", path))?,
            ),
            None => None,
        };

        Ok(Self {
            engine,
            clock: LogicalClock::new(rate),
            replay: replay.into(),
            capture,
            violation_log,
        })
    }

    pub fn run(mut self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let events = self.engine.start(self.clock.now_ms());
        self.write_events(events)?;

        let mut stdin_open = true;
        loop {
            let now = self.clock.now_ms();
            self.pump_replay(now)?;

            let next_wake = [
                self.engine.next_deadline(),
                self.replay.front().map(|e| e.time_ms),
            ]
            .into_iter()
            .flatten()
            .min();

            if !stdin_open {
                // stdin is done; run out the remaining timers and replay
                match next_wake {
                    Some(deadline) => {
                        std::thread::sleep(self.clock.wall_until(deadline));
                        self.tick()?;
                    }
                    None => break,
                }
                continue;
            }

            let received = match next_wake {
                Some(deadline) => rx.recv_timeout(self.clock.wall_until(deadline)),
                None => rx
                    .recv()
                    .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "quit" {
                        break;
                    }
                    self.handle_input(&line)?;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.tick()?,
                Err(mpsc::RecvTimeoutError::Disconnected) => stdin_open = false,
            }
        }

        Ok(())
    }

    /// A deadline came due: deliver due replay events and timers
    fn tick(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        self.pump_replay(now)?;
        let events = self.engine.advance_to(now);
        self.write_events(events)
    }

    fn pump_replay(&mut self, now: Millis) -> Result<()> {
        while self
            .replay
            .front()
            .map(|e| e.time_ms <= now)
            .unwrap_or(false)
        {
            if let Some(event) = self.replay.pop_front() {
                self.deliver(&event.name, event.value, event.time_ms)?;
            }
        }
        Ok(())
    }

    /// One `name = value` line from the transport. Bad lines are logged and
    /// dropped; they never take the engine down.
    fn handle_input(&mut self, line: &str) -> Result<()> {
        let Some((name_raw, value_raw)) = line.split_once('=') else {
            log::error!("invalid input line (expected 'name = value'): {}", line);
            return Ok(());
        };
        let Some(value) = Value::parse_literal(value_raw) else {
            log::error!("incorrect value: {}", value_raw.trim());
            return Ok(());
        };
        let name = self.engine.resolve_signal_name(name_raw.trim()).to_string();
        let now = self.clock.now_ms();
        self.deliver(&name, value, now)
    }

    /// Echo, capture and inject one incoming signal event
    fn deliver(&mut self, name: &str, value: Value, time_ms: Millis) -> Result<()> {
        let id = self.engine.signal_id(name);
        println!(
            "{} {}",
            PREFIX_INCOMING,
            format_signal_line(time_ms, name, id, &value)
        );
        if let Some(capture) = self.capture.as_mut() {
            capture.record_incoming(time_ms, name, id, &value)?;
        }

        let events = self.engine.inject(name, value, time_ms);
        if log::log_enabled!(log::Level::Trace) {
            for (signal, current) in self.engine.store().sorted() {
                log::trace!("state: {} = {}", signal, current);
            }
        }
        self.write_events(events)
    }

    fn write_events(&mut self, events: Vec<EngineEvent>) -> Result<()> {
        for event in events {
            match event {
                EngineEvent::Emission(emission) => {
                    println!(
                        "{} {}",
                        PREFIX_OUTGOING,
                        format_signal_line(
                            emission.time_ms,
                            &emission.signal,
                            emission.id,
                            &emission.value
                        )
                    );
                    if let Some(capture) = self.capture.as_mut() {
                        capture.record_outgoing(
                            emission.time_ms,
                            &emission.signal,
                            emission.id,
                            &emission.value,
                        )?;
                    }
                }
                EngineEvent::Violation(report) => match self.violation_log.as_mut() {
                    Some(file) => {
                        file.write_all(report.render().as_bytes())?;
                        file.flush()?;
                    }
                    None => eprint!("{}", report.render()),
                },
            }
        }
        std::io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_logical_scales_by_rate() {
        let elapsed = Duration::from_millis(1000);
        assert_eq!(LogicalClock::to_logical(elapsed, 100.0), 1000);
        // half speed: one wall second is half a logical second
        assert_eq!(LogicalClock::to_logical(elapsed, 50.0), 500);
        // double speed: one wall second is two logical seconds
        assert_eq!(LogicalClock::to_logical(elapsed, 200.0), 2000);
    }

    #[test]
    fn test_wall_delta_inverts_the_rate() {
        assert_eq!(
            LogicalClock::wall_delta(0, 1000, 100.0),
            Duration::from_millis(1000)
        );
        // half speed: a logical second takes two wall seconds
        assert_eq!(
            LogicalClock::wall_delta(0, 1000, 50.0),
            Duration::from_millis(2000)
        );
        // double speed: a logical second takes half a wall second
        assert_eq!(
            LogicalClock::wall_delta(500, 1500, 200.0),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_wall_delta_rounds_up_to_the_next_millisecond() {
        // 100 logical ms at 300% is 33.3 wall ms; sleeping 33 would wake early
        assert_eq!(
            LogicalClock::wall_delta(0, 100, 300.0),
            Duration::from_millis(34)
        );
    }

    #[test]
    fn test_elapsed_deadline_needs_no_wait() {
        assert_eq!(LogicalClock::wall_delta(500, 500, 100.0), Duration::ZERO);
        assert_eq!(LogicalClock::wall_delta(700, 500, 100.0), Duration::ZERO);
        assert_eq!(LogicalClock::wall_delta(700, 500, 50.0), Duration::ZERO);
    }

    #[test]
    fn test_clock_starts_near_zero() {
        let clock = LogicalClock::new(100.0);
        // freshly created clocks read essentially zero logical time
        assert!(clock.now_ms() < 100);
        assert_eq!(clock.wall_until(0), Duration::ZERO);
    }
}
