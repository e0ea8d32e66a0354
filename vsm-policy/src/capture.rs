//! Capture log recording and replay parsing
//!
//! The capture log is line-oriented CSV, `ts_ms,name,id,value_literal`,
//! with timestamps relative to capture start. Lines carry the same `<`
//! (outgoing) / `>` (incoming) markers as the stdout trace, so a recorded
//! session doubles as a replayable transcript. Replay re-injects only the
//! incoming events; outgoing lines are skipped because the rules re-derive
//! them, which is what makes a 100% replay a real round-trip check.
//!
//! The value literal is the last field and is never split, so commas
//! inside string values need no extra quoting.

use crate::types::{Millis, PolicyError, Result, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Direction marker for outgoing (emitted) signals
pub const PREFIX_OUTGOING: char = '<';
/// Direction marker for incoming (received) signals
pub const PREFIX_INCOMING: char = '>';

/// Writes signal traffic to a capture log
pub struct CaptureWriter<W: Write> {
    out: W,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Record a received signal event
    pub fn record_incoming(
        &mut self,
        time_ms: Millis,
        name: &str,
        id: Option<u32>,
        value: &Value,
    ) -> std::io::Result<()> {
        self.record(PREFIX_INCOMING, time_ms, name, id, value)
    }

    /// Record a released emission
    pub fn record_outgoing(
        &mut self,
        time_ms: Millis,
        name: &str,
        id: Option<u32>,
        value: &Value,
    ) -> std::io::Result<()> {
        self.record(PREFIX_OUTGOING, time_ms, name, id, value)
    }

    fn record(
        &mut self,
        prefix: char,
        time_ms: Millis,
        name: &str,
        id: Option<u32>,
        value: &Value,
    ) -> std::io::Result<()> {
        writeln!(
            self.out,
            "{} {}",
            prefix,
            format_signal_line(time_ms, name, id, value)
        )?;
        self.out.flush()
    }
}

/// Format the CSV payload shared by stdout traces and capture logs
pub fn format_signal_line(time_ms: Millis, name: &str, id: Option<u32>, value: &Value) -> String {
    match id {
        Some(id) => format!("{},{},{},{}", time_ms, name, id, value),
        None => format!("{},{},?,{}", time_ms, name, value),
    }
}

/// One event parsed back out of a capture log
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEvent {
    pub time_ms: Millis,
    pub name: String,
    pub value: Value,
}

/// Load the incoming events of a capture log, ordered by timestamp
pub fn load_replay_log(path: &Path) -> Result<Vec<ReplayEvent>> {
    log::info!("Loading replay log: {:?}", path);
    let file = std::fs::File::open(path)?;
    let mut events = Vec::new();

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        match parse_replay_line(&line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => {
                return Err(PolicyError::ReplayParse(format!(
                    "line {}: {}",
                    lineno + 1,
                    e
                )))
            }
        }
    }

    events.sort_by_key(|e| e.time_ms);
    log::info!("Replay log loaded: {} events", events.len());
    Ok(events)
}

/// Parse one capture line. Returns `Ok(None)` for blank lines and for
/// outgoing lines, which replay does not re-inject.
pub fn parse_replay_line(line: &str) -> std::result::Result<Option<ReplayEvent>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let payload = match trimmed.chars().next() {
        Some(PREFIX_OUTGOING) => return Ok(None),
        Some(PREFIX_INCOMING) => trimmed[1..].trim_start(),
        _ => trimmed,
    };

    // the value literal is the last field; never split inside it
    let mut fields = payload.splitn(4, ',');
    let (time_text, name, _id, literal) =
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(t), Some(n), Some(i), Some(v)) => (t, n, i, v),
            _ => return Err(format!("expected 4 comma-separated fields: '{}'", line)),
        };

    let time_ms = time_text
        .trim()
        .parse::<Millis>()
        .map_err(|e| format!("bad timestamp '{}': {}", time_text, e))?;

    let value = Value::parse_literal(literal)
        .ok_or_else(|| format!("bad value literal '{}'", literal))?;

    Ok(Some(ReplayEvent {
        time_ms,
        name: name.trim().to_string(),
        value,
    }))
}
