//! Monitored-condition state machine types
//!
//! A condition carrying `start`/`stop` timing is supervised by a monitor.
//! The monitor is armed when the parent condition becomes true, must see its
//! own expression become true before the start deadline, and must then hold
//! it until the stop deadline. The engine drives the transitions; this
//! module holds the runtime record and the violation report format.

use crate::types::{Millis, Value};
use chrono::{DateTime, Utc};
use std::fmt;

/// Lifecycle phase of a monitored condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    /// Not supervising: parent has never been true since the last reset
    Idle,
    /// Armed, waiting for the expression to become true before the start
    /// deadline
    AwaitStart,
    /// Expression went true in time; it must now hold until the stop
    /// deadline
    InWindow,
    /// The window elapsed with the expression held true
    Satisfied,
    /// The start deadline expired, or the expression fell inside the window
    Violated,
    /// The parent fell while supervision was active; ends silently
    Cancelled,
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorPhase::Idle => "Idle",
            MonitorPhase::AwaitStart => "AwaitStart",
            MonitorPhase::InWindow => "InWindow",
            MonitorPhase::Satisfied => "Satisfied",
            MonitorPhase::Violated => "Violated",
            MonitorPhase::Cancelled => "Cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Per-condition monitor state
///
/// The epoch counts arming cycles. Timers carry the epoch they were
/// scheduled in; a timer whose epoch no longer matches is stale and is
/// dropped on dispatch, which is what makes cancellation idempotent.
#[derive(Debug, Clone)]
pub struct MonitorRuntime {
    pub phase: MonitorPhase,
    pub arm_time_ms: Millis,
    pub epoch: u64,
}

impl MonitorRuntime {
    pub fn armed(arm_time_ms: Millis, epoch: u64) -> Self {
        Self {
            phase: MonitorPhase::AwaitStart,
            arm_time_ms,
            epoch,
        }
    }

    pub fn is_supervising(&self) -> bool {
        matches!(self.phase, MonitorPhase::AwaitStart | MonitorPhase::InWindow)
    }
}

/// Why a monitor transitioned to `Violated`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationReason {
    /// `T_START` elapsed while still in `AwaitStart`
    StartWindowExpired,
    /// The expression went false while in `InWindow`
    FailedInWindow,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::StartWindowExpired => {
                write!(f, "condition not satisfied before start window")
            }
            ViolationReason::FailedInWindow => {
                write!(f, "condition went false within stop window")
            }
        }
    }
}

/// A signal operand and its value at the time of a violation
#[derive(Debug, Clone, PartialEq)]
pub struct OperandSnapshot {
    pub signal: String,
    /// `None` means the signal had never been observed
    pub value: Option<Value>,
}

impl fmt::Display for OperandSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.signal, v),
            None => write!(f, "{}=<undefined>", self.signal),
        }
    }
}

/// One ancestor condition's contribution to a violation report
#[derive(Debug, Clone, PartialEq)]
pub struct AncestorSnapshot {
    pub path: String,
    pub expression: String,
    pub operands: Vec<OperandSnapshot>,
}

/// A logged monitor violation
///
/// Carries everything the log format needs: a stable path to the violating
/// condition, its expression text, every operand with its value at the time
/// of the violation, and the same for every ancestor condition.
#[derive(Debug, Clone)]
pub struct ViolationReport {
    pub time_ms: Millis,
    pub wall_time: DateTime<Utc>,
    pub path: String,
    pub expression: String,
    pub reason: ViolationReason,
    pub operands: Vec<OperandSnapshot>,
    pub ancestors: Vec<AncestorSnapshot>,
}

impl ViolationReport {
    /// Render the multi-line log block
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "[{}] violation at {}ms: {}\n",
            self.wall_time.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.time_ms,
            self.reason
        ));
        out.push_str(&format!(
            "  condition: {} ({})\n",
            self.path, self.expression
        ));
        for operand in &self.operands {
            out.push_str(&format!("  operand: {}\n", operand));
        }
        for ancestor in &self.ancestors {
            out.push_str(&format!(
                "  parent condition: {} ({})\n",
                ancestor.path, ancestor.expression
            ));
            for operand in &ancestor.operands {
                out.push_str(&format!("    operand: {}\n", operand));
            }
        }
        out
    }
}
