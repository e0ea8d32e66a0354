//! Policy engine
//!
//! The single-threaded core that owns the signal store, the rule tree
//! runtime state and the timer queue. The driver feeds it input events and
//! logical time; it hands back released emissions and monitor violations.
//!
//! Ordering within a tick: timers strictly earlier than the incoming event
//! dispatch first, then the input propagates completely, then same-instant
//! timers (including zero-delay emissions scheduled by the propagation)
//! dispatch in insertion order. A released emission updates the store and
//! propagates like an input, so rules may chain on it within the same tick.

use crate::monitor::{
    AncestorSnapshot, MonitorPhase, MonitorRuntime, OperandSnapshot, ViolationReason,
    ViolationReport,
};
use crate::rules::{self, NodeId, NodeKind, RuleTree};
use crate::sched::{TimerEvent, TimerQueue};
use crate::signum::SignalMap;
use crate::store::SignalStore;
use crate::types::{Millis, Result, Truth, Value};
use std::collections::HashMap;
use std::path::Path;

/// A released emission, ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub time_ms: Millis,
    pub signal: String,
    pub id: Option<u32>,
    pub value: Value,
}

/// Everything the engine can hand back from one step
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Emission(Emission),
    Violation(ViolationReport),
}

/// An emission evaluated at fire time, waiting for its release deadline
#[derive(Debug)]
struct PendingEmission {
    owner: NodeId,
    signal: String,
    id: Option<u32>,
    value: Value,
    cancelled: bool,
}

/// The policy manager core
pub struct PolicyEngine {
    tree: RuleTree,
    store: SignalStore,
    map: SignalMap,
    timers: TimerQueue,
    /// Reverse index: signal name -> condition nodes reading it, pre-order
    subscribers: HashMap<String, Vec<NodeId>>,
    pending: HashMap<u64, PendingEmission>,
    next_emission_key: u64,
    next_epoch: u64,
    events: Vec<EngineEvent>,
    now_ms: Millis,
}

impl PolicyEngine {
    /// Build an engine from an already-lowered rule tree
    pub fn new(tree: RuleTree, map: SignalMap) -> Self {
        let mut subscribers: HashMap<String, Vec<NodeId>> = HashMap::new();
        for id in tree.condition_ids() {
            if let Some(cond) = tree.condition(id) {
                for name in &cond.operands {
                    subscribers.entry(name.clone()).or_default().push(id);
                }
            }
        }

        Self {
            tree,
            store: SignalStore::new(),
            map,
            timers: TimerQueue::new(),
            subscribers,
            pending: HashMap::new(),
            next_emission_key: 0,
            next_epoch: 0,
            events: Vec::new(),
            now_ms: 0,
        }
    }

    /// Load rules and the signal-number mapping from files
    pub fn from_files(rules_path: &Path, map_path: &Path) -> Result<Self> {
        let map = SignalMap::load(map_path)?;
        let tree = rules::parser::load_rules(rules_path, &map)?;
        Ok(Self::new(tree, map))
    }

    /// Preset a signal value before the tree is armed.
    ///
    /// Used for initial-state files: the value lands in the store without
    /// propagation, echo or capture.
    pub fn preset(&mut self, name: &str, value: Value) {
        self.store.set(name, value, 0);
    }

    /// Arm the rule tree at program start.
    ///
    /// Top-level conditions arm immediately (monitored ones begin their
    /// start window now); top-level unconditional emits fire exactly once.
    pub fn start(&mut self, now_ms: Millis) -> Vec<EngineEvent> {
        self.now_ms = now_ms;
        for root in self.tree.roots().to_vec() {
            match self.tree.node(root).map(|n| &n.kind) {
                Some(NodeKind::Emit(_)) => self.fire_emit(root, now_ms),
                Some(_) => self.arm(root, now_ms, false),
                None => {}
            }
        }
        self.drain(now_ms, true);
        std::mem::take(&mut self.events)
    }

    /// Feed one input event at the given logical time.
    ///
    /// Re-evaluation happens on every receipt; edge detection on the stored
    /// truth value is what keeps duplicate inputs from re-firing emits.
    pub fn inject(&mut self, name: &str, value: Value, now_ms: Millis) -> Vec<EngineEvent> {
        let now_ms = now_ms.max(self.now_ms);
        self.drain(now_ms, false);
        self.now_ms = now_ms;
        self.store.set(name, value, now_ms);
        self.propagate(name, now_ms);
        self.drain(now_ms, true);
        std::mem::take(&mut self.events)
    }

    /// Dispatch every timer due at or before the given logical time
    pub fn advance_to(&mut self, now_ms: Millis) -> Vec<EngineEvent> {
        let now_ms = now_ms.max(self.now_ms);
        self.drain(now_ms, true);
        self.now_ms = now_ms;
        std::mem::take(&mut self.events)
    }

    /// Earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    pub fn tree(&self) -> &RuleTree {
        &self.tree
    }

    pub fn signal_id(&self, name: &str) -> Option<u32> {
        self.map.id_of(name)
    }

    /// Translate an input token that may be a numeric signal ID
    pub fn resolve_signal_name<'a>(&'a self, token: &'a str) -> &'a str {
        if token.chars().all(|c| c.is_ascii_digit()) {
            if let Some(name) = token.parse::<u32>().ok().and_then(|id| self.map.name_of(id)) {
                return name;
            }
        }
        token
    }

    fn drain(&mut self, now_ms: Millis, inclusive: bool) {
        while let Some((deadline, event)) = self.timers.pop_due(now_ms, inclusive) {
            self.dispatch(deadline, event);
        }
    }

    fn dispatch(&mut self, at_ms: Millis, event: TimerEvent) {
        match event {
            TimerEvent::StartDeadline { node, epoch } => {
                if self.monitor_matches(node, epoch, MonitorPhase::AwaitStart) {
                    self.violated(node, at_ms, ViolationReason::StartWindowExpired);
                }
            }
            TimerEvent::StopDeadline { node, epoch } => {
                if self.monitor_matches(node, epoch, MonitorPhase::InWindow) {
                    self.satisfied(node, at_ms);
                }
            }
            TimerEvent::Emission { key } => {
                if let Some(pending) = self.pending.remove(&key) {
                    if pending.cancelled {
                        log::debug!(
                            "discarding cancelled emission of '{}'",
                            pending.signal
                        );
                        return;
                    }
                    self.store.set(&pending.signal, pending.value.clone(), at_ms);
                    self.events.push(EngineEvent::Emission(Emission {
                        time_ms: at_ms,
                        signal: pending.signal.clone(),
                        id: pending.id,
                        value: pending.value,
                    }));
                    // downstream rules see the new value in the same tick
                    self.propagate(&pending.signal, at_ms);
                }
            }
        }
    }

    fn monitor_matches(&self, id: NodeId, epoch: u64, phase: MonitorPhase) -> bool {
        self.tree
            .condition(id)
            .and_then(|c| c.state.monitor.as_ref())
            .map(|m| m.epoch == epoch && m.phase == phase)
            .unwrap_or(false)
    }

    fn propagate(&mut self, name: &str, now_ms: Millis) {
        let Some(ids) = self.subscribers.get(name).cloned() else {
            return;
        };
        for id in ids {
            let armed = self
                .tree
                .condition(id)
                .map(|c| c.state.armed)
                .unwrap_or(false);
            if armed {
                self.reevaluate(id, now_ms);
            }
        }
    }

    fn reevaluate(&mut self, id: NodeId, now_ms: Millis) {
        let (new_truth, old_truth, text) = {
            let Some(cond) = self.tree.condition(id) else {
                return;
            };
            let new_truth = match cond.expr.eval(&self.store) {
                Some(Value::Boolean(b)) => Truth::from_bool(b),
                Some(other) => {
                    log::debug!(
                        "condition ({}) evaluated to non-boolean {}; treated as false",
                        cond.text,
                        other.kind()
                    );
                    Truth::False
                }
                None => {
                    log::debug!(
                        "condition ({}) has an undefined operand; treated as false",
                        cond.text
                    );
                    Truth::False
                }
            };
            (new_truth, cond.state.truth, cond.text.clone())
        };

        if new_truth == old_truth {
            return;
        }
        log::debug!("condition: ({}) => {}", text, new_truth);

        if let Some(cond) = self.tree.condition_mut(id) {
            cond.state.truth = new_truth;
        }

        if new_truth == Truth::True {
            self.rising(id, now_ms);
        } else if old_truth == Truth::True {
            self.falling(id, now_ms);
        }
    }

    /// The condition's expression just became true
    fn rising(&mut self, id: NodeId, now_ms: Millis) {
        let Some(cond) = self.tree.condition(id) else {
            return;
        };
        let monitored = cond.is_monitored();
        let start_ms = cond.start_ms.unwrap_or(0);
        let stop_ms = cond.stop_ms;
        let children = cond.children.clone();
        let emits = cond.emits.clone();
        let monitor = cond.state.monitor.clone();

        let mut satisfied_now = false;
        if monitored {
            if let Some(m) = monitor.filter(|m| m.phase == MonitorPhase::AwaitStart) {
                // EXPR_T during AwaitStart: move into the window. The stale
                // start timer is dropped on dispatch by the phase guard.
                if let Some(cond) = self.tree.condition_mut(id) {
                    if let Some(rt) = cond.state.monitor.as_mut() {
                        rt.phase = MonitorPhase::InWindow;
                    }
                }
                match stop_ms {
                    Some(stop) => self.timers.schedule(
                        m.arm_time_ms + start_ms + stop,
                        TimerEvent::StopDeadline {
                            node: id,
                            epoch: m.epoch,
                        },
                    ),
                    // a stop-less monitor has nothing left to hold out for
                    None => satisfied_now = true,
                }
            }
        }

        for child in children {
            self.arm(child, now_ms, false);
        }

        if monitored {
            if satisfied_now {
                self.satisfied(id, now_ms);
            }
        } else {
            for emit in emits {
                self.fire_emit(emit, now_ms);
            }
            self.complete(id, now_ms);
        }
    }

    /// The condition's expression just stopped being true
    fn falling(&mut self, id: NodeId, now_ms: Millis) {
        let Some(cond) = self.tree.condition(id) else {
            return;
        };
        let in_window = cond
            .state
            .monitor
            .as_ref()
            .map(|m| m.phase == MonitorPhase::InWindow)
            .unwrap_or(false);
        let children = cond.children.clone();

        if in_window {
            self.violated(id, now_ms, ViolationReason::FailedInWindow);
        }

        // pending emissions anywhere below (own emits included) are discarded
        self.cancel_pending_emissions(id);
        for child in children {
            self.disarm(child);
        }
        if let Some(cond) = self.tree.condition_mut(id) {
            cond.state.done = false;
        }
    }

    /// Begin supervising a node because its parent context became true.
    ///
    /// `deferred` arming is used when a sequence hands the slot to its next
    /// child: the condition arms with unknown truth and is only evaluated on
    /// the next signal receipt, so the handover itself is not an edge.
    /// Monitored conditions always evaluate immediately; their start window
    /// opens at arm time.
    fn arm(&mut self, id: NodeId, now_ms: Millis, deferred: bool) {
        let kind_children = match self.tree.node(id).map(|n| &n.kind) {
            Some(NodeKind::Condition(_)) => None,
            Some(NodeKind::Parallel(p)) => Some(p.children.clone()),
            Some(NodeKind::Sequence(s)) => Some(s.children.clone()),
            _ => return,
        };

        match kind_children {
            None => {
                let monitored = {
                    let Some(cond) = self.tree.condition_mut(id) else {
                        return;
                    };
                    cond.state.armed = true;
                    cond.state.truth = Truth::Unknown;
                    cond.state.done = false;
                    cond.is_monitored()
                };

                if monitored {
                    let epoch = self.next_epoch;
                    self.next_epoch += 1;
                    let start_ms = {
                        let Some(cond) = self.tree.condition_mut(id) else {
                            return;
                        };
                        cond.state.monitor = Some(MonitorRuntime::armed(now_ms, epoch));
                        cond.start_ms.unwrap_or(0)
                    };
                    self.timers.schedule(
                        now_ms + start_ms,
                        TimerEvent::StartDeadline { node: id, epoch },
                    );
                    self.reevaluate(id, now_ms);
                } else if !deferred {
                    self.reevaluate(id, now_ms);
                }
                // deferred arming leaves the truth Unknown and waits for the
                // next signal receipt, so the sequence handover itself is
                // not an edge
            }
            Some(children) => {
                match self.tree.node_mut(id).map(|n| &mut n.kind) {
                    Some(NodeKind::Parallel(p)) => {
                        p.armed = true;
                        p.done = false;
                    }
                    Some(NodeKind::Sequence(s)) => {
                        s.armed = true;
                        s.done = false;
                        s.cursor = 0;
                    }
                    _ => {}
                }
                match self.tree.node(id).map(|n| &n.kind) {
                    Some(NodeKind::Parallel(_)) => {
                        for child in children {
                            self.arm(child, now_ms, deferred);
                        }
                    }
                    Some(NodeKind::Sequence(_)) => {
                        if let Some(first) = children.first() {
                            self.arm(*first, now_ms, deferred);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Withdraw supervision from a subtree. Idempotent; active monitors end
    /// silently in `Cancelled`, terminal phases are left as they are.
    fn disarm(&mut self, id: NodeId) {
        let children = self.tree.child_nodes(id);
        match self.tree.node_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Condition(cond)) => {
                if let Some(m) = cond.state.monitor.as_mut() {
                    if m.is_supervising() {
                        m.phase = MonitorPhase::Cancelled;
                    }
                }
                cond.state.armed = false;
                cond.state.truth = Truth::Unknown;
                cond.state.done = false;
            }
            Some(NodeKind::Parallel(p)) => {
                p.armed = false;
                p.done = false;
            }
            Some(NodeKind::Sequence(s)) => {
                s.armed = false;
                s.done = false;
                s.cursor = 0;
            }
            _ => return,
        }
        for child in children {
            self.disarm(child);
        }
    }

    /// A node finished its part: a condition went true (plain) or reached
    /// Satisfied (monitored), or a wrapper saw all of its children finish.
    /// Advances the enclosing sequence cursor where applicable.
    fn complete(&mut self, id: NodeId, now_ms: Millis) {
        match self.tree.node_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Condition(c)) => c.state.done = true,
            Some(NodeKind::Parallel(p)) => p.done = true,
            Some(NodeKind::Sequence(s)) => s.done = true,
            _ => {}
        }

        let Some(parent) = self.tree.node(id).and_then(|n| n.parent) else {
            return;
        };

        enum Step {
            Advance { children: Vec<NodeId>, next: usize },
            Wrap { children: Vec<NodeId> },
            CheckParallel { children: Vec<NodeId> },
            Nothing,
        }

        let step = match self.tree.node(parent).map(|n| &n.kind) {
            Some(NodeKind::Sequence(s)) if s.armed && s.children.get(s.cursor) == Some(&id) => {
                let next = s.cursor + 1;
                if next < s.children.len() {
                    Step::Advance {
                        children: s.children.clone(),
                        next,
                    }
                } else {
                    Step::Wrap {
                        children: s.children.clone(),
                    }
                }
            }
            Some(NodeKind::Parallel(p)) if p.armed => Step::CheckParallel {
                children: p.children.clone(),
            },
            _ => Step::Nothing,
        };

        match step {
            Step::Advance { children, next } => {
                // the finished child leaves the armed slot
                self.disarm(id);
                if let Some(NodeKind::Sequence(s)) =
                    self.tree.node_mut(parent).map(|n| &mut n.kind)
                {
                    s.cursor = next;
                }
                self.arm(children[next], now_ms, true);
            }
            Step::Wrap { children } => {
                // full pass: report completion upward, then wrap around so
                // the sequence can run again while the parent holds
                self.disarm(id);
                if let Some(NodeKind::Sequence(s)) =
                    self.tree.node_mut(parent).map(|n| &mut n.kind)
                {
                    s.cursor = 0;
                }
                self.complete(parent, now_ms);
                // completion may have made an enclosing sequence advance
                // past this wrapper and disarm it; only restart if armed
                let still_armed = matches!(
                    self.tree.node(parent).map(|n| &n.kind),
                    Some(NodeKind::Sequence(s)) if s.armed
                );
                if still_armed {
                    if let Some(first) = children.first() {
                        self.arm(*first, now_ms, true);
                    }
                }
            }
            Step::CheckParallel { children } => {
                let all_done = children.iter().all(|child| {
                    match self.tree.node(*child).map(|n| &n.kind) {
                        Some(NodeKind::Condition(c)) => c.state.done,
                        Some(NodeKind::Parallel(p)) => p.done,
                        Some(NodeKind::Sequence(s)) => s.done,
                        _ => true,
                    }
                });
                if all_done {
                    self.complete(parent, now_ms);
                }
            }
            Step::Nothing => {}
        }
    }

    /// A monitor held its window: fire emits and report completion
    fn satisfied(&mut self, id: NodeId, now_ms: Millis) {
        let emits = {
            let Some(cond) = self.tree.condition_mut(id) else {
                return;
            };
            if let Some(m) = cond.state.monitor.as_mut() {
                m.phase = MonitorPhase::Satisfied;
            }
            cond.emits.clone()
        };
        log::debug!("monitor satisfied: {}", self.tree.path(id));
        for emit in emits {
            self.fire_emit(emit, now_ms);
        }
        self.complete(id, now_ms);
    }

    fn violated(&mut self, id: NodeId, now_ms: Millis, reason: ViolationReason) {
        let Some(cond) = self.tree.condition(id) else {
            return;
        };
        let operands = self.snapshot(&cond.operands);
        let report = ViolationReport {
            time_ms: now_ms,
            wall_time: chrono::Utc::now(),
            path: self.tree.path(id),
            expression: cond.text.clone(),
            reason,
            operands,
            ancestors: self
                .tree
                .ancestor_conditions(id)
                .into_iter()
                .filter_map(|ancestor| {
                    self.tree.condition(ancestor).map(|c| AncestorSnapshot {
                        path: self.tree.path(ancestor),
                        expression: c.text.clone(),
                        operands: self.snapshot(&c.operands),
                    })
                })
                .collect(),
        };

        if let Some(cond) = self.tree.condition_mut(id) {
            if let Some(m) = cond.state.monitor.as_mut() {
                m.phase = MonitorPhase::Violated;
            }
        }

        log::warn!("monitor violation: {} ({})", report.reason, report.path);
        self.events.push(EngineEvent::Violation(report));
    }

    fn snapshot(&self, operands: &[String]) -> Vec<OperandSnapshot> {
        operands
            .iter()
            .map(|name| OperandSnapshot {
                signal: name.clone(),
                value: self.store.get(name).cloned(),
            })
            .collect()
    }

    /// Evaluate an emit node now and schedule its release
    fn fire_emit(&mut self, emit_id: NodeId, now_ms: Millis) {
        let Some(emit) = self.tree.emit(emit_id) else {
            return;
        };
        let Some(value) = emit.value.eval(&self.store) else {
            log::debug!(
                "emit value for '{}' is undefined; emission skipped",
                emit.signal
            );
            return;
        };

        let key = self.next_emission_key;
        self.next_emission_key += 1;
        self.pending.insert(
            key,
            PendingEmission {
                owner: emit_id,
                signal: emit.signal.clone(),
                id: self.map.id_of(&emit.signal),
                value,
                cancelled: false,
            },
        );
        self.timers
            .schedule(now_ms + emit.delay_ms, TimerEvent::Emission { key });
    }

    fn cancel_pending_emissions(&mut self, root: NodeId) {
        let owners = self.tree.emit_descendants(root);
        if owners.is_empty() {
            return;
        }
        for pending in self.pending.values_mut() {
            if owners.contains(&pending.owner) {
                pending.cancelled = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parser::parse_rules_str;

    fn engine(yaml: &str, signals: &[(&str, u32)]) -> PolicyEngine {
        let map = SignalMap::from_pairs(signals);
        let tree = parse_rules_str(yaml, &map).unwrap();
        PolicyEngine::new(tree, SignalMap::from_pairs(signals))
    }

    fn emissions(events: &[EngineEvent]) -> Vec<&Emission> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Emission(emission) => Some(emission),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unconditional_emit_fires_once_at_start() {
        let mut engine = engine(
            "- emit:\n    signal: car.stop\n    value: true\n",
            &[("car.stop", 1)],
        );
        let events = engine.start(0);
        let out = emissions(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].signal, "car.stop");
        assert_eq!(out[0].id, Some(1));
        assert_eq!(out[0].value, Value::Boolean(true));
        // nothing more pending
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn test_constant_true_condition_fires_at_start() {
        let yaml = "- condition: \"1 == 1\"\n  emit:\n    signal: car.stop\n    value: 1\n";
        let mut engine = engine(yaml, &[("car.stop", 1)]);
        let events = engine.start(0);
        assert_eq!(emissions(&events).len(), 1);
    }

    #[test]
    fn test_resolve_numeric_ingress() {
        let engine = engine(
            "- emit:\n    signal: car.stop\n    value: true\n",
            &[("car.stop", 7)],
        );
        assert_eq!(engine.resolve_signal_name("7"), "car.stop");
        assert_eq!(engine.resolve_signal_name("99"), "99");
        assert_eq!(engine.resolve_signal_name("car.stop"), "car.stop");
    }
}
