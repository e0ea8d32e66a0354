//! Rule file parser
//!
//! Loads the YAML rule document and lowers it into the node arena. The top
//! level must be a list; each item is a condition map (`condition` plus any
//! of `emit`, `parallel`, `sequence`, `start`, `stop`), a wrapper map, or a
//! bare `emit` map. All structural problems are fatal load errors reported
//! before the engine starts.

use super::{
    CondState, ConditionNode, EmitNode, Node, NodeId, NodeKind, ParallelNode, RuleTree,
    SequenceNode,
};
use crate::expr::{self, Expr};
use crate::signum::SignalMap;
use crate::types::{PolicyError, Result, Value};
use serde::Deserialize;
use std::path::Path;

/// One list item of the rule document, before lowering
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawItem {
    condition: Option<String>,
    start: Option<i64>,
    stop: Option<i64>,
    emit: Option<RawEmit>,
    parallel: Option<Vec<RawItem>>,
    sequence: Option<Vec<RawItem>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEmit {
    signal: String,
    value: serde_yaml::Value,
    delay: Option<i64>,
}

/// Load and lower a rule file
pub fn load_rules(path: &Path, map: &SignalMap) -> Result<RuleTree> {
    log::info!("Loading rule file: {:?}", path);
    let content = std::fs::read_to_string(path)?;
    let tree = parse_rules_str(&content, map)?;
    log::info!("Rule file loaded: {} nodes", tree.len());
    Ok(tree)
}

/// Parse a rule document from a string
pub fn parse_rules_str(content: &str, map: &SignalMap) -> Result<RuleTree> {
    let items: Vec<RawItem> = serde_yaml::from_str(content)
        .map_err(|e| PolicyError::RuleParse(e.to_string()))?;

    let mut tree = RuleTree::default();
    for item in items {
        let id = lower_item(&mut tree, item, None, map)?;
        tree.roots.push(id);
    }
    Ok(tree)
}

fn lower_item(
    tree: &mut RuleTree,
    item: RawItem,
    parent: Option<NodeId>,
    map: &SignalMap,
) -> Result<NodeId> {
    if let Some(condition_text) = item.condition.clone() {
        return lower_condition(tree, condition_text, item, parent, map);
    }

    if item.start.is_some() || item.stop.is_some() {
        return Err(PolicyError::RuleParse(
            "'start'/'stop' are only valid on a condition".to_string(),
        ));
    }

    match (item.parallel, item.sequence, item.emit) {
        (Some(children), None, None) => lower_wrapper(tree, "parallel", children, parent, map),
        (None, Some(children), None) => lower_wrapper(tree, "sequence", children, parent, map),
        (None, None, Some(emit)) => lower_emit(tree, emit, parent, map),
        (None, None, None) => Err(PolicyError::RuleParse(
            "rule item has no condition, wrapper or emit".to_string(),
        )),
        _ => Err(PolicyError::RuleParse(
            "rule item mixes wrapper and emit keywords without a condition".to_string(),
        )),
    }
}

fn lower_condition(
    tree: &mut RuleTree,
    text: String,
    item: RawItem,
    parent: Option<NodeId>,
    map: &SignalMap,
) -> Result<NodeId> {
    let expr = expr::parser::parse(&text)?;
    let operands: Vec<String> = expr.operands().into_iter().collect();
    for name in &operands {
        if !map.contains(name) {
            return Err(PolicyError::UnknownSignal(name.clone()));
        }
    }

    let start_ms = validate_timing("start", item.start)?;
    let stop_ms = validate_timing("stop", item.stop)?;

    let id = tree.push(Node {
        parent,
        kind: NodeKind::Condition(ConditionNode {
            text,
            expr,
            operands,
            start_ms,
            stop_ms,
            children: Vec::new(),
            emits: Vec::new(),
            state: CondState::default(),
        }),
    });

    if let Some(emit) = item.emit {
        let emit_id = lower_emit(tree, emit, Some(id), map)?;
        if let Some(c) = tree.condition_mut(id) {
            c.emits.push(emit_id);
        }
    }
    if let Some(children) = item.parallel {
        let wrapper = lower_wrapper(tree, "parallel", children, Some(id), map)?;
        if let Some(c) = tree.condition_mut(id) {
            c.children.push(wrapper);
        }
    }
    if let Some(children) = item.sequence {
        let wrapper = lower_wrapper(tree, "sequence", children, Some(id), map)?;
        if let Some(c) = tree.condition_mut(id) {
            c.children.push(wrapper);
        }
    }

    Ok(id)
}

fn lower_wrapper(
    tree: &mut RuleTree,
    keyword: &str,
    children: Vec<RawItem>,
    parent: Option<NodeId>,
    map: &SignalMap,
) -> Result<NodeId> {
    let id = tree.push(Node {
        parent,
        kind: match keyword {
            "parallel" => NodeKind::Parallel(ParallelNode {
                children: Vec::new(),
                armed: false,
                done: false,
            }),
            _ => NodeKind::Sequence(SequenceNode {
                children: Vec::new(),
                cursor: 0,
                armed: false,
                done: false,
            }),
        },
    });

    let mut child_ids = Vec::new();
    for child in children {
        // wrappers contain only condition nodes or further wrappers
        if child.condition.is_none() && child.emit.is_some() {
            return Err(PolicyError::IllegalChild {
                wrapper: keyword.to_string(),
                child: "emit".to_string(),
            });
        }
        child_ids.push(lower_item(tree, child, Some(id), map)?);
    }

    match tree.node_mut(id).map(|n| &mut n.kind) {
        Some(NodeKind::Parallel(p)) => p.children = child_ids,
        Some(NodeKind::Sequence(s)) => s.children = child_ids,
        _ => {}
    }

    Ok(id)
}

fn lower_emit(
    tree: &mut RuleTree,
    emit: RawEmit,
    parent: Option<NodeId>,
    map: &SignalMap,
) -> Result<NodeId> {
    if !map.contains(&emit.signal) {
        return Err(PolicyError::UnknownSignal(emit.signal));
    }

    let value = lower_emit_value(emit.value, map)?;

    let delay_ms = match emit.delay {
        None => 0,
        Some(d) if d >= 0 => d as u64,
        Some(d) => {
            return Err(PolicyError::InvalidTiming(format!(
                "emit delay must be non-negative, got {}",
                d
            )))
        }
    };

    Ok(tree.push(Node {
        parent,
        kind: NodeKind::Emit(EmitNode {
            signal: emit.signal,
            value,
            delay_ms,
        }),
    }))
}

/// Emit values are expressions evaluated at fire time. YAML scalars lower
/// to literals directly; YAML strings are parsed with the condition
/// grammar, so `value: "speed + 1"` is arithmetic and a string payload is
/// written quoted, e.g. `value: "'reverse'"`.
fn lower_emit_value(raw: serde_yaml::Value, map: &SignalMap) -> Result<Expr> {
    match raw {
        serde_yaml::Value::Bool(b) => Ok(Expr::Literal(Value::Boolean(b))),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Expr::Literal(Value::Integer(i)))
            } else if let Some(f) = n.as_f64() {
                Ok(Expr::Literal(Value::Float(f)))
            } else {
                Err(PolicyError::RuleParse(format!(
                    "unrepresentable emit value: {:?}",
                    n
                )))
            }
        }
        serde_yaml::Value::String(s) => {
            let expr = expr::parser::parse(&s)?;
            for name in expr.operands() {
                if !map.contains(&name) {
                    return Err(PolicyError::UnknownSignal(name));
                }
            }
            Ok(expr)
        }
        other => Err(PolicyError::RuleParse(format!(
            "emit value must be a scalar or expression string, got {:?}",
            other
        ))),
    }
}

/// Load an initial-state file: a YAML list of `name = value` strings,
/// applied to the store as presets before the rule tree is armed.
pub fn load_initial_state(path: &Path) -> Result<Vec<(String, Value)>> {
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<String> = serde_yaml::from_str(&content)
        .map_err(|e| PolicyError::RuleParse(format!("initial state: {}", e)))?;

    let mut presets = Vec::new();
    for entry in entries {
        let Some((name, literal)) = entry.split_once('=') else {
            return Err(PolicyError::RuleParse(format!(
                "initial state entry '{}' is not of the form 'name = value'",
                entry
            )));
        };
        let value = Value::parse_literal(literal).ok_or_else(|| {
            PolicyError::RuleParse(format!(
                "initial state entry '{}' has an unparseable value",
                entry
            ))
        })?;
        presets.push((name.trim().to_string(), value));
    }
    Ok(presets)
}

fn validate_timing(keyword: &str, value: Option<i64>) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(v) if v >= 0 => Ok(Some(v as u64)),
        Some(v) => Err(PolicyError::InvalidTiming(format!(
            "'{}' must be non-negative, got {}",
            keyword, v
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> SignalMap {
        SignalMap::from_pairs(&[
            ("phone.call", 1),
            ("car.stop", 2),
            ("transmission.gear", 3),
            ("camera.backup.active", 4),
            ("lights.external.headlights", 5),
        ])
    }

    #[test]
    fn test_simple_gate_rule() {
        let yaml = r#"
- condition: "phone.call == 'active'"
  emit:
    signal: car.stop
    value: true
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        assert_eq!(tree.roots().len(), 1);

        let root = tree.condition(tree.roots()[0]).unwrap();
        assert_eq!(root.operands, vec!["phone.call"]);
        assert!(!root.is_monitored());
        assert_eq!(root.emits.len(), 1);

        let emit = tree.emit(root.emits[0]).unwrap();
        assert_eq!(emit.signal, "car.stop");
        assert_eq!(emit.delay_ms, 0);
        assert_eq!(emit.value, Expr::Literal(Value::Boolean(true)));
    }

    #[test]
    fn test_monitored_child_condition() {
        let yaml = r#"
- condition: "transmission.gear == 'reverse'"
  parallel:
    - condition: "camera.backup.active == true"
      start: 200
      stop: 1000
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        let conditions = tree.condition_ids();
        let child = tree.condition(conditions[1]).unwrap();
        assert!(child.is_monitored());
        assert_eq!(child.start_ms, Some(200));
        assert_eq!(child.stop_ms, Some(1000));
    }

    #[test]
    fn test_emit_with_delay() {
        let yaml = r#"
- condition: "camera.backup.active == true"
  emit:
    signal: lights.external.headlights
    value: true
    delay: 2000
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        let root = tree.condition(tree.roots()[0]).unwrap();
        let emit = tree.emit(root.emits[0]).unwrap();
        assert_eq!(emit.delay_ms, 2000);
    }

    #[test]
    fn test_unconditional_emit_at_top_level() {
        let yaml = r#"
- emit:
    signal: car.stop
    value: 1
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        assert!(tree.emit(tree.roots()[0]).is_some());
    }

    #[test]
    fn test_wrapper_rejects_direct_emit() {
        let yaml = r#"
- parallel:
    - emit:
        signal: car.stop
        value: true
"#;
        let err = parse_rules_str(yaml, &map()).unwrap_err();
        assert!(matches!(err, PolicyError::IllegalChild { .. }));
    }

    #[test]
    fn test_unknown_signal_is_fatal() {
        let yaml = r#"
- condition: "nonexistent.signal == 1"
  emit:
    signal: car.stop
    value: true
"#;
        let err = parse_rules_str(yaml, &map()).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownSignal(name) if name == "nonexistent.signal"));
    }

    #[test]
    fn test_unknown_emit_target_is_fatal() {
        let yaml = r#"
- condition: "phone.call == 'active'"
  emit:
    signal: not.mapped
    value: true
"#;
        let err = parse_rules_str(yaml, &map()).unwrap_err();
        assert!(matches!(err, PolicyError::UnknownSignal(_)));
    }

    #[test]
    fn test_negative_timing_is_fatal() {
        let yaml = r#"
- condition: "phone.call == 'active'"
  start: -5
  stop: 100
"#;
        let err = parse_rules_str(yaml, &map()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidTiming(_)));
    }

    #[test]
    fn test_non_list_top_level_is_fatal() {
        let err = parse_rules_str("condition: oops", &map()).unwrap_err();
        assert!(matches!(err, PolicyError::RuleParse(_)));
    }

    #[test]
    fn test_emit_value_expression() {
        let yaml = r#"
- condition: "phone.call == 'active'"
  emit:
    signal: car.stop
    value: "phone.call == 'active'"
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        let root = tree.condition(tree.roots()[0]).unwrap();
        let emit = tree.emit(root.emits[0]).unwrap();
        assert!(matches!(emit.value, Expr::Binary { .. }));
    }

    #[test]
    fn test_emit_string_value_is_quoted_literal() {
        let yaml = r#"
- condition: "phone.call == 'active'"
  emit:
    signal: car.stop
    value: "'halted'"
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        let root = tree.condition(tree.roots()[0]).unwrap();
        let emit = tree.emit(root.emits[0]).unwrap();
        assert_eq!(emit.value, Expr::Literal(Value::Text("halted".to_string())));
    }

    #[test]
    fn test_initial_state_file() {
        use std::io::Write;
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        write!(
            temp_file,
            "- \"phone.call = 'inactive'\"\n- \"wipers.front.on = false\"\n- \"speed = 0\"\n"
        )
        .unwrap();
        temp_file.flush().unwrap();

        let presets = load_initial_state(temp_file.path()).unwrap();
        assert_eq!(
            presets,
            vec![
                ("phone.call".to_string(), Value::Text("inactive".to_string())),
                ("wipers.front.on".to_string(), Value::Boolean(false)),
                ("speed".to_string(), Value::Integer(0)),
            ]
        );
    }

    #[test]
    fn test_nested_sequence_in_condition() {
        let yaml = r#"
- condition: "phone.call == 'active'"
  sequence:
    - condition: "transmission.gear == 'park'"
    - condition: "camera.backup.active == true"
"#;
        let tree = parse_rules_str(yaml, &map()).unwrap();
        let root = tree.condition(tree.roots()[0]).unwrap();
        assert_eq!(root.children.len(), 1);
        match &tree.node(root.children[0]).unwrap().kind {
            NodeKind::Sequence(s) => assert_eq!(s.children.len(), 2),
            other => panic!("expected sequence, got {:?}", other),
        }
    }
}
