//! Rule tree
//!
//! The rule file lowers into a flat node arena with index back-links, which
//! keeps the tree owned and acyclic while still allowing child-to-parent
//! walks (ancestor condition snapshots, sequence cursor advancement). The
//! tree structure is built once at load; only the runtime state fields
//! mutate afterwards.

pub mod parser;

use crate::expr::Expr;
use crate::monitor::MonitorRuntime;
use crate::types::Truth;

/// Stable index of a node in the arena
pub type NodeId = usize;

/// A single node in the rule tree
#[derive(Debug)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub enum NodeKind {
    Condition(ConditionNode),
    Parallel(ParallelNode),
    Sequence(SequenceNode),
    Emit(EmitNode),
}

/// A condition with optional monitor timing and child nodes
#[derive(Debug)]
pub struct ConditionNode {
    /// Original expression text, kept for logging
    pub text: String,
    pub expr: Expr,
    /// Signal names the expression reads, sorted and deduplicated
    pub operands: Vec<String>,
    pub start_ms: Option<u64>,
    pub stop_ms: Option<u64>,
    /// Wrapper and condition children, armed on this condition's rising edge
    pub children: Vec<NodeId>,
    /// Emit children, fired on rising edge (plain) or at Satisfied (monitored)
    pub emits: Vec<NodeId>,
    pub state: CondState,
}

impl ConditionNode {
    /// Conditions with start/stop timing are supervised by a monitor
    pub fn is_monitored(&self) -> bool {
        self.start_ms.is_some() || self.stop_ms.is_some()
    }
}

/// Runtime state of a condition node
#[derive(Debug, Default)]
pub struct CondState {
    /// True while every ancestor condition holds
    pub armed: bool,
    pub truth: Truth,
    /// Completed (went true / reached Satisfied) since last arming
    pub done: bool,
    pub monitor: Option<MonitorRuntime>,
}

/// Children evaluate independently
#[derive(Debug)]
pub struct ParallelNode {
    pub children: Vec<NodeId>,
    pub armed: bool,
    pub done: bool,
}

/// Child `i` is armed only once children `0..i` have each completed
#[derive(Debug)]
pub struct SequenceNode {
    pub children: Vec<NodeId>,
    /// Index of the next child to complete; only this child is evaluated
    pub cursor: usize,
    pub armed: bool,
    pub done: bool,
}

/// A stateless emission producer
#[derive(Debug)]
pub struct EmitNode {
    pub signal: String,
    pub value: Expr,
    pub delay_ms: u64,
}

/// The loaded rule tree: a node arena plus the top-level node list
#[derive(Debug, Default)]
pub struct RuleTree {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
}

impl RuleTree {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn condition(&self, id: NodeId) -> Option<&ConditionNode> {
        match self.nodes.get(id)?.kind {
            NodeKind::Condition(ref c) => Some(c),
            _ => None,
        }
    }

    pub fn condition_mut(&mut self, id: NodeId) -> Option<&mut ConditionNode> {
        match self.nodes.get_mut(id)?.kind {
            NodeKind::Condition(ref mut c) => Some(c),
            _ => None,
        }
    }

    pub fn emit(&self, id: NodeId) -> Option<&EmitNode> {
        match self.nodes.get(id)?.kind {
            NodeKind::Emit(ref e) => Some(e),
            _ => None,
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All condition node ids in arena (pre-)order
    pub fn condition_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|id| matches!(self.nodes[*id].kind, NodeKind::Condition(_)))
            .collect()
    }

    /// Ancestor condition nodes of `id`, nearest first, excluding `id`
    pub fn ancestor_conditions(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent);
        while let Some(ancestor) = current {
            if matches!(self.nodes[ancestor].kind, NodeKind::Condition(_)) {
                out.push(ancestor);
            }
            current = self.nodes[ancestor].parent;
        }
        out
    }

    /// Non-emit children of a node (the ones that carry activation state)
    pub fn child_nodes(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::Condition(c) => c.children.clone(),
            NodeKind::Parallel(p) => p.children.clone(),
            NodeKind::Sequence(s) => s.children.clone(),
            NodeKind::Emit(_) => Vec::new(),
        }
    }

    /// All emit node ids in the subtree rooted at `id`, including the
    /// node's own emit children
    pub fn emit_descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match &self.nodes[current].kind {
                NodeKind::Emit(_) => out.push(current),
                NodeKind::Condition(c) => {
                    out.extend(&c.emits);
                    stack.extend(&c.children);
                }
                NodeKind::Parallel(p) => stack.extend(&p.children),
                NodeKind::Sequence(s) => stack.extend(&s.children),
            }
        }
        out
    }

    /// Stable reference to a node: kind and child index at each level from
    /// the root, e.g. `condition#0/sequence#0/condition#1`
    pub fn path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let node = &self.nodes[current];
            let kind = match node.kind {
                NodeKind::Condition(_) => "condition",
                NodeKind::Parallel(_) => "parallel",
                NodeKind::Sequence(_) => "sequence",
                NodeKind::Emit(_) => "emit",
            };
            let index = match node.parent {
                Some(parent) => self
                    .all_children(parent)
                    .iter()
                    .position(|c| *c == current)
                    .unwrap_or(0),
                None => self.roots.iter().position(|r| *r == current).unwrap_or(0),
            };
            segments.push(format!("{}#{}", kind, index));
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        segments.reverse();
        segments.join("/")
    }

    fn all_children(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id].kind {
            NodeKind::Condition(c) => {
                let mut out = c.children.clone();
                out.extend(&c.emits);
                out
            }
            NodeKind::Parallel(p) => p.children.clone(),
            NodeKind::Sequence(s) => s.children.clone(),
            NodeKind::Emit(_) => Vec::new(),
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signum::SignalMap;

    fn map() -> SignalMap {
        SignalMap::from_pairs(&[
            ("transmission.gear", 1),
            ("camera.backup.active", 2),
            ("car.stop", 3),
            ("ignition", 4),
        ])
    }

    #[test]
    fn test_ancestor_conditions_cross_wrappers() {
        let yaml = r#"
- condition: "transmission.gear == 'reverse'"
  parallel:
    - condition: "camera.backup.active == true"
      emit:
        signal: car.stop
        value: true
"#;
        let tree = parser::parse_rules_str(yaml, &map()).unwrap();
        let conditions = tree.condition_ids();
        assert_eq!(conditions.len(), 2);

        let inner = conditions[1];
        let ancestors = tree.ancestor_conditions(inner);
        assert_eq!(ancestors, vec![conditions[0]]);
        assert_eq!(tree.path(inner), "condition#0/parallel#0/condition#0");
    }

    #[test]
    fn test_emit_descendants() {
        let yaml = r#"
- condition: "transmission.gear == 'reverse'"
  emit:
    signal: car.stop
    value: true
  sequence:
    - condition: "ignition == true"
      emit:
        signal: car.stop
        value: false
"#;
        let tree = parser::parse_rules_str(yaml, &map()).unwrap();
        let root = tree.roots()[0];
        assert_eq!(tree.emit_descendants(root).len(), 2);
    }
}
