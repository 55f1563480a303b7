//! Deep-partial diff between a current state and a target patch.
//!
//! `target` is not a full replacement state: it is a patch tree. Any node
//! set to the [`DELETED`] sentinel marks that path (and everything beneath
//! it) for removal; otherwise `target` describes the desired value, which is
//! compared structurally against the corresponding path in `src`.

use std::collections::VecDeque;

use serde_json::Value;

use crate::path::{Path, Pointer, Segment};

/// Sentinel value used in a target patch to mark a path for deletion. Chosen
/// to be vanishingly unlikely to collide with a real user value.
pub fn deleted() -> Value {
    Value::String("\u{0}__driftctl_deleted__".to_string())
}

fn is_deleted(v: &Value) -> bool {
    matches!(v, Value::String(s) if s == "\u{0}__driftctl_deleted__")
}

/// A single change needed to move `src` toward satisfying `target`.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Create { path: Path, value: Value },
    Update { path: Path, value: Value },
    Delete { path: Path },
}

impl Op {
    pub fn path(&self) -> &Path {
        match self {
            Op::Create { path, .. } => path,
            Op::Update { path, .. } => path,
            Op::Delete { path } => path,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Op::Create { value, .. } => Some(value),
            Op::Update { value, .. } => Some(value),
            Op::Delete { .. } => None,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Op::Create { .. } => OpKind::Create,
            Op::Update { .. } => OpKind::Update,
            Op::Delete { .. } => OpKind::Delete,
        }
    }
}

/// The operation kind, independent of path/value — used for task
/// applicability matching (including the task-side `Any` wildcard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

pub struct Diff;

impl Diff {
    /// Computes the ordered list of operations transforming `src` toward
    /// `target`. Breadth-first over `target`'s shape: shallower paths are
    /// emitted before deeper ones.
    pub fn of(src: &Value, target: &Value) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut queue: VecDeque<(Path, Value)> = VecDeque::new();
        queue.push_back((Path::root(), target.clone()));

        while let Some((path, target_node)) = queue.pop_front() {
            let src_node = Pointer::get(src, &path).ok().flatten();

            if is_deleted(&target_node) {
                match &src_node {
                    None => {}
                    Some(Value::Object(map)) => {
                        // Recurse into the existing subtree rather than
                        // emitting one delete for the whole container, so a
                        // registry keyed at leaf lenses can still match.
                        for k in map.keys() {
                            queue.push_back((path.join(Segment::Key(k.clone())), deleted()));
                        }
                    }
                    Some(_) => {
                        ops.push(Op::Delete { path });
                    }
                }
                continue;
            }

            match src_node {
                None => {
                    ops.push(Op::Create {
                        path,
                        value: target_node,
                    });
                }
                Some(existing) => {
                    if let (Value::Object(target_map), Value::Object(_)) = (&target_node, existing)
                    {
                        // Recurse field-by-field rather than emitting one
                        // update for the whole object, so deletes/creates
                        // inside nested objects are reported individually.
                        for (k, v) in target_map {
                            queue.push_back((path.join(Segment::Key(k.clone())), v.clone()));
                        }
                    } else if !deep_eq(existing, &target_node) {
                        ops.push(Op::Update {
                            path,
                            value: target_node,
                        });
                    }
                }
            }
        }

        ops
    }

    /// Applies `target`'s patch onto `src`, returning the resulting value.
    /// This is the value the planner reads concrete target leaves from.
    pub fn apply(src: &Value, target: &Value) -> Value {
        let mut result = src.clone();
        for op in Diff::of(src, target) {
            match op {
                Op::Create { path, value } | Op::Update { path, value } => {
                    let _ = Pointer::set(&mut result, &path, value);
                }
                Op::Delete { path } => {
                    let _ = Pointer::delete(&mut result, &path);
                }
            }
        }
        result
    }
}

fn deep_eq(a: &Value, b: &Value) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_diff() {
        let s = json!({"a": 1});
        assert!(Diff::of(&s, &s).is_empty());
    }

    #[test]
    fn test_create_missing_key() {
        let s = json!({});
        let t = json!({"a": 1});
        let ops = Diff::of(&s, &t);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Create { value, .. } if *value == json!(1)));
    }

    #[test]
    fn test_update_changed_value() {
        let s = json!({"a": 1});
        let t = json!({"a": 2});
        let ops = Diff::of(&s, &t);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Update { value, .. } if *value == json!(2)));
    }

    #[test]
    fn test_delete_sentinel() {
        let s = json!({"a": 1});
        let t = json!({"a": deleted()});
        let ops = Diff::of(&s, &t);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Delete { .. }));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let s = json!({});
        let t = json!({"a": deleted()});
        assert!(Diff::of(&s, &t).is_empty());
    }

    #[test]
    fn test_delete_container_recurses_into_subproperties() {
        let s = json!({"counters": {"a": 1, "b": 2}});
        let t = json!({"counters": deleted()});
        let ops = Diff::of(&s, &t);
        let paths: Vec<_> = ops.iter().map(|o| o.path().to_string_repr()).collect();
        assert_eq!(ops.len(), 2);
        assert!(paths.contains(&"/counters/a".to_string()));
        assert!(paths.contains(&"/counters/b".to_string()));
        assert!(ops.iter().all(|o| matches!(o, Op::Delete { .. })));
    }

    #[test]
    fn test_delete_nested_container_recurses_all_the_way_down() {
        let s = json!({"a": {"b": {"c": 1}}});
        let t = json!({"a": deleted()});
        let ops = Diff::of(&s, &t);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Delete { path } if path.to_string_repr() == "/a/b/c"));
    }

    #[test]
    fn test_nested_object_recurses() {
        let s = json!({"counters": {"a": 0, "b": 0}});
        let t = json!({"counters": {"a": 1}});
        let ops = Diff::of(&s, &t);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].path().to_string_repr(), "/counters/a");
    }

    #[test]
    fn test_shallow_before_deep_ordering() {
        let s = json!({});
        let t = json!({"a": {"b": 1}, "c": 2});
        let ops = Diff::of(&s, &t);
        // both "a" and "c" are creates at depth 1, since src has no "a" at all
        let paths: Vec<_> = ops.iter().map(|o| o.path().to_string_repr()).collect();
        assert!(paths.contains(&"/a".to_string()));
        assert!(paths.contains(&"/c".to_string()));
    }

    #[test]
    fn test_apply_round_trip() {
        let s = json!({"a": 1, "b": 2});
        let t = json!({"a": 5, "c": 9});
        let applied = Diff::apply(&s, &t);
        assert_eq!(applied, json!({"a": 5, "b": 2, "c": 9}));
        assert!(Diff::of(&applied, &t).is_empty());
    }

    #[test]
    fn test_non_object_replacement_is_update() {
        let s = json!({"arr": [1, 2]});
        let t = json!({"arr": [1, 2, 3]});
        let ops = Diff::of(&s, &t);
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Op::Update { .. }));
    }
}
