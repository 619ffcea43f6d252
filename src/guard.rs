//! Write-time value sanitization.
//!
//! The physical store only accepts [`Value`] trees. Everything an application
//! hands to `set` goes through [`SerializationGuard::sanitize`] first, which:
//!
//! 1. walks the [`Node`] graph depth-first, emitting each container once and
//!    omitting repeated references (cycles included), host objects, callables
//!    and over-deep nesting (dropped from objects, `null` inside arrays);
//! 2. applies the partition's [`CompactionPolicy`]: proactive retention, then
//!    the size ceiling with overflow retention and blob stripping.
//!
//! Omissions never fail a write. The only error is
//! [`SerializationError::SizeExceeded`] for payloads that cannot be brought
//! under the ceiling.

use std::collections::HashSet;
use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::config::{CompactionPolicy, GuardConfig};
use crate::error::SerializationError;
use crate::node::Node;
use crate::value::Value;

/// Why a value was compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// The partition keeps a bounded number of array elements.
    Retention,
    /// The encoded value exceeded the partition's size ceiling.
    SizeCeiling,
}

/// What compaction did to an array payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction {
    pub reason: CompactionReason,
    pub original_len: usize,
    pub retained: usize,
    pub blobs_stripped: usize,
}

/// Output of the guard: a storable value plus what was changed to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub value: Value,
    pub omissions: Vec<SerializationError>,
    pub compaction: Option<Compaction>,
    pub encoded_len: usize,
}

impl Sanitized {
    /// True when the stored value is exactly what the caller provided.
    #[must_use]
    pub fn is_lossless(&self) -> bool {
        self.omissions.is_empty() && self.compaction.is_none()
    }
}

/// Sanitizes values before they cross the storage boundary.
#[derive(Debug, Clone, Default)]
pub struct SerializationGuard {
    config: GuardConfig,
}

impl SerializationGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Turns `node` into a storable value for `partition`.
    ///
    /// # Errors
    /// `SizeExceeded` when the value is over the partition's ceiling and is not
    /// an array, or is still over the ceiling after compaction. A value that
    /// is not an array is rejected as soon as the walk passes the ceiling, so
    /// the reported size may be smaller than the full encoding.
    pub fn sanitize(&self, partition: &str, node: &Node) -> Result<Sanitized, SerializationError> {
        let policy = self.config.policy_for(partition);
        // Arrays can still be compacted under the ceiling; anything else is
        // rejected as soon as the emitted size passes it.
        let budget = (!matches!(node, Node::Array(_))).then_some(policy.max_bytes);
        let mut walker = Walker {
            max_depth: self.config.max_depth,
            seen: HashSet::new(),
            path: Vec::new(),
            omissions: Vec::new(),
            emitted: 0,
            budget,
        };
        let value = match walker.visit(node, 0) {
            Ok(value) => value.unwrap_or(Value::Null),
            Err(e) => {
                warn!(partition, error = %e, "value over size ceiling, sanitizing stopped early");
                return Err(e);
            }
        };
        let omissions = walker.omissions;

        if !omissions.is_empty() {
            debug!(partition, omitted = omissions.len(), "sanitizer omitted unstorable nodes");
        }

        let (value, compaction, encoded_len) = compact(value, policy, partition)?;

        Ok(Sanitized {
            value,
            omissions,
            compaction,
            encoded_len,
        })
    }
}

enum Segment {
    Key(String),
    Index(usize),
}

struct Walker {
    max_depth: usize,
    /// Every container emitted so far. A container is emitted once; a second
    /// reference to it, cyclic or not, is omitted.
    seen: HashSet<usize>,
    path: Vec<Segment>,
    omissions: Vec<SerializationError>,
    /// Lower bound of the encoded size of what has been emitted.
    emitted: usize,
    budget: Option<usize>,
}

type Visited = Result<Option<Value>, SerializationError>;

impl Walker {
    fn render_path(&self) -> String {
        let mut out = String::from("$");
        for seg in &self.path {
            match seg {
                Segment::Key(k) => {
                    let _ = write!(out, ".{k}");
                }
                Segment::Index(i) => {
                    let _ = write!(out, "[{i}]");
                }
            }
        }
        out
    }

    fn charge(&mut self, bytes: usize) -> Result<(), SerializationError> {
        self.emitted += bytes;
        match self.budget {
            Some(limit) if self.emitted > limit => Err(SerializationError::SizeExceeded {
                size: self.emitted,
                limit,
            }),
            _ => Ok(()),
        }
    }

    fn emit(&mut self, value: Value, bytes: usize) -> Visited {
        self.charge(bytes)?;
        Ok(Some(value))
    }

    fn omit_unsupported(&mut self, type_name: String) -> Visited {
        let path = self.render_path();
        self.omissions.push(SerializationError::UnsupportedType { path, type_name });
        Ok(None)
    }

    fn omit_repeat(&mut self) -> Visited {
        let path = self.render_path();
        self.omissions.push(SerializationError::CyclicReference { path });
        Ok(None)
    }

    /// `Ok(None)` when the node must be omitted. Fails only when the budget
    /// runs out.
    fn visit(&mut self, node: &Node, depth: usize) -> Visited {
        match node {
            Node::Null => self.emit(Value::Null, 4),
            Node::Bool(v) => self.emit(Value::Bool(*v), 4),
            Node::Int(v) => self.emit(Value::Int(*v), 1),
            Node::Float(v) if v.is_finite() => self.emit(Value::Float(*v), 1),
            Node::Float(_) => self.emit(Value::Null, 4),
            Node::String(v) => self.emit(Value::String(v.clone()), v.len() + 2),
            Node::Foreign { type_name } => self.omit_unsupported(type_name.clone()),
            Node::Callable { name } => self.omit_unsupported(format!("callable '{name}'")),
            Node::Array(shared) => {
                if depth >= self.max_depth {
                    return self.omit_unsupported(format!("array nested deeper than {}", self.max_depth));
                }
                if !self.seen.insert(shared.identity()) {
                    return self.omit_repeat();
                }
                let items = shared.read();
                // Brackets and separators.
                self.charge(items.len().max(1) + 1)?;
                let mut out = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    self.path.push(Segment::Index(idx));
                    let value = self.visit(item, depth + 1)?;
                    self.path.pop();
                    out.push(value.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(out)))
            }
            Node::Object(shared) => {
                if depth >= self.max_depth {
                    return self.omit_unsupported(format!("object nested deeper than {}", self.max_depth));
                }
                if !self.seen.insert(shared.identity()) {
                    return self.omit_repeat();
                }
                let fields = shared.read();
                self.charge(2)?;
                let mut out = std::collections::BTreeMap::new();
                for (key, field) in fields.iter() {
                    self.path.push(Segment::Key(key.clone()));
                    let value = self.visit(field, depth + 1)?;
                    self.path.pop();
                    if let Some(v) = value {
                        // `"key":`
                        self.charge(key.len() + 3)?;
                        out.insert(key.clone(), v);
                    }
                }
                Ok(Some(Value::Object(out)))
            }
        }
    }
}

fn compact(
    mut value: Value,
    policy: &CompactionPolicy,
    partition: &str,
) -> Result<(Value, Option<Compaction>, usize), SerializationError> {
    let mut compaction = None;

    if let (Some(limit), Value::Array(items)) = (policy.retain_last, &mut value) {
        if items.len() > limit {
            let original_len = items.len();
            items.drain(..original_len - limit);
            compaction = Some(Compaction {
                reason: CompactionReason::Retention,
                original_len,
                retained: limit,
                blobs_stripped: 0,
            });
        }
    }

    let size = value.encoded_len();
    if size <= policy.max_bytes {
        return Ok((value, compaction, size));
    }

    let Value::Array(items) = &mut value else {
        return Err(SerializationError::SizeExceeded {
            size,
            limit: policy.max_bytes,
        });
    };

    let original_len = compaction.as_ref().map_or(items.len(), |c| c.original_len);
    if items.len() > policy.overflow_retain_last {
        let excess = items.len() - policy.overflow_retain_last;
        items.drain(..excess);
    }
    let blobs_stripped = if policy.strip_blobs {
        items
            .iter_mut()
            .map(|item| strip_blobs(item, &policy.blob_prefix, &policy.blob_placeholder))
            .sum()
    } else {
        0
    };
    let retained = items.len();

    let compacted_size = value.encoded_len();
    if compacted_size > policy.max_bytes {
        return Err(SerializationError::SizeExceeded {
            size: compacted_size,
            limit: policy.max_bytes,
        });
    }

    warn!(
        partition,
        original_len,
        retained,
        blobs_stripped,
        size_before = size,
        size_after = compacted_size,
        "compacted oversized array payload"
    );

    Ok((
        value,
        Some(Compaction {
            reason: CompactionReason::SizeCeiling,
            original_len,
            retained,
            blobs_stripped,
        }),
        compacted_size,
    ))
}

/// Replaces blob strings anywhere inside `value`; returns how many were replaced.
fn strip_blobs(value: &mut Value, prefix: &str, placeholder: &str) -> usize {
    match value {
        Value::String(s) if s.starts_with(prefix) => {
            *s = placeholder.to_string();
            1
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|v| strip_blobs(v, prefix, placeholder))
            .sum(),
        Value::Object(fields) => fields
            .values_mut()
            .map(|v| strip_blobs(v, prefix, placeholder))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SerializationGuard {
        SerializationGuard::default()
    }

    fn message(id: i64, blob_len: usize) -> Node {
        Node::object([
            ("id", Node::from(id)),
            ("content", Node::from(format!("data:image/png;base64,{}", "A".repeat(blob_len)))),
            ("sender", Node::from("user")),
        ])
    }

    #[test]
    fn test_plain_value_passes_unchanged() {
        let value = Value::from(serde_json::json!({"theme": "dark", "fonts": [12, 14], "ratio": 0.5}));
        let out = guard().sanitize("settings", &Node::from(value.clone())).unwrap();
        assert_eq!(out.value, value);
        assert!(out.is_lossless());
        assert_eq!(out.encoded_len, value.encoded_len());
    }

    #[test]
    fn test_self_reference_is_omitted() {
        let note = Node::object([("title", Node::from("n1"))]);
        note.object_handle().unwrap().write().insert("me".to_string(), note.clone());

        let out = guard().sanitize("notes", &note).unwrap();
        assert_eq!(out.value, Value::from(serde_json::json!({"title": "n1"})));
        assert_eq!(
            out.omissions,
            vec![SerializationError::CyclicReference { path: "$.me".to_string() }]
        );
    }

    #[test]
    fn test_indirect_cycle_inside_array_becomes_null() {
        let parent = Node::object([("name", Node::from("parent"))]);
        let child = Node::object([("parent", parent.clone())]);
        let children = Node::array(vec![child, Node::from(7)]);
        parent.object_handle().unwrap().write().insert("children".to_string(), children);

        let out = guard().sanitize("misc", &parent).unwrap();
        let expected = serde_json::json!({
            "name": "parent",
            "children": [{}, 7]
        });
        assert_eq!(out.value, Value::from(expected));
        assert!(matches!(
            &out.omissions[0],
            SerializationError::CyclicReference { path } if path == "$.children[0].parent"
        ));
    }

    #[test]
    fn test_repeated_reference_is_emitted_once() {
        let avatar = Node::object([("url", Node::from("a.png"))]);
        let pair = Node::object([("from", avatar.clone()), ("to", avatar)]);

        let out = guard().sanitize("misc", &pair).unwrap();
        assert_eq!(out.value, Value::from(serde_json::json!({"from": {"url": "a.png"}})));
        assert_eq!(
            out.omissions,
            vec![SerializationError::CyclicReference { path: "$.to".to_string() }]
        );
    }

    #[test]
    fn test_deep_shared_graph_is_walked_once() {
        let mut node = Node::from(1);
        for _ in 0..30 {
            node = Node::object([("l", node.clone()), ("r", node)]);
        }

        let out = guard().sanitize("misc", &node).unwrap();
        // Every level but the innermost repeats its left child on the right.
        assert_eq!(out.omissions.len(), 29);
        let mut depth = 0;
        let mut cursor = &out.value;
        while let Some(next) = cursor.get("l") {
            assert!(cursor.get("r").is_none() || depth == 29);
            cursor = next;
            depth += 1;
        }
        assert_eq!(depth, 30);
    }

    #[test]
    fn test_oversized_object_stops_walk_early() {
        let policy = CompactionPolicy {
            max_bytes: 1024,
            ..CompactionPolicy::default()
        };
        let config = GuardConfig::default().with_policy("settings", policy);
        let fields: serde_json::Map<String, serde_json::Value> =
            (0..100).map(|i| (format!("field{i:03}"), serde_json::Value::from("x".repeat(100)))).collect();
        let value = Value::from(serde_json::Value::Object(fields));
        let full_len = value.encoded_len();

        let err = SerializationGuard::new(config).sanitize("settings", &Node::from(value)).unwrap_err();
        match err {
            SerializationError::SizeExceeded { size, limit } => {
                assert_eq!(limit, 1024);
                assert!(size > 1024);
                assert!(size < full_len / 2);
            }
            other => panic!("expected SizeExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_and_callable_nodes_are_omitted() {
        let node = Node::object([
            ("text", Node::from("hello")),
            ("event", Node::foreign("PointerEvent")),
            ("onClick", Node::callable("handler")),
            ("list", Node::array(vec![Node::foreign("HTMLElement"), Node::from(1)])),
        ]);

        let out = guard().sanitize("messages", &node).unwrap();
        assert_eq!(
            out.value,
            Value::from(serde_json::json!({"text": "hello", "list": [null, 1]}))
        );
        assert_eq!(out.omissions.len(), 3);
        assert!(out.omissions.iter().all(|e| matches!(e, SerializationError::UnsupportedType { .. })));
    }

    #[test]
    fn test_top_level_foreign_becomes_null() {
        let out = guard().sanitize("misc", &Node::foreign("Window")).unwrap();
        assert_eq!(out.value, Value::Null);
        assert_eq!(out.omissions.len(), 1);
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        let node = Node::array(vec![Node::from(f64::NAN), Node::from(1.5)]);
        let out = guard().sanitize("misc", &node).unwrap();
        assert_eq!(out.value, Value::Array(vec![Value::Null, Value::Float(1.5)]));
    }

    #[test]
    fn test_depth_limit_omits_deep_nodes() {
        let config = GuardConfig {
            max_depth: 2,
            ..GuardConfig::default()
        };
        let deep = Node::object([("a", Node::object([("b", Node::object([("c", Node::from(1))]))]))]);
        let out = SerializationGuard::new(config).sanitize("misc", &deep).unwrap();
        assert_eq!(out.value, Value::from(serde_json::json!({"a": {}})));
        assert_eq!(out.omissions.len(), 1);
    }

    #[test]
    fn test_proactive_retention_keeps_most_recent() {
        let config = GuardConfig::default().with_policy(
            "feed",
            CompactionPolicy {
                retain_last: Some(3),
                ..CompactionPolicy::default()
            },
        );
        let items = Node::array((0..10).map(Node::from).collect());
        let out = SerializationGuard::new(config).sanitize("feed", &items).unwrap();

        assert_eq!(
            out.value,
            Value::Array((7..10).map(Value::Int).collect())
        );
        let compaction = out.compaction.unwrap();
        assert_eq!(compaction.reason, CompactionReason::Retention);
        assert_eq!(compaction.original_len, 10);
        assert_eq!(compaction.retained, 3);
    }

    #[test]
    fn test_oversized_array_is_compacted_and_stripped() {
        let policy = CompactionPolicy {
            max_bytes: 64 * 1024,
            overflow_retain_last: 300,
            ..CompactionPolicy::default()
        };
        let config = GuardConfig::default().with_policy("list", policy);
        let chats = Node::array((0..500).map(|i| message(i, 2_000)).collect());

        let out = SerializationGuard::new(config).sanitize("list", &chats).unwrap();
        let items = out.value.as_array().unwrap();
        assert_eq!(items.len(), 300);
        assert_eq!(items[0].get("id"), Some(&Value::Int(200)));
        assert_eq!(items[299].get("content"), Some(&Value::from("[blob removed]")));

        let compaction = out.compaction.unwrap();
        assert_eq!(compaction.reason, CompactionReason::SizeCeiling);
        assert_eq!(compaction.original_len, 500);
        assert_eq!(compaction.blobs_stripped, 300);
        assert!(out.encoded_len <= 64 * 1024);
    }

    #[test]
    fn test_oversized_object_is_rejected() {
        let policy = CompactionPolicy {
            max_bytes: 1024,
            ..CompactionPolicy::default()
        };
        let config = GuardConfig::default().with_policy("settings", policy);
        let big = Node::object([("blob", Node::from("x".repeat(4096)))]);

        let err = SerializationGuard::new(config).sanitize("settings", &big).unwrap_err();
        assert!(matches!(err, SerializationError::SizeExceeded { limit: 1024, .. }));
    }

    #[test]
    fn test_array_still_too_large_after_compaction_is_rejected() {
        let policy = CompactionPolicy {
            max_bytes: 1024,
            overflow_retain_last: 10,
            strip_blobs: false,
            ..CompactionPolicy::default()
        };
        let config = GuardConfig::default().with_policy("list", policy);
        let items = Node::array((0..50).map(|i| message(i, 500)).collect());

        let err = SerializationGuard::new(config).sanitize("list", &items).unwrap_err();
        assert!(matches!(err, SerializationError::SizeExceeded { .. }));
    }
}
