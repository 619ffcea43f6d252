//! The legacy flat key-value area.
//!
//! Before the partitioned store existed, every record lived in one flat
//! string-to-string map. That area stays around as a read-only fallback:
//! migration copies it once, the tiered store reads from it on a miss, and
//! nothing ever writes to it again.
//!
//! [`LegacyLayout`] is the deterministic mapping from legacy keys to
//! `(partition, key)` addresses, plus how each raw string is parsed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::diagnostics::{LegacyKeyUsage, LegacyUsage};
use crate::value::Value;

/// Read-only view of the legacy area.
pub trait LegacySource: Send + Sync {
    fn keys(&self) -> Vec<String>;

    fn get(&self, key: &str) -> Option<String>;
}

/// Legacy area held in memory.
#[derive(Debug, Default)]
pub struct MemoryLegacyStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record. The legacy area is read-only to kyrokv; this is for
    /// the embedding application and tests.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MemoryLegacyStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: RwLock::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }
}

impl LegacySource for MemoryLegacyStore {
    fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Legacy area exported to a JSON object file.
///
/// String members are the raw legacy values; any other member is kept as its
/// JSON text.
#[derive(Debug)]
pub struct FileLegacyStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileLegacyStore {
    /// Loads an export file.
    ///
    /// # Errors
    /// `InvalidData` if the file is not a JSON object.
    pub fn open(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let document: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        let serde_json::Value::Object(members) = document else {
            return Err(IoError::new(ErrorKind::InvalidData, "legacy export must be a JSON object"));
        };

        let entries: BTreeMap<_, _> = members
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(raw) => (key, raw),
                other => (key, other.to_string()),
            })
            .collect();
        debug!(path = %path.display(), keys = entries.len(), "legacy export loaded");

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LegacySource for FileLegacyStore {
    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// How a raw legacy string becomes a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Must be valid JSON.
    Json,
    /// Kept as a string.
    Raw,
    /// JSON if it parses, the raw string otherwise.
    JsonOrRaw,
}

/// Parses a legacy value.
///
/// # Errors
/// The JSON parser's message when `mode` is `Json` and `raw` is not JSON.
pub fn parse_legacy(raw: &str, mode: ParseMode) -> Result<Value, String> {
    match mode {
        ParseMode::Raw => Ok(Value::from(raw)),
        ParseMode::Json => serde_json::from_str::<serde_json::Value>(raw)
            .map(Value::from)
            .map_err(|e| e.to_string()),
        ParseMode::JsonOrRaw => Ok(serde_json::from_str::<serde_json::Value>(raw)
            .map_or_else(|_| Value::from(raw), Value::from)),
    }
}

/// What happens to a legacy key matched by a prefix rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// `messages_42` becomes `42`.
    Strip,
    /// The legacy key is used unchanged.
    Keep,
}

/// Where a legacy record goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub partition: String,
    pub key: String,
    pub parse: ParseMode,
}

#[derive(Debug, Clone)]
enum Rule {
    Exact {
        legacy_key: String,
        partition: String,
        key: String,
        parse: ParseMode,
    },
    Prefix {
        prefix: String,
        partition: String,
        strategy: KeyStrategy,
        parse: ParseMode,
    },
}

/// Mapping from legacy keys to partitioned addresses.
///
/// Exact rules win over prefix rules; among prefixes the longest match wins.
#[derive(Debug, Clone, Default)]
pub struct LegacyLayout {
    rules: Vec<Rule>,
}

impl LegacyLayout {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn exact(
        mut self,
        legacy_key: impl Into<String>,
        partition: impl Into<String>,
        key: impl Into<String>,
        parse: ParseMode,
    ) -> Self {
        self.rules.push(Rule::Exact {
            legacy_key: legacy_key.into(),
            partition: partition.into(),
            key: key.into(),
            parse,
        });
        self
    }

    /// Maps a legacy key onto a partition under the same key.
    #[must_use]
    pub fn same_key(self, legacy_key: &str, partition: &str, parse: ParseMode) -> Self {
        self.exact(legacy_key, partition, legacy_key, parse)
    }

    #[must_use]
    pub fn prefix(
        mut self,
        prefix: impl Into<String>,
        partition: impl Into<String>,
        strategy: KeyStrategy,
        parse: ParseMode,
    ) -> Self {
        self.rules.push(Rule::Prefix {
            prefix: prefix.into(),
            partition: partition.into(),
            strategy,
            parse,
        });
        self
    }

    /// Target address of a legacy key, or `None` if no rule covers it.
    pub fn resolve(&self, legacy_key: &str) -> Option<Target> {
        let exact = self.rules.iter().find_map(|rule| match rule {
            Rule::Exact {
                legacy_key: k,
                partition,
                key,
                parse,
            } if k == legacy_key => Some(Target {
                partition: partition.clone(),
                key: key.clone(),
                parse: *parse,
            }),
            _ => None,
        });
        if exact.is_some() {
            return exact;
        }

        self.rules
            .iter()
            .filter_map(|rule| match rule {
                Rule::Prefix {
                    prefix,
                    partition,
                    strategy,
                    parse,
                } => {
                    let rest = legacy_key.strip_prefix(prefix.as_str())?;
                    if rest.is_empty() {
                        return None;
                    }
                    let key = match strategy {
                        KeyStrategy::Strip => rest.to_string(),
                        KeyStrategy::Keep => legacy_key.to_string(),
                    };
                    Some((
                        prefix.len(),
                        Target {
                            partition: partition.clone(),
                            key,
                            parse: *parse,
                        },
                    ))
                }
                Rule::Exact { .. } => None,
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, target)| target)
    }

    /// The legacy key that maps to `(partition, key)`, if any.
    pub fn reverse(&self, partition: &str, key: &str) -> Option<String> {
        let candidates = self.rules.iter().filter_map(|rule| match rule {
            Rule::Exact {
                legacy_key,
                partition: p,
                key: k,
                ..
            } if p == partition && k == key => Some(legacy_key.clone()),
            Rule::Prefix {
                prefix,
                partition: p,
                strategy,
                ..
            } if p == partition => match strategy {
                KeyStrategy::Strip => Some(format!("{prefix}{key}")),
                KeyStrategy::Keep if key.starts_with(prefix.as_str()) => Some(key.to_string()),
                KeyStrategy::Keep => None,
            },
            _ => None,
        });

        // A candidate only counts if it resolves back to the same address.
        candidates.into_iter().find(|legacy_key| {
            self.resolve(legacy_key)
                .is_some_and(|t| t.partition == partition && t.key == key)
        })
    }

    /// Partitions any rule writes to.
    pub fn partitions(&self) -> BTreeSet<&str> {
        self.rules
            .iter()
            .map(|rule| match rule {
                Rule::Exact { partition, .. } | Rule::Prefix { partition, .. } => partition.as_str(),
            })
            .collect()
    }
}

/// Layout of the application's legacy area.
pub fn default_layout() -> LegacyLayout {
    let mut layout = LegacyLayout::new()
        .prefix("messages_", "messages", KeyStrategy::Strip, ParseMode::Json)
        .same_key("moments", "moments", ParseMode::Json)
        .same_key("characters", "characters", ParseMode::Json)
        .same_key("userInfo", "userInfo", ParseMode::Json)
        .exact("wallet_balance", "wallet", "balance", ParseMode::Raw)
        .exact("wallet_transactions", "wallet", "transactions", ParseMode::Json)
        .same_key("intimate_pay_relations", "wallet", ParseMode::Json)
        .prefix("wallpaper_", "settings", KeyStrategy::Keep, ParseMode::Json);

    for key in ["unread_counts", "notified_messages", "chatList", "apiSettings"] {
        layout = layout.same_key(key, "settings", ParseMode::Json);
    }
    for key in [
        "blacklist",
        "couple_space_relations",
        "couple_space_privacy",
        "couple_space_photos",
        "couple_space_messages",
        "couple_space_anniversaries",
        "ai_interaction_memory",
        "lastMomentsCheckTime",
    ] {
        layout = layout.same_key(key, "misc", ParseMode::JsonOrRaw);
    }
    layout
}

/// Estimates the footprint of every legacy key, largest first.
///
/// The legacy area stores UTF-16 text, so a key costs two bytes per unit of
/// key plus value.
pub fn analyze(source: &dyn LegacySource) -> LegacyUsage {
    let mut keys: Vec<LegacyKeyUsage> = source
        .keys()
        .into_iter()
        .map(|key| {
            let value_len = source.get(&key).map_or(0, |v| v.encode_utf16().count());
            let bytes = ((key.encode_utf16().count() + value_len) * 2) as u64;
            LegacyKeyUsage { key, bytes }
        })
        .collect();
    keys.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.key.cmp(&b.key)));
    let total_bytes = keys.iter().map(|k| k.bytes).sum();
    LegacyUsage { keys, total_bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_prefixes() {
        let layout = default_layout();

        let target = layout.resolve("messages_42").unwrap();
        assert_eq!(target.partition, "messages");
        assert_eq!(target.key, "42");
        assert_eq!(target.parse, ParseMode::Json);

        let target = layout.resolve("wallpaper_chat_7").unwrap();
        assert_eq!(target.partition, "settings");
        assert_eq!(target.key, "wallpaper_chat_7");

        assert!(layout.resolve("messages_").is_none());
        assert!(layout.resolve("unknown_key").is_none());
    }

    #[test]
    fn test_default_layout_exact_keys() {
        let layout = default_layout();

        let balance = layout.resolve("wallet_balance").unwrap();
        assert_eq!((balance.partition.as_str(), balance.key.as_str()), ("wallet", "balance"));
        assert_eq!(balance.parse, ParseMode::Raw);

        assert_eq!(layout.resolve("chatList").unwrap().partition, "settings");
        assert_eq!(layout.resolve("blacklist").unwrap().parse, ParseMode::JsonOrRaw);
    }

    #[test]
    fn test_exact_beats_prefix_and_longest_prefix_wins() {
        let layout = LegacyLayout::new()
            .prefix("a_", "short", KeyStrategy::Strip, ParseMode::Raw)
            .prefix("a_b_", "long", KeyStrategy::Strip, ParseMode::Raw)
            .exact("a_b_c", "exact", "c", ParseMode::Raw);

        assert_eq!(layout.resolve("a_x").unwrap().partition, "short");
        let long = layout.resolve("a_b_x").unwrap();
        assert_eq!((long.partition.as_str(), long.key.as_str()), ("long", "x"));
        assert_eq!(layout.resolve("a_b_c").unwrap().partition, "exact");
    }

    #[test]
    fn test_reverse_mapping() {
        let layout = default_layout();
        assert_eq!(layout.reverse("messages", "42").as_deref(), Some("messages_42"));
        assert_eq!(layout.reverse("wallet", "balance").as_deref(), Some("wallet_balance"));
        assert_eq!(layout.reverse("settings", "chatList").as_deref(), Some("chatList"));
        assert_eq!(layout.reverse("settings", "wallpaper_3").as_deref(), Some("wallpaper_3"));
        assert_eq!(layout.reverse("settings", "__migration_version"), None);
        assert_eq!(layout.reverse("emojis", "x"), None);
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(parse_legacy("100.00", ParseMode::Raw).unwrap(), Value::from("100.00"));
        assert_eq!(parse_legacy("[1,2]", ParseMode::Json).unwrap(), Value::Array(vec![Value::from(1), Value::from(2)]));
        assert!(parse_legacy("{broken", ParseMode::Json).is_err());
        assert_eq!(parse_legacy("1700000000", ParseMode::JsonOrRaw).unwrap(), Value::from(1_700_000_000_i64));
        assert_eq!(parse_legacy("not json", ParseMode::JsonOrRaw).unwrap(), Value::from("not json"));
    }

    #[test]
    fn test_analyze_sorts_largest_first() {
        let source: MemoryLegacyStore = [("a", "x"), ("messages_1", "0123456789")].into_iter().collect();
        let usage = analyze(&source);
        assert_eq!(usage.keys[0].key, "messages_1");
        assert_eq!(usage.keys[0].bytes, 40);
        assert_eq!(usage.keys[1].bytes, 4);
        assert_eq!(usage.total_bytes, 44);
    }

    #[test]
    fn test_file_legacy_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        fs::write(&path, r#"{"chatList": "[1,2]", "wallet_balance": "12.50", "moments": [1]}"#).unwrap();

        let source = FileLegacyStore::open(&path).unwrap();
        assert_eq!(source.keys(), vec!["chatList", "moments", "wallet_balance"]);
        assert_eq!(source.get("chatList").as_deref(), Some("[1,2]"));
        assert_eq!(source.get("moments").as_deref(), Some("[1]"));

        fs::write(&path, "[1, 2]").unwrap();
        let err = FileLegacyStore::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
