//! Storage usage reports.

use std::fmt;

/// Records and encoded bytes held by one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUsage {
    pub partition: String,
    pub records: usize,
    pub bytes: u64,
}

/// Usage of the partitioned store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub partitions: Vec<PartitionUsage>,
    pub total_records: usize,
    pub total_bytes: u64,
}

impl UsageReport {
    pub fn from_partitions(partitions: Vec<PartitionUsage>) -> Self {
        let total_records = partitions.iter().map(|p| p.records).sum();
        let total_bytes = partitions.iter().map(|p| p.bytes).sum();
        Self {
            partitions,
            total_records,
            total_bytes,
        }
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionUsage> {
        self.partitions.iter().find(|p| p.partition == name)
    }

    /// The partition holding the most bytes.
    pub fn largest(&self) -> Option<&PartitionUsage> {
        self.partitions.iter().max_by_key(|p| p.bytes)
    }
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for usage in &self.partitions {
            writeln!(
                f,
                "{:<20} {:>8} records {:>12}",
                usage.partition,
                usage.records,
                format_size(usage.bytes)
            )?;
        }
        write!(
            f,
            "{:<20} {:>8} records {:>12}",
            "total",
            self.total_records,
            format_size(self.total_bytes)
        )
    }
}

/// Estimated footprint of one legacy key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyKeyUsage {
    pub key: String,
    pub bytes: u64,
}

/// Usage of the legacy area, largest keys first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyUsage {
    pub keys: Vec<LegacyKeyUsage>,
    pub total_bytes: u64,
}

impl LegacyUsage {
    /// Keys above this estimate are reported as large.
    pub const LARGE_KEY_BYTES: u64 = 10_000;

    pub fn large_keys(&self) -> impl Iterator<Item = &LegacyKeyUsage> {
        self.keys.iter().filter(|k| k.bytes > Self::LARGE_KEY_BYTES)
    }
}

/// Formats a byte count for humans: `512 B`, `1.50 KB`, `3.25 MB`.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b < KB => format!("{b} B"),
        b if b < MB => format!("{:.2} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.2} MB", b as f64 / MB as f64),
        b => format!("{:.2} GB", b as f64 / GB as f64),
    }
}
