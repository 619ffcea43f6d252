//! Snapshot segments.
//!
//! A segment is an immutable file holding a full [`Catalog`] snapshot taken at
//! compaction time. Segments are written to a temporary file and renamed into
//! place, so a crash never leaves a half-written segment behind.
//!
//! - Segments are numbered sequentially (`segment_00001.seg`, ...)
//! - The newest readable segment is the base state; the WAL is replayed on top
//! - Older segments are pruned once a newer one is durable

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::catalog::Catalog;

use super::codec;

/// Segment file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub version: u32,
    pub record_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A finalized segment file.
#[derive(Debug)]
pub struct Segment {
    id: u32,
    path: PathBuf,
}

impl Segment {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_header(&self) -> IoResult<SegmentHeader> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        codec::decode(&mut reader)
    }

    pub fn read_catalog(&self) -> IoResult<Catalog> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        let _header: SegmentHeader = codec::decode(&mut reader)?;
        let mut catalog: Catalog = codec::decode(&mut reader)?;
        catalog.recount();
        Ok(catalog)
    }
}

fn parse_segment_id(path: &Path) -> Option<u32> {
    if path.extension()? != "seg" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("segment_")?
        .parse()
        .ok()
}

/// Writes a segment atomically: temp file, fsync, rename.
pub struct SegmentWriter {
    id: u32,
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
}

impl SegmentWriter {
    fn new(id: u32, final_path: PathBuf) -> Self {
        let temp_path = final_path.with_extension(format!("seg.{}.tmp", Uuid::new_v4()));
        Self {
            id,
            temp_path: Some(temp_path),
            final_path,
        }
    }

    /// Writes `catalog` and commits the segment. After this returns the
    /// segment is durable.
    pub fn write(mut self, catalog: &Catalog) -> IoResult<Segment> {
        let temp_path = self
            .temp_path
            .clone()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment writer already consumed"))?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);

        let header = SegmentHeader {
            version: catalog.version,
            record_count: catalog.partitions.values().map(|t| t.len() as u64).sum(),
            created_at: Utc::now(),
        };
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(catalog)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.final_path)?;
        self.temp_path = None;

        Ok(Segment {
            id: self.id,
            path: self.final_path.clone(),
        })
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // Best-effort cleanup when the write did not complete.
        if let Some(temp_path) = self.temp_path.take() {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

/// Manages the segment directory.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    segments: Vec<Segment>,
    next_segment_id: u32,
}

impl SegmentManager {
    /// Opens or creates the segment directory, removing stale temp files.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        let mut next_segment_id = 1u32;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().is_some_and(|e| e == "tmp") {
                debug!(path = %path.display(), "removing stale segment temp file");
                let _ = fs::remove_file(&path);
                continue;
            }

            if let Some(id) = parse_segment_id(&path) {
                next_segment_id = next_segment_id.max(id + 1);
                segments.push(Segment { id, path });
            }
        }

        segments.sort_by_key(Segment::id);

        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            next_segment_id,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Allocates a writer for the next segment.
    pub fn create_writer(&mut self) -> SegmentWriter {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        SegmentWriter::new(id, self.dir.join(format!("segment_{id:05}.seg")))
    }

    /// Registers a new segment and deletes the ones it supersedes.
    pub fn install(&mut self, segment: Segment) {
        for old in self.segments.drain(..) {
            if let Err(e) = fs::remove_file(old.path()) {
                warn!(path = %old.path().display(), error = %e, "failed to prune old segment");
            }
        }
        self.segments.push(segment);
    }

    /// Loads the newest readable snapshot, if any.
    pub fn load_latest(&self) -> IoResult<Option<Catalog>> {
        for segment in self.segments.iter().rev() {
            match segment.read_catalog() {
                Ok(catalog) => return Ok(Some(catalog)),
                Err(e) => {
                    warn!(path = %segment.path().display(), error = %e, "skipping unreadable segment");
                }
            }
        }
        if self.segments.is_empty() {
            Ok(None)
        } else {
            Err(IoError::new(ErrorKind::InvalidData, "no readable segment found"))
        }
    }
}
