//! In-memory sorted index of [`PacketDescriptor`]s with JSON snapshot
//! persistence, binary-search lookup, and filtered queries.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::descriptor::{FeatureFilter, PacketDescriptor, Query, SortDirection};
use crate::error::IndexError;
use crate::event::{self, Event, EventSink};
use crate::variant::Variant;

const SNAPSHOT_VERSION: &str = "2.1";

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    timestamp: String,
    #[serde(rename = "fileOffset")]
    file_offset: String,
    size: u32,
    #[serde(rename = "fileName")]
    file_name: String,
    #[serde(rename = "batchId")]
    batch_id: u32,
    #[serde(rename = "packetIndex")]
    packet_index: u32,
    #[serde(rename = "commandType", default)]
    command_type: u8,
    #[serde(default)]
    sequence: u32,
    #[serde(rename = "isValidHeader", default)]
    is_valid_header: bool,
    #[serde(rename = "commandDesc", default = "default_command_desc")]
    command_desc: String,
}

fn default_command_desc() -> String {
    "unknown".to_string()
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: String,
    timestamp: String,
    entries: Vec<SnapshotEntry>,
}

impl From<&PacketDescriptor> for SnapshotEntry {
    fn from(d: &PacketDescriptor) -> Self {
        SnapshotEntry {
            timestamp: d.timestamp_ns.to_string(),
            file_offset: d.file_offset.to_string(),
            size: d.size,
            file_name: d.file_path.clone(),
            batch_id: d.batch_id,
            packet_index: d.packet_index,
            command_type: d.command_type,
            sequence: d.sequence,
            is_valid_header: d.valid_header,
            command_desc: d.command_description().to_string(),
        }
    }
}

impl SnapshotEntry {
    fn into_descriptor(self) -> Option<PacketDescriptor> {
        Some(PacketDescriptor {
            timestamp_ns: self.timestamp.parse().ok()?,
            file_path: self.file_name,
            file_offset: self.file_offset.parse().ok()?,
            size: self.size,
            batch_id: self.batch_id,
            packet_index: self.packet_index,
            command_type: self.command_type,
            sequence: self.sequence,
            valid_header: self.is_valid_header,
            features: BTreeMap::new(),
        })
    }
}

struct State {
    descriptors: Vec<PacketDescriptor>,
    timestamp_index: BTreeMap<u64, usize>,
    last_saved: usize,
    session_path: Option<PathBuf>,
    snapshot_threshold: u64,
}

impl State {
    fn new() -> Self {
        State {
            descriptors: Vec::new(),
            timestamp_index: BTreeMap::new(),
            last_saved: 0,
            session_path: None,
            snapshot_threshold: 10_000,
        }
    }
}

/// Hold-all for one session's packet descriptors: append, persist, query.
pub struct IndexStore {
    state: Mutex<State>,
    sink: Option<EventSink>,
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexStore {
    pub fn new() -> Self {
        IndexStore {
            state: Mutex::new(State::new()),
            sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Loads `{session_path}.json` if present, else starts empty. Only one
    /// session may be open on a given `IndexStore` at a time.
    /// `snapshot_threshold` is the pending-unsaved descriptor count that
    /// triggers an auto-snapshot inside `snapshot(false)`.
    pub fn open(
        &self,
        session_path: impl AsRef<Path>,
        snapshot_threshold: u64,
    ) -> Result<(), IndexError> {
        let mut state = self.state.lock();
        if state.session_path.is_some() {
            return Err(IndexError::SessionAlreadyOpen);
        }

        let json_path = snapshot_path(session_path.as_ref());
        let (descriptors, timestamp_index) = match std::fs::read_to_string(&json_path) {
            Ok(raw) => match serde_json::from_str::<SnapshotFile>(&raw) {
                Ok(snapshot) => {
                    let descriptors: Vec<PacketDescriptor> = snapshot
                        .entries
                        .into_iter()
                        .filter_map(SnapshotEntry::into_descriptor)
                        .collect();
                    let mut ts_index = BTreeMap::new();
                    for (i, d) in descriptors.iter().enumerate() {
                        ts_index.entry(d.timestamp_ns).or_insert(i);
                    }
                    (descriptors, ts_index)
                }
                Err(e) => {
                    tracing::warn!(path = %json_path.display(), error = %e, "snapshot corrupt, starting empty index");
                    (Vec::new(), BTreeMap::new())
                }
            },
            Err(_) => (Vec::new(), BTreeMap::new()),
        };

        let count = descriptors.len();
        state.descriptors = descriptors;
        state.timestamp_index = timestamp_index;
        state.last_saved = count;
        state.session_path = Some(session_path.as_ref().to_path_buf());
        state.snapshot_threshold = snapshot_threshold;
        Ok(())
    }

    pub fn close(&self) -> Result<(), IndexError> {
        self.snapshot(true)?;
        let mut state = self.state.lock();
        state.session_path = None;
        state.descriptors.clear();
        state.timestamp_index.clear();
        state.last_saved = 0;
        Ok(())
    }

    /// Appends one descriptor, returning its assigned index id.
    pub fn append_one(&self, desc: PacketDescriptor) -> Result<usize, IndexError> {
        let timestamp_ns = desc.timestamp_ns;
        let id = {
            let mut state = self.state.lock();
            if state.session_path.is_none() {
                return Err(IndexError::NoSessionOpen);
            }
            append_locked(&mut state, desc)
        };
        event::emit(self.sink.as_ref(), Event::PacketIndexed { id, timestamp_ns });
        Ok(id)
    }

    /// Appends a batch atomically with respect to observers; snapshots if
    /// the pending-unsaved count crosses `batch_snapshot_threshold`.
    pub fn append_batch(
        &self,
        descs: Vec<PacketDescriptor>,
        batch_snapshot_threshold: u64,
    ) -> Result<Vec<usize>, IndexError> {
        let should_snapshot;
        let ids_with_timestamps: Vec<(usize, u64)>;
        {
            let mut state = self.state.lock();
            if state.session_path.is_none() {
                return Err(IndexError::NoSessionOpen);
            }
            ids_with_timestamps = descs
                .into_iter()
                .map(|d| {
                    let timestamp_ns = d.timestamp_ns;
                    (append_locked(&mut state, d), timestamp_ns)
                })
                .collect();
            should_snapshot =
                (state.descriptors.len() - state.last_saved) as u64 >= batch_snapshot_threshold;
        }
        for &(id, timestamp_ns) in &ids_with_timestamps {
            event::emit(self.sink.as_ref(), Event::PacketIndexed { id, timestamp_ns });
        }
        if should_snapshot {
            self.snapshot(true)?;
        }
        Ok(ids_with_timestamps.into_iter().map(|(id, _)| id).collect())
    }

    pub fn find_closest(&self, timestamp_ns: u64) -> Option<PacketDescriptor> {
        let state = self.state.lock();
        if state.descriptors.is_empty() {
            return None;
        }
        let idx = closest_index(&state.descriptors, timestamp_ns);
        state.descriptors.get(idx).cloned()
    }

    pub fn range(&self, ts_lo: u64, ts_hi: u64) -> Vec<PacketDescriptor> {
        let state = self.state.lock();
        range_locked(&state.descriptors, ts_lo, ts_hi)
            .iter()
            .map(|&i| state.descriptors[i].clone())
            .collect()
    }

    pub fn query(&self, query: &Query) -> Vec<PacketDescriptor> {
        let state = self.state.lock();
        let indices = range_locked(&state.descriptors, query.timestamp_start, query.timestamp_end);

        let filters: Vec<FeatureFilter> = query
            .feature_filters
            .iter()
            .filter_map(|raw| FeatureFilter::parse(raw))
            .collect();

        let mut results: Vec<PacketDescriptor> = indices
            .into_iter()
            .map(|i| state.descriptors[i].clone())
            .filter(|d| filters.iter().all(|f| f.matches(d)))
            .collect();

        match query.direction {
            SortDirection::Ascending => results.sort_by_key(|d| d.timestamp_ns),
            SortDirection::Descending => {
                results.sort_by_key(|d| std::cmp::Reverse(d.timestamp_ns))
            }
        }

        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    /// Convenience over `query`: all descriptors with the given command
    /// type, most recent `limit` by timestamp.
    pub fn find_by_command(&self, command_type: u8, limit: usize) -> Vec<PacketDescriptor> {
        let state = self.state.lock();
        let mut results: Vec<PacketDescriptor> = state
            .descriptors
            .iter()
            .filter(|d| d.command_type == command_type)
            .cloned()
            .collect();
        results.sort_by_key(|d| d.timestamp_ns);
        results.truncate(limit);
        results
    }

    pub fn count(&self) -> usize {
        self.state.lock().descriptors.len()
    }

    /// Writes the JSON snapshot. No-op if `!force` and fewer than the
    /// session's configured `snapshot_threshold` descriptors have accrued
    /// since the last save.
    pub fn snapshot(&self, force: bool) -> Result<(), IndexError> {
        let threshold = self.state.lock().snapshot_threshold;
        self.snapshot_with_threshold(force, threshold)
    }

    pub fn snapshot_with_threshold(
        &self,
        force: bool,
        snapshot_threshold: u64,
    ) -> Result<(), IndexError> {
        let (path, entries, count) = {
            let state = self.state.lock();
            let Some(path) = state.session_path.clone() else {
                return Err(IndexError::NoSessionOpen);
            };
            if !force
                && (state.descriptors.len() - state.last_saved) as u64 < snapshot_threshold
            {
                return Ok(());
            }
            let entries: Vec<SnapshotEntry> =
                state.descriptors.iter().map(SnapshotEntry::from).collect();
            (path, entries, state.descriptors.len())
        };

        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            entries,
        };

        let json_path = snapshot_path(&path);
        write_snapshot_atomically(&json_path, &snapshot)?;

        let mut state = self.state.lock();
        state.last_saved = count;
        drop(state);
        event::emit(self.sink.as_ref(), Event::SnapshotSaved { count });
        Ok(())
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.descriptors.clear();
        state.timestamp_index.clear();
        state.last_saved = 0;
    }
}

fn append_locked(state: &mut State, desc: PacketDescriptor) -> usize {
    let id = state.descriptors.len();
    state.timestamp_index.entry(desc.timestamp_ns).or_insert(id);
    state.descriptors.push(desc);
    id
}

fn closest_index(descriptors: &[PacketDescriptor], timestamp_ns: u64) -> usize {
    let pos = descriptors.partition_point(|d| d.timestamp_ns < timestamp_ns);
    if pos >= descriptors.len() {
        return descriptors.len() - 1;
    }
    if pos == 0 {
        return 0;
    }
    if descriptors[pos].timestamp_ns == timestamp_ns {
        return pos;
    }
    let after = descriptors[pos].timestamp_ns - timestamp_ns;
    let before = timestamp_ns - descriptors[pos - 1].timestamp_ns;
    if before <= after {
        pos - 1
    } else {
        pos
    }
}

fn range_locked(descriptors: &[PacketDescriptor], ts_lo: u64, ts_hi: u64) -> Vec<usize> {
    let start = descriptors.partition_point(|d| d.timestamp_ns < ts_lo);
    let end = descriptors.partition_point(|d| d.timestamp_ns <= ts_hi);
    (start..end).collect()
}

fn snapshot_path(session_path: &Path) -> PathBuf {
    let mut p = session_path.to_path_buf();
    let has_json_ext = p.extension().map(|e| e == "json").unwrap_or(false);
    if !has_json_ext {
        p.set_extension("json");
    }
    p
}

fn write_snapshot_atomically(path: &Path, snapshot: &SnapshotFile) -> Result<(), IndexError> {
    let tmp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let write_result = (|| -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(&body)?;
        f.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    write_result.map_err(|source| {
        let _ = std::fs::remove_file(&tmp_path);
        IndexError::SnapshotWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}
