//! The crate's single entry point: owns one `IndexStore`, one
//! `PacketReader`, one `FeatureExtractor`, and hands out independent
//! `StreamParser`s per capture file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};

use crate::config::Config;
use crate::descriptor::{PacketDescriptor, Query};
use crate::error::CoreError;
use crate::event::EventSink;
use crate::feature_extractor::FeatureExtractor;
use crate::index_store::IndexStore;
use crate::packet_reader::{PacketReader, ReaderConfig};
use crate::stream_parser::StreamParser;

/// Packet count at which `parse_and_ingest` flushes pending descriptors to
/// `IndexStore` during a single `parse` call, rather than holding the whole
/// call's output in memory until it returns.
const PARSE_FLUSH_CHUNK_SIZE: usize = 1_000;

enum OwnedRuntime {
    Borrowed(Handle),
    Owned(Runtime),
}

impl OwnedRuntime {
    fn handle(&self) -> Handle {
        match self {
            OwnedRuntime::Borrowed(h) => h.clone(),
            OwnedRuntime::Owned(rt) => rt.handle().clone(),
        }
    }
}

/// The pipeline's top-level handle: composes IndexStore, PacketReader,
/// FeatureExtractor, and acts as a factory for per-file StreamParsers.
pub struct Core {
    base_path: PathBuf,
    index: Arc<IndexStore>,
    reader: Arc<PacketReader>,
    features: Arc<FeatureExtractor>,
    config: Config,
    runtime: OwnedRuntime,
    event_sink: Option<EventSink>,
    _sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl Core {
    /// Opens (or creates) a session under `base_path`, loading any existing
    /// snapshot. Spawns its own single-threaded runtime if `None` is
    /// passed for `handle`. `event_sink`, if given, receives progress and
    /// completion notifications from the `PacketReader`.
    pub fn open(
        base_path: impl AsRef<Path>,
        session_id: &str,
        config: Config,
        handle: Option<Handle>,
        event_sink: Option<EventSink>,
    ) -> Result<Core, CoreError> {
        let base_path = base_path.as_ref().to_path_buf();
        let runtime = match handle {
            Some(h) => OwnedRuntime::Borrowed(h),
            None => {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|source| CoreError::InitFailed {
                        component: "tokio runtime",
                        source,
                    })?;
                OwnedRuntime::Owned(rt)
            }
        };

        let mut index_store = IndexStore::new();
        if let Some(sink) = &event_sink {
            index_store = index_store.with_event_sink(sink.clone());
        }
        index_store.open(base_path.join(session_id), config.snapshot_threshold)?;
        let index = Arc::new(index_store);

        let reader_config = ReaderConfig {
            max_open_files: config.max_open_files,
            byte_cache_budget_bytes: config.byte_cache_budget_bytes,
            read_retry_attempts: config.read_retry_attempts,
            read_retry_backoff_ms: config.read_retry_backoff_ms,
            read_timeout_ms: config.read_timeout_ms,
            idle_file_close_seconds: config.idle_file_close_seconds,
        };
        let mut reader = PacketReader::new(Arc::clone(&index), reader_config);
        if let Some(sink) = &event_sink {
            reader = reader.with_event_sink(sink.clone());
        }
        let reader = Arc::new(reader);

        let features = Arc::new(FeatureExtractor::new(config.feature_worker_threads).map_err(
            |source| CoreError::InitFailed {
                component: "FeatureExtractor",
                source,
            },
        )?);

        let sweeper = {
            let reader = Arc::clone(&reader);
            let interval_secs = config.file_sweep_interval_secs.max(1);
            Some(runtime.handle().spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
                loop {
                    ticker.tick().await;
                    reader.sweep_idle_files();
                }
            }))
        };

        Ok(Core {
            base_path,
            index,
            reader,
            features,
            config,
            runtime,
            event_sink,
            _sweeper: sweeper,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hands out an independent parser bound to `capture_file_path`.
    /// Callers serialise `parse` calls on the returned parser themselves.
    pub fn new_parser(&self, capture_file_path: impl Into<String>) -> StreamParser {
        let mut parser = StreamParser::with_thresholds(
            capture_file_path,
            self.config.parser_early_terminate_packets,
            self.config.parser_stride_confirm_hits as u32,
        );
        if let Some(sink) = &self.event_sink {
            parser = parser.with_event_sink(sink.clone());
        }
        parser
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub fn reader(&self) -> &Arc<PacketReader> {
        &self.reader
    }

    pub fn features(&self) -> &Arc<FeatureExtractor> {
        &self.features
    }

    /// Appends a batch of descriptors from a parse pass, snapshotting per
    /// `config.batch_snapshot_threshold`.
    pub fn ingest(&self, descriptors: Vec<PacketDescriptor>) -> Result<Vec<usize>, CoreError> {
        Ok(self
            .index
            .append_batch(descriptors, self.config.batch_snapshot_threshold)?)
    }

    /// Runs `parser` over `buf`, flushing accepted packets into `IndexStore`
    /// every [`PARSE_FLUSH_CHUNK_SIZE`] packets rather than buffering an
    /// entire call's output in memory before indexing any of it. Returns
    /// the number of packets emitted by this call.
    pub fn parse_and_ingest(
        &self,
        parser: &mut StreamParser,
        buf: &[u8],
        file_offset: u64,
    ) -> Result<usize, CoreError> {
        let mut pending: Vec<PacketDescriptor> = Vec::with_capacity(PARSE_FLUSH_CHUNK_SIZE);
        let mut flush_err: Option<CoreError> = None;

        let emitted = parser.parse(buf, file_offset, |desc| {
            if flush_err.is_some() {
                return;
            }
            pending.push(desc);
            if pending.len() >= PARSE_FLUSH_CHUNK_SIZE {
                let chunk = std::mem::take(&mut pending);
                if let Err(e) = self.ingest(chunk) {
                    flush_err = Some(e);
                }
            }
        });

        if let Some(e) = flush_err {
            return Err(e);
        }
        if !pending.is_empty() {
            self.ingest(pending)?;
        }
        Ok(emitted)
    }

    pub fn read(&self, desc: &PacketDescriptor) -> Result<Arc<Vec<u8>>, CoreError> {
        Ok(self.reader.read(desc)?)
    }

    pub async fn read_query_async(
        &self,
        query: Query,
    ) -> Result<Vec<(Arc<Vec<u8>>, PacketDescriptor)>, CoreError> {
        Ok(Arc::clone(&self.reader).read_query_async(query).await?)
    }

    pub fn close(&self) -> Result<(), CoreError> {
        Ok(self.index.close()?)
    }
}
