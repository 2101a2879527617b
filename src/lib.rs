//! Capture-to-index-to-retrieval pipeline for FX3-class USB3 capture
//! streams: frame packet boundaries out of a raw byte stream, index the
//! resulting descriptors, and serve payload bytes and per-frame features
//! back out on demand.
//!
//! The four components compose into a single [`Core`] handle:
//!
//! - [`stream_parser::StreamParser`] frames raw bytes into
//!   [`descriptor::PacketDescriptor`]s, tolerating arbitrary buffer splits.
//! - [`index_store::IndexStore`] holds descriptors for a session, persists
//!   JSON snapshots, and answers point/range/filtered queries.
//! - [`packet_reader::PacketReader`] turns descriptors into payload bytes,
//!   caching file handles and recently-read bytes.
//! - [`feature_extractor::FeatureExtractor`] derives per-frame features
//!   (average, histogram, edge count, ...) from decoded RAW8/10/12 frames.

pub mod config;
pub mod core;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod feature_extractor;
pub mod index_store;
pub mod packet_reader;
pub mod stream_parser;
pub mod variant;

pub use config::Config;
pub use core::Core;
pub use descriptor::{CommandType, FeatureFilter, PacketDescriptor, Query, SortDirection};
pub use error::{CoreError, FeatureError, IndexError, ReadError};
pub use event::{Event, EventSink};
pub use feature_extractor::FeatureExtractor;
pub use index_store::IndexStore;
pub use packet_reader::{PacketReader, ReaderConfig};
pub use stream_parser::{ParserStats, StreamParser};
pub use variant::Variant;
