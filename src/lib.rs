//! Per-partition append-only log storage engine for the Tank broker
//!
//! A broker hosts many topics, each sharded into partitions; every partition
//! is an independent, totally-ordered log of messages identified by a dense
//! 64-bit sequence number. This crate is that log: the segmented on-disk
//! representation, the bundle/message binary format, the memory-mapped
//! sparse index, segment rolling, retention (delete and key-based cleanup
//! policies), background durable flushing, crash reconstruction, and the
//! passive cache that closes idle partitions.
//!
//! The TCP server, cluster membership and client pipelines live elsewhere;
//! this crate receives append batches, read requests, configuration updates
//! and wall-clock ticks, and exposes high-water marks, message iteration and
//! readable byte ranges.
//!
//! ```no_run
//! use tanklog::{Codec, Engine, IterAction, Message, NewMessage, PartitionConfig};
//! use bytes::Bytes;
//!
//! let mut engine = Engine::open(
//!     std::path::Path::new("/var/lib/tank"),
//!     PartitionConfig::default(),
//!     None,
//!     1_700_000_000,
//! )?;
//! engine.create_partition("events", 0, 1_700_000_000)?;
//! engine.append(
//!     "events",
//!     0,
//!     1_700_000_000,
//!     &[NewMessage { ts: 1_700_000_000_000, key: None, payload: Bytes::from("hello") }],
//!     Codec::Snappy,
//! )?;
//! engine.for_each_msg("events", 0, 1_700_000_000, &mut |msg: &Message| {
//!     println!("{}: {:?}", msg.seq_num, msg.payload);
//!     IterAction::Continue
//! })?;
//! # Ok::<(), tanklog::TankError>(())
//! ```

pub mod bundle;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod index;
pub mod mmap;
pub mod partition;
pub mod segment;
pub mod varint;

pub use bundle::{decode_bundle, encode_bundle, Codec, DecodedBundle, Message};
pub use cache::{AccessTracker, IDLE_CLOSE_SECS, SWEEP_INTERVAL_SECS};
pub use compaction::CleanupCheckpoint;
pub use config::{parse_duration, parse_size, CleanupPolicy, PartitionConfig};
pub use engine::{Engine, FileOpener, IdleCloser};
pub use error::{Result, TankError};
pub use flush::{FlushWorker, Flusher};
pub use index::{IndexEntry, SegmentIndex};
pub use partition::{
    IterAction, MsgVisitor, NewMessage, PartitionLog, ReadRange, RetentionOutcome,
};
pub use segment::{ActiveSegment, FdHandle, RoSegment};
