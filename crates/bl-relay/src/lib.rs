//! Batchline Relay
//!
//! The aggregation-and-dispatch engine:
//! - **Buckets**: per `(channel, group)` accumulation with size and window flush triggers
//! - **Merge**: joins a flushed batch into one payload
//! - **Throttler**: fixed one-second window admission per channel
//! - **Dispatcher**: a single delivery attempt with failure routing
//! - **Retry**: durable store for failed payloads and the sweeper that replays them
//! - **Relay**: owns workers and tickers, ingest and graceful shutdown
//!
//! Archival, status reporting, content filters and the HTTP receiver are thin
//! leaves behind traits.

pub mod api;
pub mod archive;
pub mod bucket;
pub mod content;
pub mod dispatcher;
pub mod error;
pub mod merge;
pub mod parked;
pub mod relay;
pub mod relay_metrics;
pub mod reload;
pub mod report;
pub mod retry_store;
pub mod sweeper;
pub mod throttle;
pub mod transport;

pub use archive::{Archiver, FileArchiver, FileArchiverConfig, NoopArchiver};
pub use bucket::{extract_group_key, Batch, BucketManager, FlushTrigger};
pub use content::{AesGcmCipher, Cipher, ContentError, Filter, Transformer};
pub use dispatcher::Dispatcher;
pub use error::RelayError;
pub use merge::Merger;
pub use parked::ParkedMessages;
pub use relay::{Relay, RelayBuilder, RelayStats};
pub use reload::ConfigReloader;
pub use report::{CsvReporter, NoopReporter, Reporter};
pub use retry_store::{FileRetryStore, MemoryRetryStore, RetryStore};
pub use sweeper::{RetrySweeper, SweepStats};
pub use throttle::Throttler;
pub use transport::{HttpTransport, HttpTransportConfig, Transport};

pub type Result<T> = std::result::Result<T, RelayError>;
