//! Types and traits for recording training statistics.
//!
//! The world-model trainer reports its losses as [`Record`]s: key-value
//! containers that callers can forward to any sink (console, tensorboard,
//! a tracking server) by implementing [`Recorder`].
//!
//! # Basic Usage
//!
//! ```rust
//! use mirage_core::record::{LossStats, Record, RecordValue};
//!
//! let mut stats = LossStats::default();
//! stats.push(0.5);
//! stats.push(0.3);
//!
//! let mut record = Record::empty();
//! record.insert("epoch", RecordValue::Scalar(2.0));
//! record.merge_inplace(stats.to_record("train_loss"));
//! assert!(record.get_scalar("train_loss_mean").is_ok());
//! ```
mod base;
mod buffered_recorder;
mod loss_stats;
mod null_recorder;
mod recorder;

pub use base::{Record, RecordValue};
pub use buffered_recorder::BufferedRecorder;
pub use loss_stats::LossStats;
pub use null_recorder::NullRecorder;
pub use recorder::Recorder;
