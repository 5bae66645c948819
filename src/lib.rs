//! # Prooftail
//!
//! Prooftail follows the log of a GPU mining process and exports the proof rate it reports. The log is expected to be appended
//! to and periodically rotated (removed or renamed and created again under the same path).
//!
//! * `parse` that extracts proof rate from a single line of dashboard output
//!
//! ```rust
//! # use prooftail::{parse, ParseOutcome};
//! let line = "| gpu[*]: (1m - 1107500   5m - 1107333   15m - 1065888   30m - 1294375   60m - 1253611 )    |";
//! assert_eq!(parse(line), ParseOutcome::Value(1107500));
//! assert_eq!(parse("gpu[*]: a b c d N/A"), ParseOutcome::Unavailable);
//! ```
//!
//! * `TailFollower` that keeps reading newly appended lines, survives rotation and reports values into a `MetricSink`.
//! Events can be injected through an `EventFeed`, which also makes the follower easy to drive without a real watcher.
//!
//! ```rust
//! # use std::{fs, io::Write, sync::Arc};
//! # use prooftail::{FollowerConfig, MemorySink, Subscription, TailFollower};
//! # let dir = tempfile::tempdir()?;
//! let path = dir.path().join("miner.log");
//! fs::write(&path, "old content is skipped\n")?;
//!
//! let sink = Arc::new(MemorySink::new());
//! let (subscription, feed) = Subscription::channel();
//! let mut follower = TailFollower::with_subscription(&path, subscription, sink.clone(), FollowerConfig::default())?;
//!
//! fs::OpenOptions::new().append(true).open(&path)?.write_all(b"gpu[*]: a b c d 999 e\n")?;
//! feed.write();
//! follower.step()?;
//! assert_eq!(sink.last_rate(), Some(999));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! * `PrometheusSink` and `exporter` that publish values as `proof_rate` gauge and `log_errors_total` counter
//!

pub mod cli;
pub mod config;
pub mod exporter;
mod follower;
mod line_parser;
mod sink;
mod subscription;

pub use follower::{
    FollowerConfig, FollowerError, FollowerState, ScanReport, TailFollower, DEFAULT_GRACE_PERIOD,
};
pub use line_parser::{parse, ParseOutcome};
pub use sink::{MemorySink, MetricSink, PrometheusSink, LOG_ERRORS_METRIC, PROOF_RATE_METRIC};
pub use subscription::{EventFeed, Subscription, WatchEvent};
