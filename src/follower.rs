use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Seek, SeekFrom},
    os::unix::prelude::MetadataExt,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    line_parser::{parse, ParseOutcome},
    sink::MetricSink,
    subscription::{EventFeed, Subscription, WatchEvent},
};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Tunables of `TailFollower`
#[derive(Clone, Debug)]
pub struct FollowerConfig {
    /// Pause between noticing rotation and reopening the path, gives the writer time to create the new file
    pub grace_period: Duration,
    /// Skip content that already exists when the follower starts. When false, existing content is read once.
    pub start_at_end: bool,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            start_at_end: true,
        }
    }
}

/// Errors that stop the follower. Everything else is logged, counted by the sink and survived.
#[derive(Error, Debug)]
pub enum FollowerError {
    #[error("failed to open log file {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to watch log file {}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("failed to seek in log file {}", .path.display())]
    Seek {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to reopen log file {} after rotation", .path.display())]
    Reopen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FollowerState {
    Opening,
    Watching,
    RotationRecovery,
    Stopped,
}

/// Counters describing one pass over newly appended content
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// complete lines consumed
    pub lines: usize,
    /// lines that updated the rate
    pub rates: usize,
    /// recognized lines with unparsable rate
    pub malformed: usize,
}

/// State owned by the follower for the lifetime of one watch
struct TailSession {
    path: PathBuf,
    /// `None` only while rotation recovery waits for the replacement file
    handle: Option<BufReader<File>>,
    /// position right after the last consumed line
    offset: u64,
    subscription: Subscription,
}

impl TailSession {
    fn handle(&mut self) -> io::Result<&mut BufReader<File>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "log file is not open"))
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.offset = self.handle()?.seek(pos)?;
        Ok(self.offset)
    }

    /// Read next complete line into `buf`, returning `false` when there is none.
    ///
    /// A trailing line without terminator is not consumed: read position is moved back to its first byte.
    fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        buf.clear();
        let offset = self.offset;
        let handle = self.handle()?;
        let read = handle.read_until(b'\n', buf)?;
        if read == 0 {
            return Ok(false);
        }
        if buf.last() != Some(&b'\n') {
            handle.seek(SeekFrom::Start(offset))?;
            return Ok(false);
        }
        self.offset += read as u64;
        Ok(true)
    }

    /// Jump to end of file if it became shorter than what was already consumed
    fn resync(&mut self) -> io::Result<()> {
        let len = self.handle()?.get_ref().metadata()?.len();
        if len < self.offset {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "log file truncated in place; skipping to its end"
            );
            self.seek(SeekFrom::End(0))?;
        }
        Ok(())
    }

    /// Whether `path` no longer names the file behind the open handle.
    ///
    /// True when the handle's file lost its last link, when `path` is gone, or when `path` now points to another
    /// inode. Events that arrive after a rotation was already handled find the two matching and are ignored.
    fn replaced(&self) -> bool {
        let Some(handle) = self.handle.as_ref() else {
            return true;
        };
        let Ok(open) = handle.get_ref().metadata() else {
            return true;
        };
        if open.nlink() == 0 {
            return true;
        }
        match fs::metadata(&self.path) {
            Ok(current) => current.ino() != open.ino() || current.dev() != open.dev(),
            Err(_) => true,
        }
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.handle = Some(open_reader(&self.path)?);
        self.offset = 0;
        Ok(())
    }
}

fn open_reader(path: &Path) -> io::Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// Follows a single log file across writes and rotations, feeding proof rates into a `MetricSink`.
///
/// The follower is a small state machine driven by one blocking loop:
///
/// * on write, newly appended complete lines are parsed and dispatched to the sink
/// * on removal, rename or metadata change, the follower checks whether `path` still names the open file. If not,
/// the file is considered rotated: the handle is closed, the follower waits for `grace_period`, reopens the same
/// path and reads the replacement from its start
/// * watcher errors, scan errors and malformed values are logged and counted, but never stop the loop
///
/// Only failing to open, watch or reopen the file is fatal; such errors are returned as `FollowerError`.
///
/// ```rust no_run
/// # use std::sync::Arc;
/// # use prooftail::{FollowerConfig, MemorySink, TailFollower};
/// let sink = Arc::new(MemorySink::new());
/// let (follower, feed) = TailFollower::open("/var/log/miner.log", sink.clone(), FollowerConfig::default())?;
/// let worker = std::thread::spawn(move || follower.run());
/// // later
/// feed.shutdown();
/// worker.join().unwrap()?;
/// # Ok::<(), prooftail::FollowerError>(())
/// ```
pub struct TailFollower {
    session: TailSession,
    sink: Arc<dyn MetricSink>,
    config: FollowerConfig,
    state: FollowerState,
}

impl TailFollower {
    /// Open `path`, start watching it through the platform watcher and position at its end.
    ///
    /// Returned `EventFeed` can be used to stop the follower.
    pub fn open(
        path: impl AsRef<Path>,
        sink: Arc<dyn MetricSink>,
        config: FollowerConfig,
    ) -> Result<(Self, EventFeed), FollowerError> {
        let path = path.as_ref();
        let handle = open_reader(path).map_err(|source| FollowerError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let (subscription, feed) =
            Subscription::watch(path).map_err(|source| FollowerError::Watch {
                path: path.to_path_buf(),
                source,
            })?;
        let follower = Self::start(path, handle, subscription, sink, config)?;
        Ok((follower, feed))
    }

    /// Same as `open`, but events come from an already established subscription.
    pub fn with_subscription(
        path: impl AsRef<Path>,
        subscription: Subscription,
        sink: Arc<dyn MetricSink>,
        config: FollowerConfig,
    ) -> Result<Self, FollowerError> {
        let path = path.as_ref();
        let handle = open_reader(path).map_err(|source| FollowerError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::start(path, handle, subscription, sink, config)
    }

    fn start(
        path: &Path,
        handle: BufReader<File>,
        subscription: Subscription,
        sink: Arc<dyn MetricSink>,
        config: FollowerConfig,
    ) -> Result<Self, FollowerError> {
        let mut follower = Self {
            session: TailSession {
                path: path.to_path_buf(),
                handle: Some(handle),
                offset: 0,
                subscription,
            },
            sink,
            config,
            state: FollowerState::Opening,
        };

        if follower.config.start_at_end {
            follower
                .session
                .seek(SeekFrom::End(0))
                .map_err(|source| FollowerError::Seek {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        info!(
            path = %path.display(),
            offset = follower.session.offset,
            "tailing log file"
        );
        follower.state = FollowerState::Watching;

        if !follower.config.start_at_end {
            follower.scan();
        }
        Ok(follower)
    }

    pub fn state(&self) -> FollowerState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.session.path
    }

    /// Position right after the last consumed line
    pub fn offset(&self) -> u64 {
        self.session.offset
    }

    /// Handle events until the subscription closes or shutdown is requested.
    pub fn run(mut self) -> Result<(), FollowerError> {
        loop {
            if self.step()? == FollowerState::Stopped {
                return Ok(());
            }
        }
    }

    /// Wait for a single event and handle it, returning the state the follower ended up in.
    pub fn step(&mut self) -> Result<FollowerState, FollowerError> {
        if self.state == FollowerState::Stopped {
            return Ok(self.state);
        }

        match self.session.subscription.next() {
            Some(WatchEvent::Write) => {
                self.scan();
            }
            Some(
                event @ (WatchEvent::Removed | WatchEvent::Renamed | WatchEvent::MetadataChanged),
            ) => {
                if !self.session.replaced() {
                    debug!(path = %self.session.path.display(), ?event, "log file unchanged; ignoring event");
                    return Ok(self.state);
                }
                info!(path = %self.session.path.display(), ?event, "log rotation detected");
                if let Err(err) = self.recover_from_rotation() {
                    self.stop();
                    return Err(err);
                }
            }
            Some(WatchEvent::Error(err)) => {
                warn!(path = %self.session.path.display(), error = %err, "file watcher error");
                self.sink.increment_error_count();
            }
            Some(WatchEvent::Shutdown) => {
                info!(path = %self.session.path.display(), "shutdown requested");
                self.stop();
            }
            None => {
                info!(path = %self.session.path.display(), "watch subscription closed");
                self.stop();
            }
        }
        Ok(self.state)
    }

    /// Consume every complete line appended since the last scan.
    ///
    /// Errors are not returned: they are logged, counted by the sink and the read position is moved to the
    /// end of file so that the next write starts from a known place.
    pub fn scan(&mut self) -> ScanReport {
        let mut report = ScanReport::default();
        let outcome = self
            .dispatch_new_lines(&mut report)
            .and_then(|_| self.session.resync());

        if let Err(err) = outcome {
            warn!(
                path = %self.session.path.display(),
                error = %err,
                "failed to read log file"
            );
            self.sink.increment_error_count();
            if let Err(err) = self.session.seek(SeekFrom::End(0)) {
                warn!(
                    path = %self.session.path.display(),
                    error = %err,
                    "failed to seek to end of log file"
                );
            }
        }

        debug!(
            path = %self.session.path.display(),
            lines = report.lines,
            rates = report.rates,
            malformed = report.malformed,
            offset = self.session.offset,
            "scanned log file"
        );
        report
    }

    fn dispatch_new_lines(&mut self, report: &mut ScanReport) -> io::Result<()> {
        let mut buf = Vec::new();
        while self.session.read_line(&mut buf)? {
            report.lines += 1;
            let line = String::from_utf8_lossy(trim_line_ending(&buf));
            match parse(&line) {
                ParseOutcome::Value(value) => {
                    self.sink.set_rate(value);
                    report.rates += 1;
                }
                ParseOutcome::Unavailable => {
                    self.sink.set_rate(0);
                    report.rates += 1;
                }
                ParseOutcome::Malformed { line, cause } => {
                    warn!(%line, error = %cause, "malformed proof rate");
                    self.sink.increment_error_count();
                    report.malformed += 1;
                }
                ParseOutcome::NoMetric => {}
            }
        }
        Ok(())
    }

    fn recover_from_rotation(&mut self) -> Result<(), FollowerError> {
        self.state = FollowerState::RotationRecovery;
        self.session.close();
        thread::sleep(self.config.grace_period);

        let path = self.session.path.clone();
        self.session
            .reopen()
            .map_err(|source| FollowerError::Reopen {
                path: path.clone(),
                source,
            })?;
        self.session
            .subscription
            .rearm(&path)
            .map_err(|source| FollowerError::Watch {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "reopened log file after rotation");

        self.state = FollowerState::Watching;
        // replacement may already hold lines written before the watch was re-armed
        self.scan();
        Ok(())
    }

    fn stop(&mut self) {
        self.session.close();
        self.state = FollowerState::Stopped;
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::{FollowerConfig, FollowerError, FollowerState, ScanReport, TailFollower};
    use crate::{
        sink::{MemorySink, MetricSink},
        subscription::{EventFeed, Subscription},
    };

    const HISTORY: &str = "|  Total | 1    | 0     |             |                    | Uptime  5s           |\n";

    struct Harness {
        // keeps the directory alive
        _dir: TempDir,
        path: PathBuf,
        sink: Arc<MemorySink>,
        feed: EventFeed,
        follower: TailFollower,
    }

    fn config(start_at_end: bool) -> FollowerConfig {
        FollowerConfig {
            grace_period: Duration::from_millis(10),
            start_at_end,
        }
    }

    fn start(content: &str, config: FollowerConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.log");
        fs::write(&path, content).unwrap();

        let sink = Arc::new(MemorySink::new());
        let (subscription, feed) = Subscription::channel();
        let dyn_sink: Arc<dyn MetricSink> = sink.clone();
        let follower = TailFollower::with_subscription(&path, subscription, dyn_sink, config).unwrap();
        Harness {
            _dir: dir,
            path,
            sink,
            feed,
            follower,
        }
    }

    #[fixture]
    fn harness() -> Harness {
        start(HISTORY, config(true))
    }

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    impl Harness {
        fn append_and_notify(&mut self, content: &str) -> FollowerState {
            append(&self.path, content);
            self.feed.write();
            self.follower.step().unwrap()
        }
    }

    #[rstest]
    fn existing_content_is_skipped(mut harness: Harness) {
        assert_eq!(harness.follower.state(), FollowerState::Watching);
        assert_eq!(harness.follower.offset(), HISTORY.len() as u64);

        let state = harness.append_and_notify("gpu[*]: a b c d 5 e\n");
        assert_eq!(state, FollowerState::Watching);
        assert_eq!(harness.sink.rates(), vec![5]);
    }

    #[test]
    fn backfill_reads_existing_content_once() {
        let mut harness = start(HISTORY, config(false));
        assert_eq!(harness.sink.rates(), vec![1]);

        harness.append_and_notify("gpu[*]: a b c d 2\n");
        assert_eq!(harness.sink.rates(), vec![1, 2]);
    }

    #[rstest]
    #[case("gpu[*]: (1m - 1107500   5m - 1107333   15m - 1065888 )\n", vec![1107500], 0)]
    #[case("|  Total | 935755    | 0     | Uptime  68415s |\n", vec![935755], 0)]
    #[case("|  Total | N/A | 0 | Uptime 1s |\n", vec![0], 0)]
    #[case("gpu[*]: a b c d abc\n", vec![], 1)]
    #[case("| gpu[0]: (1m - 138750    5m - 138916 )    |\n", vec![], 0)]
    #[case("gpu[*]: a b c d 7\r\n", vec![7], 0)]
    fn lines_are_dispatched_by_outcome(
        mut harness: Harness,
        #[case] line: &str,
        #[case] rates: Vec<u64>,
        #[case] errors: u64,
    ) {
        harness.append_and_notify(line);
        assert_eq!(harness.sink.rates(), rates);
        assert_eq!(harness.sink.error_count(), errors);
    }

    #[rstest]
    fn every_appended_line_is_dispatched_in_order(mut harness: Harness) {
        append(&harness.path, "gpu[*]: a b c d 1\nnoise\n");
        append(&harness.path, "gpu[*]: a b c d 2\n|  Total | 3 | 0 | Uptime 1s |\n");
        let report = harness.follower.scan();

        assert_eq!(
            report,
            ScanReport {
                lines: 4,
                rates: 3,
                malformed: 0
            }
        );
        assert_eq!(harness.sink.rates(), vec![1, 2, 3]);
    }

    #[rstest]
    fn rescanning_without_new_writes_dispatches_nothing(mut harness: Harness) {
        harness.append_and_notify("gpu[*]: a b c d 5\n");
        let offset = harness.follower.offset();

        harness.feed.write();
        harness.follower.step().unwrap();
        assert_eq!(harness.follower.scan(), ScanReport::default());
        assert_eq!(harness.sink.rates(), vec![5]);
        assert_eq!(harness.follower.offset(), offset);
    }

    #[rstest]
    fn partial_line_waits_for_terminator(mut harness: Harness) {
        let offset = harness.follower.offset();
        harness.append_and_notify("gpu[*]: a b c d 12");
        assert!(harness.sink.rates().is_empty());
        assert_eq!(harness.follower.offset(), offset);

        harness.append_and_notify(" e\n");
        assert_eq!(harness.sink.rates(), vec![12]);
    }

    #[rstest]
    fn truncation_in_place_resyncs_to_new_end(mut harness: Harness) {
        let file = OpenOptions::new().write(true).open(&harness.path).unwrap();
        file.set_len(0).unwrap();
        drop(file);
        harness.append_and_notify("x\n");

        assert_eq!(harness.follower.offset(), 2);
        assert!(harness.sink.rates().is_empty());
        assert_eq!(harness.sink.error_count(), 0);

        harness.append_and_notify("gpu[*]: a b c d 8\n");
        assert_eq!(harness.sink.rates(), vec![8]);
    }

    #[rstest]
    #[case::rename(true)]
    #[case::remove(false)]
    fn rotation_reads_replacement_from_start(mut harness: Harness, #[case] rename: bool) {
        harness.append_and_notify("gpu[*]: a b c d 5\n");

        if rename {
            fs::rename(&harness.path, harness.path.with_extension("log.1")).unwrap();
        } else {
            fs::remove_file(&harness.path).unwrap();
        }
        fs::write(&harness.path, "gpu[*]: a b c d 999 e\n").unwrap();
        if rename {
            harness.feed.renamed();
        } else {
            harness.feed.removed();
        }

        let state = harness.follower.step().unwrap();
        assert_eq!(state, FollowerState::Watching);
        assert_eq!(harness.sink.rates(), vec![5, 999]);
        assert_eq!(
            harness.follower.offset(),
            "gpu[*]: a b c d 999 e\n".len() as u64
        );

        harness.append_and_notify("gpu[*]: a b c d 1000\n");
        assert_eq!(harness.sink.rates(), vec![5, 999, 1000]);
    }

    #[rstest]
    fn unlinked_file_is_detected_from_metadata_change(mut harness: Harness) {
        // inotify reports only an attribute change while the removed file is still open
        fs::remove_file(&harness.path).unwrap();
        fs::write(&harness.path, "gpu[*]: a b c d 999 e\n").unwrap();
        harness.feed.metadata_changed();

        assert_eq!(harness.follower.step().unwrap(), FollowerState::Watching);
        assert_eq!(harness.sink.rates(), vec![999]);
    }

    #[rstest]
    fn events_for_current_file_are_ignored(mut harness: Harness) {
        let offset = harness.follower.offset();
        harness.feed.metadata_changed();
        harness.feed.removed();
        harness.feed.renamed();
        for _ in 0..3 {
            assert_eq!(harness.follower.step().unwrap(), FollowerState::Watching);
        }
        assert_eq!(harness.follower.offset(), offset);

        harness.append_and_notify("gpu[*]: a b c d 6\n");
        assert_eq!(harness.sink.rates(), vec![6]);
    }

    #[rstest]
    fn stale_removal_after_rotation_does_not_reread(mut harness: Harness) {
        fs::remove_file(&harness.path).unwrap();
        fs::write(&harness.path, "gpu[*]: a b c d 999 e\n").unwrap();
        harness.feed.metadata_changed();
        // watcher reports the old inode once its last descriptor is closed
        harness.feed.removed();

        harness.follower.step().unwrap();
        harness.follower.step().unwrap();
        assert_eq!(harness.sink.rates(), vec![999]);
    }

    #[test]
    fn read_failure_is_counted_and_survived() {
        // opening a directory succeeds, reading from it does not
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let (subscription, feed) = Subscription::channel();
        let dyn_sink: Arc<dyn MetricSink> = sink.clone();
        let mut follower =
            TailFollower::with_subscription(dir.path(), subscription, dyn_sink, config(false))
                .unwrap();

        assert_eq!(follower.state(), FollowerState::Watching);
        assert_eq!(sink.error_count(), 1);
        assert!(sink.rates().is_empty());

        feed.write();
        assert_eq!(follower.step().unwrap(), FollowerState::Watching);
        assert_eq!(sink.error_count(), 2);
    }

    #[rstest]
    fn missing_replacement_is_fatal(mut harness: Harness) {
        fs::remove_file(&harness.path).unwrap();
        harness.feed.removed();

        let err = harness.follower.step().unwrap_err();
        assert!(matches!(err, FollowerError::Reopen { .. }));
        assert_eq!(harness.follower.state(), FollowerState::Stopped);
    }

    #[rstest]
    fn watcher_errors_are_counted_and_survived(mut harness: Harness) {
        harness.feed.error(notify::Error::generic("queue overflow"));
        assert_eq!(harness.follower.step().unwrap(), FollowerState::Watching);
        assert_eq!(harness.sink.error_count(), 1);

        harness.append_and_notify("gpu[*]: a b c d 3\n");
        assert_eq!(harness.sink.rates(), vec![3]);
    }

    #[rstest]
    fn run_stops_on_shutdown(harness: Harness) {
        append(&harness.path, "gpu[*]: a b c d 4\n");
        harness.feed.write();
        harness.feed.shutdown();

        harness.follower.run().unwrap();
        assert_eq!(harness.sink.rates(), vec![4]);
    }

    #[rstest]
    fn run_stops_when_subscription_closes(harness: Harness) {
        let Harness {
            follower, feed, ..
        } = harness;
        drop(feed);
        follower.run().unwrap();
    }

    #[rstest]
    fn stopped_follower_stays_stopped(mut harness: Harness) {
        harness.feed.shutdown();
        assert_eq!(harness.follower.step().unwrap(), FollowerState::Stopped);
        assert_eq!(harness.follower.step().unwrap(), FollowerState::Stopped);
    }

    #[test]
    fn missing_file_is_fatal_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let (subscription, _feed) = Subscription::channel();
        let sink: Arc<dyn MetricSink> = Arc::new(MemorySink::new());
        let result = TailFollower::with_subscription(
            dir.path().join("missing.log"),
            subscription,
            sink,
            FollowerConfig::default(),
        );
        assert!(matches!(result, Err(FollowerError::Open { .. })));
    }
}
