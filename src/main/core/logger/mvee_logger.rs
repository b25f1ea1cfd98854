use std::cell::RefCell;
use std::io::Write;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

/// Trigger an asynchronous flush when this many lines are queued.
const ASYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10_000;

/// Performs a *synchronous* flush when this many lines are queued. If log lines keep coming in
/// faster than they can be flushed, the logging thread waits for the flush rather than letting
/// the queue grow.
const SYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10 * ASYNC_FLUSH_QD_LINES_THRESHOLD;

/// Logging thread flushes at least this often.
const MIN_FLUSH_FREQUENCY: Duration = Duration::from_secs(1);

/// The name of the log file within the log directory.
pub const LOG_FILE_NAME: &str = "MVEE.log";

static MVEE_LOGGER: Lazy<MveeLogger> = Lazy::new(MveeLogger::new);

/// Wall time of the log lines is relative to this.
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Initialize the supervisor's logger. Records are written to stdout, and to `log_file` if
/// given. With `warnings_to_stderr`, warnings and errors are also written to stderr.
pub fn init(
    max_log_level: LevelFilter,
    warnings_to_stderr: bool,
    log_file: Option<std::fs::File>,
) -> Result<(), SetLoggerError> {
    Lazy::force(&START_TIME);
    MVEE_LOGGER.set_max_level(max_log_level);
    MVEE_LOGGER.set_warnings_to_stderr(warnings_to_stderr);
    *MVEE_LOGGER.log_file.lock().unwrap() = log_file.map(std::io::BufWriter::new);

    log::set_logger(&*MVEE_LOGGER)?;
    log::set_max_level(max_log_level);

    // Start the thread that will receive log records and flush them to output.
    std::thread::Builder::new()
        .name("mvee-logger".to_string())
        .spawn(move || MVEE_LOGGER.logger_thread_fn())
        .unwrap();

    // Arrange to flush the logger on panic.
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Flush on the current thread rather than asking the logger thread, which may be the one
        // panicking.
        MVEE_LOGGER.flush_records(None).ok();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

/// Block until all records logged so far have been written.
pub fn flush() {
    log::logger().flush();
}

/// When disabled, the logger thread is notified to write each record as soon as it's created.
/// The calling thread still isn't blocked on the record actually being written, though.
pub fn set_buffering_enabled(buffering_enabled: bool) {
    MVEE_LOGGER.set_buffering_enabled(buffering_enabled);
}

/// A logger shared by the management thread and all monitor threads.
///
/// Records are formatted on the calling thread and queued. A helper thread writes them out, so
/// that a monitor doesn't block on stdout while its variants are stopped.
pub struct MveeLogger {
    // The Sender half of a channel isn't Sync, so it's protected by a Mutex. It's only locked
    // once per thread to clone it into the thread-local SENDER.
    command_sender: Mutex<Sender<LoggerCommand>>,

    // Only locked by the logger thread, which keeps it locked for as long as it's running.
    command_receiver: Mutex<Receiver<LoggerCommand>>,

    // Commands go through the channel since this queue doesn't support blocking operations.
    records: ArrayQueue<MveeLogRecord>,

    buffering_enabled: RwLock<bool>,

    max_log_level: OnceCell<LevelFilter>,

    warnings_to_stderr: OnceCell<bool>,

    log_file: Mutex<Option<std::io::BufWriter<std::fs::File>>>,
}

thread_local!(static SENDER: RefCell<Option<Sender<LoggerCommand>>> = const { RefCell::new(None) });
thread_local!(static THREAD_NAME: String = get_thread_name());
thread_local!(static THREAD_ID: nix::unistd::Pid = nix::unistd::gettid());

fn get_thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or_default()
        .to_string()
}

impl MveeLogger {
    fn new() -> MveeLogger {
        let (sender, receiver) = std::sync::mpsc::channel();

        MveeLogger {
            records: ArrayQueue::new(SYNC_FLUSH_QD_LINES_THRESHOLD),
            command_sender: Mutex::new(sender),
            command_receiver: Mutex::new(receiver),
            buffering_enabled: RwLock::new(true),
            max_log_level: OnceCell::new(),
            warnings_to_stderr: OnceCell::new(),
            log_file: Mutex::new(None),
        }
    }

    fn logger_thread_fn(&self) {
        let command_receiver = self.command_receiver.lock().unwrap();

        loop {
            use std::sync::mpsc::RecvTimeoutError;
            let result = match command_receiver.recv_timeout(MIN_FLUSH_FREQUENCY) {
                Ok(LoggerCommand::Flush(done_sender)) => self.flush_records(done_sender),
                Err(RecvTimeoutError::Timeout) => self.flush_records(None),
                // the logger is static, so the sender is never dropped
                Err(RecvTimeoutError::Disconnected) => return,
            };

            if let Err(e) = result {
                // we can't log from this thread
                eprintln!("WARNING: Logger couldn't write records: {e}");
            }
        }
    }

    // Write the records that are queued now to the outputs. If `done_sender` is provided, it's
    // notified after the flush has completed.
    fn flush_records(&self, done_sender: Option<Sender<()>>) -> std::io::Result<()> {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut log_file = self.log_file.lock().unwrap();

        let result = self.write_queued(
            &mut std::io::BufWriter::new(stdout.lock()),
            &mut std::io::BufWriter::new(stderr.lock()),
            log_file.as_mut(),
        );

        if let Some(done_sender) = done_sender {
            // the calling thread may have gone away
            done_sender.send(()).unwrap_or_else(|e| {
                eprintln!("WARNING: Logger couldn't notify calling thread: {e:?}")
            });
        }

        result
    }

    fn write_queued(
        &self,
        stdout: &mut impl Write,
        stderr: &mut impl Write,
        mut log_file: Option<&mut impl Write>,
    ) -> std::io::Result<()> {
        // Only flush records that are already in the queue, so that a synchronous flush isn't
        // held up by records that arrive while flushing.
        let mut toflush = self.records.len();
        let warnings_to_stderr = self.warnings_to_stderr.get().copied().unwrap_or(true);

        while toflush > 0 {
            // another thread may be consuming from the queue if it panicked
            let Some(record) = self.records.pop() else {
                break;
            };
            toflush -= 1;

            let line = record.to_string();
            stdout.write_all(line.as_bytes())?;
            if record.level <= Level::Warn && warnings_to_stderr {
                stderr.write_all(line.as_bytes())?;
            }
            if let Some(log_file) = log_file.as_mut() {
                log_file.write_all(line.as_bytes())?;
            }
        }

        stdout.flush()?;
        stderr.flush()?;
        if let Some(log_file) = log_file {
            log_file.flush()?;
        }

        Ok(())
    }

    pub fn set_buffering_enabled(&self, buffering_enabled: bool) {
        *self.buffering_enabled.write().unwrap() = buffering_enabled;
    }

    /// If the maximum log level has not yet been set, returns `LevelFilter::Trace`.
    pub fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    /// Is only intended to be called from `init()`. Will panic if called more than once.
    fn set_max_level(&self, level: LevelFilter) {
        self.max_log_level.set(level).unwrap()
    }

    /// Is only intended to be called from `init()`. Will panic if called more than once.
    fn set_warnings_to_stderr(&self, val: bool) {
        self.warnings_to_stderr.set(val).unwrap()
    }

    // Send a flush command to the logger thread and block until it's completed.
    fn flush_sync(&self) {
        let (done_sender, done_receiver) = std::sync::mpsc::channel();
        self.send_command(LoggerCommand::Flush(Some(done_sender)));
        done_receiver.recv().unwrap_or_else(|e| {
            eprintln!("WARNING: Logger thread didn't complete the flush: {e:?}")
        });
    }

    fn flush_async(&self) {
        self.send_command(LoggerCommand::Flush(None));
    }

    fn send_command(&self, cmd: LoggerCommand) {
        SENDER
            .try_with(|thread_sender| {
                let mut thread_sender = thread_sender.borrow_mut();
                let sender = thread_sender
                    .get_or_insert_with(|| self.command_sender.lock().unwrap().clone());
                sender.send(cmd).unwrap_or_else(|e| {
                    eprintln!("WARNING: Couldn't send command to logger thread: {e:?}");
                });
            })
            .unwrap_or_else(|e| {
                eprintln!("WARNING: Couldn't get sender channel to logger thread: {e:?}");
            });
    }

    fn push_record(&self, mut record: MveeLogRecord) {
        loop {
            match self.records.push(record) {
                Ok(()) => break,
                Err(r) => {
                    // Queue is full. Flush it and try again.
                    record = r;
                    self.flush_sync();
                }
            }
        }
    }
}

impl Log for MveeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.level();
        self.push_record(MveeLogRecord {
            level,
            file: record.file_static(),
            module_path: record.module_path_static(),
            line: record.line(),
            message: std::fmt::format(*record.args()),
            wall_time: START_TIME.elapsed(),
            thread_name: THREAD_NAME
                .try_with(|name| name.clone())
                .unwrap_or_else(|_| get_thread_name()),
            thread_id: THREAD_ID
                .try_with(|id| *id)
                .unwrap_or_else(|_| nix::unistd::gettid()),
        });

        if level == Level::Error {
            // Flush *synchronously*, since we're likely about to exit.
            self.flush_sync();
        } else if self.records.len() > ASYNC_FLUSH_QD_LINES_THRESHOLD
            || !*self.buffering_enabled.read().unwrap()
        {
            self.flush_async();
        }
    }

    fn flush(&self) {
        self.flush_sync();
    }
}

struct MveeLogRecord {
    level: Level,
    file: Option<&'static str>,
    module_path: Option<&'static str>,
    line: Option<u32>,
    message: String,
    wall_time: Duration,
    thread_name: String,
    thread_id: nix::unistd::Pid,
}

impl std::fmt::Display for MveeLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.wall_time.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}.{:06}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.wall_time.subsec_micros()
        )?;
        write!(f, " [{}:{}]", self.thread_id, self.thread_name)?;
        write!(f, " [{level}]", level = self.level)?;
        write!(
            f,
            " [{file}:",
            file = self
                .file
                .map(|f| f.rsplit('/').next().unwrap_or(f))
                .unwrap_or("n/a"),
        )?;
        match self.line {
            Some(line) => write!(f, "{line}")?,
            None => write!(f, "n/a")?,
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )
    }
}

enum LoggerCommand {
    // Flush; takes an optional one-shot channel to notify that the flush has completed.
    Flush(Option<Sender<()>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: Level, message: &str) -> MveeLogRecord {
        MveeLogRecord {
            level,
            file: Some("src/main/core/registry.rs"),
            module_path: Some("mvee::core::registry"),
            line: Some(42),
            message: message.to_string(),
            wall_time: Duration::from_micros(3_723_000_005),
            thread_name: "monitor-1".to_string(),
            thread_id: nix::unistd::Pid::from_raw(77),
        }
    }

    #[test]
    fn test_record_format() {
        assert_eq!(
            record(Level::Info, "hello").to_string(),
            "01:02:03.000005 [77:monitor-1] [INFO] [registry.rs:42] [mvee::core::registry] hello\n"
        );

        let mut r = record(Level::Debug, "x");
        r.file = None;
        r.line = None;
        r.module_path = None;
        assert!(r.to_string().ends_with("[DEBUG] [n/a:n/a] [n/a] x\n"));
    }

    #[test]
    fn test_write_queued() {
        let logger = MveeLogger::new();
        logger.set_warnings_to_stderr(true);
        logger.push_record(record(Level::Info, "first"));
        logger.push_record(record(Level::Warn, "second"));
        logger.push_record(record(Level::Error, "third"));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut file = Vec::new();
        logger
            .write_queued(&mut stdout, &mut stderr, Some(&mut file))
            .unwrap();

        let stdout = String::from_utf8(stdout).unwrap();
        let stderr = String::from_utf8(stderr).unwrap();
        assert_eq!(stdout.lines().count(), 3);
        assert_eq!(stderr.lines().count(), 2);
        assert!(stderr.contains("second") && stderr.contains("third"));
        assert_eq!(String::from_utf8(file).unwrap(), stdout);
        assert!(logger.records.is_empty());
    }

    #[test]
    fn test_no_stderr_duplication() {
        let logger = MveeLogger::new();
        logger.set_warnings_to_stderr(false);
        logger.push_record(record(Level::Error, "oops"));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        logger
            .write_queued(&mut stdout, &mut stderr, None::<&mut Vec<u8>>)
            .unwrap();
        assert!(!stdout.is_empty());
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_enabled() {
        let logger = MveeLogger::new();
        // unset means everything
        assert!(logger.enabled(&Metadata::builder().level(Level::Trace).build()));

        logger.set_max_level(LevelFilter::Info);
        assert!(logger.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).build()));
    }

    #[test]
    fn test_init_error_is_std_error() {
        // init errors are propagated through anyhow
        fn assert_std_error<E: std::error::Error + Send + Sync + 'static>() {}
        assert_std_error::<SetLoggerError>();
    }
}
