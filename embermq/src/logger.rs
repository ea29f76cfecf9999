use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};

use anyhow::Result;
use slog::{b, o, Drain};
use slog_logfmt::Logfmt;

use crate::settings::log::{Level, To};
use crate::settings::{Log, ValueMut};

pub use slog::Logger;

/// Builds the slog pipeline from the `[log]` section and installs it behind
/// the `log` facade the rest of the crate logs through. Call once, early.
pub fn init(cfg: &Log) -> Result<Logger> {
    let logger = config_logger(cfg.filename(), cfg.to.clone(), cfg.level.clone());
    log::set_boxed_logger(Box::new(FacadeBridge(logger.clone())))?;
    log::set_max_level(slog_to_facade(cfg.level.get().inner()).to_level_filter());
    Ok(logger)
}

pub fn config_logger(filename: String, to: ValueMut<To>, level: ValueMut<Level>) -> Logger {
    let drain = Logfmt::new(SinkWriter::new(filename, to))
        .set_prefix(move |io: &mut dyn io::Write, rec: &slog::Record| -> slog::Result {
            write!(
                io,
                "{date} {level} {module}.{line} | {msg}\t",
                date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level = rec.level().as_short_str(),
                module = rec.module(),
                line = rec.line(),
                msg = rec.msg(),
            )?;
            Ok(())
        })
        .build()
        .fuse();

    let drain = RuntimeLevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(8192)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    slog::Logger::root(drain, o!())
}

/// Routes `log` macro records into the slog pipeline.
struct FacadeBridge(Logger);

impl log::Log for FacadeBridge {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = facade_to_slog(r.metadata().level());
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), b!()))
    }

    fn flush(&self) {}
}

fn facade_to_slog(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_to_facade(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();
    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// The runtime-adjustable level gate; `level.set(..)` takes effect on the
/// next record.
struct RuntimeLevelFilter<D> {
    drain: D,
    level: ValueMut<Level>,
}

impl<D> Drain for RuntimeLevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level.get().inner()) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// Writes to console, file, both or neither, per the runtime-mutable sink
/// selection. The file is opened lazily on first use.
struct SinkWriter {
    filename: String,
    to: ValueMut<To>,
    file: Option<File>,
    console: Stdout,
}

impl SinkWriter {
    fn new(filename: String, to: ValueMut<To>) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&File> {
        let file = match self.file.take() {
            Some(f) => f,
            None => open_file(&self.filename)?,
        };
        Ok(self.file.insert(file))
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let to = self.to.get();
        let mut n = buf.len();
        if to.console() {
            n = self.console.write(buf)?;
        }
        if to.file() {
            n = self.file()?.write(buf)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let to = self.to.get();
        if to.console() {
            self.console.flush()?;
        }
        if to.file() {
            self.file()?.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename)
}
