//! Console logger: timestamped, coloured by level.

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            Level::Error => "E".bright_red().bold(),
            Level::Warn => "W".bright_yellow(),
            Level::Info => "I".bright_green(),
            Level::Debug => "D".bright_cyan(),
            Level::Trace => "V".dimmed(),
        };
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        let thread = std::thread::current();
        println!(
            "{} {} ({}) {:9} {}",
            level,
            timestamp.dimmed(),
            thread.name().unwrap_or("?"),
            record.target().bright_white(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs the console logger; a second call is a no-op.
pub fn init(level: LevelFilter) {
    let logger = Box::new(ConsoleLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
