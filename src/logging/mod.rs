use std::collections::BTreeSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

pub const ALL_SUBSYSTEMS: &str = "all";

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn as_colored_str(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
            Self::Verbose => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

/// Which subsystems may emit debug and verbose lines.
///
/// A subsystem is the part of a log context before the first `::`, so the
/// context `files::advance` belongs to the `files` subsystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugSubsystems {
    All,
    Only(BTreeSet<String>),
}

impl Default for DebugSubsystems {
    fn default() -> Self {
        Self::All
    }
}

impl DebugSubsystems {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selected = BTreeSet::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            if name == ALL_SUBSYSTEMS {
                return Self::All;
            }
            selected.insert(name.to_owned());
        }

        if selected.is_empty() {
            Self::All
        } else {
            Self::Only(selected)
        }
    }

    fn allows(&self, context: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Only(selected) => {
                let Some(context) = context else {
                    return false;
                };
                let subsystem = context.split("::").next().unwrap_or(context);
                selected.contains(subsystem)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
    pub debug_subsystems: DebugSubsystems,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
            debug_subsystems: DebugSubsystems::All,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Appends every line to a file, used for `--debug-file`.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.should_log(level, context) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    fn should_log(&self, level: LogLevel, context: Option<&str>) -> bool {
        if level > self.config.min_level {
            return false;
        }
        if level >= LogLevel::Debug {
            return self.config.debug_subsystems.allows(context);
        }
        true
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            level.as_colored_str()
        } else {
            level.as_str()
        };

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!("{timestamp} [{rendered_level}]{context_part} {message}{payload_part}")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{DebugSubsystems, FileSink, LogLevel, LogSink, Logger, LoggerConfig};

    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub(crate) lines: Mutex<Vec<String>>,
    }

    impl LogSink for MemorySink {
        fn write_line(&self, line: &str) {
            self.lines
                .lock()
                .expect("memory sink mutex poisoned")
                .push(line.to_owned());
        }
    }

    pub(crate) fn quiet_logger() -> Arc<Logger> {
        Arc::new(Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Error,
                ..LoggerConfig::default()
            },
            Arc::new(MemorySink::default()),
        ))
    }

    fn debug_config(subsystems: DebugSubsystems) -> LoggerConfig {
        LoggerConfig {
            min_level: LogLevel::Debug,
            human_friendly: false,
            debug_subsystems: subsystems,
        }
    }

    #[test]
    fn parses_config_levels() {
        assert_eq!(LogLevel::from_config_value("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_config_value(" WARN "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn debug_threshold_excludes_verbose_logs() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(debug_config(DebugSubsystems::All), sink.clone());

        logger.debug(Some("tests::logger"), "debug message");
        logger.verbose(Some("tests::logger"), "verbose message");

        let lines = sink.lines.lock().expect("memory sink mutex poisoned");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG]"));
    }

    #[test]
    fn debug_lines_are_filtered_by_subsystem() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            debug_config(DebugSubsystems::from_names(["wire"])),
            sink.clone(),
        );

        logger.debug(Some("wire::handshake"), "kept");
        logger.debug(Some("files::advance"), "dropped");
        logger.debug(None, "dropped without context");
        logger.warn(Some("files::advance"), "warnings always pass");

        let lines = sink.lines.lock().expect("memory sink mutex poisoned");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("kept"));
        assert!(lines[1].contains("[WARN]"));
    }

    #[test]
    fn all_keyword_enables_every_subsystem() {
        assert_eq!(
            DebugSubsystems::from_names(["wire", "all"]),
            DebugSubsystems::All
        );
        assert_eq!(
            DebugSubsystems::from_names(Vec::<String>::new()),
            DebugSubsystems::All
        );
    }

    #[test]
    fn log_supports_optional_json_payload() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(LoggerConfig::default(), sink.clone());

        logger.log(
            LogLevel::Info,
            Some("tests::payload"),
            "payload attached",
            Some(json!({"worker":"conn-3","blobs":2})),
        );

        let lines = sink.lines.lock().expect("memory sink mutex poisoned");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO]"));
        assert!(lines[0].contains("[tests::payload]"));
        assert!(lines[0].contains("payload={\"blobs\":2,\"worker\":\"conn-3\"}"));
        assert!(lines[0].starts_with("20"));
    }

    #[test]
    fn file_sink_appends_lines() {
        let path = std::env::temp_dir().join(format!(
            "dataswarm-log-test-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let sink = Arc::new(FileSink::open(&path).expect("file sink should open"));
        let logger = Logger::with_sink(LoggerConfig::default(), sink);
        logger.info(Some("tests::file"), "first");
        logger.error(Some("tests::file"), "second");

        let content = std::fs::read_to_string(&path).expect("log file should be readable");
        std::fs::remove_file(&path).expect("temp log cleanup should succeed");
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("second"));
    }
}
