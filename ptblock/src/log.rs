//! The implementation of the `PTBLOCK_LOG` environment variable. The variable itself is read by
//! [crate::DecoderSessionBuilder::from_env].

use crate::errors::PtBlockError;
use std::{fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

/// How verbose should logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log the opening and closing of sessions, and the regions of each code image.
    SessionEvent,
    /// Log every block the decoder hands out, and the end of the stream.
    BlockEvent,
}

#[derive(Clone, Debug)]
pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Verbosity::Error,
            path: None,
        }
    }
}

impl Log {
    /// Parse a `PTBLOCK_LOG` value, which must be of the form `[<path|->:]<level>`.
    pub(crate) fn parse(s: &str) -> Result<Self, PtBlockError> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // If there's an existing log file, truncate (i.e. empty it), so that later
                    // appends to the log aren't appending to a previous log run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => {
                return Err(PtBlockError::Config(
                    "PTBLOCK_LOG must be of the format `[<path|->:]<level>`".into(),
                ))
            }
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| PtBlockError::Config(format!("Invalid PTBLOCK_LOG level '{s}': {e}")))?;
        // This unwrap can only fail dynamically if we've got the types wrong statically.
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level).ok_or_else(|| {
            PtBlockError::Config(format!(
                "PTBLOCK_LOG level {level} exceeds maximum {max_level}"
            ))
        })?;
        Ok(Self { level, path })
    }

    /// Log to stderr at the given level.
    pub fn with_level(level: Verbosity) -> Self {
        Self { level, path: None }
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Will a message at `level` be written?
    pub fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if !self.enabled(level) {
            assert_ne!(level, Verbosity::Disabled);
            return;
        }
        let kind = match level {
            Verbosity::Disabled => unreachable!(),
            Verbosity::Error => "error",
            Verbosity::Warning => "warning",
            Verbosity::SessionEvent => "session",
            Verbosity::BlockEvent => "block",
        };
        let line = format!("ptblock-{kind}: {msg}");
        match &self.path {
            // Write failures are ignored.
            Some(p) => {
                if let Ok(mut f) = File::options().append(true).open(p) {
                    writeln!(f, "{line}").ok();
                }
            }
            None => eprintln!("{line}"),
        }
    }
}
