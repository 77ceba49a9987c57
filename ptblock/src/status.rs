//! The status word that a block decoder hands back from every call.
//!
//! The encoding follows libipt: a negative value is an error code (see [ErrorCode]), whereas a
//! non-negative value is a set of status flags.

use std::{borrow::Cow, error::Error, fmt};
use strum::{EnumCount, FromRepr, IntoEnumIterator};
use strum_macros::EnumIter;

/// A block decoder status.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Status(i32);

impl Status {
    /// No flags set: the decoder is ready to hand out a block.
    pub const CLEAN: Self = Self(0);
    /// The instruction pointer of the last item was suppressed.
    pub const IP_SUPPRESSED: i32 = 1 << 0;
    /// There is an event pending which must be fetched before the next block.
    pub const EVENT_PENDING: i32 = 1 << 2;
    /// The end of the trace stream has been reached.
    pub const END_OF_STREAM: i32 = 1 << 3;

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// A status carrying only the given flags.
    pub fn from_flags(flags: i32) -> Self {
        debug_assert!(flags >= 0);
        Self(flags)
    }

    /// A status carrying the given error.
    pub fn from_error(code: ErrorCode) -> Self {
        Self(-(code as i32))
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn is_error(&self) -> bool {
        self.0 < 0
    }

    /// If this status is an error, return it.
    pub fn error(&self) -> Option<EngineError> {
        if self.is_error() {
            Some(EngineError(self.0))
        } else {
            None
        }
    }

    /// Returns `true` if this status is the engine's end-of-stream *error*.
    pub fn is_eos_error(&self) -> bool {
        self.0 == -(ErrorCode::Eos as i32)
    }

    fn has_flag(&self, flag: i32) -> bool {
        !self.is_error() && self.0 & flag != 0
    }

    pub fn event_pending(&self) -> bool {
        self.has_flag(Self::EVENT_PENDING)
    }

    pub fn end_of_stream(&self) -> bool {
        self.has_flag(Self::END_OF_STREAM)
    }
}

/// The status flags, in the order they are rendered.
#[derive(Clone, Copy, EnumIter)]
enum Flag {
    IpSuppressed,
    EventPending,
    EndOfStream,
}

impl Flag {
    fn bit(self) -> i32 {
        match self {
            Self::IpSuppressed => Status::IP_SUPPRESSED,
            Self::EventPending => Status::EVENT_PENDING,
            Self::EndOfStream => Status::END_OF_STREAM,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::IpSuppressed => "ip_suppressed",
            Self::EventPending => "event_pending",
            Self::EndOfStream => "eos",
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(e) = self.error() {
            return write!(f, "Status({e})");
        }
        let flags = Flag::iter()
            .filter(|fl| self.0 & fl.bit() != 0)
            .map(Flag::name)
            .collect::<Vec<_>>();
        let other = Flag::iter().fold(self.0, |acc, fl| acc & !fl.bit());
        if other != 0 {
            return write!(f, "Status({} | 0x{:x})", flags.join(" | "), other);
        }
        write!(f, "Status({})", flags.join(" | "))
    }
}

/// The error codes a decode engine can report, numbered as in libipt's `enum pt_error_code`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, EnumCount, Eq, FromRepr, PartialEq)]
pub enum ErrorCode {
    Ok = 0,
    Internal,
    Invalid,
    NoSync,
    BadOpcode,
    BadPacket,
    BadContext,
    Eos,
    BadQuery,
    NoMem,
    BadConfig,
    NoIp,
    IpSuppressed,
    NoMap,
    BadInsn,
    NoTime,
    NoCbr,
    BadImage,
    BadLock,
    NotSupported,
    RetStackEmpty,
    BadRetComp,
    BadStatusUpdate,
    NoEnable,
    EventIgnored,
    Overflow,
    BadFile,
    BadCpu,
}

impl ErrorCode {
    /// The description libipt gives for this error.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Internal => "internal error",
            Self::Invalid => "invalid argument",
            Self::NoSync => "decoder out of sync",
            Self::BadOpcode => "unknown opcode",
            Self::BadPacket => "unknown packet",
            Self::BadContext => "unexpected packet context",
            Self::Eos => "reached end of trace stream",
            Self::BadQuery => "trace stream does not match query",
            Self::NoMem => "out of memory",
            Self::BadConfig => "bad configuration",
            Self::NoIp => "no ip",
            Self::IpSuppressed => "ip has been suppressed",
            Self::NoMap => "no memory mapped at this address",
            Self::BadInsn => "unknown instruction",
            Self::NoTime => "no timing information",
            Self::NoCbr => "no core:bus ratio",
            Self::BadImage => "bad image",
            Self::BadLock => "locking error",
            Self::NotSupported => "not supported",
            Self::RetStackEmpty => "compressed return without call",
            Self::BadRetComp => "bad compressed return",
            Self::BadStatusUpdate => "bad status update",
            Self::NoEnable => "expected tracing enabled event",
            Self::EventIgnored => "event ignored",
            Self::Overflow => "overflow",
            Self::BadFile => "bad file",
            Self::BadCpu => "unknown cpu",
        }
    }

    #[cfg(decoder_libipt)]
    fn message(&self) -> Cow<'static, str> {
        // Ask libipt, in case its messages differ from ours.
        Cow::Owned(crate::libipt::errstr(*self))
    }

    #[cfg(not(decoder_libipt))]
    fn message(&self) -> Cow<'static, str> {
        Cow::Borrowed(self.as_str())
    }
}

/// An error indicated by a negative engine status code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineError(i32);

impl EngineError {
    /// Wraps a raw (negative) engine return code.
    pub fn from_raw(raw: i32) -> Self {
        debug_assert!(raw < 0);
        Self(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    /// The error code, if the engine used one we know about.
    pub fn code(&self) -> Option<ErrorCode> {
        self.0.checked_neg().and_then(ErrorCode::from_repr)
    }

    /// Returns `true` if the hardware trace buffer overflowed while the trace was collected.
    pub fn is_overflow(&self) -> bool {
        self.code() == Some(ErrorCode::Overflow)
    }
}

impl From<ErrorCode> for EngineError {
    fn from(code: ErrorCode) -> Self {
        Self(-(code as i32))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code() {
            Some(c) => write!(f, "libipt error: {}", c.message()),
            None => write!(f, "libipt error: unknown error code {}", self.0),
        }
    }
}

impl Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::{EngineError, ErrorCode, Status};
    use strum::EnumCount;

    #[test]
    fn flags() {
        let s = Status::from_flags(Status::EVENT_PENDING | Status::END_OF_STREAM);
        assert!(s.event_pending());
        assert!(s.end_of_stream());
        assert!(!s.is_error());
        assert_eq!(Status::CLEAN, Status::from_raw(0));
        assert!(!Status::CLEAN.event_pending());
    }

    #[test]
    fn negative_status_has_no_flags() {
        // -7 has bit 3 set in two's complement, but it's an error, not an end-of-stream flag.
        let s = Status::from_error(ErrorCode::Eos);
        assert_eq!(s.raw(), -7);
        assert!(s.is_error());
        assert!(s.is_eos_error());
        assert!(!s.end_of_stream());
        assert!(!s.event_pending());
        assert_eq!(s.error().unwrap().code(), Some(ErrorCode::Eos));
    }

    #[test]
    fn error_codes() {
        assert_eq!(ErrorCode::COUNT, 28);
        assert_eq!(ErrorCode::BadCpu as i32, 27);
        assert_eq!(ErrorCode::Overflow as i32, 25);
        assert!(EngineError::from(ErrorCode::Overflow).is_overflow());
        assert!(!EngineError::from(ErrorCode::NoMap).is_overflow());
    }

    #[test]
    fn error_strings() {
        assert_eq!(
            EngineError::from(ErrorCode::NoMap).to_string(),
            "libipt error: no memory mapped at this address"
        );
        assert_eq!(
            EngineError::from_raw(-100).to_string(),
            "libipt error: unknown error code -100"
        );
        assert_eq!(ErrorCode::Ok.as_str(), "OK");
        assert_eq!(ErrorCode::BadPacket.as_str(), "unknown packet");
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", Status::CLEAN), "Status()");
        assert_eq!(
            format!("{:?}", Status::from_flags(Status::EVENT_PENDING)),
            "Status(event_pending)"
        );
        assert_eq!(
            format!("{:?}", Status::from_raw(0x8 | 0x1 | 0x40)),
            "Status(ip_suppressed | eos | 0x40)"
        );
        assert_eq!(
            format!("{:?}", Status::from_error(ErrorCode::Eos)),
            "Status(libipt error: reached end of trace stream)"
        );
    }
}
