//! Progress events raised synchronously from inside long-running archive
//! calls, and the bridge that hands them to caller logic.
//!
//! Engines report every event on the thread that made the call, before the
//! call returns. The bridge forwards each one in order to a
//! [`ProgressHandler`] together with the caller's context, and passes the
//! handler's status back to the engine untouched. Returning
//! [`ProgressStatus::Abort`] is the only way to cancel an operation.

use std::path::PathBuf;

use tracing::trace;

use crate::engine::ProgressSink;

macro_rules! progress_msgs {
    ($( $(#[$meta:meta])* $name:ident = $value:expr, )*) => {
        /// Kind of a progress event, as numbered by the engine.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ProgressMsg {
            $( $(#[$meta])* $name, )*
            /// A kind this crate has no name for.
            Unknown(u32),
        }

        impl ProgressMsg {
            pub const fn from_raw(raw: u32) -> Self {
                match raw {
                    $( $value => Self::$name, )*
                    other => Self::Unknown(other),
                }
            }

            pub const fn as_raw(self) -> u32 {
                match self {
                    $( Self::$name => $value, )*
                    Self::Unknown(raw) => raw,
                }
            }
        }
    };
}

progress_msgs! {
    ExtractImageBegin = 0,
    ExtractTreeBegin = 1,
    ExtractFileStructure = 3,
    ExtractStreams = 4,
    ExtractSpwmPartBegin = 5,
    ExtractMetadata = 6,
    ExtractImageEnd = 7,
    ExtractTreeEnd = 8,
    ScanBegin = 9,
    ScanDentry = 10,
    ScanEnd = 11,
    WriteStreams = 12,
    WriteMetadataBegin = 13,
    WriteMetadataEnd = 14,
    Rename = 15,
    VerifyIntegrity = 16,
    CalcIntegrity = 17,
    SplitBeginPart = 19,
    SplitEndPart = 20,
    UpdateBeginCommand = 21,
    UpdateEndCommand = 22,
    ReplaceFileInWim = 23,
    WimbootExclude = 24,
    UnmountBegin = 25,
    DoneWithFile = 26,
    BeginVerifyImage = 27,
    EndVerifyImage = 28,
    VerifyStreams = 29,
    TestFileExclusion = 30,
    HandleError = 31,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteStreamsProgress {
    pub total_bytes: u64,
    pub total_streams: u64,
    pub completed_bytes: u64,
    pub completed_streams: u64,
    pub num_threads: u32,
    pub compression_type: i32,
    pub total_parts: u32,
    pub completed_parts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStatus {
    Ok,
    Excluded,
    Unsupported,
    FixedSymlink,
    NotFixedSymlink,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanProgress {
    pub source: PathBuf,
    pub cur_path: Option<PathBuf>,
    pub status: ScanStatus,
    pub num_dirs_scanned: u64,
    pub num_nondirs_scanned: u64,
    pub num_bytes_scanned: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractProgress {
    pub image: u32,
    pub extract_flags: u32,
    pub wimfile_name: Option<PathBuf>,
    pub image_name: Option<String>,
    pub target: PathBuf,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub total_streams: u64,
    pub completed_streams: u64,
    pub current_file_count: u64,
    pub end_file_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntegrityProgress {
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub chunk_size: u32,
    pub filename: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SplitProgress {
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub cur_part_number: u32,
    pub total_parts: u32,
    pub part_name: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyImageProgress {
    pub wimfile: Option<PathBuf>,
    pub total_images: u32,
    pub current_image: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyStreamsProgress {
    pub wimfile: Option<PathBuf>,
    pub total_streams: u64,
    pub total_bytes: u64,
    pub completed_streams: u64,
    pub completed_bytes: u64,
}

/// Payload of a progress event. Which variant arrives depends on the
/// [`ProgressMsg`] it was sent with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressInfo {
    WriteStreams(WriteStreamsProgress),
    Scan(ScanProgress),
    Extract(ExtractProgress),
    Rename { from: PathBuf, to: PathBuf },
    Integrity(IntegrityProgress),
    Split(SplitProgress),
    VerifyImage(VerifyImageProgress),
    VerifyStreams(VerifyStreamsProgress),
    DoneWithFile { path: PathBuf },
    /// The event carries no payload.
    Empty,
}

/// What a handler tells the engine after an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressStatus {
    #[default]
    Continue,
    Abort,
    /// Any other value; handed to the engine verbatim.
    Other(i32),
}

impl ProgressStatus {
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Continue => 0,
            Self::Abort => 1,
            Self::Other(raw) => raw,
        }
    }

    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Continue,
            1 => Self::Abort,
            other => Self::Other(other),
        }
    }
}

/// Caller logic invoked for each progress event.
///
/// Returning `None` means "continue".
pub trait ProgressHandler<C: ?Sized> {
    fn on_progress(
        &mut self,
        msg: ProgressMsg,
        info: &ProgressInfo,
        context: &mut C,
    ) -> Option<ProgressStatus>;
}

impl<C, F> ProgressHandler<C> for F
where
    C: ?Sized,
    F: FnMut(ProgressMsg, &ProgressInfo, &mut C) -> Option<ProgressStatus>,
{
    fn on_progress(
        &mut self,
        msg: ProgressMsg,
        info: &ProgressInfo,
        context: &mut C,
    ) -> Option<ProgressStatus> {
        self(msg, info, context)
    }
}

/// A handler and its context, held for the whole of one engine call.
///
/// Both are borrowed mutably for the lifetime `'a`, so neither can move or
/// be dropped while an operation that was given this context is running,
/// however many times the engine calls back into it.
pub struct ProgressContext<'a, C: ?Sized> {
    handler: &'a mut dyn ProgressHandler<C>,
    context: &'a mut C,
    delivered: u64,
    last_status: ProgressStatus,
}

impl<'a, C: ?Sized> ProgressContext<'a, C> {
    pub fn new(handler: &'a mut dyn ProgressHandler<C>, context: &'a mut C) -> Self {
        Self {
            handler,
            context,
            delivered: 0,
            last_status: ProgressStatus::Continue,
        }
    }

    /// Number of events handed to the handler so far.
    pub fn events_delivered(&self) -> u64 {
        self.delivered
    }

    /// Status returned for the most recent event.
    pub fn last_status(&self) -> ProgressStatus {
        self.last_status
    }

    pub fn context(&self) -> &C {
        &*self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut *self.context
    }

    fn dispatch(&mut self, msg: ProgressMsg, info: &ProgressInfo) -> i32 {
        self.delivered += 1;
        let status = self
            .handler
            .on_progress(msg, info, &mut *self.context)
            .unwrap_or_default();
        trace!(?msg, seq = self.delivered, status = status.as_raw(), "progress event");
        self.last_status = status;
        status.as_raw()
    }

    /// Runs `call` with a trampoline that routes engine events to the handler.
    pub(crate) fn run<T>(&mut self, call: impl FnOnce(&mut ProgressSink<'_>) -> T) -> T {
        let mut trampoline = |msg: ProgressMsg, info: &ProgressInfo| self.dispatch(msg, info);
        call(&mut trampoline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_keep_their_number() {
        assert_eq!(ProgressMsg::from_raw(12), ProgressMsg::WriteStreams);
        assert_eq!(ProgressMsg::from_raw(18), ProgressMsg::Unknown(18));
        assert_eq!(ProgressMsg::Unknown(18).as_raw(), 18);
        assert_eq!(ProgressMsg::HandleError.as_raw(), 31);
    }

    #[test]
    fn handler_without_signal_continues() {
        let mut seen = Vec::new();
        let mut handler = |msg: ProgressMsg,
                           _: &ProgressInfo,
                           seen: &mut Vec<ProgressMsg>|
         -> Option<ProgressStatus> {
            seen.push(msg);
            None
        };
        let mut ctx = ProgressContext::new(&mut handler, &mut seen);
        let raw = ctx.run(|sink| sink(ProgressMsg::ScanBegin, &ProgressInfo::Empty));
        assert_eq!(raw, 0);
        assert_eq!(ctx.events_delivered(), 1);
        assert_eq!(seen, vec![ProgressMsg::ScanBegin]);
    }

    #[test]
    fn handler_status_is_forwarded_verbatim() {
        let mut handler =
            |_: ProgressMsg, _: &ProgressInfo, _: &mut ()| Some(ProgressStatus::Other(42));
        let mut unit = ();
        let mut ctx = ProgressContext::new(&mut handler, &mut unit);
        let raw = ctx.run(|sink| sink(ProgressMsg::WriteStreams, &ProgressInfo::Empty));
        assert_eq!(raw, 42);
        assert_eq!(ctx.last_status(), ProgressStatus::Other(42));
    }
}
