use bitflags::bitflags;
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::queue::RequestHandle;

// Exports
mod errors;
pub use errors::FileError;

pub(crate) mod extra;
pub(crate) use extra::{Extra, Progress, ReadWriteExtra};

mod open_mode;
pub use open_mode::OpenMode;

/// Every operation the engine knows how to perform.
///
/// Adding a variant forces every dispatch site in the submission and
/// completion paths to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Close,
    Read,
    Write,
    VectoredRead,
    VectoredWrite,
    Flush,
    Stat,
    Cancel,
}

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::Open,
        Operation::Close,
        Operation::Read,
        Operation::Write,
        Operation::VectoredRead,
        Operation::VectoredWrite,
        Operation::Flush,
        Operation::Stat,
        Operation::Cancel,
    ];
}

bitflags! {
    /// A set of [`Operation`]s, used by backends to declare capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OperationSet: u16 {
        const OPEN = 1;
        const CLOSE = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const VECTORED_READ = 1 << 4;
        const VECTORED_WRITE = 1 << 5;
        const FLUSH = 1 << 6;
        const STAT = 1 << 7;
        const CANCEL = 1 << 8;
    }
}

impl From<Operation> for OperationSet {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Open => OperationSet::OPEN,
            Operation::Close => OperationSet::CLOSE,
            Operation::Read => OperationSet::READ,
            Operation::Write => OperationSet::WRITE,
            Operation::VectoredRead => OperationSet::VECTORED_READ,
            Operation::VectoredWrite => OperationSet::VECTORED_WRITE,
            Operation::Flush => OperationSet::FLUSH,
            Operation::Stat => OperationSet::STAT,
            Operation::Cancel => OperationSet::CANCEL,
        }
    }
}

impl OperationSet {
    pub fn has(&self, op: Operation) -> bool {
        self.contains(op.into())
    }
}

/// Result slot of a request: empty until the request finishes.
pub type RequestResult<T> = Option<Result<T, FileError>>;

/// Callback invoked exactly once with the finished request.
pub struct OnCompletion<T>(Option<Box<dyn FnOnce(T)>>);

impl<T> Default for OnCompletion<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T> fmt::Debug for OnCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.is_some() { "<function>" } else { "<none>" };
        f.debug_tuple("OnCompletion").field(&state).finish()
    }
}

macro_rules! impl_request {
    ($ty:ident, $variant:ident) => {
        impl $ty {
            /// Registers the callback that receives the request back, with its
            /// result slot resolved, once the engine is done with it.
            pub fn on_completion(mut self, f: impl FnOnce($ty) + 'static) -> Self {
                self.callback = OnCompletion(Some(Box::new(f)));
                self
            }

            fn invoke_callback(mut self) {
                if let Some(callback) = self.callback.0.take() {
                    callback(self);
                }
            }
        }

        impl From<$ty> for Request {
            fn from(req: $ty) -> Self {
                Request::$variant(req)
            }
        }
    };
}

/// Open `path` relative to the current working directory.
#[derive(Debug)]
pub struct OpenRequest {
    pub path: PathBuf,
    pub mode: OpenMode,
    pub result: RequestResult<RawFd>,
    callback: OnCompletion<OpenRequest>,
}

impl OpenRequest {
    pub fn new(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        Self {
            path: path.into(),
            mode,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(OpenRequest, Open);

#[derive(Debug)]
pub struct CloseRequest {
    pub fd: RawFd,
    pub result: RequestResult<()>,
    callback: OnCompletion<CloseRequest>,
}

impl CloseRequest {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(CloseRequest, Close);

/// Positional read filling the whole of `destination`, unless end of file is
/// reached first. The result holds the number of bytes read.
#[derive(Debug)]
pub struct ReadRequest {
    pub fd: RawFd,
    pub offset: u64,
    pub destination: Vec<u8>,
    pub result: RequestResult<u64>,
    callback: OnCompletion<ReadRequest>,
}

impl ReadRequest {
    pub fn new(fd: RawFd, offset: u64, destination: Vec<u8>) -> Self {
        Self {
            fd,
            offset,
            destination,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(ReadRequest, Read);

/// Positional write of `source`. The result holds the number of bytes written.
#[derive(Debug)]
pub struct WriteRequest {
    pub fd: RawFd,
    pub offset: u64,
    pub source: Vec<u8>,
    pub result: RequestResult<u64>,
    callback: OnCompletion<WriteRequest>,
}

impl WriteRequest {
    pub fn new(fd: RawFd, offset: u64, source: Vec<u8>) -> Self {
        Self {
            fd,
            offset,
            source,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(WriteRequest, Write);

/// Positional scatter read into `destinations`, in order.
#[derive(Debug)]
pub struct VectoredReadRequest {
    pub fd: RawFd,
    pub offset: u64,
    pub destinations: Vec<Vec<u8>>,
    pub result: RequestResult<u64>,
    callback: OnCompletion<VectoredReadRequest>,
}

impl VectoredReadRequest {
    pub fn new(fd: RawFd, offset: u64, destinations: Vec<Vec<u8>>) -> Self {
        Self {
            fd,
            offset,
            destinations,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(VectoredReadRequest, VectoredRead);

/// Positional gather write of `sources`, in order.
#[derive(Debug)]
pub struct VectoredWriteRequest {
    pub fd: RawFd,
    pub offset: u64,
    pub sources: Vec<Vec<u8>>,
    pub result: RequestResult<u64>,
    callback: OnCompletion<VectoredWriteRequest>,
}

impl VectoredWriteRequest {
    pub fn new(fd: RawFd, offset: u64, sources: Vec<Vec<u8>>) -> Self {
        Self {
            fd,
            offset,
            sources,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(VectoredWriteRequest, VectoredWrite);

/// Flushes file data and metadata to storage. Acts as a barrier: it is not
/// started before every earlier transfer has completed.
#[derive(Debug)]
pub struct FlushRequest {
    pub fd: RawFd,
    pub result: RequestResult<()>,
    callback: OnCompletion<FlushRequest>,
}

impl FlushRequest {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(FlushRequest, Flush);

/// Queries the size of an open file.
#[derive(Debug)]
pub struct StatRequest {
    pub fd: RawFd,
    pub result: RequestResult<u64>,
    callback: OnCompletion<StatRequest>,
}

impl StatRequest {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            result: None,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(StatRequest, Stat);

/// Best-effort cancellation of a previously queued request. Its outcome shows
/// in the target's result; the cancel itself carries none.
#[derive(Debug)]
pub struct CancelRequest {
    pub handle: RequestHandle,
    callback: OnCompletion<CancelRequest>,
}

impl CancelRequest {
    pub fn new(handle: RequestHandle) -> Self {
        Self {
            handle,
            callback: OnCompletion::default(),
        }
    }
}

impl_request!(CancelRequest, Cancel);

/// A queued operation of any kind.
#[derive(Debug)]
pub enum Request {
    Open(OpenRequest),
    Close(CloseRequest),
    Read(ReadRequest),
    Write(WriteRequest),
    VectoredRead(VectoredReadRequest),
    VectoredWrite(VectoredWriteRequest),
    Flush(FlushRequest),
    Stat(StatRequest),
    Cancel(CancelRequest),
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Open(_) => Operation::Open,
            Request::Close(_) => Operation::Close,
            Request::Read(_) => Operation::Read,
            Request::Write(_) => Operation::Write,
            Request::VectoredRead(_) => Operation::VectoredRead,
            Request::VectoredWrite(_) => Operation::VectoredWrite,
            Request::Flush(_) => Operation::Flush,
            Request::Stat(_) => Operation::Stat,
            Request::Cancel(_) => Operation::Cancel,
        }
    }

    /// Target file handle, for operations that have one.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        match self {
            Request::Close(req) => Some(req.fd),
            Request::Read(req) => Some(req.fd),
            Request::Write(req) => Some(req.fd),
            Request::VectoredRead(req) => Some(req.fd),
            Request::VectoredWrite(req) => Some(req.fd),
            Request::Flush(req) => Some(req.fd),
            Request::Stat(req) => Some(req.fd),
            Request::Open(_) | Request::Cancel(_) => None,
        }
    }

    pub(crate) fn set_error(&mut self, error: FileError) {
        match self {
            Request::Open(req) => req.result = Some(Err(error)),
            Request::Close(req) => req.result = Some(Err(error)),
            Request::Read(req) => req.result = Some(Err(error)),
            Request::Write(req) => req.result = Some(Err(error)),
            Request::VectoredRead(req) => req.result = Some(Err(error)),
            Request::VectoredWrite(req) => req.result = Some(Err(error)),
            Request::Flush(req) => req.result = Some(Err(error)),
            Request::Stat(req) => req.result = Some(Err(error)),
            Request::Cancel(_) => {}
        }
    }

    pub(crate) fn invoke_callback(self) {
        match self {
            Request::Open(req) => req.invoke_callback(),
            Request::Close(req) => req.invoke_callback(),
            Request::Read(req) => req.invoke_callback(),
            Request::Write(req) => req.invoke_callback(),
            Request::VectoredRead(req) => req.invoke_callback(),
            Request::VectoredWrite(req) => req.invoke_callback(),
            Request::Flush(req) => req.invoke_callback(),
            Request::Stat(req) => req.invoke_callback(),
            Request::Cancel(req) => req.invoke_callback(),
        }
    }

    pub(crate) fn finish_with_error(mut self, error: FileError) {
        self.set_error(error);
        self.invoke_callback();
    }
}
