use std::cell::{OnceCell, RefCell};
use std::thread_local;

use crate::engine::{Builder, Engine};
use crate::queue::RequestHandle;
use crate::request::{FileError, Operation, Request};
use crate::utils::Deadline;

// `None` once initialisation has failed on this thread; it is not retried.
thread_local! {
    static SHARED: OnceCell<Option<RefCell<Engine>>> = const { OnceCell::new() };
}

/// Runs `f` against this thread's engine, creating it on first use.
///
/// `f` gets [`FileError::Open`] when the ring could not be set up, and
/// [`FileError::Resource`] when the engine is already in use further up the
/// stack (a completion callback calling back in) or the thread is exiting.
fn with_shared<F, R>(f: F) -> R
where
    F: FnOnce(Result<&mut Engine, FileError>) -> R,
{
    let mut f = Some(f);

    let res = SHARED.try_with(|shared| {
        let engine = shared.get_or_init(|| match Builder::new().try_build() {
            Ok(engine) => Some(RefCell::new(engine)),
            Err(e) => {
                tracing::warn!(error = %e, "ring engine unavailable on this thread");
                None
            }
        });

        f.take().map(|f| match engine {
            None => f(Err(FileError::Open)),
            Some(engine) => match engine.try_borrow_mut() {
                Ok(mut engine) => f(Ok(&mut *engine)),
                Err(_) => f(Err(FileError::Resource)),
            },
        })
    });

    match (res, f.take()) {
        (Ok(Some(res)), _) => res,
        (_, Some(f)) => f(Err(FileError::Resource)),
        (_, None) => unreachable!("closure consumed without a result"),
    }
}

/// Runs `f` against this thread's engine, or with `None` if the ring is
/// unavailable or the engine is already in use on this thread.
pub fn with_shared_instance<F, R>(f: F) -> R
where
    F: FnOnce(Option<&mut Engine>) -> R,
{
    with_shared(|engine| f(engine.ok()))
}

/// [`Engine::queue_request`] on this thread's engine. Without a usable
/// engine the request finishes right away with the reason and the invalid
/// handle is returned.
pub fn queue_request(request: impl Into<Request>) -> RequestHandle {
    let request = request.into();

    with_shared(|engine| match engine {
        Ok(engine) => engine.queue_request(request),
        Err(error) => {
            tracing::debug!(op = ?request.operation(), %error, "shared engine not usable");
            request.finish_with_error(error);
            RequestHandle::INVALID
        }
    })
}

pub fn submit_requests() {
    with_shared(|engine| {
        if let Ok(engine) = engine {
            engine.submit_requests();
        }
    })
}

/// [`Engine::wait_for_request`] on this thread's engine. Returns `true` when
/// the engine is unavailable, since no request can be pending on it, and
/// `false` when called from inside one of its own callbacks.
pub fn wait_for_request(handle: RequestHandle, deadline: impl Into<Deadline>) -> bool {
    let deadline = deadline.into();

    with_shared(|engine| match engine {
        Ok(engine) => engine.wait_for_request(handle, deadline),
        Err(FileError::Resource) => !handle.is_valid(),
        Err(_) => true,
    })
}

pub fn supports_operation(op: Operation) -> bool {
    with_shared(|engine| engine.is_ok_and(|engine| engine.supports_operation(op)))
}
