use anyhow::Result;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::backend::{RingBackend, UringRing};
use crate::engine::EngineConfig;

pub(crate) const LOREM: &str = "lorem ipsum";

/// Anonymous temporary file holding [`LOREM`].
pub(crate) fn lorem_file() -> Result<File> {
    let mut file = tempfile::tempfile()?;
    file.write_all(LOREM.as_bytes())?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// The kernel ring, or `None` where `io_uring` is unavailable (old kernels,
/// seccomp-restricted sandboxes). Tests against it skip in that case.
pub(crate) fn try_uring(cfg: &EngineConfig) -> Option<UringRing> {
    match UringRing::try_new(cfg) {
        Ok(ring) => Some(ring),
        Err(e) => {
            eprintln!("io_uring unavailable, skipping: {e:#}");
            None
        }
    }
}

/// Receives the value passed to a completion callback and checks it is
/// passed at most once.
pub(crate) struct Slot<T>(Rc<RefCell<Option<T>>>);

impl<T: 'static> Slot<T> {
    pub(crate) fn new() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    pub(crate) fn fill(&self) -> impl FnOnce(T) + 'static {
        let slot = Rc::clone(&self.0);
        move |value| {
            let prev = slot.borrow_mut().replace(value);
            assert!(prev.is_none(), "completion callback invoked twice");
        }
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }

    pub(crate) fn is_filled(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Records the order in which completion callbacks fire.
#[derive(Clone, Default)]
pub(crate) struct CallLog(Rc<RefCell<Vec<&'static str>>>);

impl CallLog {
    pub(crate) fn record<T: 'static>(&self, name: &'static str) -> impl FnOnce(T) + 'static {
        let log = self.clone();
        move |_| log.0.borrow_mut().push(name)
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Backend {
    Emulated,
    Uring,
}

/// Runs a generic engine scenario on the selected backend. Kernel ring
/// scenarios pass trivially when `io_uring` is unavailable.
macro_rules! on_backend {
    ($backend:expr, $builder:expr, $scenario:ident $(, $arg:expr)* $(,)?) => {
        match $backend {
            $crate::test_utils::Backend::Emulated => {
                $scenario($builder.try_build_with::<$crate::backend::EmulatedRing>()? $(, $arg)*)
            }
            $crate::test_utils::Backend::Uring => {
                match $builder.try_build_with::<$crate::backend::UringRing>() {
                    Ok(engine) => $scenario(engine $(, $arg)*),
                    Err(e) => {
                        eprintln!("io_uring unavailable, skipping: {e:#}");
                        Ok(())
                    }
                }
            }
        }
    };
}

pub(crate) use on_backend;
