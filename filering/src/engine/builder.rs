use anyhow::{anyhow, Result};
use std::convert::TryFrom;

use crate::backend::{RingBackend, UringRing};
use crate::engine::Engine;

/// Default size of the submission ring.
const SQ_ENTRIES: u32 = 128;

/// Final completion ring size is `sq_entries * multiplier` unless set
/// explicitly.
const CQ_ENTRIES_MULTIPLIER: u32 = 2;

/// Linux caps a single read/write at `0x7ffff000` bytes regardless of the
/// requested length.
pub(crate) const MAX_TRANSFER_LEN: usize = 0x7fff_f000;

#[derive(Debug, Clone)]
pub struct Builder {
    /// Size of the submission ring. The ring may round it up.
    sq_entries: u32,

    /// Size of the completion ring. Bounds how many entries may be in flight
    /// at once, so it should leave headroom above `sq_entries`: continuing
    /// transfers and cancels each hold a completion slot of their own.
    cq_entries: Option<u32>,

    /// Largest transfer handed to the ring in one entry. Longer reads and
    /// writes are split and resumed transparently.
    max_transfer_len: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            sq_entries: SQ_ENTRIES,
            cq_entries: None,
            max_transfer_len: MAX_TRANSFER_LEN,
        }
    }

    #[track_caller]
    pub fn sq_entries(mut self, val: u32) -> Self {
        assert!(val.is_power_of_two(), "sq_entries must be a power of two");
        self.sq_entries = val;
        self
    }

    /// Defaults to twice `sq_entries`.
    #[track_caller]
    pub fn cq_entries(mut self, val: u32) -> Self {
        assert!(val > 0, "cq_entries must be greater than 0");
        self.cq_entries = Some(val);
        self
    }

    #[track_caller]
    pub fn max_transfer_len(mut self, val: usize) -> Self {
        assert!(
            val > 0 && val <= MAX_TRANSFER_LEN,
            "max_transfer_len must be in 1..={MAX_TRANSFER_LEN:#x}"
        );
        self.max_transfer_len = val;
        self
    }

    /// Builds an engine over the kernel ring.
    pub fn try_build(self) -> Result<Engine<UringRing>> {
        self.try_build_with()
    }

    /// Builds an engine over any ring backend.
    pub fn try_build_with<B: RingBackend>(self) -> Result<Engine<B>> {
        let cfg = EngineConfig::try_from(self)?;
        let backend = B::try_new(&cfg)?;
        Ok(Engine::new(backend))
    }
}

/// Validated engine configuration, handed to ring backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub max_transfer_len: usize,
}

impl TryFrom<Builder> for EngineConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cq_entries = match builder.cq_entries {
            Some(cq) => cq,
            None => builder
                .sq_entries
                .checked_mul(CQ_ENTRIES_MULTIPLIER)
                .ok_or_else(|| anyhow!("sq_entries {} is too large", builder.sq_entries))?,
        };

        if cq_entries < builder.sq_entries {
            return Err(anyhow!(
                "cq_entries ({cq_entries}) must be at least sq_entries ({})",
                builder.sq_entries
            ));
        }

        Ok(EngineConfig {
            sq_entries: builder.sq_entries,
            cq_entries,
            max_transfer_len: builder.max_transfer_len,
        })
    }
}
