//! Coalescing of multi-request refreshes into one change notification.
//!
//! A printer-list refresh opens a [`FetchWave`] naming every category it will fetch.
//! Each branch settles its category when it finishes (fetched, skipped, or failed);
//! the wave reports completion exactly once, when the last category settles.
//! Generations keep a late branch of an older wave from settling a newer one.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    Printers,
    Status,
    PrinterTypes,
    PrinterMembers,
    Members,
}

impl DataKind {
    pub const ALL: [DataKind; 5] = [
        DataKind::Printers,
        DataKind::Status,
        DataKind::PrinterTypes,
        DataKind::PrinterMembers,
        DataKind::Members,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenWave {
    generation: u64,
    pending: BTreeSet<DataKind>,
}

#[derive(Debug, Default)]
pub struct FetchWave {
    open: Option<OpenWave>,
    next_generation: u64,
}

impl FetchWave {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new wave over `kinds`, replacing any wave still in flight.
    pub fn begin(&mut self, kinds: &[DataKind]) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.open = Some(OpenWave {
            generation,
            pending: kinds.iter().copied().collect(),
        });
        generation
    }

    /// Settle `kind` for wave `generation`. Returns `true` if this closed the wave.
    pub fn settle(&mut self, generation: u64, kind: DataKind) -> bool {
        let Some(open) = self.open.as_mut() else {
            return false;
        };
        if open.generation != generation || !open.pending.remove(&kind) {
            return false;
        }
        if open.pending.is_empty() {
            self.open = None;
            true
        } else {
            false
        }
    }

    /// No wave in flight.
    pub fn is_settled(&self) -> bool {
        self.open.is_none()
    }

    pub fn pending(&self) -> Vec<DataKind> {
        self.open
            .as_ref()
            .map(|w| w.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop the open wave without notifying.
    pub fn cancel(&mut self) {
        self.open = None;
    }
}
