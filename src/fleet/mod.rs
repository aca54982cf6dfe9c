//! Fleet synchronisation: printers, their status, membership and jobs.

pub mod history;
pub mod manager;
pub mod schedule;
pub mod state;
pub mod wave;

pub use history::JobHistory;
pub use manager::{FleetEvent, PrintManager};
pub use schedule::{RefreshDecision, RefreshPolicy};
pub use state::{FleetState, NormalizedStatus, PrinterView};
pub use wave::{DataKind, FetchWave};
