use std::collections::HashMap;

use crate::contract::{
    Job, Member, Printer, PrinterId, PrinterMember, PrinterStatus, PrinterType, ReportedState,
    StatusData,
};

/// Everything the synchroniser knows about the fleet. Consumers receive clones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetState {
    pub printers: Vec<Printer>,
    /// Authoritative status cache, keyed by printer id.
    pub status: HashMap<PrinterId, PrinterStatus>,
    pub printer_types: HashMap<String, PrinterType>,
    pub printer_members: HashMap<PrinterId, Vec<PrinterMember>>,
    pub members: HashMap<String, Member>,
    /// Active job per printer id.
    pub jobs: HashMap<PrinterId, Job>,
}

/// Status with the reported state and its data always present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedStatus {
    pub printer_status: Option<String>,
    pub job_id: Option<String>,
    pub data: StatusData,
}

impl From<Option<&PrinterStatus>> for NormalizedStatus {
    fn from(status: Option<&PrinterStatus>) -> Self {
        let state: ReportedState = status
            .and_then(|s| s.last_reported_state.clone())
            .unwrap_or_default();
        NormalizedStatus {
            printer_status: state.printer_status,
            job_id: state.job_id,
            data: state.data.unwrap_or_default(),
        }
    }
}

/// One row of [`FleetState::printer_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterView {
    pub printer: Printer,
    pub printer_type: Option<PrinterType>,
    /// The registered primary member, if membership is known and has one.
    pub owner: Option<PrinterMember>,
    pub printer_members: Vec<PrinterMember>,
    pub status: NormalizedStatus,
    pub job: Option<Job>,
}

impl FleetState {
    pub fn printer(&self, printer_id: &str) -> Option<&Printer> {
        self.printers.iter().find(|p| p.printer_id == printer_id)
    }

    /// Join printers with their type, owner, membership, cached status and job,
    /// sorted by printer name ignoring case.
    pub fn printer_data(&self) -> Vec<PrinterView> {
        let mut views: Vec<PrinterView> = self
            .printers
            .iter()
            .map(|printer| {
                let id = &printer.printer_id;
                let printer_members = self.printer_members.get(id).cloned().unwrap_or_default();
                let owner = printer_members
                    .iter()
                    .find(|m| m.is_registered && m.is_primary)
                    .cloned();
                PrinterView {
                    printer: printer.clone(),
                    printer_type: self.printer_types.get(&printer.type_id).cloned(),
                    owner,
                    printer_members,
                    status: NormalizedStatus::from(self.status.get(id)),
                    job: self.jobs.get(id).cloned(),
                }
            })
            .collect();
        views.sort_by_cached_key(|v| v.printer.printer_name.to_lowercase());
        views
    }

    /// Tick the cached time remaining of a printing printer down by one second.
    /// Returns whether anything changed.
    pub(crate) fn count_down(&mut self, printer_id: &str) -> bool {
        let remaining = self
            .status
            .get_mut(printer_id)
            .and_then(|s| s.last_reported_state.as_mut())
            .and_then(|s| s.data.as_mut())
            .and_then(|d| d.seconds_left.as_mut());
        match remaining {
            Some(seconds) if *seconds > 0 => {
                *seconds -= 1;
                true
            }
            _ => false,
        }
    }

    /// Printers whose cached status names a job.
    pub(crate) fn active_jobs(&self) -> Vec<(PrinterId, String)> {
        self.printers
            .iter()
            .filter_map(|p| {
                self.status
                    .get(&p.printer_id)
                    .and_then(|s| s.job_id())
                    .map(|job| (p.printer_id.clone(), job.to_owned()))
            })
            .collect()
    }
}
