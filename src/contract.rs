//! # contract: interfaces to the remote services and the rendering surface
//!
//! This module defines the seams between this crate and everything it treats as an
//! external collaborator:
//!
//! - [`ProcessingApi`]: the remote mesh/tray processing service (import, analyse,
//!   repair, transform, tray create/prepare, support export, printable generation).
//! - [`FleetApi`]: the remote printer management service (printers, status, printer
//!   types, membership, members, jobs).
//! - [`VisualLoader`] and [`Scene`]: download/decode of visuals and the on-screen scene.
//!
//! Wire types are plain `serde` data. All remote calls are async and return
//! [`RemoteError`] with the server message; long-running processing calls take a
//! [`ProgressFn`] which the service invokes with a fraction in `[0, 1]`.
//!
//! ## Mocking & Testing
//! Every trait is annotated for `mockall`; the mocks are exported behind the
//! `test-export-mocks` feature so integration tests can script the remote side.

use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

pub type MeshId = String;
pub type PrinterId = String;

/// Progress callback handed to a remote call. Invoked with a fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Placement matrix as exchanged with the processing service: three rows of four.
pub type Transform = [[f64; 4]; 3];

pub const IDENTITY_TRANSFORM: Transform = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// A raw file selected by the user for import.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// The stored file returned by an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshProblem {
    #[serde(rename = "type")]
    pub kind: String,
}

/// One processing-stage variant of a logical mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub id: MeshId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub geometry_id: Option<String>,
    /// Content id of the downloadable visual for this variant.
    #[serde(default)]
    pub visual_file_id: Option<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub problems: Vec<MeshProblem>,
}

impl Mesh {
    pub fn problem_kinds(&self) -> Vec<String> {
        self.problems.iter().map(|p| p.kind.clone()).collect()
    }
}

/// Per-mesh placement flags submitted with a tray.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrayAttributes {
    pub reposition: bool,
    pub reorient: bool,
    pub support: bool,
}

/// Everything the processing service needs to lay out a tray.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrayRequest {
    pub printer_type_id: String,
    pub profile_id: String,
    pub material_id: Option<String>,
    pub mesh_ids: Vec<MeshId>,
    pub mesh_attributes: Vec<TrayAttributes>,
}

/// A server-side arrangement of meshes. `meshes` follows the submitted id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tray {
    pub id: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub meshes: Vec<Mesh>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintableFile {
    pub file_id: String,
}

/// A decoded, renderable object. Shared by `Arc`; identity matters to the visual cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Visual {
    pub content_id: String,
    pub selectable: bool,
    pub color: u32,
    pub transform: Option<Transform>,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ProcessingApi: Send + Sync {
    async fn upload_file(&self, file: &UploadFile, progress: ProgressFn)
        -> Result<FileInfo, RemoteError>;

    async fn import_mesh(
        &self,
        file_id: &str,
        name: &str,
        with_visual: bool,
        progress: ProgressFn,
    ) -> Result<Mesh, RemoteError>;

    async fn analyze_mesh(&self, mesh_id: &str, progress: ProgressFn)
        -> Result<Mesh, RemoteError>;

    async fn transform_mesh(
        &self,
        mesh_id: &str,
        transform: &Transform,
        progress: ProgressFn,
    ) -> Result<Mesh, RemoteError>;

    /// Repair all problems of the mesh; the result is a new mesh with a new id.
    async fn repair_mesh(
        &self,
        mesh_id: &str,
        with_visual: bool,
        progress: ProgressFn,
    ) -> Result<Mesh, RemoteError>;

    async fn create_tray(&self, request: &TrayRequest, progress: ProgressFn)
        -> Result<Tray, RemoteError>;

    async fn prepare_tray(
        &self,
        tray_id: &str,
        with_visual: bool,
        progress: ProgressFn,
    ) -> Result<Tray, RemoteError>;

    async fn export_supports(
        &self,
        tray_id: &str,
        with_visual: bool,
        progress: ProgressFn,
    ) -> Result<Vec<Mesh>, RemoteError>;

    async fn generate_printable(&self, tray_id: &str, progress: ProgressFn)
        -> Result<PrintableFile, RemoteError>;
}

/// Downloads and decodes the visual of a mesh variant.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait VisualLoader: Send + Sync {
    async fn load_visual(
        &self,
        mesh: &Mesh,
        color: u32,
        selectable: bool,
    ) -> Result<Visual, RemoteError>;
}

/// The on-screen scene. Transform edits made there are reported back through
/// [`crate::models::PrintModels::transformed`].
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait Scene: Send + Sync {
    fn add_model(&self, visual: &Arc<Visual>);
    fn remove_model(&self, visual: &Arc<Visual>);
}

// ---------------------------------------------------------------------------
// Fleet wire types
// ---------------------------------------------------------------------------

pub const STATUS_PRINTING: &str = "printing";
pub const STATUS_PAUSED: &str = "paused";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub seconds_left: Option<i64>,
    #[serde(default)]
    pub job_progress: Option<f64>,
    #[serde(default)]
    pub layer: Option<u32>,
    #[serde(default)]
    pub total_layers: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedState {
    #[serde(default)]
    pub printer_status: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub data: Option<StatusData>,
}

/// Live status as returned by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    #[serde(default)]
    pub last_reported_state: Option<ReportedState>,
}

impl PrinterStatus {
    pub fn printer_status(&self) -> Option<&str> {
        self.last_reported_state
            .as_ref()
            .and_then(|s| s.printer_status.as_deref())
    }

    pub fn job_id(&self) -> Option<&str> {
        self.last_reported_state
            .as_ref()
            .and_then(|s| s.job_id.as_deref())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.printer_status(), Some(STATUS_PRINTING | STATUS_PAUSED))
    }

    pub fn is_printing(&self) -> bool {
        self.printer_status() == Some(STATUS_PRINTING)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    pub printer_id: PrinterId,
    pub printer_name: String,
    pub type_id: String,
    #[serde(default)]
    pub firmware: Option<String>,
    /// Copy embedded by the list endpoint. Never used for display: it is reset on
    /// every list refresh and lags the synchroniser's status cache.
    #[serde(default)]
    pub status: Option<PrinterStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// One membership entry of a printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterMember {
    pub member_id: String,
    pub printer_id: PrinterId,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_registered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default)]
    pub printer_id: Option<PrinterId>,
    #[serde(default)]
    pub job_status: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub job_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobCommand {
    Pause,
    Resume,
    Cancel,
}

impl JobCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCommand::Pause => "pause",
            JobCommand::Resume => "resume",
            JobCommand::Cancel => "cancel",
        }
    }
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Whether a usable access token is currently held. Polling is skipped otherwise.
    fn has_valid_token(&self) -> bool;

    async fn list_printers(&self) -> Result<Vec<Printer>, RemoteError>;

    async fn printer_status(&self, printer_id: &str) -> Result<PrinterStatus, RemoteError>;

    async fn register_printer(&self, name: &str, code: &str) -> Result<Printer, RemoteError>;

    async fn unregister_printer(&self, printer_id: &str) -> Result<(), RemoteError>;

    async fn reset_printer(&self, printer_id: &str) -> Result<(), RemoteError>;

    async fn printer_type(&self, type_id: &str) -> Result<PrinterType, RemoteError>;

    async fn printer_members(&self, printer_id: &str) -> Result<Vec<PrinterMember>, RemoteError>;

    async fn member_profile(&self, member_id: &str) -> Result<Member, RemoteError>;

    async fn job_status(&self, job_id: &str) -> Result<Job, RemoteError>;

    async fn send_job_command(
        &self,
        printer_id: &str,
        job_id: &str,
        command: JobCommand,
    ) -> Result<(), RemoteError>;

    /// All jobs of the current account, newest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, RemoteError>;
}
