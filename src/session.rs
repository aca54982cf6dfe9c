//! Staged print-preparation pipeline: import → analyse → repair → layout/support →
//! printable.
//!
//! A [`Session`] owns every artifact produced so far (imports, repairs, the layout and
//! support trays, exported supports and the printable file) and memoizes the expensive
//! stages against them:
//!
//! - `repair` is keyed by the *input* mesh id; a repeat call returns the cached result.
//! - `create_and_prepare_tray` reuses a ready tray when the submitted mesh ids and
//!   attributes match the ones it was prepared with.
//! - `generate_printable` reuses the printable of the current support tray.
//!
//! Every stage reports progress on the [`StatusHub`] under its operation label and
//! publishes its result on a broadcast channel (see [`SessionChannels`]). Remote
//! failures propagate as [`Error::RemoteCallFailed`]; nothing is retried here.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::contract::{
    FileInfo, Mesh, MeshId, ProcessingApi, Transform, Tray, TrayAttributes, TrayRequest,
    UploadFile,
};
use crate::error::{Error, Result};
use crate::status::StatusHub;

const CHANNEL_CAPACITY: usize = 64;

/// Share of an import reported as soon as the upload starts.
const UPLOAD_SHARE: f64 = 0.25;

/// Printer type, print profile and material a tray is laid out for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrintSettings {
    pub printer_type_id: String,
    pub profile_id: String,
    pub material_id: Option<String>,
}

/// The generated printable file together with the operation that asked for it, so
/// subscribers can tell an export from a print.
#[derive(Debug, Clone, PartialEq)]
pub struct Printable {
    pub file_id: String,
    pub operation: String,
}

/// Broadcast channels the UI layer listens on.
#[derive(Clone)]
pub struct SessionChannels {
    pub imported: broadcast::Sender<Mesh>,
    pub analysed: broadcast::Sender<Mesh>,
    /// `(input mesh id, repaired mesh)`.
    pub repaired: broadcast::Sender<(MeshId, Mesh)>,
    pub layout_tray: broadcast::Sender<Arc<Tray>>,
    pub support_tray: broadcast::Sender<Arc<Tray>>,
    pub supports: broadcast::Sender<Vec<Mesh>>,
    pub printable: broadcast::Sender<Printable>,
}

impl SessionChannels {
    fn new() -> Self {
        Self {
            imported: broadcast::channel(CHANNEL_CAPACITY).0,
            analysed: broadcast::channel(CHANNEL_CAPACITY).0,
            repaired: broadcast::channel(CHANNEL_CAPACITY).0,
            layout_tray: broadcast::channel(CHANNEL_CAPACITY).0,
            support_tray: broadcast::channel(CHANNEL_CAPACITY).0,
            supports: broadcast::channel(CHANNEL_CAPACITY).0,
            printable: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

/// A prepared tray plus the request it answers, for the reuse check.
struct PreparedTray {
    tray: Arc<Tray>,
    mesh_ids: Vec<MeshId>,
    attributes: Vec<TrayAttributes>,
}

impl PreparedTray {
    fn answers(&self, mesh_ids: &[MeshId], attributes: &[TrayAttributes]) -> bool {
        self.tray.ready && self.mesh_ids == mesh_ids && self.attributes == attributes
    }
}

struct CachedPrintable {
    tray_id: String,
    printable: Printable,
}

#[derive(Default)]
struct Artifacts {
    uploads: Vec<FileInfo>,
    imports: IndexMap<MeshId, Mesh>,
    /// Keyed by the id of the mesh that was repaired, not the result's id.
    repairs: HashMap<MeshId, Mesh>,
    layout_tray: Option<PreparedTray>,
    support_tray: Option<PreparedTray>,
    supports: Vec<Mesh>,
    printable: Option<CachedPrintable>,
}

pub struct Session {
    api: Arc<dyn ProcessingApi>,
    status: StatusHub,
    channels: SessionChannels,
    settings: Mutex<PrintSettings>,
    artifacts: Mutex<Artifacts>,
}

impl Session {
    pub fn new(api: Arc<dyn ProcessingApi>, status: StatusHub) -> Self {
        Self {
            api,
            status,
            channels: SessionChannels::new(),
            settings: Mutex::new(PrintSettings::default()),
            artifacts: Mutex::new(Artifacts::default()),
        }
    }

    pub fn channels(&self) -> &SessionChannels {
        &self.channels
    }

    pub fn status(&self) -> &StatusHub {
        &self.status
    }

    pub fn set_print_settings(&self, settings: PrintSettings) {
        info!(
            printer_type = %settings.printer_type_id,
            profile = %settings.profile_id,
            "print settings updated"
        );
        *self.settings.lock() = settings;
    }

    pub fn print_settings(&self) -> PrintSettings {
        self.settings.lock().clone()
    }

    /// Upload a raw file and import it as a mesh. The upload has no progress of its own,
    /// so a quarter is reported up-front and the import fills the rest.
    pub async fn upload_and_import(
        &self,
        file: &UploadFile,
        with_visual: bool,
        operation: &str,
    ) -> Result<Mesh> {
        let tracker = self.status.start(operation);
        tracker.report(UPLOAD_SHARE);

        let mut file_info = self
            .api
            .upload_file(file, tracker.slice(0.0, UPLOAD_SHARE))
            .await
            .map_err(|e| {
                error!(file = %file.name, error = %e, "upload failed");
                Error::from(e)
            })?;
        file_info.name = file.name.clone();
        self.artifacts.lock().uploads.push(file_info.clone());

        info!(file = %file_info.name, file_id = %file_info.file_id, "importing");
        let mesh = self
            .api
            .import_mesh(
                &file_info.file_id,
                &file_info.name,
                with_visual,
                tracker.slice(UPLOAD_SHARE, 1.0 - UPLOAD_SHARE),
            )
            .await?;
        tracker.complete();

        self.artifacts
            .lock()
            .imports
            .insert(mesh.id.clone(), mesh.clone());
        let _ = self.channels.imported.send(mesh.clone());
        Ok(mesh)
    }

    /// Run structural analysis. The import entry is updated in place with the
    /// analysed mesh; a mesh with problems fails with [`Error::AnalysisFailed`].
    pub async fn analyse(&self, mesh: &Mesh) -> Result<Mesh> {
        let noop: crate::contract::ProgressFn = Arc::new(|_| {});
        let analysed = self.api.analyze_mesh(&mesh.id, noop).await?;

        {
            let mut artifacts = self.artifacts.lock();
            if let Some(entry) = artifacts.imports.get_mut(&analysed.id) {
                *entry = analysed.clone();
            }
        }
        let _ = self.channels.analysed.send(analysed.clone());

        if analysed.problems.is_empty() {
            info!(mesh = %analysed.id, "analysis clean");
            Ok(analysed)
        } else {
            let problems = analysed.problem_kinds();
            info!(mesh = %analysed.id, ?problems, "analysis found problems");
            Err(Error::AnalysisFailed { problems })
        }
    }

    /// Push a new placement. The caller keeps the returned mesh as its transform
    /// variant; nothing is cached here.
    pub async fn transform(&self, mesh: &Mesh, transform: &Transform) -> Result<Mesh> {
        debug!(mesh = %mesh.id, ?transform, "pushing transform");
        let noop: crate::contract::ProgressFn = Arc::new(|_| {});
        Ok(self.api.transform_mesh(&mesh.id, transform, noop).await?)
    }

    pub async fn repair(&self, mesh: &Mesh, operation: &str) -> Result<Mesh> {
        if let Some(repaired) = self.artifacts.lock().repairs.get(&mesh.id).cloned() {
            debug!(mesh = %mesh.id, repaired = %repaired.id, "repair cached");
            self.status.resume(operation).complete();
            return Ok(repaired);
        }

        let tracker = self.status.start(operation);
        let repaired = self
            .api
            .repair_mesh(&mesh.id, true, tracker.slice(0.0, 1.0))
            .await?;
        tracker.complete();

        info!(mesh = %mesh.id, repaired = %repaired.id, "repaired");
        self.artifacts
            .lock()
            .repairs
            .insert(mesh.id.clone(), repaired.clone());
        let _ = self
            .channels
            .repaired
            .send((mesh.id.clone(), repaired.clone()));
        Ok(repaired)
    }

    /// Repair several meshes concurrently; fails on the first rejection.
    pub async fn repair_all(&self, meshes: &[Mesh], operation: &str) -> Result<Vec<Mesh>> {
        try_join_all(meshes.iter().map(|mesh| self.repair(mesh, operation))).await
    }

    /// Create a tray from `mesh_ids` (one attribute set per id, same order) and prepare
    /// it. With supports, support meshes are exported afterwards.
    pub async fn create_and_prepare_tray(
        &self,
        mesh_ids: &[MeshId],
        attributes: &[TrayAttributes],
        with_supports: bool,
        operation: &str,
    ) -> Result<Arc<Tray>> {
        {
            let mut artifacts = self.artifacts.lock();
            let slot = if with_supports {
                &artifacts.support_tray
            } else {
                &artifacts.layout_tray
            };
            if let Some(cached) = slot.as_ref().filter(|p| p.answers(mesh_ids, attributes)) {
                let tray = cached.tray.clone();
                artifacts.printable = None;
                drop(artifacts);
                debug!(tray = %tray.id, with_supports, "tray unchanged, reusing");
                self.status.resume(operation).complete();
                self.publish_tray(with_supports, &tray);
                return Ok(tray);
            }
            artifacts.printable = None;
        }

        if mesh_ids.is_empty() {
            return Err(Error::NoMeshes);
        }
        if mesh_ids.len() != attributes.len() {
            return Err(Error::TrayMismatch {
                expected: mesh_ids.len(),
                actual: attributes.len(),
            });
        }

        let tracker = self.status.start(operation);
        let (create_share, prepared_at) = if with_supports { (0.3, 0.8) } else { (0.5, 1.0) };

        let settings = self.print_settings();
        let request = TrayRequest {
            printer_type_id: settings.printer_type_id,
            profile_id: settings.profile_id,
            material_id: settings.material_id,
            mesh_ids: mesh_ids.to_vec(),
            mesh_attributes: attributes.to_vec(),
        };
        info!(meshes = mesh_ids.len(), with_supports, "creating tray");
        let tray = self
            .api
            .create_tray(&request, tracker.slice(0.0, create_share))
            .await?;

        debug!(tray = %tray.id, "preparing tray");
        let prepared = self
            .api
            .prepare_tray(
                &tray.id,
                true,
                tracker.slice(create_share, prepared_at - create_share),
            )
            .await?;
        tracker.report(prepared_at);

        let prepared = Arc::new(prepared);
        {
            let entry = PreparedTray {
                tray: prepared.clone(),
                mesh_ids: mesh_ids.to_vec(),
                attributes: attributes.to_vec(),
            };
            let mut artifacts = self.artifacts.lock();
            if with_supports {
                artifacts.support_tray = Some(entry);
            } else {
                artifacts.layout_tray = Some(entry);
            }
        }
        info!(tray = %prepared.id, ready = prepared.ready, with_supports, "tray prepared");
        self.publish_tray(with_supports, &prepared);

        if with_supports {
            let supports = self
                .api
                .export_supports(&prepared.id, true, tracker.slice(prepared_at, 0.2))
                .await?;
            tracker.complete();
            info!(tray = %prepared.id, supports = supports.len(), "supports exported");
            self.artifacts.lock().supports = supports.clone();
            let _ = self.channels.supports.send(supports);
        }

        Ok(prepared)
    }

    /// Forget the support tray and its supports after an upstream change. Local only.
    pub fn unprepare(&self) {
        let mut artifacts = self.artifacts.lock();
        artifacts.support_tray = None;
        artifacts.supports.clear();
        debug!("support tray cleared");
    }

    /// Generate the printable file for the ready support tray.
    pub async fn generate_printable(&self, operation: &str) -> Result<String> {
        let tray_id = {
            let artifacts = self.artifacts.lock();
            match artifacts.support_tray.as_ref() {
                Some(prepared) if prepared.tray.ready => prepared.tray.id.clone(),
                _ => return Err(Error::NotPrepared),
            }
        };

        let tracker = self.status.start(operation);
        let cached = {
            let mut artifacts = self.artifacts.lock();
            match artifacts.printable.as_mut() {
                Some(cached) if cached.tray_id == tray_id => {
                    cached.printable.operation = operation.to_owned();
                    Some(cached.printable.clone())
                }
                _ => None,
            }
        };
        if let Some(printable) = cached {
            tracker.complete();
            let file_id = printable.file_id.clone();
            let _ = self.channels.printable.send(printable);
            return Ok(file_id);
        }

        let file = self
            .api
            .generate_printable(&tray_id, tracker.slice(0.0, 1.0))
            .await?;
        tracker.complete();

        let printable = Printable {
            file_id: file.file_id.clone(),
            operation: operation.to_owned(),
        };
        info!(tray = %tray_id, file_id = %file.file_id, operation, "printable ready");
        self.artifacts.lock().printable = Some(CachedPrintable {
            tray_id,
            printable: printable.clone(),
        });
        let _ = self.channels.printable.send(printable);
        Ok(file.file_id)
    }

    pub fn uploads(&self) -> Vec<FileInfo> {
        self.artifacts.lock().uploads.clone()
    }

    pub fn imported(&self, id: &str) -> Option<Mesh> {
        self.artifacts.lock().imports.get(id).cloned()
    }

    pub fn import_ids(&self) -> Vec<MeshId> {
        self.artifacts.lock().imports.keys().cloned().collect()
    }

    /// The repaired variant of the mesh with input id `id`.
    pub fn repaired(&self, id: &str) -> Option<Mesh> {
        self.artifacts.lock().repairs.get(id).cloned()
    }

    pub fn layout_tray(&self) -> Option<Arc<Tray>> {
        self.artifacts
            .lock()
            .layout_tray
            .as_ref()
            .map(|p| p.tray.clone())
    }

    pub fn support_tray(&self) -> Option<Arc<Tray>> {
        self.artifacts
            .lock()
            .support_tray
            .as_ref()
            .map(|p| p.tray.clone())
    }

    pub fn supports(&self) -> Vec<Mesh> {
        self.artifacts.lock().supports.clone()
    }

    pub fn printable(&self) -> Option<Printable> {
        self.artifacts
            .lock()
            .printable
            .as_ref()
            .map(|c| c.printable.clone())
    }

    fn publish_tray(&self, with_supports: bool, tray: &Arc<Tray>) {
        let channel = if with_supports {
            &self.channels.support_tray
        } else {
            &self.channels.layout_tray
        };
        let _ = channel.send(tray.clone());
    }
}
