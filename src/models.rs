//! Print model registry: one [`PrintModel`] per imported object, in import order.
//!
//! The registry drives the [`Session`] for multi-model operations (repair everything,
//! prepare a tray from every model) and keeps each model's on-screen visual in sync
//! with its most refined mesh variant, sharing decoded visuals through the
//! [`VisualCache`].
//!
//! Trays answer with one prepared mesh per submitted id, in submission order. The
//! registry submits an explicit ordered list of `(model id, mesh id)` pairs and zips the
//! response against that same list, so the correlation never depends on map order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::contract::{
    Mesh, MeshId, Scene, Transform, Tray, TrayAttributes, UploadFile, Visual, VisualLoader,
};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::visual_cache::VisualCache;

pub const IMPORT_COLOR: u32 = 0xCCCC66;
pub const REPAIR_OK_COLOR: u32 = 0x66CC66;
pub const REPAIR_NOT_OK_COLOR: u32 = 0xFF5555;
pub const PREPARED_COLOR: u32 = 0x6688CC;
pub const SUPPORT_COLOR: u32 = 0xCC2288;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Imported,
    Repaired,
    Transformed,
    Prepared,
}

#[derive(Debug, Clone)]
struct Variant {
    mesh: Mesh,
    visual: Option<Arc<Visual>>,
}

impl Variant {
    fn new(mesh: Mesh) -> Self {
        Self { mesh, visual: None }
    }
}

#[derive(Debug, Clone)]
pub struct PrintModel {
    imported: Variant,
    repaired: Option<Variant>,
    transformed: Option<Variant>,
    prepared: Option<Variant>,
    is_support: bool,
    laid_out: bool,
    pending_transform: Option<Transform>,
    current_visual: Option<Arc<Visual>>,
}

impl PrintModel {
    fn new(mesh: Mesh, is_support: bool) -> Self {
        Self {
            imported: Variant::new(mesh),
            repaired: None,
            transformed: None,
            prepared: None,
            is_support,
            laid_out: false,
            pending_transform: None,
            current_visual: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.imported.mesh.id
    }

    pub fn import_mesh(&self) -> &Mesh {
        &self.imported.mesh
    }

    pub fn repaired_mesh(&self) -> Option<&Mesh> {
        self.repaired.as_ref().map(|v| &v.mesh)
    }

    pub fn transform_mesh(&self) -> Option<&Mesh> {
        self.transformed.as_ref().map(|v| &v.mesh)
    }

    pub fn prepared_mesh(&self) -> Option<&Mesh> {
        self.prepared.as_ref().map(|v| &v.mesh)
    }

    /// The most refined variant: prepared > transformed > repaired > imported.
    pub fn current_mesh(&self) -> &Mesh {
        &self.current_variant().mesh
    }

    pub fn current_stage(&self) -> Stage {
        if self.prepared.is_some() {
            Stage::Prepared
        } else if self.transformed.is_some() {
            Stage::Transformed
        } else if self.repaired.is_some() {
            Stage::Repaired
        } else {
            Stage::Imported
        }
    }

    pub fn is_support(&self) -> bool {
        self.is_support
    }

    pub fn is_laid_out(&self) -> bool {
        self.laid_out
    }

    pub fn pending_transform(&self) -> Option<&Transform> {
        self.pending_transform.as_ref()
    }

    pub fn current_visual(&self) -> Option<&Arc<Visual>> {
        self.current_visual.as_ref()
    }

    fn current_variant(&self) -> &Variant {
        self.prepared
            .as_ref()
            .or(self.transformed.as_ref())
            .or(self.repaired.as_ref())
            .unwrap_or(&self.imported)
    }

    fn variant_mut(&mut self, stage: Stage) -> Option<&mut Variant> {
        match stage {
            Stage::Imported => Some(&mut self.imported),
            Stage::Repaired => self.repaired.as_mut(),
            Stage::Transformed => self.transformed.as_mut(),
            Stage::Prepared => self.prepared.as_mut(),
        }
    }
}

struct Inner {
    session: Arc<Session>,
    cache: Arc<Mutex<VisualCache>>,
    loader: Arc<dyn VisualLoader>,
    scene: Arc<dyn Scene>,
    models: Mutex<IndexMap<MeshId, PrintModel>>,
    transforms_enabled: AtomicBool,
}

/// Cloneable handle; clones share the same registry.
#[derive(Clone)]
pub struct PrintModels {
    inner: Arc<Inner>,
}

impl PrintModels {
    pub fn new(
        session: Arc<Session>,
        cache: Arc<Mutex<VisualCache>>,
        loader: Arc<dyn VisualLoader>,
        scene: Arc<dyn Scene>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                cache,
                loader,
                scene,
                models: Mutex::new(IndexMap::new()),
                transforms_enabled: AtomicBool::new(false),
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn len(&self) -> usize {
        self.inner.models.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Model ids in traversal order.
    pub fn ids(&self) -> Vec<MeshId> {
        self.inner.models.lock().keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<PrintModel> {
        self.inner.models.lock().get(id).cloned()
    }

    pub fn allow_transforms(&self, enabled: bool) {
        self.inner
            .transforms_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn transforms_enabled(&self) -> bool {
        self.inner.transforms_enabled.load(Ordering::Relaxed)
    }

    /// Upload and import a file, add its model and analyse it. Analysis problems are
    /// reported to the user but do not fail the import.
    pub async fn import(&self, file: &UploadFile, operation: &str) -> Result<Mesh> {
        let mesh = self
            .inner
            .session
            .upload_and_import(file, true, operation)
            .await?;
        self.add(mesh.clone(), false);

        match self.inner.session.analyse(&mesh).await {
            Ok(analysed) => self.update_mesh(analysed),
            Err(err) => {
                if let Some(analysed) = self.inner.session.imported(&mesh.id) {
                    self.update_mesh(analysed);
                }
                self.inner.session.status().error(format!("ERROR: {err}"));
            }
        }
        Ok(mesh)
    }

    /// Add a model for `mesh` and start loading its visual in the background.
    pub fn add(&self, mesh: Mesh, is_support: bool) -> JoinHandle<()> {
        let id = mesh.id.clone();
        debug!(model = %id, is_support, "adding model");
        self.inner
            .models
            .lock()
            .insert(id.clone(), PrintModel::new(mesh, is_support));

        let color = if is_support { SUPPORT_COLOR } else { IMPORT_COLOR };
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.visualise(&id, Stage::Imported, color, false).await {
                this.inner.session.status().error(format!("ERROR: {err}"));
            }
        })
    }

    pub fn remove(&self, id: &str) {
        let removed = self.inner.models.lock().shift_remove(id);
        if let Some(mut model) = removed {
            debug!(model = %id, "removing model");
            self.clean(&mut model);
        }
    }

    /// Replace a model's import mesh in place (analysis results keep the same id).
    pub fn update_mesh(&self, mesh: Mesh) {
        if let Some(model) = self.inner.models.lock().get_mut(&mesh.id) {
            model.imported.mesh = mesh;
        }
    }

    /// Transform-change notification from the scene.
    pub fn transformed(&self, id: &str, matrix: Transform) {
        if let Some(model) = self.inner.models.lock().get_mut(id) {
            debug!(model = %id, "transform edited");
            model.pending_transform = Some(matrix);
            model.laid_out = true;
        }
    }

    /// Repair every model's import mesh; fails on the first rejected repair.
    pub async fn repair(&self, operation: &str) -> Result<()> {
        let (ids, meshes): (Vec<MeshId>, Vec<Mesh>) = self
            .inner
            .models
            .lock()
            .iter()
            .map(|(id, model)| (id.clone(), model.imported.mesh.clone()))
            .unzip();

        let repaired = self.inner.session.repair_all(&meshes, operation).await?;
        info!(models = ids.len(), "repair complete");

        let visuals = ids.iter().zip(repaired).map(|(id, mesh)| {
            let color = if mesh.problems.is_empty() {
                REPAIR_OK_COLOR
            } else {
                REPAIR_NOT_OK_COLOR
            };
            self.set_variant(id, Stage::Repaired, mesh);
            self.visualise_reporting(id.clone(), Stage::Repaired, color, false)
        });
        join_all(visuals).await;
        Ok(())
    }

    /// Push pending transforms, lay out (and with supports, support) every
    /// non-support model, then distribute the prepared meshes back onto the models.
    pub async fn prepare(&self, with_supports: bool, operation: &str) -> Result<Arc<Tray>> {
        info!(with_supports, operation, "prepare");
        let editable = !with_supports && self.transforms_enabled();

        struct Pending {
            model_id: MeshId,
            mesh: Mesh,
            transform: Option<Transform>,
            laid_out: bool,
        }
        let pending: Vec<Pending> = self
            .inner
            .models
            .lock()
            .iter()
            .filter(|(_, model)| !model.is_support)
            .map(|(id, model)| Pending {
                model_id: id.clone(),
                mesh: model.current_mesh().clone(),
                transform: model.pending_transform,
                laid_out: model.laid_out,
            })
            .collect();

        let session = &self.inner.session;
        let resolved = try_join_all(pending.iter().map(|p| async move {
            match &p.transform {
                None => Ok(p.mesh.clone()),
                Some(transform) => session.transform(&p.mesh, transform).await,
            }
        }))
        .await?;

        for (p, mesh) in pending.iter().zip(&resolved) {
            if p.transform.is_some() {
                debug!(model = %p.model_id, mesh = %mesh.id, "transform pushed");
                self.set_variant(&p.model_id, Stage::Transformed, mesh.clone());
                if let Some(model) = self.inner.models.lock().get_mut(&p.model_id) {
                    model.pending_transform = None;
                }
            }
        }

        let submitted: Vec<(MeshId, MeshId)> = pending
            .iter()
            .zip(&resolved)
            .map(|(p, mesh)| (p.model_id.clone(), mesh.id.clone()))
            .collect();
        let mesh_ids: Vec<MeshId> = submitted.iter().map(|(_, mesh)| mesh.clone()).collect();
        let attributes: Vec<TrayAttributes> = pending
            .iter()
            .map(|p| TrayAttributes {
                reposition: !p.laid_out,
                reorient: !p.laid_out,
                support: with_supports,
            })
            .collect();

        let tray = session
            .create_and_prepare_tray(&mesh_ids, &attributes, with_supports, operation)
            .await?;
        if tray.meshes.len() != submitted.len() {
            warn!(
                tray = %tray.id,
                submitted = submitted.len(),
                returned = tray.meshes.len(),
                "prepared tray does not match submission"
            );
            return Err(Error::TrayMismatch {
                expected: submitted.len(),
                actual: tray.meshes.len(),
            });
        }

        let stage = if editable {
            Stage::Transformed
        } else {
            Stage::Prepared
        };
        let visuals = submitted
            .iter()
            .zip(tray.meshes.iter())
            .map(|((model_id, _), prepared)| {
                debug!(model = %model_id, mesh = %prepared.id, "prepared mesh");
                self.set_variant(model_id, stage, prepared.clone());
                if let Some(model) = self.inner.models.lock().get_mut(model_id) {
                    model.laid_out = true;
                }
                self.visualise_reporting(model_id.clone(), stage, PREPARED_COLOR, editable)
            })
            .collect::<Vec<_>>();
        join_all(visuals).await;

        if with_supports {
            for support in session.supports() {
                if !self.inner.models.lock().contains_key(&support.id) {
                    self.add(support, true);
                }
            }
        }
        Ok(tray)
    }

    /// Drop support models, revert the rest to their pre-preparation visual and clear
    /// the session's support artifacts. `new_layout` also forgets that models were
    /// laid out, so the next prepare repositions them.
    pub fn unprepare(&self, new_layout: bool) {
        let support_ids: Vec<MeshId> = self
            .inner
            .models
            .lock()
            .iter()
            .filter(|(_, model)| model.is_support)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &support_ids {
            self.remove(id);
        }

        {
            let mut models = self.inner.models.lock();
            let mut cache = self.inner.cache.lock();
            for model in models.values_mut() {
                if new_layout {
                    model.laid_out = false;
                }
                if let Some(mut prepared) = model.prepared.take() {
                    release(&mut cache, &mut prepared);
                }
                if let Some(visual) = model.current_variant().visual.clone() {
                    show(self.inner.scene.as_ref(), model, visual);
                }
            }
        }
        self.inner.session.unprepare();
        info!(removed_supports = support_ids.len(), new_layout, "unprepared");
    }

    pub async fn generate_printable(&self, operation: &str) -> Result<String> {
        self.inner.session.generate_printable(operation).await
    }

    fn set_variant(&self, id: &str, stage: Stage, mesh: Mesh) {
        let mut models = self.inner.models.lock();
        let Some(model) = models.get_mut(id) else {
            return;
        };
        let slot = match stage {
            Stage::Imported => {
                model.imported.mesh = mesh;
                return;
            }
            Stage::Repaired => &mut model.repaired,
            Stage::Transformed => &mut model.transformed,
            Stage::Prepared => &mut model.prepared,
        };
        // Same mesh back (memoized repair or reused tray): keep its visual.
        if slot.as_ref().is_some_and(|variant| variant.mesh.id == mesh.id) {
            return;
        }
        if let Some(mut old) = slot.replace(Variant::new(mesh)) {
            release(&mut self.inner.cache.lock(), &mut old);
        }
    }

    async fn visualise_reporting(&self, id: MeshId, stage: Stage, color: u32, selectable: bool) {
        if let Err(err) = self.visualise(&id, stage, color, selectable).await {
            self.inner.session.status().error(format!("ERROR: {err}"));
        }
    }

    /// Make the `stage` variant of model `id` visible, reusing its own visual, a cached
    /// visual of the same content, or a freshly loaded one, in that order.
    async fn visualise(&self, id: &str, stage: Stage, color: u32, selectable: bool) -> Result<()> {
        let mesh = {
            let mut models = self.inner.models.lock();
            let Some(model) = models.get_mut(id) else {
                return Err(Error::UnknownModel(id.to_owned()));
            };
            let Some(variant) = model.variant_mut(stage) else {
                return Ok(());
            };
            if let Some(visual) = variant.visual.clone() {
                show(self.inner.scene.as_ref(), model, visual);
                return Ok(());
            }
            let Some(content_id) = variant.mesh.visual_file_id.clone() else {
                return Ok(());
            };
            let cached = {
                let mut cache = self.inner.cache.lock();
                cache
                    .get_visual(&content_id, selectable)
                    .map(|visual| cache.cache(&content_id, visual))
            };
            if let Some(visual) = cached {
                debug!(model = %id, content = %content_id, "visual from cache");
                variant.visual = Some(visual.clone());
                show(self.inner.scene.as_ref(), model, visual);
                return Ok(());
            }
            variant.mesh.clone()
        };

        debug!(model = %id, mesh = %mesh.id, selectable, "loading visual");
        let visual = Arc::new(
            self.inner
                .loader
                .load_visual(&mesh, color, selectable)
                .await?,
        );

        let mut models = self.inner.models.lock();
        let Some(model) = models.get_mut(id) else {
            return Ok(());
        };
        let Some(variant) = model.variant_mut(stage) else {
            return Ok(());
        };
        if variant.mesh.id != mesh.id || variant.visual.is_some() {
            // Superseded while loading.
            return Ok(());
        }
        let Some(content_id) = variant.mesh.visual_file_id.clone() else {
            return Ok(());
        };
        let visual = self.inner.cache.lock().cache(&content_id, visual);
        variant.visual = Some(visual.clone());
        show(self.inner.scene.as_ref(), model, visual);
        Ok(())
    }

    fn clean(&self, model: &mut PrintModel) {
        hide(self.inner.scene.as_ref(), model);
        let mut cache = self.inner.cache.lock();
        release(&mut cache, &mut model.imported);
        for variant in [&mut model.repaired, &mut model.transformed, &mut model.prepared]
            .into_iter()
            .flatten()
        {
            release(&mut cache, variant);
        }
    }
}

fn release(cache: &mut VisualCache, variant: &mut Variant) {
    if variant.visual.take().is_some() {
        if let Some(content_id) = variant.mesh.visual_file_id.as_deref() {
            cache.uncache(content_id);
        }
    }
}

fn show(scene: &dyn Scene, model: &mut PrintModel, visual: Arc<Visual>) {
    if let Some(current) = &model.current_visual {
        if Arc::ptr_eq(current, &visual) {
            return;
        }
    }
    hide(scene, model);
    scene.add_model(&visual);
    model.current_visual = Some(visual);
}

fn hide(scene: &dyn Scene, model: &mut PrintModel) {
    if let Some(current) = model.current_visual.take() {
        scene.remove_model(&current);
    }
}
