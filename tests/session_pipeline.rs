use std::sync::Arc;

use spark_print::contract::{
    FileInfo, Mesh, MeshProblem, MockProcessingApi, PrintableFile, Tray, TrayAttributes,
    UploadFile,
};
use spark_print::session::{PrintSettings, Session};
use spark_print::status::{ProgressUpdate, StatusHub};
use spark_print::Error;
use tokio::sync::broadcast::Receiver;

fn mesh(id: &str) -> Mesh {
    Mesh {
        id: id.to_owned(),
        name: format!("{id}.stl"),
        geometry_id: Some(format!("geom-{id}")),
        visual_file_id: Some(format!("vis-{id}")),
        transform: None,
        problems: Vec::new(),
    }
}

fn tray(id: &str, ready: bool, meshes: &[&str]) -> Tray {
    Tray {
        id: id.to_owned(),
        ready,
        meshes: meshes.iter().map(|m| mesh(m)).collect(),
    }
}

fn attrs(n: usize) -> Vec<TrayAttributes> {
    vec![
        TrayAttributes {
            reposition: true,
            reorient: true,
            support: false,
        };
        n
    ]
}

fn session(api: MockProcessingApi) -> (Session, StatusHub) {
    let status = StatusHub::new();
    let session = Session::new(Arc::new(api), status.clone());
    session.set_print_settings(PrintSettings {
        printer_type_id: "ember".into(),
        profile_id: "default".into(),
        material_id: None,
    });
    (session, status)
}

fn drain(rx: &mut Receiver<ProgressUpdate>, operation: &str) -> Vec<f64> {
    let mut out = Vec::new();
    while let Ok(update) = rx.try_recv() {
        if update.operation == operation {
            out.push(update.fraction);
        }
    }
    out
}

#[tokio::test]
async fn repair_calls_remote_once_per_input_mesh() {
    let mut api = MockProcessingApi::new();
    api.expect_repair_mesh()
        .times(1)
        .returning(|id, _, _| Ok(mesh(&format!("{id}-fixed"))));
    let (session, status) = session(api);
    let mut progress = status.subscribe_progress();

    let first = session.repair(&mesh("m1"), "repair-1").await.unwrap();
    let second = session.repair(&mesh("m1"), "repair-2").await.unwrap();

    assert_eq!(first.id, "m1-fixed");
    assert_eq!(first, second);
    assert_eq!(session.repaired("m1"), Some(first));
    assert_eq!(drain(&mut progress, "repair-2"), vec![1.0]);
}

#[tokio::test]
async fn repair_all_runs_every_mesh() {
    let mut api = MockProcessingApi::new();
    api.expect_repair_mesh()
        .times(3)
        .returning(|id, _, _| Ok(mesh(&format!("{id}-fixed"))));
    let (session, _) = session(api);

    let repaired = session
        .repair_all(&[mesh("a"), mesh("b"), mesh("c")], "repair")
        .await
        .unwrap();
    let ids: Vec<_> = repaired.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["a-fixed", "b-fixed", "c-fixed"]);
}

#[tokio::test]
async fn identical_request_reuses_ready_tray() {
    let mut api = MockProcessingApi::new();
    api.expect_create_tray()
        .times(1)
        .returning(|_, _| Ok(tray("t1", false, &[])));
    api.expect_prepare_tray()
        .times(1)
        .returning(|id, _, _| Ok(tray(id, true, &["p1", "p2"])));
    let (session, status) = session(api);
    let mut layout = session.channels().layout_tray.subscribe();
    let mut progress = status.subscribe_progress();
    let ids = vec!["m1".to_owned(), "m2".to_owned()];

    let first = session
        .create_and_prepare_tray(&ids, &attrs(2), false, "layout")
        .await
        .unwrap();
    let second = session
        .create_and_prepare_tray(&ids, &attrs(2), false, "layout-again")
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&layout.try_recv().unwrap(), &first));
    assert!(Arc::ptr_eq(&layout.try_recv().unwrap(), &first));
    assert_eq!(drain(&mut progress, "layout-again"), vec![1.0]);
}

#[tokio::test]
async fn changed_attributes_recompute_tray() {
    let mut api = MockProcessingApi::new();
    api.expect_create_tray()
        .times(2)
        .returning(|_, _| Ok(tray("t", false, &[])));
    api.expect_prepare_tray()
        .times(2)
        .returning(|id, _, _| Ok(tray(id, true, &["p1"])));
    let (session, _) = session(api);
    let ids = vec!["m1".to_owned()];

    session
        .create_and_prepare_tray(&ids, &attrs(1), false, "layout")
        .await
        .unwrap();
    let fixed = vec![TrayAttributes::default()];
    session
        .create_and_prepare_tray(&ids, &fixed, false, "layout")
        .await
        .unwrap();
}

#[tokio::test]
async fn tray_that_is_not_ready_is_recomputed() {
    let mut api = MockProcessingApi::new();
    api.expect_create_tray()
        .times(2)
        .returning(|_, _| Ok(tray("t", false, &[])));
    api.expect_prepare_tray()
        .times(2)
        .returning(|id, _, _| Ok(tray(id, false, &["p1"])));
    let (session, _) = session(api);
    let ids = vec!["m1".to_owned()];

    for _ in 0..2 {
        session
            .create_and_prepare_tray(&ids, &attrs(1), false, "layout")
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn tray_request_validates_input() {
    let (session, _) = session(MockProcessingApi::new());

    let empty = session
        .create_and_prepare_tray(&[], &[], false, "layout")
        .await
        .unwrap_err();
    assert_eq!(empty, Error::NoMeshes);

    let ids = vec!["m1".to_owned(), "m2".to_owned()];
    let mismatch = session
        .create_and_prepare_tray(&ids, &attrs(1), false, "layout")
        .await
        .unwrap_err();
    assert_eq!(mismatch, Error::TrayMismatch { expected: 2, actual: 1 });
}

#[tokio::test]
async fn support_tray_exports_supports() {
    let mut api = MockProcessingApi::new();
    api.expect_create_tray()
        .withf(|request, _| request.printer_type_id == "ember" && request.mesh_ids == ["m1"])
        .times(1)
        .returning(|_, _| Ok(tray("s1", false, &[])));
    api.expect_prepare_tray()
        .returning(|id, _, _| Ok(tray(id, true, &["p1"])));
    api.expect_export_supports()
        .times(1)
        .returning(|_, _, _| Ok(vec![mesh("sup1"), mesh("sup2")]));
    let (session, _) = session(api);
    let mut supports = session.channels().supports.subscribe();

    let tray = session
        .create_and_prepare_tray(&["m1".to_owned()], &attrs(1), true, "support")
        .await
        .unwrap();

    assert_eq!(session.support_tray().map(|t| t.id.clone()), Some(tray.id.clone()));
    assert!(session.layout_tray().is_none());
    assert_eq!(supports.try_recv().unwrap().len(), 2);

    session.unprepare();
    assert!(session.support_tray().is_none());
    assert!(session.supports().is_empty());
}

#[tokio::test]
async fn printable_requires_ready_support_tray() {
    let (session, _) = session(MockProcessingApi::new());
    let err = session.generate_printable("print").await.unwrap_err();
    assert_eq!(err, Error::NotPrepared);
}

#[tokio::test]
async fn printable_is_generated_once_per_support_tray() {
    let mut api = MockProcessingApi::new();
    api.expect_create_tray()
        .returning(|_, _| Ok(tray("s1", false, &[])));
    api.expect_prepare_tray()
        .returning(|id, _, _| Ok(tray(id, true, &["p1"])));
    api.expect_export_supports()
        .returning(|_, _, _| Ok(Vec::new()));
    api.expect_generate_printable()
        .times(1)
        .returning(|_, _| Ok(PrintableFile { file_id: "file-1".into() }));
    let (session, _) = session(api);
    let mut printable = session.channels().printable.subscribe();

    session
        .create_and_prepare_tray(&["m1".to_owned()], &attrs(1), true, "support")
        .await
        .unwrap();
    assert_eq!(session.generate_printable("export").await.unwrap(), "file-1");
    assert_eq!(session.generate_printable("print").await.unwrap(), "file-1");

    assert_eq!(printable.try_recv().unwrap().operation, "export");
    assert_eq!(printable.try_recv().unwrap().operation, "print");

    session.unprepare();
    assert_eq!(session.generate_printable("print").await.unwrap_err(), Error::NotPrepared);
}

#[tokio::test]
async fn analysis_problems_fail_and_update_import() {
    let mut api = MockProcessingApi::new();
    api.expect_upload_file().returning(|_, _| {
        Ok(FileInfo {
            file_id: "f1".into(),
            name: String::new(),
        })
    });
    api.expect_import_mesh()
        .returning(|_, _, _, _| Ok(mesh("m1")));
    api.expect_analyze_mesh().returning(|id, _| {
        let mut analysed = mesh(id);
        analysed.problems = vec![MeshProblem { kind: "holes".into() }];
        Ok(analysed)
    });
    let (session, _) = session(api);
    let file = UploadFile {
        name: "bracket.stl".into(),
        contents: b"solid".to_vec(),
    };

    let imported = session.upload_and_import(&file, true, "import").await.unwrap();
    assert!(imported.problems.is_empty());
    assert_eq!(session.uploads()[0].name, "bracket.stl");

    let err = session.analyse(&imported).await.unwrap_err();
    assert_eq!(err, Error::AnalysisFailed { problems: vec!["holes".into()] });
    assert_eq!(session.imported("m1").unwrap().problems.len(), 1);
}

#[tokio::test]
async fn import_progress_never_goes_backwards() {
    let mut api = MockProcessingApi::new();
    api.expect_upload_file().returning(|_, progress| {
        progress(0.5);
        Ok(FileInfo {
            file_id: "f1".into(),
            name: "ignored".into(),
        })
    });
    api.expect_import_mesh().returning(|_, _, _, progress| {
        progress(0.6);
        progress(0.2);
        progress(1.0);
        Ok(mesh("m1"))
    });
    let (session, status) = session(api);
    let mut progress = status.subscribe_progress();
    let file = UploadFile {
        name: "bracket.stl".into(),
        contents: Vec::new(),
    };

    session.upload_and_import(&file, true, "import").await.unwrap();

    let seen = drain(&mut progress, "import");
    assert_eq!(seen.first(), Some(&0.0));
    assert_eq!(seen.last(), Some(&1.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
}

#[tokio::test]
async fn remote_failure_propagates_message() {
    let mut api = MockProcessingApi::new();
    api.expect_repair_mesh()
        .returning(|_, _, _| Err(spark_print::RemoteError::new("mesh too large")));
    let (session, _) = session(api);

    let err = session.repair(&mesh("m1"), "repair").await.unwrap_err();
    assert_eq!(err, Error::RemoteCallFailed("mesh too large".into()));
    assert!(session.repaired("m1").is_none());
}
