//! Result files on disk.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use publix_kernel::{Batch, Component, InMemoryPublixStore, StoreSeed, Study, WorkerKind};
use publix_runtime::{Publix, PublixConfig, PublixError, StartRunRequest, WorkerRequest};

fn seed() -> StoreSeed {
    StoreSeed {
        studies: vec![Study {
            id: 4,
            title: "drawing".into(),
            component_ids: vec![40, 41],
            group_study: false,
            max_group_size: 2,
            linear_flow: false,
        }],
        components: vec![
            Component {
                id: 40,
                study_id: 4,
                title: "canvas".into(),
                active: true,
                reloadable: false,
            },
            Component {
                id: 41,
                study_id: 4,
                title: "review".into(),
                active: true,
                reloadable: false,
            },
        ],
        batches: vec![Batch {
            id: 2,
            study_id: 4,
            title: "lab".into(),
            active: true,
            allowed_kinds: BTreeSet::from([WorkerKind::PersonalMultiple]),
            max_total_workers: None,
            worker_ids: BTreeSet::new(),
        }],
        workers: vec![],
    }
}

#[test]
fn uploads_land_under_the_configured_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = PublixConfig::from_env_map(&HashMap::from([
        (
            "PUBLIX_UPLOADS_DIR".to_string(),
            dir.path().display().to_string(),
        ),
        ("PUBLIX_UPLOADS_MAX_FILE_SIZE".to_string(), "16".to_string()),
        ("PUBLIX_TOKEN_SECRET".to_string(), "files".to_string()),
    ]))
    .unwrap();
    let publix = Publix::builder(Arc::new(InMemoryPublixStore::from_seed(seed())))
        .config(config)
        .build()
        .unwrap();

    let started = publix
        .start_run(
            2,
            &StartRunRequest {
                worker: WorkerRequest {
                    kind: WorkerKind::PersonalMultiple,
                    worker_id: None,
                    platform_worker_id: None,
                },
                preview: false,
            },
        )
        .unwrap();
    let run_id = started.run.id;
    let first_cr = started.component_run.id;

    publix
        .upload_file(&started.token, run_id, 40, "sketch.svg", b"<svg/>")
        .unwrap();
    let on_disk = dir
        .path()
        .join(format!("run_{}", run_id))
        .join(format!("comp_{}", first_cr))
        .join("sketch.svg");
    assert_eq!(std::fs::read(on_disk).unwrap(), b"<svg/>".to_vec());

    let next = publix
        .start_next_component(&started.token, run_id)
        .unwrap()
        .unwrap();
    publix
        .upload_file(&next.token, run_id, 41, "sketch.svg", b"<svg v2/>")
        .unwrap();

    assert_eq!(
        publix.download_file(&next.token, run_id, "sketch.svg", None).unwrap(),
        b"<svg v2/>".to_vec()
    );
    assert_eq!(
        publix
            .download_file(&next.token, run_id, "sketch.svg", Some(first_cr))
            .unwrap(),
        b"<svg/>".to_vec()
    );

    let err = publix
        .upload_file(&next.token, run_id, 41, "big.bin", &[0u8; 17])
        .unwrap_err();
    assert!(matches!(err, PublixError::FileTooLarge { size: 17, limit: 16 }));
    let err = publix
        .upload_file(&next.token, run_id, 40, "late.txt", b"x")
        .unwrap_err();
    assert!(matches!(err, PublixError::Forbidden(_)));
}
