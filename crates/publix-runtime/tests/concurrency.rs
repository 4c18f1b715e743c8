//! Concurrent access to one study and one run.

use std::collections::HashMap;
use std::sync::Arc;

use publix_kernel::{GroupState, InMemoryPublixStore, PublixStore, StoreSeed, WorkerKind};
use publix_runtime::{
    ComponentStart, IdTokenCodec, Publix, PublixError, StartRunRequest, WorkerRequest,
};

const SEED: &str = r#"{
    "studies": [
        {"id": 1, "title": "lobby", "component_ids": [10, 20], "group_study": true, "max_group_size": 3}
    ],
    "components": [
        {"id": 10, "study_id": 1, "title": "intro"},
        {"id": 20, "study_id": 1, "title": "task", "reloadable": true}
    ],
    "batches": [
        {"id": 1, "study_id": 1, "title": "default", "active": true,
         "allowed_kinds": ["anonymous_repeatable", "personal_multiple"], "max_total_workers": null}
    ]
}"#;

fn publix() -> Publix<InMemoryPublixStore> {
    let seed = StoreSeed::from_json(SEED).expect("seed");
    Publix::builder(Arc::new(InMemoryPublixStore::from_seed(seed)))
        .token_codec(IdTokenCodec::new(b"concurrency".to_vec()))
        .build()
        .expect("publix")
}

fn start(publix: &Publix<InMemoryPublixStore>) -> ComponentStart {
    publix
        .start_run(
            1,
            &StartRunRequest {
                worker: WorkerRequest {
                    kind: WorkerKind::AnonymousRepeatable,
                    worker_id: None,
                    platform_worker_id: None,
                },
                preview: false,
            },
        )
        .expect("start run")
}

#[test]
fn concurrent_joins_never_overfill_a_group() {
    let publix = publix();
    let starts: Vec<ComponentStart> = (0..7).map(|_| start(&publix)).collect();

    std::thread::scope(|scope| {
        for started in &starts {
            let publix = &publix;
            scope.spawn(move || {
                publix
                    .join_group(&started.token, started.run.id)
                    .expect("join group");
            });
        }
    });

    let mut members: HashMap<u64, Vec<u64>> = HashMap::new();
    for started in &starts {
        let run = publix.store().require_run(started.run.id).unwrap();
        let group_id = run.group_id.expect("every run has a group");
        members.entry(group_id).or_default().push(run.id);
    }
    let mut sizes: Vec<usize> = members.values().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3, 3]);

    for (group_id, mut runs) in members {
        let group = publix.store().find_group(group_id).unwrap().unwrap();
        let mut recorded = group.member_run_ids.clone();
        recorded.sort_unstable();
        runs.sort_unstable();
        assert_eq!(recorded, runs);
        let expected = if runs.len() == 3 {
            GroupState::Complete
        } else {
            GroupState::Incomplete
        };
        assert_eq!(group.state, expected);
    }
}

#[test]
fn concurrent_starts_leave_one_open_component_run() {
    let publix = publix();
    let started = start(&publix);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let publix = &publix;
            let started = &started;
            scope.spawn(move || {
                publix
                    .start_component(&started.token, started.run.id, 20)
                    .expect("reloadable component starts");
            });
        }
    });

    let component_runs = publix.store().list_component_runs(started.run.id).unwrap();
    assert_eq!(component_runs.len(), 9);
    assert_eq!(component_runs.iter().filter(|c| !c.is_done()).count(), 1);
    let seqs: Vec<u64> = component_runs.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, (1..=9).collect::<Vec<u64>>());
    assert!(component_runs.last().is_some_and(|c| !c.is_done()));
}

#[test]
fn finish_races_with_result_submission() {
    let publix = publix();
    let started = start(&publix);

    let outcomes: Vec<Result<(), PublixError>> = std::thread::scope(|scope| {
        let submit = scope.spawn(|| {
            publix
                .submit_result_data(&started.token, started.run.id, 10, "{}", true)
                .map(|_| ())
        });
        let finish = scope.spawn(|| {
            publix
                .finish_run(&started.token, started.run.id, true, None)
                .map(|_| ())
        });
        vec![submit.join().unwrap(), finish.join().unwrap()]
    });

    assert!(outcomes[1].is_ok());
    let run = publix.store().require_run(started.run.id).unwrap();
    assert!(run.is_done());
    let component_runs = publix.store().list_component_runs(started.run.id).unwrap();
    assert!(component_runs.iter().all(|c| c.is_done()));
    if outcomes[0].is_err() {
        assert!(matches!(outcomes[0], Err(PublixError::Forbidden(_))));
    }
}
