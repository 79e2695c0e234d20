use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tempfile::tempdir;
use unimask_rs::model::SEP;
use unimask_rs::{ClaimRequest, ClaimResponse};

mod support;

#[test]
fn collision_then_retry_then_hint() {
    let dir = tempdir().unwrap();
    let store = support::open_store(dir.path(), 4);

    // alice takes the canonical candidate.
    let responses = store
        .store_claim("R", &[ClaimRequest::initial("alice", "XYZ")])
        .unwrap();
    assert_eq!(responses, vec![ClaimResponse::Linked]);

    // bob collides and there is nothing remembered yet.
    let responses = store
        .store_claim("R", &[ClaimRequest::initial("bob", "XYZ")])
        .unwrap();
    assert_eq!(responses, vec![ClaimResponse::Rejected { hint: None }]);

    // bob's first retry wins and is memoized under the original candidate.
    let responses = store
        .store_claim("R", &[ClaimRequest::retry("bob", "XYZ2", "XYZ", 1)])
        .unwrap();
    assert_eq!(responses, vec![ClaimResponse::Linked]);
    assert_eq!(store.owner("R", "XYZ2").unwrap().as_deref(), Some("bob"));
    assert_eq!(store.hints("R").unwrap(), vec![(format!("XYZ{SEP}bob"), 1)]);

    // A later client resolving bob again is told where to jump.
    let responses = store
        .store_claim("R", &[ClaimRequest::initial("bob", "XYZ")])
        .unwrap();
    assert_eq!(responses, vec![ClaimResponse::Rejected { hint: Some(1) }]);
}

#[test]
fn repositories_are_independent() {
    let dir = tempdir().unwrap();
    let store = support::open_store(dir.path(), 4);

    store
        .store_claim("R1", &[ClaimRequest::initial("alice", "XYZ")])
        .unwrap();
    let responses = store
        .store_claim("R2", &[ClaimRequest::initial("bob", "XYZ")])
        .unwrap();
    assert_eq!(responses, vec![ClaimResponse::Linked]);
    assert_eq!(store.owner("R1", "XYZ").unwrap().as_deref(), Some("alice"));
    assert_eq!(store.owner("R2", "XYZ").unwrap().as_deref(), Some("bob"));
}

#[test]
fn concurrent_claims_never_share_a_target() {
    let dir = tempdir().unwrap();
    let store = support::open_store(dir.path(), 8);

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut won = Vec::new();
                for target in 0..200 {
                    let source = format!("source-{worker}");
                    let target = format!("T{target}");
                    let responses = store
                        .store_claim("R", &[ClaimRequest::initial(&source, &target)])
                        .unwrap();
                    if responses[0].is_linked() {
                        won.push(target);
                    }
                }
                (worker, won)
            })
        })
        .collect();

    let mut winners: HashMap<String, usize> = HashMap::new();
    for handle in workers {
        let (worker, won) = handle.join().unwrap();
        for target in won {
            assert!(
                winners.insert(target.clone(), worker).is_none(),
                "{target} linked to two sources"
            );
        }
    }
    assert_eq!(winners.len(), 200);
    for (target, worker) in &winners {
        assert_eq!(
            store.owner("R", target).unwrap(),
            Some(format!("source-{worker}"))
        );
    }
}

#[test]
fn committed_claims_survive_restart() {
    let dir = tempdir().unwrap();
    {
        let store = support::open_store(dir.path(), 4);
        store
            .store_claim(
                "R",
                &[
                    ClaimRequest::initial("alice", "XYZ"),
                    ClaimRequest::retry("bob", "XYZ2", "XYZ", 1),
                ],
            )
            .unwrap();
        assert_eq!(store.commit_all().unwrap(), 3);
    }

    let store = support::open_store(dir.path(), 4);
    assert_eq!(
        store.claims("R").unwrap(),
        vec![
            ("XYZ".to_string(), "alice".to_string()),
            ("XYZ2".to_string(), "bob".to_string()),
        ]
    );
    let responses = store
        .store_claim("R", &[ClaimRequest::initial("bob", "XYZ")])
        .unwrap();
    assert_eq!(responses, vec![ClaimResponse::Rejected { hint: Some(1) }]);
}

#[test]
fn reopening_with_another_shard_count_fails() {
    let dir = tempdir().unwrap();
    drop(support::open_store(dir.path(), 4));

    let config = support::storage_config(dir.path(), 8);
    assert!(unimask_rs::Store::open(&config).is_err());
}
