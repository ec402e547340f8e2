/// Falsification tests for passgate.
///
/// These tests try to break the engine rather than confirm it works:
///
/// - Generated ids and codes drifting out of their alphabets
/// - Concurrent touches, creates and sweeps racing on one store
/// - Children outliving their parents
/// - Consumers reaching sessions that are not theirs
///
/// Philosophy: If we can't break it, we gain confidence it's correct.
use chrono::{Duration, Utc};
use passgate::auth::{generate_code, generate_session_id, is_code, is_session_id};
use passgate::prelude::*;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn shared_engine() -> Arc<SessionEngine> {
    let engine = SessionEngine::in_memory().unwrap();
    engine.create_user("u1").unwrap();
    Arc::new(engine)
}

// ============================================================================
// SECTION 1: GENERATED VALUES
// ============================================================================

#[test]
fn falsify_code_format() {
    let pattern = Regex::new(r"^\d{6}$").unwrap();
    for _ in 0..2000 {
        let code = generate_code();
        assert!(pattern.is_match(&code), "bad code: {code}");
        assert!(is_code(&code));
    }
}

#[test]
fn falsify_session_id_format() {
    let pattern = Regex::new(r"^[a-z0-9]{32}$").unwrap();
    let mut seen = HashSet::new();
    for _ in 0..2000 {
        let id = generate_session_id();
        assert!(pattern.is_match(&id), "bad session id: {id}");
        assert!(is_session_id(&id));
        assert!(seen.insert(id), "duplicate session id");
    }
}

#[test]
fn falsify_stored_sessions_keep_format() {
    let engine = shared_engine();
    let code_pattern = Regex::new(r"^\d{6}$").unwrap();
    let id_pattern = Regex::new(r"^[a-z0-9]{32}$").unwrap();

    for _ in 0..200 {
        let session = engine
            .create_session("u1", "keyA", SessionOptions::default())
            .unwrap();
        let stored = engine.get_session(&session.session_id).unwrap().unwrap();
        assert!(id_pattern.is_match(&stored.session_id));
        assert!(code_pattern.is_match(stored.code.as_deref().unwrap()));
        assert_eq!(stored, session);
    }
}

// ============================================================================
// SECTION 2: CONCURRENCY
// ============================================================================

#[test]
fn falsify_concurrent_touches() {
    let engine = shared_engine();
    let session = engine
        .create_session("u1", "keyA", SessionOptions::new().duration(60))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let id = session.session_id.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let touched = engine.touch_session(&id, 600 + i).unwrap().unwrap();
                    assert_eq!(touched.session_id, id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let after = engine.get_session(&session.session_id).unwrap().unwrap();
    assert!((600..608).contains(&after.session_duration));
    assert!(after.expires_at > session.expires_at);
    assert_eq!(engine.count_sessions().unwrap(), 1);
}

#[test]
fn falsify_concurrent_creates_unique_ids() {
    let engine = shared_engine();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                (0..50)
                    .map(|_| {
                        engine
                            .create_session("u1", "keyA", SessionOptions::default())
                            .unwrap()
                            .session_id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(ids.insert(id), "duplicate session id under concurrency");
        }
    }
    assert_eq!(ids.len(), 400);
    assert_eq!(engine.count_sessions().unwrap(), 400);
    assert_eq!(engine.stats().unwrap().sessions_created, 400);
}

#[test]
fn falsify_sweep_during_traffic() {
    let engine = shared_engine();

    // Sessions already expired relative to the sweeper's horizon
    let doomed: Vec<String> = (0..20)
        .map(|_| {
            engine
                .create_session("u1", "keyA", SessionOptions::new().duration(1))
                .unwrap()
                .session_id
        })
        .collect();
    let horizon = Utc::now() + Duration::seconds(5);

    let sweeper = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let mut removed = 0;
            for _ in 0..20 {
                removed += engine.delete_expired_sessions(Some(horizon)).unwrap();
            }
            removed
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..25 {
                    let session = engine
                        .create_session("u1", "keyB", SessionOptions::new().duration(3600))
                        .unwrap();
                    assert!(engine
                        .check_session_access(&session.session_id, "keyB")
                        .unwrap());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    let removed = sweeper.join().unwrap();

    assert_eq!(removed, doomed.len());
    for id in &doomed {
        assert!(engine.get_session(id).unwrap().is_none());
    }
    assert_eq!(engine.count_sessions().unwrap(), 100);
}

// ============================================================================
// SECTION 3: DELEGATION AND ISOLATION
// ============================================================================

#[test]
fn falsify_children_never_outlive_parent() {
    let engine = shared_engine();
    let parent = engine
        .create_session("u1", "keyA", SessionOptions::new().duration(120))
        .unwrap();
    engine.validate_session(&parent.session_id).unwrap();

    let children: Vec<Session> = (0..5)
        .map(|i| {
            engine
                .create_delegated_session(&parent.session_id, &format!("key{i}"), Some(86_400))
                .unwrap()
        })
        .collect();

    let later = parent.expires_at + Duration::seconds(1);
    for child in &children {
        assert!(!engine.is_session_active_at(&child.session_id, later).unwrap());
        assert!(!engine.check_session_access(&child.session_id, &child.api_key).unwrap());
    }
    assert_eq!(engine.count_sessions().unwrap(), 0);
}

#[test]
fn falsify_child_cannot_delegate_after_parent_rotation() {
    let engine = shared_engine();
    let parent = engine
        .create_session("u1", "keyA", SessionOptions::default())
        .unwrap();
    engine.validate_session(&parent.session_id).unwrap();
    let child = engine
        .create_delegated_session(&parent.session_id, "keyB", None)
        .unwrap();

    let rotated = engine.rotate_session(&parent.session_id).unwrap();
    assert!(matches!(
        engine.create_delegated_session(&child.session_id, "keyC", None),
        Err(SessionError::NestedDelegation)
    ));

    // Rotated parent still owns the child
    assert!(engine.delete_session(&rotated.session_id).unwrap());
    assert!(engine.get_session(&child.session_id).unwrap().is_none());
}

#[test]
fn falsify_api_key_lookalikes() {
    let engine = shared_engine();
    let session = engine
        .create_session("u1", "keyA", SessionOptions::default())
        .unwrap();

    for candidate in ["keya", "KEYA", "keyA ", " keyA", "keyA\0", "key", "keyAA", ""] {
        assert!(
            !engine.check_session_access(&session.session_id, candidate).unwrap(),
            "api key {candidate:?} reached a keyA session"
        );
    }
}

#[test]
fn falsify_code_lookalikes() {
    let engine = shared_engine();
    let session = engine
        .create_session("u1", "keyA", SessionOptions::default())
        .unwrap();
    let code = session.code.clone().unwrap();

    let candidates = [
        format!(" {code}"),
        format!("{code} "),
        format!("{code}0"),
        code[..5].to_string(),
        String::new(),
    ];
    for candidate in &candidates {
        assert!(!engine.validate_code(&session.session_id, candidate).unwrap());
    }
    assert!(engine.validate_code(&session.session_id, &code).unwrap());
    assert_eq!(engine.stats().unwrap().codes_rejected, candidates.len() as u64);
}

#[test]
fn falsify_delegated_session_has_no_code_to_guess() {
    let engine = shared_engine();
    let parent = engine
        .create_session("u1", "keyA", SessionOptions::default())
        .unwrap();
    engine.validate_session(&parent.session_id).unwrap();
    let child = engine
        .create_delegated_session(&parent.session_id, "keyB", None)
        .unwrap();

    for candidate in ["", "000000", parent.code.as_deref().unwrap()] {
        assert!(!engine.validate_code(&child.session_id, candidate).unwrap());
    }
}
