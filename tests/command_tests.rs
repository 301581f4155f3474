//! Tests for operator commands against the session store

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use txconsole::{
    BranchRegistration, BranchStatus, BranchType, CommandProcessor, Coordinator, ErrorKind,
    GlobalSession, GlobalStatus, SessionStore, StoreConfig,
};

fn setup_test_env() -> (TempDir, Arc<SessionStore>, CommandProcessor) {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SessionStore::open(temp_dir.path(), StoreConfig::default()).unwrap());
    let commands = CommandProcessor::new(Arc::clone(&store));
    (temp_dir, store, commands)
}

/// Global session T1 (Begin) with one Registered branch B1
fn seed_t1(store: &SessionStore) {
    let mut t1 = GlobalSession::new("T1", 1, "app", "order", 1000);
    let b1 = t1.new_branch(1, BranchType::AT, "jdbc:orders");
    t1.add_branch(b1);
    store.put(t1).unwrap();
}

// ============== Lifecycle Scenario ==============

#[test]
fn test_stop_start_delete_force_delete_scenario() {
    let (_dir, store, commands) = setup_test_env();
    seed_t1(&store);

    commands.stop_global("T1").unwrap();
    let t1 = store.get("T1").unwrap();
    assert_eq!(t1.status, GlobalStatus::Suspended);
    assert_eq!(t1.suspended_from, Some(GlobalStatus::Begin));

    commands.start_global("T1").unwrap();
    assert_eq!(store.get("T1").unwrap().status, GlobalStatus::Begin);

    let err = commands.delete_global("T1").unwrap_err();
    assert!(err.kind().is_state_conflict());

    commands.force_delete_global("T1").unwrap();
    assert_eq!(store.get("T1").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.get_branch("T1", 1).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_delete_then_get_is_not_found() {
    let (_dir, store, commands) = setup_test_env();
    store
        .put(GlobalSession::new("T2", 2, "app", "order", 1).with_status(GlobalStatus::Finished))
        .unwrap();
    commands.delete_global("T2").unwrap();
    assert_eq!(store.get("T2").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(commands.delete_global("T2").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_force_delete_succeeds_from_every_status() {
    let (_dir, store, commands) = setup_test_env();
    for (i, status) in GlobalStatus::ALL.iter().enumerate() {
        let xid = format!("T{}", i);
        store.put(GlobalSession::new(xid.clone(), i as u64, "app", "tx", 1).with_status(*status)).unwrap();
        commands.force_delete_global(&xid).unwrap();
        assert_eq!(commands.force_delete_global(&xid).unwrap_err().kind(), ErrorKind::NotFound);
    }
    assert!(store.is_empty());
}

#[test]
fn test_commands_on_unknown_xid() {
    let (_dir, _store, commands) = setup_test_env();
    assert_eq!(commands.stop_global("nope").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(commands.start_global("nope").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        commands.send_commit_or_rollback("nope", None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(commands.stop_branch("nope", 1).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_every_command_leaves_a_defined_status() {
    let (_dir, store, commands) = setup_test_env();
    for (i, status) in GlobalStatus::ALL.iter().enumerate() {
        let xid = format!("S{}", i);
        store.put(GlobalSession::new(xid.clone(), i as u64, "app", "tx", 1).with_status(*status)).unwrap();
        let _ = commands.stop_global(&xid);
        let _ = commands.send_commit_or_rollback(&xid, None);
        let _ = commands.change_global_status(&xid, None);
        let _ = commands.start_global(&xid);
        let after = store.get(&xid).unwrap().status;
        assert!(GlobalStatus::ALL.contains(&after));
        assert_eq!(GlobalStatus::from_code(after.code()), Some(after));
    }
}

// ============== Branch Commands ==============

#[test]
fn test_branch_delete_requires_terminal_status() {
    let (_dir, store, commands) = setup_test_env();
    seed_t1(&store);
    let err = commands.delete_branch("T1", 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StillActive);

    let mut t1 = store.get("T1").unwrap();
    t1.branch_mut(1).unwrap().status = BranchStatus::PhaseTwoRollbacked;
    store.put(t1).unwrap();
    commands.delete_branch("T1", 1).unwrap();
    assert_eq!(store.get_branch("T1", 1).unwrap_err().kind(), ErrorKind::NotFound);
    assert!(store.get("T1").is_ok());
}

#[test]
fn test_stopped_branch_blocks_coordinator_reports() {
    let (_dir, store, commands) = setup_test_env();
    let coordinator = Coordinator::new(Arc::clone(&store), "127.0.0.1:8091");
    let xid = coordinator.begin("app", "group", "order", 60_000).unwrap();
    let branch = coordinator
        .register_branch(&xid, BranchRegistration::new(BranchType::TCC, "svc"))
        .unwrap();

    commands.stop_branch(&xid, branch).unwrap();
    let err = coordinator
        .report_branch_status(&xid, branch, BranchStatus::PhaseOneDone)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    commands.start_branch(&xid, branch).unwrap();
    coordinator
        .report_branch_status(&xid, branch, BranchStatus::PhaseOneDone)
        .unwrap();
}

// ============== Concurrency ==============

#[test]
fn test_command_fails_busy_while_xid_is_locked() {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig { lock_wait: Duration::from_millis(20), ..Default::default() };
    let store = Arc::new(SessionStore::open(temp_dir.path(), config).unwrap());
    let commands = Arc::new(CommandProcessor::new(Arc::clone(&store)));
    seed_t1(&store);

    let guard = store.lock("T1").unwrap();
    let worker = {
        let commands = Arc::clone(&commands);
        thread::spawn(move || commands.stop_global("T1"))
    };
    let err = worker.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    drop(guard);

    // Reissuing after the lock is released succeeds
    commands.stop_global("T1").unwrap();
}

#[test]
fn test_concurrent_commands_and_reports_serialize() {
    let (_dir, store, commands) = setup_test_env();
    let commands = Arc::new(commands);
    let coordinator = Arc::new(Coordinator::new(Arc::clone(&store), "127.0.0.1:8091"));
    let xid = coordinator.begin("app", "group", "order", 60_000).unwrap();

    let registrar = {
        let coordinator = Arc::clone(&coordinator);
        let xid = xid.clone();
        thread::spawn(move || {
            let mut registered = 0;
            for _ in 0..50 {
                if coordinator
                    .register_branch(&xid, BranchRegistration::new(BranchType::AT, "db"))
                    .is_ok()
                {
                    registered += 1;
                }
            }
            registered
        })
    };
    let operator = {
        let commands = Arc::clone(&commands);
        let xid = xid.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                let _ = commands.stop_global(&xid);
                let _ = commands.start_global(&xid);
            }
        })
    };

    let registered = registrar.join().unwrap();
    operator.join().unwrap();

    let session = store.get(&xid).unwrap();
    // Every successful registration is visible, none was lost to an interleaved write
    assert_eq!(session.branches.len(), registered);
    assert!(matches!(session.status, GlobalStatus::Begin | GlobalStatus::Suspended));
}
