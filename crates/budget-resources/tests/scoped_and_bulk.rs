mod common;

use std::panic::{self, AssertUnwindSafe};

use budget_resources::{AcquireOptions, ResourceError, ScopedContext};

use common::manager;

#[test]
fn bulk_failure_rolls_back_everything_it_opened() {
    let manager = manager();
    manager.backend().insert("/budgets/a.xlsx", b"PK".to_vec());
    manager
        .backend()
        .insert_malformed("/budgets/corrupt.xlsx", "not a ZIP or CFB workbook container");
    manager.backend().insert("/budgets/c.xlsx", b"PK".to_vec());
    let before = manager.stats().active_count;

    let err = manager
        .acquire_bulk(
            ["/budgets/a.xlsx", "/budgets/corrupt.xlsx", "/budgets/c.xlsx"],
            AcquireOptions::read_only(),
        )
        .expect_err("corrupt member");

    match &err {
        ResourceError::ValidationFailed { key, reason } => {
            assert!(key.ends_with("corrupt.xlsx"), "{key}");
            assert!(reason.contains("not a ZIP"), "{reason}");
        }
        other => panic!("expected ValidationFailed, got {other:?}"),
    }
    assert_eq!(manager.stats().active_count, before);
    assert_eq!(manager.backend().close_count("/budgets/a.xlsx"), 1);
    // Acquisition stops at the first failure.
    assert_eq!(manager.backend().open_count("/budgets/c.xlsx"), 0);
}

#[test]
fn bulk_rollback_keeps_entries_other_callers_hold() {
    let manager = manager();
    manager.backend().insert("/budgets/shared.xlsx", b"PK".to_vec());
    manager.backend().insert("/budgets/fresh.xlsx", b"PK".to_vec());
    let held = manager
        .acquire("/budgets/shared.xlsx", AcquireOptions::read_only())
        .expect("acquire shared");

    let err = manager
        .acquire_bulk(
            ["/budgets/shared.xlsx", "/budgets/fresh.xlsx", "/budgets/missing.xlsx"],
            AcquireOptions::read_only(),
        )
        .expect_err("missing member");
    assert!(matches!(err, ResourceError::NotFound { .. }));

    assert_eq!(manager.active_count(), 1);
    assert_eq!(manager.refcount("/budgets/shared.xlsx"), 1);
    assert_eq!(manager.backend().close_count("/budgets/shared.xlsx"), 0);
    assert_eq!(manager.backend().close_count("/budgets/fresh.xlsx"), 1);
    manager.release(held);
}

#[test]
fn bulk_acquires_duplicates_once() {
    let manager = manager();
    manager.backend().insert("/budgets/a.xlsx", b"PK".to_vec());
    manager.backend().insert("/budgets/b.xlsx", b"PK".to_vec());

    let handles = manager
        .acquire_bulk(
            ["/budgets/a.xlsx", "/budgets/b.xlsx", "/budgets/./a.xlsx"],
            AcquireOptions::read_only(),
        )
        .expect("bulk");
    assert_eq!(handles.len(), 2);
    assert_eq!(manager.refcount("/budgets/a.xlsx"), 1);
    assert!(handles.get("/budgets/b.xlsx").is_some());

    for handle in handles.into_vec() {
        manager.release(handle);
    }
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn with_resource_releases_when_body_fails() {
    let manager = manager();
    manager.backend().insert("/budgets/a.xlsx", b"PK".to_vec());
    let scoped = ScopedContext::new(&manager);

    let result: anyhow::Result<()> =
        scoped.with_resource("/budgets/a.xlsx", AcquireOptions::read_write(), |handle| {
            assert_eq!(manager.refcount(handle.key()), 1);
            anyhow::bail!("sheet `Q3` is missing")
        });

    let err = result.expect_err("body error reaches the caller");
    assert!(err.to_string().contains("Q3"));
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.backend().close_count("/budgets/a.xlsx"), 1);
}

#[test]
fn with_resource_releases_when_body_panics() {
    let manager = manager();
    manager.backend().insert("/budgets/a.xlsx", b"PK".to_vec());
    let held = manager
        .acquire("/budgets/a.xlsx", AcquireOptions::read_only())
        .expect("outer acquire");
    let scoped = ScopedContext::new(&manager);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _: Result<(), ResourceError> =
            scoped.with_resource("/budgets/a.xlsx", AcquireOptions::read_only(), |_| {
                panic!("formula evaluation blew up")
            });
    }));
    assert!(outcome.is_err());

    // Back to the outer caller's single reference.
    assert_eq!(manager.refcount("/budgets/a.xlsx"), 1);
    manager.release(held);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn with_resource_surfaces_acquisition_errors() {
    let manager = manager();
    manager.backend().insert("/budgets/a.xlsx", b"PK".to_vec());
    manager.backend().set_locked("/budgets/a.xlsx", true);
    let scoped = ScopedContext::new(&manager);

    let mut ran = false;
    let result = scoped.with_resource("/budgets/a.xlsx", AcquireOptions::read_only(), |_| {
        ran = true;
        Ok::<_, ResourceError>(())
    });

    assert!(matches!(result, Err(ResourceError::Locked { .. })));
    assert!(!ran);
    assert_eq!(manager.stats().open_failures, 1);
}

#[test]
fn with_resources_bulk_releases_the_batch() {
    let manager = manager();
    for path in ["/budgets/a.xlsx", "/budgets/b.xlsx"] {
        manager.backend().insert(path, b"PK".to_vec());
    }
    let scoped = ScopedContext::new(&manager);

    let total = scoped
        .with_resources_bulk(
            ["/budgets/a.xlsx", "/budgets/b.xlsx"],
            AcquireOptions::read_only(),
            |handles| {
                let mut total = 0;
                for handle in handles.iter() {
                    total += handle.resource()?.bytes().len();
                }
                Ok::<_, ResourceError>(total)
            },
        )
        .expect("bulk body");

    assert_eq!(total, 4);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.backend().total_closes(), 2);
}

fn file_names(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .map(|key| key.rsplit('/').next().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn with_resources_bulk_releases_newest_first_when_body_fails() {
    let manager = manager();
    for path in ["/budgets/a.xlsx", "/budgets/b.xlsx"] {
        manager.backend().insert(path, b"PK".to_vec());
    }
    let scoped = ScopedContext::new(&manager);

    let result: anyhow::Result<()> = scoped.with_resources_bulk(
        ["/budgets/a.xlsx", "/budgets/b.xlsx"],
        AcquireOptions::read_only(),
        |handles| {
            assert_eq!(handles.len(), 2);
            anyhow::bail!("column `Amount` has a non-numeric cell")
        },
    );

    assert!(result.is_err());
    assert_eq!(manager.active_count(), 0);
    assert_eq!(
        file_names(manager.backend().close_order()),
        vec!["b.xlsx", "a.xlsx"]
    );
}

#[test]
fn with_resources_bulk_releases_newest_first_when_body_panics() {
    let manager = manager();
    for path in ["/budgets/a.xlsx", "/budgets/b.xlsx"] {
        manager.backend().insert(path, b"PK".to_vec());
    }
    let scoped = ScopedContext::new(&manager);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _: Result<(), ResourceError> = scoped.with_resources_bulk(
            ["/budgets/a.xlsx", "/budgets/b.xlsx"],
            AcquireOptions::read_only(),
            |_| panic!("partner rows out of sync"),
        );
    }));

    assert!(outcome.is_err());
    assert_eq!(manager.active_count(), 0);
    assert_eq!(
        file_names(manager.backend().close_order()),
        vec!["b.xlsx", "a.xlsx"]
    );
}
