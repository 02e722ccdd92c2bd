//! End-to-end tests of the dynamic multi-database shell.

use mapstore_core::{ComparisonKind, MultiDatabase, OpenMode, StoreError};
use tempfile::tempdir;

const STORE_SIZE: u64 = 8 << 20;

fn open_shell(dir: &std::path::Path) -> MultiDatabase {
    MultiDatabase::open(dir, OpenMode::ReadWrite, STORE_SIZE).unwrap()
}

#[test]
fn record_reachable_through_all_three_orderings() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("test").unwrap();
    shell
        .modify("test", |db| {
            db.create_table("balances")?;
            db.create("balances", 1, 2, b"abc".to_vec())?;
            Ok(())
        })
        .unwrap();

    // The shell convenience call works outside an explicit modify.
    let second = shell
        .create_record("test", "balances", 4, 3, b"d".to_vec())
        .unwrap();
    assert_eq!(second.id, 2);

    let by_id = shell.get_by_id("test", "balances", 2).unwrap();
    let by_primary = shell.get_by_primary("test", "balances", 4).unwrap();
    let by_secondary = shell.get_by_secondary("test", "balances", 3).unwrap();
    assert_eq!(by_id, by_primary);
    assert_eq!(by_id, by_secondary);
    assert_eq!(by_id.value, b"d");
}

#[test]
fn record_ids_start_at_one() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| {
            handle.create_table("t")?;
            let record = handle.create("t", 0, 0, Vec::new())?;
            assert_eq!(record.id, 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn database_management() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("alpha").unwrap();
    shell.create_database("beta").unwrap();
    assert!(matches!(
        shell.create_database("alpha"),
        Err(StoreError::AlreadyExists { .. })
    ));

    assert_eq!(shell.database_names().unwrap(), vec!["alpha", "beta"]);
    assert!(shell.find_database("gamma").unwrap().is_none());
    assert!(matches!(
        shell.get_database("gamma"),
        Err(StoreError::DatabaseNotFound { .. })
    ));

    shell
        .modify("alpha", |db| {
            db.create_table("t1")?;
            db.create_table("t2")
        })
        .unwrap();
    let info = shell.get_database("alpha").unwrap();
    assert_eq!(info.tables, vec!["t1", "t2"]);

    shell.remove_database("alpha").unwrap();
    assert!(shell.find_database("alpha").unwrap().is_none());
    assert!(matches!(
        shell.get_by_id("alpha", "t1", 1),
        Err(StoreError::DatabaseNotFound { .. })
    ));
}

#[test]
fn missing_lookups_fail_and_find_returns_none() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| handle.create_table("t"))
        .unwrap();

    assert!(shell.find_by_id("db", "t", 1).unwrap().is_none());
    assert!(shell.find_by_primary("db", "t", 1).unwrap().is_none());
    assert!(matches!(
        shell.get_by_id("db", "t", 1),
        Err(StoreError::RecordNotFound { .. })
    ));
    assert!(matches!(
        shell.get_by_secondary("db", "t", 9),
        Err(StoreError::RecordNotFound { .. })
    ));
    assert!(matches!(
        shell.find_by_id("db", "missing", 1),
        Err(StoreError::TableNotFound { .. })
    ));
}

#[test]
fn session_drop_reverts_record_mutations() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| {
            handle.create_table("t")?;
            handle.create("t", 1, 1, b"one".to_vec())?;
            Ok(())
        })
        .unwrap();

    {
        let _session = shell.start_undo_session(true).unwrap();
        shell
            .modify("db", |handle| {
                handle.modify("t", 1, 9, 9, b"changed".to_vec())?;
                handle.create("t", 2, 2, b"two".to_vec())?;
                handle.remove("t", 1)?;
                Ok(())
            })
            .unwrap();
    }

    let record = shell.get_by_id("db", "t", 1).unwrap();
    assert_eq!(record.primary, 1);
    assert_eq!(record.value, b"one");
    assert!(shell.find_by_id("db", "t", 2).unwrap().is_none());

    // The id counter rewound with the undo.
    let next = shell.create_record("db", "t", 5, 5, Vec::new()).unwrap();
    assert_eq!(next.id, 2);
}

#[test]
fn session_drop_reverts_table_creation() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    {
        let _session = shell.start_undo_session(true).unwrap();
        shell
            .modify("db", |handle| {
                handle.create_table("temp")?;
                handle.create("temp", 1, 1, Vec::new())?;
                Ok(())
            })
            .unwrap();
    }

    let info = shell.get_database("db").unwrap();
    assert!(info.tables.is_empty());
}

#[test]
fn session_drop_restores_removed_table_with_records() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| {
            handle.create_table("t")?;
            handle.create("t", 1, 10, b"a".to_vec())?;
            handle.create("t", 2, 20, b"b".to_vec())?;
            Ok(())
        })
        .unwrap();

    {
        let _session = shell.start_undo_session(true).unwrap();
        shell.modify("db", |handle| handle.remove_table("t")).unwrap();
        assert!(shell.get_database("db").unwrap().tables.is_empty());
    }

    let info = shell.get_database("db").unwrap();
    assert_eq!(info.tables, vec!["t"]);
    assert_eq!(shell.get_by_id("db", "t", 1).unwrap().value, b"a");
    assert_eq!(shell.get_by_id("db", "t", 2).unwrap().value, b"b");
    // The restored table keeps its id counter.
    let next = shell.create_record("db", "t", 3, 30, Vec::new()).unwrap();
    assert_eq!(next.id, 3);
}

#[test]
fn push_then_shell_undo() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| {
            handle.create_table("t")?;
            handle.create("t", 1, 1, b"v1".to_vec())?;
            Ok(())
        })
        .unwrap();

    let session = shell.start_undo_session(true).unwrap();
    shell
        .modify("db", |handle| handle.modify("t", 1, 1, 1, b"v2".to_vec()))
        .unwrap();
    session.push();

    assert_eq!(shell.get_by_id("db", "t", 1).unwrap().value, b"v2");
    shell.undo().unwrap();
    assert_eq!(shell.get_by_id("db", "t", 1).unwrap().value, b"v1");
}

#[test]
fn commit_truncates_dynamic_undo() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| handle.create_table("t"))
        .unwrap();

    let session = shell.start_undo_session(true).unwrap();
    shell.create_record("db", "t", 1, 1, Vec::new()).unwrap();
    let revision = session.revision();
    session.push();

    shell.commit(revision).unwrap();
    shell.undo().unwrap();
    assert!(shell.find_by_id("db", "t", 1).unwrap().is_some());
}

#[test]
fn state_persists_across_reopen() {
    let temp = tempdir().unwrap();
    {
        let shell = open_shell(temp.path());
        shell.create_database("db").unwrap();
        shell
            .modify("db", |handle| {
                handle.create_table_with("t", ComparisonKind::Unsigned, ComparisonKind::Memory)?;
                handle.create("t", -1, 7, b"payload".to_vec())?;
                Ok(())
            })
            .unwrap();
        shell.close();
    }

    let shell = open_shell(temp.path());
    let info = shell.get_database("db").unwrap();
    assert_eq!(info.tables, vec!["t"]);

    // In unsigned mode -1 is still an exact-match key.
    let record = shell.get_by_primary("db", "t", -1).unwrap();
    assert_eq!(record.id, 1);
    assert_eq!(record.value, b"payload");

    // The id counter survives reattach.
    let next = shell.create_record("db", "t", 2, 2, Vec::new()).unwrap();
    assert_eq!(next.id, 2);
}

#[test]
fn read_only_attach_serves_lookups() {
    let temp = tempdir().unwrap();
    {
        let shell = open_shell(temp.path());
        shell.create_database("db").unwrap();
        shell
            .modify("db", |handle| {
                handle.create_table("t")?;
                handle.create("t", 1, 2, b"x".to_vec())?;
                Ok(())
            })
            .unwrap();
        shell.close();
    }

    let shell = MultiDatabase::open(temp.path(), OpenMode::ReadOnly, 0).unwrap();
    assert_eq!(shell.get_by_id("db", "t", 1).unwrap().value, b"x");
    assert!(matches!(
        shell.create_database("other"),
        Err(StoreError::NotWritable)
    ));
    assert!(matches!(
        shell.modify("db", |handle| handle.create_table("u")),
        Err(StoreError::NotWritable)
    ));
}

#[test]
fn sibling_tables_share_one_undo_structure() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("db").unwrap();
    shell
        .modify("db", |handle| {
            handle.create_table("left")?;
            handle.create_table("right")?;
            Ok(())
        })
        .unwrap();

    {
        let _session = shell.start_undo_session(true).unwrap();
        shell
            .modify("db", |handle| {
                handle.create("left", 1, 1, Vec::new())?;
                handle.create("right", 2, 2, Vec::new())?;
                Ok(())
            })
            .unwrap();
    }

    // One session drop reverted both tables together.
    assert!(shell.find_by_id("db", "left", 1).unwrap().is_none());
    assert!(shell.find_by_id("db", "right", 1).unwrap().is_none());
}

#[test]
fn distinct_databases_have_independent_undo_stacks() {
    let temp = tempdir().unwrap();
    let shell = open_shell(temp.path());

    shell.create_database("a").unwrap();
    shell.create_database("b").unwrap();
    shell
        .modify("a", |handle| handle.create_table("t"))
        .unwrap();
    shell
        .modify("b", |handle| handle.create_table("t"))
        .unwrap();

    let session = shell.start_undo_session(true).unwrap();
    shell.create_record("a", "t", 1, 1, Vec::new()).unwrap();
    session.push();
    shell.undo().unwrap();

    // Only "a" had recorded work; "b" is untouched either way.
    assert!(shell.find_by_id("a", "t", 1).unwrap().is_none());
    assert!(shell.find_by_id("b", "t", 1).unwrap().is_none());
}
