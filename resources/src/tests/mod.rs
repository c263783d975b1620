//! This contains test scenarios a [ResourceStore] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all store setups we want to
//! test against, and then apply this template to all test functions.

use std::{fs, sync::Arc, thread, time::Duration};

use rstest::*;
use rstest_reuse::{self, *};

use crate::{
    cache::FileSystemCache,
    db::{Database, RecordTable},
    ignored::IgnoredPaths,
    lock::MemoryLockProvider,
    Error, Resource, ResourcePath, ResourceStore, ResourceType, UNDEFINED_ID,
};

use self::utils::{make_file_store, make_memory_store, make_two_instances, REFRESH_INTERVAL};

fn id(resource: &Resource) -> i64 {
    match resource {
        Resource::Database(handle) => handle.id(),
        Resource::FileSystem(_) => panic!("{} is not database-backed", resource.path()),
    }
}

/// Waits until every handle is due for a refresh.
fn let_handles_go_stale() {
    thread::sleep(REFRESH_INTERVAL + Duration::from_millis(20));
}

#[template]
#[rstest]
#[case::memory(make_memory_store())]
#[case::file(make_file_store())]
pub fn stores(#[case] store: ResourceStore) {}

/// Paths never written are undefined, not errors.
#[apply(stores)]
fn undefined_paths(store: ResourceStore) {
    for path in ["never/written", "styles/point.sld", "temp/nothing.png"] {
        let resource = store.get(path).expect("get must not fail");
        assert_eq!(ResourceType::Undefined, resource.kind());
        assert!(!resource.exists());
        assert_eq!(Vec::<Resource>::new(), resource.list().unwrap());
    }

    match store.get("never/written").unwrap() {
        Resource::Database(handle) => {
            assert_eq!(UNDEFINED_ID, handle.id());
            assert_eq!(UNDEFINED_ID, handle.parent_id());
        }
        Resource::FileSystem(_) => panic!("must be database-backed"),
    }
}

#[apply(stores)]
fn root_is_a_directory(store: ResourceStore) {
    let root = store.get("").unwrap();
    assert_eq!(ResourceType::Directory, root.kind());
    assert_eq!(root, store.get("/").unwrap());
    assert!(root.parent().unwrap().is_none());

    assert!(matches!(store.remove(""), Err(Error::InvalidRequest(_))));
}

#[apply(stores)]
fn mkdirs_creates_ancestors(store: ResourceStore) {
    let ws1 = store.mkdirs("workspaces/ws1").unwrap();
    assert_eq!(ResourceType::Directory, ws1.kind());

    let workspaces = ws1.parent().unwrap().unwrap();
    assert_eq!(ResourceType::Directory, workspaces.kind());
    assert_eq!(vec![ws1.clone()], workspaces.list().unwrap());

    // idempotent
    store.mkdirs("workspaces/ws1").unwrap();
    assert_eq!(1, workspaces.list().unwrap().len());
}

/// Moving a directory moves everything below it and keeps identities.
#[apply(stores)]
fn move_workspace(store: ResourceStore) {
    store.mkdirs("workspaces/ws1").unwrap();
    let file = store
        .write("workspaces/ws1/workspace.xml", b"<workspace/>")
        .unwrap();
    let ws1_id = id(&store.get("workspaces/ws1").unwrap());
    let file_id = id(&file);

    assert!(store.rename("workspaces/ws1", "workspaces/ws2").unwrap());

    let ws2 = store.get("workspaces/ws2").unwrap();
    assert_eq!(ResourceType::Directory, ws2.kind());
    assert_eq!(ws1_id, id(&ws2));
    assert_eq!(
        ResourceType::Undefined,
        store.get("workspaces/ws1").unwrap().kind()
    );
    assert_eq!(
        ResourceType::Undefined,
        store.get("workspaces/ws1/workspace.xml").unwrap().kind()
    );

    let moved = store.get("workspaces/ws2/workspace.xml").unwrap();
    assert_eq!(ResourceType::Resource, moved.kind());
    assert_eq!(file_id, id(&moved));
    assert_eq!(b"<workspace/>".to_vec(), moved.read().unwrap());

    // the old handle notices after a refresh
    let_handles_go_stale();
    assert_eq!(ResourceType::Undefined, file.kind());
}

#[apply(stores)]
fn move_onto_itself(store: ResourceStore) {
    store.write("styles/point.sld", b"<sld/>").unwrap();
    let styles = store.get("styles").unwrap();
    let before = styles.list().unwrap();

    assert!(store.rename("styles", "styles").unwrap());
    assert!(store.rename("/styles/", "styles").unwrap());

    assert_eq!(ResourceType::Directory, store.get("styles").unwrap().kind());
    assert_eq!(before, styles.list().unwrap());
}

#[apply(stores)]
fn move_edge_cases(store: ResourceStore) {
    // missing source
    assert!(!store.rename("nothing", "something").unwrap());
    assert_eq!(ResourceType::Undefined, store.get("something").unwrap().kind());

    // into its own subtree, or onto an ancestor
    store.mkdirs("a/b").unwrap();
    assert!(!store.rename("a", "a/b/c").unwrap());
    assert!(!store.rename("a/b", "a").unwrap());
    assert_eq!(ResourceType::Directory, store.get("a/b").unwrap().kind());

    // replaces the target, creating its ancestors
    store.write("x.xml", b"new").unwrap();
    store.write("deep/er/y.xml", b"old").unwrap();
    let resource = store.get("x.xml").unwrap();
    assert!(resource.rename_to("deep/er/y.xml").unwrap());
    assert_eq!(ResourceType::Undefined, resource.kind());
    assert_eq!(b"new".to_vec(), store.read("deep/er/y.xml").unwrap());

    store.write("f.xml", b"").unwrap();
    assert!(store.rename("f.xml", "new/parent/f.xml").unwrap());
    assert_eq!(
        ResourceType::Directory,
        store.get("new/parent").unwrap().kind()
    );
}

/// Moving between the database and the local-only directories fails and
/// changes nothing.
#[apply(stores)]
fn move_across_tiers(store: ResourceStore) {
    store.write("styles/point.sld", b"<sld/>").unwrap();
    store.write("temp/sample.png", b"png").unwrap();

    assert!(matches!(
        store.rename("styles/point.sld", "temp/point.sld"),
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        store.rename("temp/sample.png", "styles/sample.png"),
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        store.rename("temp", "workspaces/temp"),
        Err(Error::Unsupported(_))
    ));

    assert_eq!(b"<sld/>".to_vec(), store.read("styles/point.sld").unwrap());
    assert_eq!(b"png".to_vec(), store.read("temp/sample.png").unwrap());
    assert!(!store.get("temp/point.sld").unwrap().exists());
    assert!(!store.get("styles/sample.png").unwrap().exists());
}

/// Moves inside the local-only directories work like on a filesystem.
#[apply(stores)]
fn move_within_local(store: ResourceStore) {
    store.write("temp/a/sample.png", b"png").unwrap();

    assert!(store.rename("temp/a", "tmp/b").unwrap());
    assert_eq!(b"png".to_vec(), store.read("tmp/b/sample.png").unwrap());
    assert!(!store.get("temp/a").unwrap().exists());
    assert!(!store.rename("temp/a", "tmp/c").unwrap());
}

/// Content under an ignored directory never reaches the database.
#[apply(stores)]
fn remove_ignored_directory(store: ResourceStore) {
    let sample = store.write("temp/sample.png", b"png").unwrap();
    assert!(sample.is_filesystem_only());
    assert!(sample.exists());

    assert!(store.remove("temp").unwrap());
    assert_eq!(
        ResourceType::Undefined,
        store.get("temp/sample.png").unwrap().kind()
    );

    let records = store.records();
    assert!(!records.find_by_path(&"temp".parse().unwrap()).unwrap().exists());
    assert!(!records
        .find_by_path(&"temp/sample.png".parse().unwrap())
        .unwrap()
        .exists());
}

#[apply(stores)]
fn remove_directory(store: ResourceStore) {
    let roads = store.write("workspaces/ws1/layers/roads.xml", b"").unwrap();
    let workspace = store.write("workspaces/ws1/workspace.xml", b"").unwrap();
    let other = store.write("workspaces/ws10/workspace.xml", b"").unwrap();
    let mirrors = [&roads, &workspace, &other].map(|r| store.cache().mirror_path(id(r)));
    assert!(mirrors.iter().all(|mirror| mirror.is_file()));

    assert!(store.remove("workspaces/ws1").unwrap());
    // mirrors of rows removed through their ancestors are dropped too
    assert!(!mirrors[0].exists());
    assert!(!mirrors[1].exists());
    assert!(mirrors[2].is_file());
    for path in [
        "workspaces/ws1",
        "workspaces/ws1/layers",
        "workspaces/ws1/layers/roads.xml",
        "workspaces/ws1/workspace.xml",
    ] {
        assert_eq!(ResourceType::Undefined, store.get(path).unwrap().kind());
    }
    assert!(store.get("workspaces/ws10/workspace.xml").unwrap().exists());

    assert!(!store.remove("workspaces/ws1").unwrap());
}

/// Replacing a directory by a rename drops the mirrors of everything below it.
#[apply(stores)]
fn move_replaces_target_subtree(store: ResourceStore) {
    let old = store.write("styles/old/nested/point.sld", b"<old/>").unwrap();
    store.write("staging/point.sld", b"<new/>").unwrap();
    let mirror = store.cache().mirror_path(id(&old));
    assert!(mirror.is_file());

    assert!(store.rename("staging", "styles/old").unwrap());
    assert!(!mirror.exists());
    assert_eq!(b"<new/>".to_vec(), store.read("styles/old/point.sld").unwrap());
    assert!(!store.get("styles/old/nested").unwrap().exists());
}

#[apply(stores)]
fn delete_through_handle(store: ResourceStore) {
    let file = store.write("global.xml", b"<global/>").unwrap();
    assert!(file.delete().unwrap());
    // no need to wait, the handle saw its own change
    assert_eq!(ResourceType::Undefined, file.kind());
    assert!(!file.delete().unwrap());
}

#[apply(stores)]
fn type_conflicts(store: ResourceStore) {
    store.write("a/file", b"x").unwrap();
    store.mkdirs("d").unwrap();

    assert!(matches!(
        store.write("a/file/b", b"y"),
        Err(Error::TypeConflict { .. })
    ));
    assert!(matches!(
        store.mkdirs("a/file"),
        Err(Error::TypeConflict { .. })
    ));
    assert!(matches!(
        store.write("d", b"y"),
        Err(Error::TypeConflict { .. })
    ));
    assert!(matches!(store.read("d"), Err(Error::TypeConflict { .. })));
    assert!(matches!(
        store.read("missing"),
        Err(Error::InvalidRequest(_))
    ));

    // nothing was changed by the failed calls
    assert_eq!(b"x".to_vec(), store.read("a/file").unwrap());
    assert!(!store.get("a/file/b").unwrap().exists());
}

/// Content survives the staleness window and a refresh.
#[apply(stores)]
fn write_read_roundtrip(store: ResourceStore) {
    let content = b"<security><filter/></security>".to_vec();
    let resource = store.write("security/config.xml", &content).unwrap();
    assert_eq!(content, resource.read().unwrap());

    let_handles_go_stale();
    assert_eq!(ResourceType::Resource, resource.kind());
    assert_eq!(content, resource.read().unwrap());
    assert_eq!(content, store.read("security/config.xml").unwrap());
}

#[apply(stores)]
fn writes_advance_last_modified(store: ResourceStore) {
    let resource = store.write("global.xml", b"one").unwrap();
    let first = resource.last_modified();

    resource.write(b"two").unwrap();
    assert!(resource.last_modified() > first);
    assert_eq!(b"two".to_vec(), resource.read().unwrap());
}

/// Reads fall back to the database when the mirror is gone, and restore it.
#[apply(stores)]
fn mirror_is_repopulated(store: ResourceStore) {
    let resource = store.write("styles/line.sld", b"<line/>").unwrap();
    let mirror = store.cache().mirror_path(id(&resource));
    assert!(mirror.is_file());

    std::fs::remove_file(&mirror).unwrap();
    assert_eq!(b"<line/>".to_vec(), resource.read().unwrap());
    assert!(mirror.is_file());

    assert_eq!(mirror, resource.file().unwrap());
}

#[apply(stores)]
fn list_is_ordered(store: ResourceStore) {
    store.write("styles/c.sld", b"").unwrap();
    store.write("styles/a.sld", b"").unwrap();
    store.mkdirs("styles/b").unwrap();

    let names: Vec<String> = store
        .list("styles")
        .unwrap()
        .iter()
        .map(|r| r.name().to_owned())
        .collect();
    assert_eq!(vec!["a.sld", "b", "c.sld"], names);

    // files have no children
    assert!(store.list("styles/a.sld").unwrap().is_empty());
}

/// The root lists local-only directories next to the database ones, rows a
/// former deployment left below ignored directories stay hidden.
#[apply(stores)]
fn root_listing(store: ResourceStore) {
    store.mkdirs("workspaces").unwrap();
    store.mkdirs("styles").unwrap();
    store.write("logs/geoserver.log", b"started").unwrap();
    store
        .records()
        .upsert_resource(&"data/legacy.png".parse().unwrap(), b"old")
        .unwrap();

    let listed: Vec<(String, bool)> = store
        .list("")
        .unwrap()
        .iter()
        .map(|r| (r.path().to_string(), r.is_filesystem_only()))
        .collect();
    assert_eq!(
        vec![
            ("logs".to_string(), true),
            ("styles".to_string(), false),
            ("workspaces".to_string(), false),
        ],
        listed
    );
    assert!(!store.get("data/legacy.png").unwrap().exists());

    assert_eq!(2, store.purge_ignored_rows().unwrap());
    assert_eq!(0, store.purge_ignored_rows().unwrap());
    assert!(store.get("styles").unwrap().exists());
}

#[apply(stores)]
fn initialize_defaults(store: ResourceStore) {
    let defaults: [(&str, &[u8]); 2] = [
        ("styles/default_point.sld", b"<point/>"),
        ("styles/default_line.sld", b"<line/>"),
    ];
    store.write("styles/default_line.sld", b"<custom/>").unwrap();

    let created = store.initialize_defaults("DEFAULT_STYLES", defaults).unwrap();
    assert_eq!(
        vec!["styles/default_point.sld".parse::<ResourcePath>().unwrap()],
        created
    );
    assert_eq!(b"<custom/>".to_vec(), store.read("styles/default_line.sld").unwrap());

    assert!(store
        .initialize_defaults("DEFAULT_STYLES", defaults)
        .unwrap()
        .is_empty());
}

#[apply(stores)]
fn with_lock(store: ResourceStore) {
    assert_eq!(42, store.with_lock("init", || Ok(42)).unwrap());
    assert_eq!(
        Err(Error::Unsupported("nope".into())),
        store.with_lock("init", || Err::<(), _>(Error::Unsupported("nope".into())))
    );
    // released in both cases
    let lock = store.get("styles").unwrap().lock().unwrap();
    assert_eq!("resource:styles", lock.name());
    let other = store.clone();
    thread::spawn(move || other.with_lock("init", || Ok(())))
        .join()
        .unwrap()
        .unwrap();
}

/// Changes to a path can be made while holding its lock.
#[apply(stores)]
fn changes_while_holding_lock(store: ResourceStore) {
    let users = store.get("security/users.xml").unwrap();
    let _lock = users.lock().unwrap();

    users.write(b"<users/>").unwrap();
    assert_eq!(b"<users/>".to_vec(), users.read().unwrap());
    assert!(users.delete().unwrap());

    users.mkdirs().unwrap();
    assert_eq!(ResourceType::Directory, users.kind());
    assert!(store.remove("security/users.xml").unwrap());

    store.write("security/users.xml", b"<users/>").unwrap();
    assert!(users.rename_to("security/users.xml.bak").unwrap());
    assert_eq!(
        b"<users/>".to_vec(),
        store.read("security/users.xml.bak").unwrap()
    );

    let _again = users.lock().unwrap();
    store.dir("security").unwrap();
}

#[apply(stores)]
fn dir_materializes_subtree(store: ResourceStore) {
    store.write("workspaces/ws1/workspace.xml", b"<workspace/>").unwrap();
    store.write("workspaces/ws1/layers/roads.xml", b"<layer/>").unwrap();
    store.mkdirs("workspaces/ws1/empty").unwrap();
    store.write("workspaces/ws10/workspace.xml", b"<other/>").unwrap();

    let dir = store.dir("workspaces/ws1").unwrap();
    assert_eq!(
        store.cache().tree_path(&"workspaces/ws1".parse().unwrap()),
        dir
    );
    assert_eq!(
        b"<workspace/>".to_vec(),
        fs::read(dir.join("workspace.xml")).unwrap()
    );
    assert_eq!(
        b"<layer/>".to_vec(),
        fs::read(dir.join("layers").join("roads.xml")).unwrap()
    );
    assert!(dir.join("empty").is_dir());
    assert!(!store
        .cache()
        .tree_path(&"workspaces/ws10".parse().unwrap())
        .exists());

    // every call starts over from the record table
    store.remove("workspaces/ws1/layers").unwrap();
    store.write("workspaces/ws1/workspace.xml", b"<changed/>").unwrap();
    let dir = store.get("workspaces/ws1").unwrap().dir().unwrap();
    assert!(!dir.join("layers").exists());
    assert_eq!(
        b"<changed/>".to_vec(),
        fs::read(dir.join("workspace.xml")).unwrap()
    );
}

#[apply(stores)]
fn dir_creates_or_conflicts(store: ResourceStore) {
    store.write("global.xml", b"<global/>").unwrap();
    assert!(matches!(
        store.dir("global.xml"),
        Err(Error::TypeConflict { .. })
    ));

    let styles = store.get("styles").unwrap();
    assert!(styles.dir().unwrap().is_dir());
    assert_eq!(ResourceType::Directory, styles.kind());
}

/// The record table stays authoritative when the mirror can't be written.
#[apply(stores)]
fn unwritable_mirror(store: ResourceStore) {
    let resource = store.write("styles/line.sld", b"one").unwrap();
    let shard = store
        .cache()
        .mirror_path(id(&resource))
        .parent()
        .unwrap()
        .to_owned();
    fs::remove_dir_all(&shard).unwrap();
    fs::write(&shard, b"").unwrap();

    resource.write(b"two").unwrap();
    assert_eq!(b"two".to_vec(), resource.read().unwrap());
    assert_eq!(b"two".to_vec(), store.read("styles/line.sld").unwrap());
}

/// A handle whose row was replaced reads whatever the path holds now.
#[apply(stores)]
fn read_after_replacement(store: ResourceStore) {
    let file = store.write("styles/a", b"x").unwrap();
    assert!(store.remove("styles/a").unwrap());
    store.mkdirs("styles/a").unwrap();

    assert!(matches!(file.read(), Err(Error::TypeConflict { .. })));
    assert_eq!(ResourceType::Directory, file.kind());

    let other = store.write("styles/b", b"one").unwrap();
    assert!(store.remove("styles/b").unwrap());
    store.write("styles/b", b"two").unwrap();
    assert_eq!(b"two".to_vec(), other.read().unwrap());
}

/// A handle refreshed by the store sees changes right away.
#[apply(stores)]
fn update_state(store: ResourceStore) {
    let resource = store.get("global.xml").unwrap();
    store.write("global.xml", b"<global/>").unwrap();
    assert_eq!(ResourceType::Undefined, resource.kind());

    let Resource::Database(handle) = &resource else {
        panic!("must be database-backed")
    };
    store.update_state(handle).unwrap();
    assert_eq!(ResourceType::Resource, resource.kind());
}

/// Two instances sharing a database converge once their handles refresh.
#[test]
fn instances_converge() {
    let (a, b, _dir) = make_two_instances();

    let seen_by_b = b.get("workspaces/ws1/workspace.xml").unwrap();
    assert!(!seen_by_b.exists());

    let written = a
        .write("workspaces/ws1/workspace.xml", b"<workspace/>")
        .unwrap();
    let_handles_go_stale();

    assert_eq!(ResourceType::Resource, seen_by_b.kind());
    assert_eq!(written.last_modified(), seen_by_b.last_modified());
    assert_eq!(b"<workspace/>".to_vec(), seen_by_b.read().unwrap());

    // updates too, never served from the outdated mirror of b
    written.write(b"<workspace name=\"ws1\"/>").unwrap();
    let_handles_go_stale();
    assert_eq!(written.last_modified(), seen_by_b.last_modified());
    assert_eq!(b"<workspace name=\"ws1\"/>".to_vec(), seen_by_b.read().unwrap());

    assert!(b.rename("workspaces/ws1", "workspaces/ws2").unwrap());
    let_handles_go_stale();
    assert_eq!(ResourceType::Undefined, written.kind());
    assert_eq!(
        b"<workspace name=\"ws1\"/>".to_vec(),
        a.read("workspaces/ws2/workspace.xml").unwrap()
    );
}

/// Local-only content stays with its instance.
#[test]
fn ignored_paths_are_not_shared() {
    let (a, b, _dir) = make_two_instances();

    a.write("temp/sample.png", b"png").unwrap();
    assert!(!b.get("temp/sample.png").unwrap().exists());
}

/// Concurrent creation of the same directories from two instances yields one
/// row per path.
#[test]
fn concurrent_mkdirs() {
    let (a, b, _dir) = make_two_instances();

    let handles: Vec<_> = [a.clone(), b.clone(), a.clone(), b.clone()]
        .into_iter()
        .map(|store| thread::spawn(move || store.mkdirs("workspaces/ws1/layers").map(|_| ())))
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(1, a.list("").unwrap().len());
    assert_eq!(1, b.list("workspaces").unwrap().len());
    assert_eq!(1, a.list("workspaces/ws1").unwrap().len());
}

/// Only one of several instances booting at the same time creates defaults.
#[test]
fn concurrent_initialize_defaults() {
    let (a, b, _dir) = make_two_instances();
    let defaults: [(&'static str, &'static [u8]); 3] = [
        ("styles/point.sld", b"<point/>"),
        ("styles/line.sld", b"<line/>"),
        ("styles/polygon.sld", b"<polygon/>"),
    ];

    let handles: Vec<_> = [a.clone(), b.clone()]
        .into_iter()
        .map(|store| thread::spawn(move || store.initialize_defaults("DEFAULT_STYLES", defaults)))
        .collect();
    let created: usize = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap().len())
        .sum();

    assert_eq!(3, created);
    assert_eq!(3, a.list("styles").unwrap().len());
}

#[test]
fn custom_ignored_directories() {
    let store = ResourceStore::new(
        RecordTable::new(Arc::new(Database::open_in_memory().unwrap())),
        Arc::new(MemoryLockProvider::default()),
        FileSystemCache::new_temporary().unwrap(),
        IgnoredPaths::new(["scratch"]).unwrap(),
        REFRESH_INTERVAL,
    );

    assert!(store.get("scratch/x").unwrap().is_filesystem_only());
    assert!(!store.get("temp/x").unwrap().is_filesystem_only());
}
