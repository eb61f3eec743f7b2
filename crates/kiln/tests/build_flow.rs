//! End-to-end build session flows over real tiers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use kiln::{
    BuildNode, BuildSession, CancelToken, LocalCacheTier, QueueConfig, SessionOptions, StoreConfig,
    TableStoreTier,
};
use kiln_remote::{MemoryTableClient, RemoteConfig, TableClient};
use tempfile::TempDir;

/// Surfaces library logs when the test binary runs with `RUST_LOG` set.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn local_tier(store_root: &Path) -> LocalCacheTier {
    LocalCacheTier::open_at(store_root, &StoreConfig::default()).unwrap()
}

fn writer_node(root: &Path, uid: &'static str, contents: &'static str) -> BuildNode {
    let rel = format!("out/{uid}.txt");
    let root = root.to_path_buf();
    let target = rel.clone();
    BuildNode::new(uid).with_output(rel).with_action(move || {
        let path = root.join(&target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(())
    })
}

#[test]
fn diamond_dependents_fire_only_after_both_parents() {
    init_logging();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut session = BuildSession::new(SessionOptions::new("/tmp/kiln-diamond-test"));
    for uid in ["aa", "bb"] {
        let order = Arc::clone(&order);
        session.add_node(BuildNode::new(uid).with_action(move || {
            order.lock().unwrap().push(uid);
            Ok(())
        }));
    }
    let tail = Arc::clone(&order);
    session.add_node(
        BuildNode::new("cc")
            .with_deps(["aa", "bb"])
            .with_action(move || {
                tail.lock().unwrap().push("cc");
                Ok(())
            }),
    );

    let report = session.run().unwrap();
    assert!(report.success());
    assert_eq!(report.completed, ["aa", "bb", "cc"]);

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 3);
    assert_eq!(*order.last().unwrap(), "cc");

    // Replay keeps the same story: the dependent's group completes last.
    assert_eq!(report.completion_order.last().unwrap(), &["cc".to_string()]);
}

#[test]
fn second_session_restores_from_cache_and_skips_actions() {
    init_logging();
    let store = TempDir::new().unwrap();
    let ws1 = TempDir::new().unwrap();

    let mut first = BuildSession::new(SessionOptions::new(ws1.path()));
    first.add_tier(local_tier(store.path()));
    first.add_node(writer_node(ws1.path(), "aa", "from aa"));
    first.add_node(writer_node(ws1.path(), "bb", "from bb"));
    first.add_node(writer_node(ws1.path(), "cc", "from cc").with_deps(["aa", "bb"]));

    let report = first.run().unwrap();
    assert!(report.success());
    assert_eq!(report.misses, 3);
    assert_eq!(report.hits, 0);

    // A fresh workspace over the same store: everything restores, nothing
    // runs.
    let ws2 = TempDir::new().unwrap();
    let ran = Arc::new(AtomicU32::new(0));
    let mut second = BuildSession::new(SessionOptions::new(ws2.path()));
    second.add_tier(local_tier(store.path()));
    for uid in ["aa", "bb"] {
        let ran = Arc::clone(&ran);
        second.add_node(
            BuildNode::new(uid)
                .with_output(format!("out/{uid}.txt"))
                .with_action(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );
    }
    let ran_cc = Arc::clone(&ran);
    second.add_node(
        BuildNode::new("cc")
            .with_deps(["aa", "bb"])
            .with_output("out/cc.txt")
            .with_action(move || {
                ran_cc.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
    );

    let report = second.run().unwrap();
    assert!(report.success());
    assert_eq!(report.hits, 3);
    assert_eq!(report.misses, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    assert_eq!(
        fs::read_to_string(ws2.path().join("out/aa.txt")).unwrap(),
        "from aa"
    );
    assert_eq!(
        fs::read_to_string(ws2.path().join("out/cc.txt")).unwrap(),
        "from cc"
    );
    assert_eq!(report.tier_stats.len(), 1);
    assert_eq!(report.tier_stats[0].tier, "local");
    assert_eq!(report.tier_stats[0].hits, 3);
}

#[test]
fn failed_action_blocks_downstream_but_not_siblings() {
    init_logging();
    let mut session = BuildSession::new(SessionOptions::new("/tmp/kiln-failure-test"));
    session.add_node(BuildNode::new("aa").with_action(|| Ok(())));
    session.add_node(BuildNode::new("bb").with_action(|| Err("toolchain exploded".into())));
    session.add_node(BuildNode::new("cc").with_dep("bb").with_action(|| Ok(())));
    session.add_node(BuildNode::new("dd").with_action(|| Ok(())));

    let report = session.run().unwrap();
    assert!(!report.success());
    assert_eq!(report.completed, ["aa", "dd"]);
    assert_eq!(report.uncompleted, ["bb", "cc"]);
    let error = report.first_error.unwrap();
    assert!(error.contains("bb"), "unexpected error: {error}");
}

#[test]
fn remote_tier_serves_a_workspace_with_a_cold_local_store() {
    init_logging();
    let client = Arc::new(MemoryTableClient::new());
    let store1 = TempDir::new().unwrap();
    let ws1 = TempDir::new().unwrap();

    let mut first = BuildSession::new(SessionOptions::new(ws1.path()));
    first.add_tier(local_tier(store1.path()));
    first.add_tier(TableStoreTier::new(
        Arc::clone(&client) as Arc<dyn TableClient>,
        &RemoteConfig::default(),
        CancelToken::new(),
    ));
    first.add_node(writer_node(ws1.path(), "aa", "hello"));

    let report = first.run().unwrap();
    assert!(report.success());
    assert_eq!(report.misses, 1);
    assert!(!client.is_empty(), "publish should have written table rows");

    // Cold local store, warm remote: the chain falls through and hits.
    let store2 = TempDir::new().unwrap();
    let ws2 = TempDir::new().unwrap();
    let ran = Arc::new(AtomicU32::new(0));
    let mut second = BuildSession::new(SessionOptions::new(ws2.path()));
    second.add_tier(local_tier(store2.path()));
    second.add_tier(TableStoreTier::new(
        Arc::clone(&client) as Arc<dyn TableClient>,
        &RemoteConfig::default(),
        CancelToken::new(),
    ));
    let ran_aa = Arc::clone(&ran);
    second.add_node(
        BuildNode::new("aa")
            .with_output("out/aa.txt")
            .with_action(move || {
                ran_aa.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
    );

    let report = second.run().unwrap();
    assert!(report.success());
    assert_eq!(report.hits, 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(
        fs::read_to_string(ws2.path().join("out/aa.txt")).unwrap(),
        "hello"
    );
}

#[test]
fn cancellation_abandons_pending_work() {
    init_logging();
    let ran_bb = Arc::new(AtomicU32::new(0));
    let mut session = BuildSession::new(
        SessionOptions::new("/tmp/kiln-cancel-test").with_queue(QueueConfig {
            workers: 1,
            cap: BTreeMap::new(),
        }),
    );
    let token = session.cancel_token();
    session.add_node(BuildNode::new("aa").with_action(move || {
        token.cancel();
        Ok(())
    }));
    let ran = Arc::clone(&ran_bb);
    session.add_node(BuildNode::new("bb").with_action(move || {
        ran.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let report = session.run().unwrap();
    assert!(!report.success());
    assert!(report.first_error.is_some());
    assert_eq!(report.uncompleted, ["bb"]);
    assert!(report.completed.contains(&"aa".to_string()));
    assert_eq!(ran_bb.load(Ordering::SeqCst), 0);
}
