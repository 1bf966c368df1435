//! End-to-end reconciliation scenarios against the SQLite store and the
//! in-memory data source.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use retcon::metrics::Metrics;
use retcon::model::{
    ChangeNotification, Document, DocumentPath, EntityName, MergePolicy, SourceName, WorkItem,
};
use retcon::source::{DataSource, MemorySource, SourceRegistry};
use retcon::store::{SqliteStore, Store, StoreHandle};
use retcon::worker::{LockKey, LockTable, Reconciler, WorkerConfig, WorkerError, WorkerPool};

const SOURCE_TIMEOUT: Duration = Duration::from_millis(300);

fn entity() -> EntityName {
    EntityName::new("customer").expect("entity name")
}

fn source(name: &str) -> SourceName {
    SourceName::new(name).expect("source name")
}

fn doc(pairs: &[(&str, &str)]) -> Document {
    let mut out = Document::new();
    for (path, value) in pairs {
        out.insert(
            DocumentPath::new([*path]).expect("path"),
            (*value).to_string(),
        );
    }
    out
}

struct Rig {
    _dir: tempfile::TempDir,
    store: Arc<dyn Store>,
    db1: Arc<MemorySource>,
    db2: Arc<MemorySource>,
    config: WorkerConfig,
}

impl Rig {
    fn new(policy: MergePolicy) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&dir.path().join("retcon.sqlite")).expect("open store"),
        );
        let db1 = Arc::new(MemorySource::new());
        let db2 = Arc::new(MemorySource::new());

        let mut registry = SourceRegistry::new(SOURCE_TIMEOUT);
        registry.register(
            entity(),
            source("db1"),
            Arc::clone(&db1) as Arc<dyn DataSource>,
        );
        registry.register(
            entity(),
            source("db2"),
            Arc::clone(&db2) as Arc<dyn DataSource>,
        );

        let config = WorkerConfig {
            registry: Arc::new(registry),
            policy,
            locks: LockTable::new(),
            metrics: Metrics::new(),
            reconcile_timeout: Duration::from_secs(5),
            retry_cap: 3,
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        Self {
            _dir: dir,
            store,
            db1,
            db2,
            config,
        }
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.handle().expect("store handle"), self.config.clone())
    }

    fn handle(&self) -> Box<dyn StoreHandle> {
        self.store.handle().expect("store handle")
    }

    fn notification(&self, source_name: &str, foreign_id: &str) -> WorkItem {
        WorkItem::Process(ChangeNotification {
            entity: entity(),
            source: source(source_name),
            foreign_id: foreign_id.to_string(),
        })
    }

    /// Foreign id the given source holds for the (sole) internal key.
    fn foreign_id(&self, source_name: &str) -> String {
        let mut store = self.handle();
        let key = store
            .lookup_internal(
                &ChangeNotification {
                    entity: entity(),
                    source: source("db1"),
                    foreign_id: "1".to_string(),
                }
                .foreign_key(),
            )
            .expect("lookup")
            .expect("internal key");
        store
            .lookup_foreign(&key, &source(source_name))
            .expect("lookup")
            .expect("foreign key")
            .id
    }

    /// Seed db1 with one document and run the create cycle.
    fn bootstrap(&self, initial: Document) {
        self.db1.insert("1", initial);
        self.reconciler()
            .run(&self.notification("db1", "1"))
            .expect("create cycle");
    }
}

#[test]
fn unknown_key_creates_everywhere() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    let alice = doc(&[("name", "Alice")]);
    rig.db1.insert("1", alice.clone());

    rig.reconciler()
        .run(&rig.notification("db1", "1"))
        .expect("process");

    // db2 received an identical copy under a freshly allocated id.
    assert_eq!(rig.db2.len(), 1);
    let db2_id = rig.foreign_id("db2");
    assert_eq!(rig.db2.document(&db2_id), Some(alice.clone()));

    let mut store = rig.handle();
    let key = store
        .lookup_internal(&ChangeNotification {
            entity: entity(),
            source: source("db1"),
            foreign_id: "1".to_string(),
        }
        .foreign_key())
        .expect("lookup")
        .expect("internal key");
    assert_eq!(store.get_initial(&key).expect("initial"), Some(alice));
    assert!(store.lookup_foreign(&key, &source("db1")).expect("fk").is_some());
    assert!(store.lookup_foreign(&key, &source("db2")).expect("fk").is_some());

    assert_eq!(
        rig.config.metrics.counter("entity.customer.creates").get(),
        1
    );
}

#[test]
fn non_conflicting_update_propagates() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.bootstrap(doc(&[("name", "Alice"), ("city", "A")]));

    rig.db1.insert("1", doc(&[("name", "Alice"), ("city", "B")]));
    let db2_id = rig.foreign_id("db2");
    rig.db2
        .insert(db2_id.clone(), doc(&[("name", "Alice"), ("city", "A"), ("age", "30")]));

    rig.reconciler()
        .run(&rig.notification("db1", "1"))
        .expect("update");

    let converged = doc(&[("name", "Alice"), ("city", "B"), ("age", "30")]);
    assert_eq!(rig.db1.document("1"), Some(converged.clone()));
    assert_eq!(rig.db2.document(&db2_id), Some(converged.clone()));

    let mut store = rig.handle();
    assert!(store.list_conflicts().expect("conflicts").is_empty());
    assert_eq!(
        rig.config.metrics.counter("entity.customer.updates").get(),
        1
    );
}

#[test]
fn conflicting_update_parks_and_leaves_sources_alone() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.bootstrap(doc(&[("x", "0")]));

    let db2_id = rig.foreign_id("db2");
    rig.db1.insert("1", doc(&[("x", "1")]));
    rig.db2.insert(db2_id.clone(), doc(&[("x", "2")]));

    rig.reconciler()
        .run(&rig.notification("db1", "1"))
        .expect("update");

    // Sources untouched, one parked conflict with two rejected ops.
    assert_eq!(rig.db1.document("1"), Some(doc(&[("x", "1")])));
    assert_eq!(rig.db2.document(&db2_id), Some(doc(&[("x", "2")])));

    let mut store = rig.handle();
    let conflicts = store.list_conflicts().expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].diff.is_empty());
    assert_eq!(conflicts[0].conflicts.len(), 2);
    assert_eq!(conflicts[0].initial, doc(&[("x", "0")]));
    assert_eq!(
        rig.config
            .metrics
            .counter("entity.customer.conflicts")
            .get(),
        1
    );
}

#[test]
fn resolution_applies_selected_ops_everywhere() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.bootstrap(doc(&[("x", "0")]));

    let db2_id = rig.foreign_id("db2");
    rig.db1.insert("1", doc(&[("x", "1")]));
    rig.db2.insert(db2_id.clone(), doc(&[("x", "2")]));
    rig.reconciler()
        .run(&rig.notification("db1", "1"))
        .expect("update");

    let mut store = rig.handle();
    let record = store.list_conflicts().expect("conflicts").remove(0);
    let (op_id, _) = record
        .conflicts
        .iter()
        .find(|(_, op)| matches!(op, retcon::model::DiffOp::Insert { value, .. } if value == "1"))
        .expect("db1 op")
        .clone();

    let resolution = store.resolve_ops(record.diff_id, &[op_id]).expect("resolve");
    rig.reconciler()
        .run(&WorkItem::Apply {
            diff_id: record.diff_id,
            diff: resolution,
            accepted: vec![op_id],
        })
        .expect("apply");

    assert_eq!(rig.db1.document("1"), Some(doc(&[("x", "1")])));
    assert_eq!(rig.db2.document(&db2_id), Some(doc(&[("x", "1")])));
    assert!(store.list_conflicts().expect("conflicts").is_empty());

    let key = record.key;
    assert_eq!(
        store.get_initial(&key).expect("initial"),
        Some(doc(&[("x", "1")]))
    );
}

#[test]
fn vanished_copy_deletes_everywhere() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.bootstrap(doc(&[("name", "Alice")]));
    let db2_id = rig.foreign_id("db2");

    rig.db1.remove("1");
    rig.reconciler()
        .run(&rig.notification("db1", "1"))
        .expect("process");

    assert_eq!(rig.db2.document(&db2_id), None);
    let mut store = rig.handle();
    assert!(store
        .lookup_internal(
            &ChangeNotification {
                entity: entity(),
                source: source("db1"),
                foreign_id: "1".to_string(),
            }
            .foreign_key()
        )
        .expect("lookup")
        .is_none());
    assert_eq!(
        rig.config.metrics.counter("entity.customer.deletes").get(),
        1
    );
}

#[test]
fn timed_out_set_abandons_then_succeeds_with_one_update_metric() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.bootstrap(doc(&[("city", "A")]));
    let db2_id = rig.foreign_id("db2");

    rig.db1.insert("1", doc(&[("city", "B")]));
    rig.db2.delay_next_set(SOURCE_TIMEOUT * 4);

    let mut store = rig.handle();
    store.enqueue(&rig.notification("db1", "1")).expect("enqueue");

    let wait = Duration::from_millis(200);
    let lease = Duration::from_secs(30);
    let leased = store.dequeue(wait, lease).expect("dequeue").expect("item");
    let err = rig
        .reconciler()
        .run(&leased.item)
        .expect_err("db2 set should time out");
    assert!(matches!(err, WorkerError::Source(_)));
    store
        .abandon(&leased.lease, &err.to_string(), rig.config.retry_cap)
        .expect("abandon");

    // Redelivered after the abandon; this attempt completes.
    let leased = store.dequeue(wait, lease).expect("dequeue").expect("item");
    rig.reconciler().run(&leased.item).expect("retry succeeds");
    store.complete(&leased.lease).expect("complete");

    assert_eq!(rig.db2.document(&db2_id), Some(doc(&[("city", "B")])));
    assert_eq!(
        rig.config.metrics.counter("entity.customer.updates").get(),
        1
    );
}

#[test]
fn held_lock_makes_the_item_abandon() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.bootstrap(doc(&[("x", "0")]));

    let mut store = rig.handle();
    let key = store
        .lookup_internal(
            &ChangeNotification {
                entity: entity(),
                source: source("db1"),
                foreign_id: "1".to_string(),
            }
            .foreign_key(),
        )
        .expect("lookup")
        .expect("internal key");

    let _guard = rig
        .config
        .locks
        .try_acquire(LockKey::Internal(key))
        .expect("acquire");

    let err = rig
        .reconciler()
        .run(&rig.notification("db1", "1"))
        .expect_err("lock is held");
    assert!(matches!(err, WorkerError::LockBusy));
}

#[test]
fn trust_source_resolves_conflicts_in_its_favour() {
    let rig = Rig::new(MergePolicy::TrustSource(source("db2")));
    rig.bootstrap(doc(&[("x", "0")]));

    let db2_id = rig.foreign_id("db2");
    rig.db1.insert("1", doc(&[("x", "1")]));
    rig.db2.insert(db2_id.clone(), doc(&[("x", "2")]));

    rig.reconciler()
        .run(&rig.notification("db1", "1"))
        .expect("update");

    // db2 wins the conflicted path, but db1's refused op is still parked.
    assert_eq!(rig.db1.document("1"), Some(doc(&[("x", "1")])));
    let mut store = rig.handle();
    let conflicts = store.list_conflicts().expect("conflicts");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflicts.len(), 1);
    assert_eq!(conflicts[0].diff.ops.len(), 1);
}

#[test]
fn worker_pool_drains_the_queue() {
    let rig = Rig::new(MergePolicy::IgnoreConflicts);
    rig.db1.insert("1", doc(&[("name", "Alice")]));

    let mut store = rig.handle();
    // Two notifications for the same copy: create, then a no-op update.
    store.enqueue(&rig.notification("db1", "1")).expect("enqueue");
    store.enqueue(&rig.notification("db1", "1")).expect("enqueue");

    let pool = WorkerPool::spawn(Arc::clone(&rig.store), rig.config.clone(), 4);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let depth = store.queue_depth().expect("depth");
        let leased_out = depth == 0 && rig.db2.len() == 1;
        if leased_out || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    rig.config
        .shutdown
        .store(true, std::sync::atomic::Ordering::Relaxed);
    pool.join();

    assert_eq!(rig.db2.len(), 1);
    assert_eq!(
        rig.config.metrics.counter("entity.customer.creates").get(),
        1
    );
    assert!(store.dead_letters().expect("dead letters").is_empty());
}
