use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

use recordchain::audit::{AuditEventLog, AuditTrail, EntityRegistry, EntityStore};
use recordchain::crypto::{KeyPoolManager, KeyStorage, SignatureEngine};
use recordchain::error::AuditError;
use recordchain::ledger::LedgerService;
use recordchain::store::Database;

const TEST_POOL: usize = 64;
const ENTITY_TYPE: &str = "PatientRecord";

/// Stand-in for the external record store.
#[derive(Default)]
struct MemoryStore {
    records: Mutex<HashMap<Uuid, Value>>,
}

impl MemoryStore {
    fn put(&self, id: Uuid, value: Value) {
        self.records.lock().insert(id, value);
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn fetch_current(&self, entity_id: Uuid) -> Result<Option<Value>, AuditError> {
        Ok(self.records.lock().get(&entity_id).cloned())
    }
}

struct Harness {
    trail: AuditTrail,
    ledger: Arc<LedgerService>,
    engine: Arc<SignatureEngine>,
    event_log: Arc<AuditEventLog>,
    store: Arc<MemoryStore>,
}

async fn harness_in(dir: &TempDir) -> Harness {
    let passphrase = dir.path().join("passphrase.txt");
    std::fs::write(&passphrase, "integration test passphrase").unwrap();
    let storage =
        Arc::new(KeyStorage::new("e2e-test-secret", passphrase, dir.path().join("keys")).unwrap());
    storage.bootstrap_seeds(4).unwrap();

    let pool = Arc::new(
        KeyPoolManager::initialize(storage.clone(), TEST_POOL, Duration::from_secs(2 * 60 * 60))
            .unwrap(),
    );
    let engine = Arc::new(SignatureEngine::new(pool, storage));

    let db_path = dir.path().join("audit.db");
    let database = Database::new(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await
        .unwrap();
    database.run_migrations().await.unwrap();
    let ledger = Arc::new(LedgerService::new(
        database,
        b"e2e-ledger-secret".as_slice(),
    ));

    let event_log = Arc::new(AuditEventLog::new(dir.path().join("audit.log")).unwrap());

    let store = Arc::new(MemoryStore::default());
    let mut registry = EntityRegistry::new();
    registry.register(ENTITY_TYPE, store.clone());

    Harness {
        trail: AuditTrail::new(ledger.clone(), engine.clone(), event_log.clone(), registry),
        ledger,
        engine,
        event_log,
        store,
    }
}

#[tokio::test]
async fn test_record_change_builds_verifiable_chain() {
    let dir = TempDir::new().unwrap();
    let harness = harness_in(&dir).await;
    let entity_id = Uuid::new_v4();

    harness.store.put(entity_id, json!({"name": "A", "age": 30}));
    let first = harness
        .trail
        .record_change(ENTITY_TYPE, entity_id, "clerk")
        .await
        .unwrap();

    // The embedded snapshot verifies against its pinned pool snapshot.
    assert!(harness.engine.verify(
        &first.signed.payload,
        &first.signed.signature,
        &first.signed.snapshot_version
    ));

    harness.store.put(entity_id, json!({"name": "B", "age": 30}));
    harness
        .trail
        .record_change(ENTITY_TYPE, entity_id, "clerk")
        .await
        .unwrap();

    let validation = harness
        .ledger
        .validate_chain(ENTITY_TYPE, entity_id)
        .await
        .unwrap();
    assert!(validation.is_valid, "{}", validation.message);

    let lines = harness.event_log.read_lines().unwrap();
    assert_eq!(lines.len(), 2);
    assert!(harness.event_log.validate(lines.iter().map(String::as_str)));
}

#[tokio::test]
async fn test_history_carries_change_records() {
    let dir = TempDir::new().unwrap();
    let harness = harness_in(&dir).await;
    let entity_id = Uuid::new_v4();

    harness.store.put(entity_id, json!({"name": "A", "age": 30}));
    harness
        .trail
        .record_change(ENTITY_TYPE, entity_id, "clerk")
        .await
        .unwrap();

    harness.store.put(entity_id, json!({"name": "B", "age": 30}));
    harness
        .trail
        .record_change(ENTITY_TYPE, entity_id, "registrar")
        .await
        .unwrap();

    let history = harness
        .trail
        .entity_history(ENTITY_TYPE, entity_id)
        .await
        .unwrap();

    // Genesis plus two appends.
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].action, "Created");
    assert_eq!(history[0].modified_by, "System");
    assert_eq!(history[2].action, "Updated");
    assert_eq!(history[2].modified_by, "registrar");
    assert_eq!(history[2].changes, "name: 'A' → 'B'");
    assert!(history[2].serialized_snapshot.contains("\"B\""));
}

#[tokio::test]
async fn test_changes_since_compares_against_live_state() {
    let dir = TempDir::new().unwrap();
    let harness = harness_in(&dir).await;
    let entity_id = Uuid::new_v4();

    harness.store.put(entity_id, json!({"name": "A", "age": 30}));
    let first = harness
        .trail
        .record_change(ENTITY_TYPE, entity_id, "clerk")
        .await
        .unwrap();

    harness
        .store
        .put(entity_id, json!({"name": "A", "age": 31}));
    let drift = harness.trail.changes_since(&first.block).await.unwrap();
    assert_eq!(drift, "age: 30 → 31");

    harness.store.records.lock().remove(&entity_id);
    let gone = harness.trail.changes_since(&first.block).await.unwrap();
    assert!(gone.contains("no longer exists"));
}

#[tokio::test]
async fn test_unregistered_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    let harness = harness_in(&dir).await;

    match harness
        .trail
        .record_change("UnknownType", Uuid::new_v4(), "clerk")
        .await
    {
        Err(AuditError::ValidationError(msg)) => assert!(msg.contains("not registered")),
        other => panic!("Expected validation error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_missing_entity_is_rejected() {
    let dir = TempDir::new().unwrap();
    let harness = harness_in(&dir).await;

    match harness
        .trail
        .record_change(ENTITY_TYPE, Uuid::new_v4(), "clerk")
        .await
    {
        Err(AuditError::ValidationError(msg)) => assert!(msg.contains("not found")),
        other => panic!("Expected validation error, got {:?}", other.map(|_| ())),
    }
}
