use chrono::Utc;
use recordchain::ledger::{LedgerService, NewBlock, GENESIS_PREVIOUS_HASH};
use recordchain::store::Database;
use tempfile::TempDir;
use uuid::Uuid;

async fn ledger_in(dir: &TempDir) -> (Database, LedgerService) {
    let db_path = dir.path().join("ledger.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let database = Database::new(&url).await.unwrap();
    database.run_migrations().await.unwrap();
    let ledger = LedgerService::new(database.clone(), b"ledger-test-secret".as_slice());
    (database, ledger)
}

fn new_block(entity_id: Uuid, payload: &str, modified_by: &str) -> NewBlock {
    NewBlock {
        compressed_data: payload.to_string(),
        entity_type: "PatientRecord".to_string(),
        entity_id,
        modified_by: modified_by.to_string(),
        version: Utc::now().timestamp_micros().to_be_bytes().to_vec(),
    }
}

#[tokio::test]
async fn test_genesis_block_precedes_first_append() {
    let dir = TempDir::new().unwrap();
    let (_, ledger) = ledger_in(&dir).await;
    let entity_id = Uuid::new_v4();

    let appended = ledger
        .add_block(new_block(entity_id, "snapshot-1", "clerk"))
        .await
        .unwrap();

    let blocks = ledger
        .blocks_for_entity("PatientRecord", entity_id)
        .await
        .unwrap();
    assert_eq!(blocks.len(), 2);

    let genesis = &blocks[0];
    assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
    assert_eq!(genesis.modified_by, "System");
    assert!(genesis.id.unwrap() < appended.id.unwrap());

    assert_eq!(blocks[1].previous_hash, genesis.hash);
    assert_eq!(blocks[1].modified_by, "clerk");
    assert_eq!(blocks[1].hash.len(), 64);
}

#[tokio::test]
async fn test_chains_are_isolated_per_entity() {
    let dir = TempDir::new().unwrap();
    let (_, ledger) = ledger_in(&dir).await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    ledger
        .add_block(new_block(first, "snapshot-a", "clerk"))
        .await
        .unwrap();
    ledger
        .add_block(new_block(second, "snapshot-b", "clerk"))
        .await
        .unwrap();

    let chain_a = ledger.blocks_for_entity("PatientRecord", first).await.unwrap();
    let chain_b = ledger
        .blocks_for_entity("PatientRecord", second)
        .await
        .unwrap();
    assert_eq!(chain_a.len(), 2);
    assert_eq!(chain_b.len(), 2);
    assert_eq!(chain_b[0].previous_hash, GENESIS_PREVIOUS_HASH);
}

#[tokio::test]
async fn test_valid_chain_passes_validation() {
    let dir = TempDir::new().unwrap();
    let (_, ledger) = ledger_in(&dir).await;
    let entity_id = Uuid::new_v4();

    for i in 0..3 {
        ledger
            .add_block(new_block(entity_id, &format!("snapshot-{}", i), "clerk"))
            .await
            .unwrap();
    }

    let result = ledger
        .validate_chain("PatientRecord", entity_id)
        .await
        .unwrap();
    assert!(result.is_valid, "{}", result.message);
    assert_eq!(result.message, "Chain is valid.");
}

#[tokio::test]
async fn test_empty_chain_reports_no_blocks() {
    let dir = TempDir::new().unwrap();
    let (_, ledger) = ledger_in(&dir).await;

    let result = ledger
        .validate_chain("PatientRecord", Uuid::new_v4())
        .await
        .unwrap();
    assert!(!result.is_valid);
    assert!(result.message.contains("No blocks found"));
}

#[tokio::test]
async fn test_tampered_previous_hash_reports_exact_block() {
    let dir = TempDir::new().unwrap();
    let (database, ledger) = ledger_in(&dir).await;
    let entity_id = Uuid::new_v4();

    ledger
        .add_block(new_block(entity_id, "snapshot-1", "clerk"))
        .await
        .unwrap();
    let b2 = ledger
        .add_block(new_block(entity_id, "snapshot-2", "clerk"))
        .await
        .unwrap();

    let blocks = ledger
        .blocks_for_entity("PatientRecord", entity_id)
        .await
        .unwrap();
    let expected_previous = blocks[1].hash.clone();

    // Flip one byte of B2's stored previous hash.
    let mut corrupted = b2.previous_hash.clone().into_bytes();
    corrupted[0] = if corrupted[0] == b'0' { b'1' } else { b'0' };
    sqlx::query("UPDATE ledger_blocks SET previous_hash = ? WHERE id = ?")
        .bind(String::from_utf8(corrupted).unwrap())
        .bind(b2.id.unwrap())
        .execute(database.pool())
        .await
        .unwrap();

    let result = ledger
        .validate_chain("PatientRecord", entity_id)
        .await
        .unwrap();
    assert!(!result.is_valid);
    assert!(result.message.contains("Link consistency failed"));
    assert!(result.message.contains(&format!("{:?}", b2.id)));
    assert!(result.message.contains(&expected_previous));
}

#[tokio::test]
async fn test_tampered_hash_reports_data_integrity_failure() {
    let dir = TempDir::new().unwrap();
    let (database, ledger) = ledger_in(&dir).await;
    let entity_id = Uuid::new_v4();

    ledger
        .add_block(new_block(entity_id, "snapshot-1", "clerk"))
        .await
        .unwrap();
    let last = ledger
        .add_block(new_block(entity_id, "snapshot-2", "clerk"))
        .await
        .unwrap();

    sqlx::query("UPDATE ledger_blocks SET hash = ? WHERE id = ?")
        .bind("f".repeat(64))
        .bind(last.id.unwrap())
        .execute(database.pool())
        .await
        .unwrap();

    let result = ledger
        .validate_chain("PatientRecord", entity_id)
        .await
        .unwrap();
    assert!(!result.is_valid);
    assert!(result.message.contains("Data integrity failed"));
    assert!(result.message.contains(&format!("{:?}", last.id)));
}
