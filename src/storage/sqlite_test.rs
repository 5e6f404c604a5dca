use super::*;
use crate::storage::SqliteStorage;
use chrono::Duration;
use tempfile::TempDir;

fn code(hash: &str) -> AuthorizationCode {
    let now = Utc::now();
    AuthorizationCode {
        code_hash: hash.to_string(),
        client_id: "c1".to_string(),
        user_id: "u1".to_string(),
        scopes: vec!["openid".to_string(), "profile".to_string()],
        redirect_uri: "https://app/cb".to_string(),
        nonce: None,
        auth_time: now,
        claims: Default::default(),
        code_challenge: Some("abc".to_string()),
        code_challenge_method: Some("S256".to_string()),
        created_at: now,
        expires_at: now + Duration::minutes(10),
    }
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested/authority.db");
    let dsn = db_path.to_str().unwrap();

    {
        let storage = SqliteStorage::new(dsn).await.unwrap();
        storage.save_authorization_code(&code("persisted")).await.unwrap();
    }

    let storage = SqliteStorage::new(dsn).await.unwrap();
    let taken = storage
        .take_authorization_code("persisted", "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(taken.scopes, vec!["openid", "profile"]);
    assert_eq!(taken.code_challenge_method.as_deref(), Some("S256"));
}

#[tokio::test]
async fn test_concurrent_take_yields_single_winner() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("race.db");
    let storage = Arc::new(SqliteStorage::new(db_path.to_str().unwrap()).await.unwrap());
    storage.save_authorization_code(&code("race")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.take_authorization_code("race", "c1").await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_rejects_path_traversal() {
    let result = SqliteStorage::new("../outside.db").await;
    assert!(result.is_err());
}
