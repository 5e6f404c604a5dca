use super::*;
use crate::storage::MemoryStorage;
use chrono::Duration;

fn code(hash: &str) -> AuthorizationCode {
    let now = Utc::now();
    AuthorizationCode {
        code_hash: hash.to_string(),
        client_id: "c1".to_string(),
        user_id: "u1".to_string(),
        scopes: vec!["openid".to_string()],
        redirect_uri: "https://app/cb".to_string(),
        nonce: None,
        auth_time: now,
        claims: Default::default(),
        code_challenge: None,
        code_challenge_method: None,
        created_at: now,
        expires_at: now + Duration::minutes(10),
    }
}

#[tokio::test]
async fn test_concurrent_take_yields_single_winner() {
    let storage = Arc::new(MemoryStorage::new());
    storage.save_authorization_code(&code("h")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage.take_authorization_code("h", "c1").await.unwrap()
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
async fn test_clone_shares_state() {
    let storage = MemoryStorage::new();
    let clone = storage.clone();
    storage.save_authorization_code(&code("shared")).await.unwrap();
    assert!(clone.take_authorization_code("shared", "c1").await.unwrap().is_some());
}
