// REST secret store against a mock PostgREST service.

use chrono::{TimeZone, Utc};
use mockito::{Matcher, Server};
use serde_json::json;
use tokenvault::credentials::{
    CredentialRecord, EncryptedSecret, RecordUpdate, RestSecretStore, RestStoreConfig, Scope,
    ScopeKey, SecretStore, StoreError,
};

const TABLE_PATH: &str = "/rest/v1/user_credentials";

fn store_for(url: &str) -> RestSecretStore {
    RestSecretStore::new(&RestStoreConfig {
        url: url.to_string(),
        service_key: Some("service-key".to_string()),
        table: "user_credentials".to_string(),
        request_timeout_seconds: 5,
    })
    .expect("Failed to build REST store")
}

fn key_query(user_id: &str, scope: &str) -> Vec<Matcher> {
    vec![
        Matcher::UrlEncoded("user_id".into(), format!("eq.{}", user_id)),
        Matcher::UrlEncoded("scope".into(), format!("eq.{}", scope)),
    ]
}

#[tokio::test]
async fn test_get_record_parses_row() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", TABLE_PATH)
        .match_query(Matcher::AllOf(key_query("U", "agent:calendar")))
        .match_header("apikey", "service-key")
        .match_header("authorization", "Bearer service-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([{
                "user_id": "U",
                "scope": "agent:calendar",
                "access_token": "aa:bb:cc",
                "refresh_token": "dd:ee:ff",
                "expires_at": "2026-03-01T12:00:00+00:00",
                "token_type": "Bearer",
                "provider_endpoint": "https://mcp.example.com/mcp"
            }])
            .to_string(),
        )
        .create_async()
        .await;

    let store = store_for(&server.url());
    let record = store
        .get_record(&ScopeKey::agent("U", "calendar"))
        .await
        .unwrap()
        .expect("record present");

    assert_eq!(record.access_token.as_str(), "aa:bb:cc");
    assert_eq!(record.refresh_token.as_str(), "dd:ee:ff");
    assert_eq!(
        record.expires_at,
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    );
    assert_eq!(record.provider_endpoint, "https://mcp.example.com/mcp");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_get_record_empty_result_is_none() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", TABLE_PATH)
        .match_query(Matcher::AllOf(key_query("U", "global")))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;

    let store = store_for(&server.url());
    assert!(store.get_record(&ScopeKey::global("U")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_record_naive_expiry_is_corrupt() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", TABLE_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([{
                "access_token": "a",
                "refresh_token": "r",
                "expires_at": "2026-03-01 12:00:00",
                "provider_endpoint": "https://api.example.com"
            }])
            .to_string(),
        )
        .create_async()
        .await;

    let store = store_for(&server.url());
    assert!(matches!(
        store.get_record(&ScopeKey::global("U")).await,
        Err(StoreError::Corrupt(_))
    ));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", TABLE_PATH)
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("internal error")
        .create_async()
        .await;

    let store = store_for(&server.url());
    assert!(matches!(
        store.get_record(&ScopeKey::global("U")).await,
        Err(StoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_unauthorized_is_unavailable() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", TABLE_PATH)
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(r#"{"message":"Invalid API key"}"#)
        .create_async()
        .await;

    let store = store_for(&server.url());
    assert!(matches!(
        store.list_scopes("U").await,
        Err(StoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_unreachable_service_is_unavailable() {
    let store = store_for("http://127.0.0.1:1");
    assert!(matches!(
        store.get_record(&ScopeKey::global("U")).await,
        Err(StoreError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_compare_and_update_filters_on_refresh_token() {
    let mut server = Server::new_async().await;
    let mut query = key_query("U", "global");
    query.push(Matcher::UrlEncoded(
        "refresh_token".into(),
        "eq.11:22:33".into(),
    ));

    let won = server
        .mock("PATCH", TABLE_PATH)
        .match_query(Matcher::AllOf(query))
        .match_header("prefer", "return=representation")
        .match_body(Matcher::PartialJson(json!({
            "access_token": "44:55:66",
            "refresh_token": "77:88:99"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"user_id":"U","scope":"global"}]"#)
        .expect(1)
        .create_async()
        .await;

    let store = store_for(&server.url());
    let update = RecordUpdate {
        access_token: Some(EncryptedSecret::from_stored("44:55:66")),
        refresh_token: Some(EncryptedSecret::from_stored("77:88:99")),
        expires_at: Some(Utc::now()),
        token_type: None,
    };

    let committed = store
        .compare_and_update(
            &ScopeKey::global("U"),
            &EncryptedSecret::from_stored("11:22:33"),
            &update,
        )
        .await
        .unwrap();
    assert!(committed);
    won.assert_async().await;
}

#[tokio::test]
async fn test_compare_and_update_no_rows_is_lost() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("PATCH", TABLE_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;

    let store = store_for(&server.url());
    let committed = store
        .compare_and_update(
            &ScopeKey::global("U"),
            &EncryptedSecret::from_stored("stale"),
            &RecordUpdate {
                access_token: Some(EncryptedSecret::from_stored("new")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!committed);
}

#[tokio::test]
async fn test_update_missing_row_is_record_missing() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("PATCH", TABLE_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create_async()
        .await;

    let store = store_for(&server.url());
    let result = store
        .update_record(
            &ScopeKey::agent("U", "drive"),
            &RecordUpdate {
                token_type: Some("Bearer".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(StoreError::RecordMissing(_))));
}

#[tokio::test]
async fn test_put_record_upserts_on_scope_key() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", TABLE_PATH)
        .match_query(Matcher::UrlEncoded(
            "on_conflict".into(),
            "user_id,scope".into(),
        ))
        .match_header(
            "prefer",
            Matcher::Regex("resolution=merge-duplicates".to_string()),
        )
        .match_body(Matcher::PartialJson(json!({
            "user_id": "U",
            "scope": "agent:calendar",
            "access_token": "a1:a2:a3",
            "refresh_token": "r1:r2:r3",
            "token_type": "Bearer",
            "provider_endpoint": "https://mcp.example.com"
        })))
        .with_status(201)
        .create_async()
        .await;

    let store = store_for(&server.url());
    store
        .put_record(
            &ScopeKey::agent("U", "calendar"),
            &CredentialRecord {
                access_token: EncryptedSecret::from_stored("a1:a2:a3"),
                refresh_token: EncryptedSecret::from_stored("r1:r2:r3"),
                expires_at: Utc::now(),
                token_type: "Bearer".to_string(),
                provider_endpoint: "https://mcp.example.com".to_string(),
            },
        )
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_delete_and_list_scopes() {
    let mut server = Server::new_async().await;
    let _delete = server
        .mock("DELETE", TABLE_PATH)
        .match_query(Matcher::AllOf(key_query("U", "global")))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"user_id":"U","scope":"global"}]"#)
        .create_async()
        .await;
    let _list = server
        .mock("GET", TABLE_PATH)
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("user_id".into(), "eq.U".into()),
            Matcher::UrlEncoded("select".into(), "scope".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"scope":"agent:calendar"},{"scope":"agent:drive"}]"#)
        .create_async()
        .await;

    let store = store_for(&server.url());
    assert!(store.delete_record(&ScopeKey::global("U")).await.unwrap());
    assert_eq!(
        store.list_scopes("U").await.unwrap(),
        vec![
            Scope::Agent("calendar".to_string()),
            Scope::Agent("drive".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_empty_user_id_rejected_without_request() {
    let store = store_for("http://127.0.0.1:1");
    assert!(matches!(
        store.get_record(&ScopeKey::global("")).await,
        Err(StoreError::InvalidKey(_))
    ));
    assert!(matches!(
        store.list_scopes("").await,
        Err(StoreError::InvalidKey(_))
    ));
}
