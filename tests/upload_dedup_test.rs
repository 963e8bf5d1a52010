use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::Utc;
use flattop::api::error::AppError;
use flattop::config::{AppConfig, DedupLookup};
use flattop::entities::{card_images, prelude::*};
use flattop::infrastructure::database::setup_database;
use flattop::services::card_image_service::CardImageService;
use flattop::services::storage::LocalStorageService;
use flattop::utils::hash::calculate_hash;
use flattop::{AppState, create_app};
use http_body_util::BodyExt;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tower::ServiceExt;

const BOUNDARY: &str = "----flattopboundary7MA4YWxkTrZu0gW";

struct TestApp {
    app: Router,
    db: DatabaseConnection,
    media: TempDir,
}

async fn setup(lookup: DedupLookup) -> TestApp {
    let media = tempfile::tempdir().unwrap();

    let mut config = AppConfig::development();
    config.media_root = media.path().to_path_buf();
    config.dedup_lookup = lookup;

    let db = setup_database(&config).await.unwrap();
    let storage = Arc::new(LocalStorageService::new(
        config.media_root.clone(),
        config.media_url.clone(),
    ));

    let state = AppState::new(db.clone(), storage, config);

    TestApp {
        app: create_app(state),
        db,
        media,
    }
}

async fn login(app: &Router, username: &str) -> String {
    let credentials =
        serde_json::json!({"username": username, "password": "password123"}).to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/accounts/register")
                .header("Content-Type", "application/json")
                .body(Body::from(credentials.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/accounts/login")
                .header("Content-Type", "application/json")
                .body(Body::from(credentials.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    json["token"].as_str().unwrap().to_string()
}

fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\n\
        Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
        Content-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_upload(app: &Router, token: Option<&str>, body: Vec<u8>) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/board/api/upload_card_image/")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn upload(app: &Router, token: &str, filename: &str, content: &[u8]) -> Value {
    let (status, json) = post_upload(app, Some(token), multipart_body("image", filename, content)).await;
    assert_eq!(status, StatusCode::OK, "upload failed: {}", json);
    json
}

fn stored_files(media: &TempDir) -> Vec<String> {
    let dir = media.path().join("card_images");
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_identical_uploads_share_one_file() {
    let t = setup(DedupLookup::Scan).await;
    let token = login(&t.app, "dm").await;

    let first = upload(&t.app, &token, "goblin.png", b"hello").await;
    let second = upload(&t.app, &token, "orc.png", b"hello").await;

    assert_eq!(first["url"], "/media/card_images/goblin.png");
    assert_eq!(first["duplicate"], false);
    assert_eq!(second["url"], first["url"]);
    assert_eq!(second["duplicate"], true);
    assert_ne!(second["id"], first["id"]);

    assert_eq!(stored_files(&t.media), vec!["goblin.png"]);

    let rows = CardImages::find()
        .order_by_asc(card_images::Column::Id)
        .all(&t.db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].image, rows[1].image);
    assert!(rows.iter().all(|r| r.uploaded_by.is_some()));

    let expected = calculate_hash(b"hello");
    assert!(
        rows.iter()
            .all(|r| r.content_hash.as_deref() == Some(expected.as_str()))
    );
}

#[tokio::test]
async fn test_different_content_is_stored_separately() {
    let t = setup(DedupLookup::Index).await;
    let token = login(&t.app, "dm").await;

    let first = upload(&t.app, &token, "card.png", b"hello").await;
    let second = upload(&t.app, &token, "card.png", b"world").await;

    assert_eq!(first["duplicate"], false);
    assert_eq!(second["duplicate"], false);
    assert_ne!(first["url"], second["url"]);
    assert_eq!(stored_files(&t.media).len(), 2);

    // content decides, not the name
    let third = upload(&t.app, &token, "renamed.png", b"world").await;
    assert_eq!(third["url"], second["url"]);
    assert_eq!(third["duplicate"], true);
}

#[tokio::test]
async fn test_first_stored_match_wins() {
    let t = setup(DedupLookup::Scan).await;
    let token = login(&t.app, "dm").await;

    // Two files with the same content, as left behind before deduplication existed
    let dir = t.media.path().join("card_images");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("older.png"), b"hello").unwrap();
    std::fs::write(dir.join("newer.png"), b"hello").unwrap();
    for name in ["older.png", "newer.png"] {
        card_images::ActiveModel {
            image: Set(Some(format!("card_images/{}", name))),
            uploaded_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&t.db)
        .await
        .unwrap();
    }

    let json = upload(&t.app, &token, "again.png", b"hello").await;
    assert_eq!(json["url"], "/media/card_images/older.png");
    assert_eq!(json["duplicate"], true);
}

#[tokio::test]
async fn test_index_lookup_backfills_legacy_rows() {
    let t = setup(DedupLookup::Index).await;
    let token = login(&t.app, "dm").await;

    let dir = t.media.path().join("card_images");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("other.png"), b"other").unwrap();
    std::fs::write(dir.join("legacy.png"), b"hello").unwrap();

    let mut legacy_ids = Vec::new();
    for name in ["other.png", "legacy.png"] {
        let row = card_images::ActiveModel {
            image: Set(Some(format!("card_images/{}", name))),
            content_hash: Set(None),
            uploaded_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&t.db)
        .await
        .unwrap();
        legacy_ids.push(row.id);
    }

    let json = upload(&t.app, &token, "fresh.png", b"hello").await;
    assert_eq!(json["url"], "/media/card_images/legacy.png");
    assert_eq!(json["duplicate"], true);

    let other = CardImages::find_by_id(legacy_ids[0])
        .one(&t.db)
        .await
        .unwrap()
        .unwrap();
    let legacy = CardImages::find_by_id(legacy_ids[1])
        .one(&t.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        other.content_hash.as_deref(),
        Some(calculate_hash(b"other").as_str())
    );
    assert_eq!(
        legacy.content_hash.as_deref(),
        Some(calculate_hash(b"hello").as_str())
    );
}

#[tokio::test]
async fn test_missing_file_is_not_reused() {
    let t = setup(DedupLookup::Index).await;
    let token = login(&t.app, "dm").await;

    let first = upload(&t.app, &token, "goblin.png", b"hello").await;
    std::fs::remove_file(t.media.path().join("card_images/goblin.png")).unwrap();

    let second = upload(&t.app, &token, "goblin.png", b"hello").await;
    assert_eq!(second["duplicate"], false);
    assert_eq!(second["url"], first["url"]);
    assert!(t.media.path().join("card_images/goblin.png").exists());
}

#[tokio::test]
async fn test_upload_without_image_field_is_rejected() {
    let t = setup(DedupLookup::Index).await;
    let token = login(&t.app, "dm").await;

    let (status, json) = post_upload(
        &t.app,
        Some(&token),
        multipart_body("file", "goblin.png", b"hello"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        json["error"],
        "No file uploaded (field name should be \"image\")."
    );
    assert!(CardImages::find().all(&t.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_executable_upload_is_rejected() {
    let t = setup(DedupLookup::Index).await;
    let token = login(&t.app, "dm").await;

    let (status, _) = post_upload(
        &t.app,
        Some(&token),
        multipart_body("image", "card.png", b"MZ\x90\x00\x03\x00"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!t.media.path().join("card_images").exists());
}

#[tokio::test]
async fn test_upload_requires_authentication() {
    let t = setup(DedupLookup::Index).await;

    let (status, json) = post_upload(&t.app, None, multipart_body("image", "a.png", b"hello")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "Authentication required");

    let (status, _) = post_upload(
        &t.app,
        Some("not-a-jwt"),
        multipart_body("image", "a.png", b"hello"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_board_redirects_anonymous_users_to_login() {
    let t = setup(DedupLookup::Index).await;

    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/board/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()[header::LOCATION],
        "/accounts/login/?next=%2Fboard%2F"
    );
}

#[tokio::test]
async fn test_board_accepts_login_cookie() {
    let t = setup(DedupLookup::Index).await;
    let token = login(&t.app, "dm").await;

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/board/")
                .header("Cookie", format!("token={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_second_user_reuses_first_users_file() {
    let t = setup(DedupLookup::Index).await;
    let alice = login(&t.app, "alice").await;
    let bob = login(&t.app, "bob").await;

    let first = upload(&t.app, &alice, "dragon.png", b"hello").await;
    let second = upload(&t.app, &bob, "dragon.png", b"hello").await;

    assert_eq!(first["duplicate"], false);
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["url"], first["url"]);
    assert_eq!(stored_files(&t.media), vec!["dragon.png"]);

    let rows = CardImages::find()
        .order_by_asc(card_images::Column::Id)
        .all(&t.db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].image, rows[1].image);
    assert_ne!(rows[0].uploaded_by, rows[1].uploaded_by);
}

#[tokio::test]
async fn test_executable_header_split_across_reads_is_rejected() {
    let media = tempfile::tempdir().unwrap();
    let mut config = AppConfig::development();
    config.media_root = media.path().to_path_buf();
    let db = setup_database(&config).await.unwrap();
    let storage = Arc::new(LocalStorageService::new(
        config.media_root.clone(),
        config.media_url.clone(),
    ));
    let service = CardImageService::new(db, storage, config);

    // first read yields only "M"
    let reader = (&b"M"[..]).chain(&b"Z\x90\x00\x03\x00"[..]);
    let result = service.accept_upload(None, "card.png", reader).await;

    assert!(matches!(result, Err(AppError::InvalidInput(_))));
    assert!(!media.path().join("card_images").exists());
}
