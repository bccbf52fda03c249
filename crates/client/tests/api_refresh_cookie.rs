use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use workshop_sync_client::api::{ApiError, HttpApi};
use workshop_sync_client::auth::{RefreshClient, RefreshError};
use workshop_sync_client::store::{MemorySessionStore, SessionStore};

#[derive(Serialize)]
struct Claims {
    user_id: i64,
    exp: i64,
}

fn access_token(lifetime_secs: i64) -> String {
    let claims = Claims { user_id: 7, exp: Utc::now().timestamp() + lifetime_secs };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"server-side-secret")).unwrap()
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.unwrap();
        if read == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..read]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn cookie_in(head: &str) -> Option<String> {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix("refresh_token="))
        .map(str::to_string)
        .next()
}

/// Refresh endpoint that insists on the `refresh_token` cookie and rotates it
/// on every success. Records the cookie each request carried.
async fn cookie_server(seen: Arc<Mutex<Vec<Option<String>>>>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut issued = 1;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let head = read_head(&mut stream).await;
            let cookie = cookie_in(&head);
            seen.lock().unwrap().push(cookie.clone());

            let response = if cookie.as_deref() == Some(&format!("rt-{issued}")) {
                issued += 1;
                let body = serde_json::json!({ "access_token": access_token(3600) }).to_string();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Set-Cookie: refresh_token=rt-{issued}; HttpOnly; Path=/\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
            } else {
                "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string()
            };
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    Url::parse(&format!("http://{addr}")).unwrap()
}

fn api(base: Url, timeout: Duration) -> HttpApi {
    HttpApi::new(base, timeout).unwrap()
}

#[tokio::test]
async fn stored_cookie_is_sent_and_rotation_is_persisted() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = cookie_server(seen.clone()).await;
    let store = Arc::new(MemorySessionStore::new());
    store.save_refresh_cookie(Some("rt-1")).unwrap();
    let api = api(base, Duration::from_secs(5)).with_session_store(store.clone());

    let fresh = api.refresh(access_token(30)).await.unwrap();
    assert!(fresh.remaining_at(Utc::now()) > Duration::from_secs(3000));
    assert_eq!(store.load_refresh_cookie().unwrap().as_deref(), Some("rt-2"));

    // The rotated cookie is what the next refresh presents.
    api.refresh(fresh.token).await.unwrap();
    assert_eq!(store.load_refresh_cookie().unwrap().as_deref(), Some("rt-3"));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![Some("rt-1".to_string()), Some("rt-2".to_string())]);
}

#[tokio::test]
async fn rotated_cookie_survives_a_new_client() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = cookie_server(seen.clone()).await;
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    store.save_refresh_cookie(Some("rt-1")).unwrap();

    let first = api(base.clone(), Duration::from_secs(5)).with_session_store(store.clone());
    first.refresh(access_token(30)).await.unwrap();
    drop(first);

    let restarted = api(base, Duration::from_secs(5)).with_session_store(store);
    assert!(restarted.refresh(access_token(30)).await.is_ok());
}

#[tokio::test]
async fn refresh_without_cookie_is_rejected_as_invalid() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let base = cookie_server(seen.clone()).await;
    let api = api(base, Duration::from_secs(5))
        .with_session_store(Arc::new(MemorySessionStore::new()));

    assert_eq!(api.refresh(access_token(30)).await, Err(RefreshError::Invalid));
    assert_eq!(seen.lock().unwrap().as_slice(), &[None]);
}

#[tokio::test]
async fn silent_server_times_out_as_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
    // Accept and hold the connection without ever answering.
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let api = api(base, Duration::from_millis(200));
    let started = std::time::Instant::now();
    let error = api.refresh_token(&access_token(30)).await.unwrap_err();
    assert!(matches!(&error, ApiError::Request(inner) if inner.is_timeout()), "{error}");
    assert!(started.elapsed() < Duration::from_secs(5));

    let outcome = api.refresh(access_token(30)).await;
    assert!(matches!(outcome, Err(RefreshError::Transient(_))));
    hold.abort();
}
