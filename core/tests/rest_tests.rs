/// REST client against an in-process hyper server
extern crate storelink_core;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use storelink_core::{Config, Credential, HistoryApi, HttpHistoryApi, OrderStatus, SyncError};
use tokio::net::TcpListener;

const TOKEN: &str = "t0k";

fn json(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn stored(id: &str, sender: &str, recipient: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "senderId": sender,
        "recipientId": recipient,
        "content": content,
        "createdAt": "2024-05-01T10:00:00Z"
    })
}

async fn handle(req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {}", TOKEN).as_str());
    if !authorized {
        return json(StatusCode::UNAUTHORIZED, serde_json::json!({"error": "no"}));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    match (method, path.as_str()) {
        (Method::GET, "/api/messages") => {
            let mut messages = vec![
                stored("m1", "42", "support", "hello"),
                stored("m2", "7", "support", "hi"),
            ];
            if query == "peer=42" {
                messages.truncate(1);
            }
            json(StatusCode::OK, serde_json::json!({ "messages": messages }))
        }
        (Method::POST, "/api/messages") => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let sent: serde_json::Value = serde_json::from_slice(&body).unwrap();
            let recipient = sent["recipientId"].as_str().unwrap_or_default();
            let content = sent["content"].as_str().unwrap_or_default();
            json(
                StatusCode::OK,
                serde_json::json!({ "message": stored("srv-1", "u1", recipient, content) }),
            )
        }
        (Method::GET, "/api/orders/ORD-1") => json(
            StatusCode::OK,
            serde_json::json!({
                "order": {
                    "orderId": "ORD-1",
                    "status": "processing",
                    "updatedAt": "2024-05-01T10:00:00Z"
                }
            }),
        ),
        (Method::GET, "/api/orders/slow") => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            json(StatusCode::OK, serde_json::json!({}))
        }
        (Method::GET, "/api/orders/ORD-500") => {
            json(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({}))
        }
        _ => json(StatusCode::NOT_FOUND, serde_json::json!({})),
    }
}

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let svc = service_fn(|req| async move { Ok::<_, Infallible>(handle(req).await) });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

async fn client(token: &str) -> HttpHistoryApi {
    let addr = start_server().await;
    let config = Config {
        rest_base_url: format!("http://{}", addr),
        request_timeout: Duration::from_millis(500),
        ..Config::default()
    };
    HttpHistoryApi::new(&config, Credential::new(token))
}

#[tokio::test]
async fn test_fetch_history_all_and_filtered() {
    let api = client(TOKEN).await;

    let all = api.fetch_history(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].sender_id, "42");

    let one = api.fetch_history(Some("42")).await.unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].id, "m1");
}

#[tokio::test]
async fn test_send_returns_stored_message() {
    let api = client(TOKEN).await;

    let msg = api.send_message("support", "Where is ORD-1?").await.unwrap();

    assert_eq!(msg.id, "srv-1");
    assert_eq!(msg.recipient_id, "support");
    assert_eq!(msg.content, "Where is ORD-1?");
}

#[tokio::test]
async fn test_fetch_order_and_not_found() {
    let api = client(TOKEN).await;

    let order = api.fetch_order("ORD-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::Processing);
    assert!(order.history.is_empty());

    assert!(matches!(
        api.fetch_order("ORD-9").await,
        Err(SyncError::OrderNotFound(id)) if id == "ORD-9"
    ));
    assert!(matches!(
        api.fetch_order("ORD-500").await,
        Err(SyncError::OrderFetch { .. })
    ));
}

#[tokio::test]
async fn test_bad_credential_maps_to_history_error() {
    let api = client("wrong").await;

    let err = api.fetch_history(None).await.unwrap_err();

    assert!(matches!(err, SyncError::HistoryFetch(_)));
    assert!(!err.user_message().contains("401"));
    assert!(matches!(
        api.send_message("support", "hi").await,
        Err(SyncError::Send(_))
    ));
}

#[tokio::test]
async fn test_request_is_aborted_after_timeout() {
    let api = client(TOKEN).await;

    let started = std::time::Instant::now();
    let result = api.fetch_order("slow").await;

    assert!(matches!(result, Err(SyncError::OrderFetch { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
}
