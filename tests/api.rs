mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{Harness, INVOICE_TEXT};
use purchase_recon_rust::api::{self, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "recon-test-boundary";

fn app(h: &Harness) -> Router {
    let state = AppState::new(&h.repos, h.documents.clone(), Arc::clone(&h.matcher), &h.config);
    api::router(state)
}

fn multipart(fields: &[(&str, &str)], file: Option<&str>) -> Body {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            BOUNDARY, name, value
        ));
    }
    if let Some(content) = file {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"invoice.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n{}\r\n",
            BOUNDARY, content
        ));
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    Body::from(body)
}

fn upload_request(body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/invoices/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(body)
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_is_accepted_and_parsed_in_background() {
    let h = Harness::new();
    h.seed_catalog().await;
    let vendor = h.vendor_id.to_string();
    let shop = h.shop_id.to_string();
    let body = multipart(
        &[("vendor_id", vendor.as_str()), ("shop_id", shop.as_str()), ("source", "email")],
        Some(INVOICE_TEXT),
    );

    let response = app(&h).oneshot(upload_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "processing");
    let id = json["data"]["parsed_invoice_id"].as_str().unwrap().to_string();

    h.drain_jobs().await;
    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/invoices/{}/parsed", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["invoice"]["status"], "parsed");
    assert_eq!(json["data"]["lines"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn upload_without_vendor_is_a_validation_error() {
    let h = Harness::new();
    let shop = h.shop_id.to_string();
    let body = multipart(&[("shop_id", shop.as_str())], Some(INVOICE_TEXT));

    let response = app(&h).oneshot(upload_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn unknown_invoice_is_a_json_404() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/invoices/{}/parsed", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn grn_lifecycle_over_http() {
    let h = Harness::new();
    let (arnica, nux, _) = h.seed_catalog().await;
    let create = json!({
        "vendor_id": h.vendor_id,
        "shop_id": h.shop_id,
        "lines": [
            { "product_id": arnica, "qty": "12", "unit_cost": "70" },
            { "product_id": nux, "qty": "5", "unit_cost": "185" }
        ]
    });

    let response = app(&h)
        .oneshot(json_request("POST", "/purchases/grn", create))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "draft");
    let id = json["data"]["id"].as_str().unwrap().to_string();

    let confirm_uri = format!("/purchases/grn/{}/confirm", id);
    let response = app(&h)
        .oneshot(json_request("POST", &confirm_uri, json!({ "approved_by": "alice" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app(&h)
        .oneshot(json_request("POST", &confirm_uri, json!({ "approved_by": "alice" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "INVALID_STATE_TRANSITION");

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/purchases/grn/{}/post", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "posted");
    assert_eq!(json["data"]["entries"].as_array().unwrap().len(), 2);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/inventory/batches?shop_id={}", h.shop_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 2);

    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri(format!("/purchases/grn/{}/export", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
}

#[tokio::test]
async fn product_search_ranks_by_similarity() {
    let h = Harness::new();
    let (arnica, _, _) = h.seed_catalog().await;
    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/products/search?q=SBL%20Arnica%2030C%2010ml&limit=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let results = json["data"].as_array().unwrap();
    assert!(results.len() <= 2);
    assert_eq!(results[0]["id"], arnica.to_string());
    assert!(results[0]["similarity"].as_f64().unwrap() > 0.6);
}

#[tokio::test]
async fn reconciliation_queue_rejects_unknown_status() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/purchases/reconciliations?status=done")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
