use axum::{
    extract::{Json, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::AppResult;
use crate::models::{GrnStatus, LineStatus, ProductQuery, ReconciliationFilter};
use crate::service::grn::{CreateGrnRequest, UpdateGrnRequest};
use crate::service::ingestion::UploadRequest;
use crate::service::inventory::BulkUpdateRequest;
use crate::service::reconciliation::ResolveLineRequest;

/// 成功响应: `{ "success": true, "data": ... }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

/// 上传受理结果
#[derive(Debug, Serialize)]
pub struct UploadAccepted {
    pub parsed_invoice_id: Uuid,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ReconciliationQuery {
    pub status: Option<String>,
    pub vendor_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GrnListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub approved_by: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    pub shop_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 发票上传: 保存原件并入队解析，立即返回 202
pub async fn upload_invoice(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut req = UploadRequest::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                req.file_name = field.file_name().map(|s| s.to_string());
                req.content = Some(field.bytes().await?.to_vec());
            }
            "vendor_id" => req.vendor_id = Some(field.text().await?),
            "shop_id" => req.shop_id = Some(field.text().await?),
            "source" => req.source = Some(field.text().await?),
            _ => {}
        }
    }

    let invoice = state.ingestion.upload(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        ok(UploadAccepted {
            parsed_invoice_id: invoice.id,
            status: invoice.status.to_string(),
        }),
    ))
}

pub async fn get_parsed_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.ingestion.get_parsed(id).await?))
}

/// 确认收货前的校验报告
pub async fn validate_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.reconciliation.validate(id).await?))
}

pub async fn resolve_line(
    State(state): State<AppState>,
    Path((id, line_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ResolveLineRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.reconciliation.resolve(id, line_id, req).await?))
}

pub async fn search_products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.matcher.search(&query).await?))
}

/// 对账队列 (默认 pending)
pub async fn reconciliation_queue(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationQuery>,
) -> AppResult<impl IntoResponse> {
    let defaults = ReconciliationFilter::default();
    let filter = ReconciliationFilter {
        status: match query.status.as_deref() {
            Some(s) => s.parse::<LineStatus>()?,
            None => defaults.status,
        },
        vendor_id: query.vendor_id,
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
    };
    Ok(ok(state.reconciliation.queue(filter).await?))
}

pub async fn create_grn(
    State(state): State<AppState>,
    Json(req): Json<CreateGrnRequest>,
) -> AppResult<impl IntoResponse> {
    let grn = state.grns.create(req).await?;
    Ok((StatusCode::CREATED, ok(grn)))
}

pub async fn list_grns(
    State(state): State<AppState>,
    Query(query): Query<GrnListQuery>,
) -> AppResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(|s| s.parse::<GrnStatus>())
        .transpose()?;
    let grns = state
        .grns
        .list(status, query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(ok(grns))
}

pub async fn get_grn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.grns.get(id).await?))
}

pub async fn update_grn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateGrnRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.grns.update(id, req).await?))
}

pub async fn delete_grn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.grns.delete(id).await?;
    Ok(ok(serde_json::json!({ "deleted": id })))
}

pub async fn confirm_grn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.grns.confirm(id, &req.approved_by).await?))
}

pub async fn post_grn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.grns.post(id).await?))
}

/// 收货明细 CSV
pub async fn export_grn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let csv = state.grns.export_csv(id).await?;
    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"grn-{}.csv\"", id),
        ),
    ];
    Ok((headers, csv))
}

pub async fn bulk_update_batches(
    State(state): State<AppState>,
    Json(req): Json<BulkUpdateRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.inventory.bulk_update(req).await?))
}

pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> AppResult<impl IntoResponse> {
    Ok(ok(state.inventory.list(query.shop_id, query.product_id).await?))
}
