//! 文本提取 (外部服务): 原始字节 -> 纯文本
//!
//! OCR / PDF 解析由外部服务负责，这里只定义调用边界。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ExtractionConfig;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, file_name: &str, content: &[u8]) -> AppResult<String>;
}

/// 按配置选择提取器: 配置了 endpoint 用 HTTP，否则按 UTF-8 文本读取
pub fn from_config(config: &ExtractionConfig) -> AppResult<Box<dyn TextExtractor>> {
    match &config.endpoint {
        Some(endpoint) => Ok(Box::new(HttpExtractor::new(
            endpoint.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Box::new(PlainTextExtractor)),
    }
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    text: Option<String>,
    error: Option<String>,
}

/// POST 原始字节到提取服务，响应 `{"text": "..."}` 或 `{"error": "..."}`
pub struct HttpExtractor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExtractor {
    pub fn new(endpoint: String, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl TextExtractor for HttpExtractor {
    async fn extract(&self, file_name: &str, content: &[u8]) -> AppResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("file_name", file_name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "extraction service returned {}: {}",
                status, body
            )));
        }

        let body: ExtractResponse = response.json().await?;
        match (body.text, body.error) {
            (_, Some(error)) => Err(AppError::ExternalService(error)),
            (Some(text), None) if !text.trim().is_empty() => Ok(text),
            _ => Err(AppError::ExternalService(
                "extraction service returned no text".to_string(),
            )),
        }
    }
}

/// 文本 / CSV 发票直接按 UTF-8 读取
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, file_name: &str, content: &[u8]) -> AppResult<String> {
        let text = std::str::from_utf8(content).map_err(|_| {
            AppError::ExternalService(format!(
                "{} is not UTF-8 text and no extraction endpoint is configured",
                file_name
            ))
        })?;
        if text.trim().is_empty() {
            return Err(AppError::ExternalService(format!("{} contains no text", file_name)));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_accepts_utf8() {
        let text = PlainTextExtractor
            .extract("inv.txt", "Arnica – 1 units @ 5".as_bytes())
            .await
            .unwrap();
        assert!(text.contains("Arnica"));
    }

    #[tokio::test]
    async fn plain_text_rejects_binary_and_empty() {
        let err = PlainTextExtractor
            .extract("scan.pdf", &[0xff, 0xfe, 0x00])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalService(_)));
        assert!(PlainTextExtractor.extract("e.txt", b"  \n").await.is_err());
    }
}
