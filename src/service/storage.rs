//! 原始发票文件存储
//!
//! `raw_doc_ref` 即 [`DocumentStore::put`] 返回的引用: 本地实现为 `file://` 路径，
//! 内存实现为 `mem://<key>`。

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 保存文件，返回引用
    async fn put(&self, key: &str, content: &[u8]) -> AppResult<String>;

    async fn get(&self, doc_ref: &str) -> AppResult<Vec<u8>>;

    /// 删除文件；不存在时视为成功
    async fn delete(&self, doc_ref: &str) -> AppResult<()>;
}

/// 过滤掉路径分隔符等字符，避免上传文件名逃逸出存储目录
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// 本地文件系统
pub struct LocalDocumentStore {
    base_path: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn put(&self, key: &str, content: &[u8]) -> AppResult<String> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.base_path.join(sanitize_key(key));
        tokio::fs::write(&path, content).await?;
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, doc_ref: &str) -> AppResult<Vec<u8>> {
        let path = doc_ref
            .strip_prefix("file://")
            .ok_or_else(|| AppError::validation(format!("expected file:// reference: {}", doc_ref)))?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::not_found(format!("document {}", doc_ref)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, doc_ref: &str) -> AppResult<()> {
        let path = doc_ref
            .strip_prefix("file://")
            .ok_or_else(|| AppError::validation(format!("expected file:// reference: {}", doc_ref)))?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 内存存储 (memory:// 运行模式与测试)
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: DashMap<String, Vec<u8>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, key: &str, content: &[u8]) -> AppResult<String> {
        let doc_ref = format!("mem://{}", sanitize_key(key));
        self.docs.insert(doc_ref.clone(), content.to_vec());
        Ok(doc_ref)
    }

    async fn get(&self, doc_ref: &str) -> AppResult<Vec<u8>> {
        self.docs
            .get(doc_ref)
            .map(|d| d.value().clone())
            .ok_or_else(|| AppError::not_found(format!("document {}", doc_ref)))
    }

    async fn delete(&self, doc_ref: &str) -> AppResult<()> {
        self.docs.remove(doc_ref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cannot_escape_the_directory() {
        assert_eq!(sanitize_key("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_key("inv 01.pdf"), "inv_01.pdf");
    }

    #[tokio::test]
    async fn local_store_round_trips_bytes() {
        let dir = std::env::temp_dir().join(format!("recon-docs-{}", uuid::Uuid::new_v4()));
        let store = LocalDocumentStore::new(&dir);
        let doc_ref = store.put("a.txt", b"hello").await.unwrap();
        assert!(doc_ref.starts_with("file://"));
        assert_eq!(store.get(&doc_ref).await.unwrap(), b"hello");

        store.delete(&doc_ref).await.unwrap();
        assert!(matches!(store.get(&doc_ref).await, Err(AppError::NotFound(_))));
        store.delete(&doc_ref).await.unwrap();
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_memory_document_is_not_found() {
        let store = MemoryDocumentStore::new();
        assert!(matches!(
            store.get("mem://nope").await,
            Err(AppError::NotFound(_))
        ));
    }
}
