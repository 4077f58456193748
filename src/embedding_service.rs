//! 嵌入服务
//!
//! 定义文本/多模态嵌入契约，并提供 OpenAI 兼容 `/embeddings` 端点的默认实现。
//!
//! ## 设计要点
//!
//! - **契约与实现分离**: 索引写入层只依赖 `TextEmbedding` / `MultimodalEmbedding`
//!   两个 trait，API 客户端是其中一种实现，测试可注入确定性实现。
//! - **批量处理**: 多模态模型处理速度较慢，批量大小建议限制在 8 以内；
//!   文本模型可放宽。服务负责将大批量输入拆分处理。
//! - **能力声明**: 图像嵌入能力通过 `supports_images()` 显式声明，
//!   索引写入层在构造时校验，而不是在首次调用时才失败。

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::models::AppError;
use crate::types::NodeImage;

type Result<T> = std::result::Result<T, AppError>;

/// 默认文本批量大小
const DEFAULT_TEXT_BATCH_SIZE: usize = 32;
/// 默认图像批量大小（多模态模型处理速度较慢，限制在 8 以内）
const DEFAULT_IMAGE_BATCH_SIZE: usize = 8;

// ============================================================================
// 嵌入契约
// ============================================================================

/// 文本嵌入契约
#[async_trait]
pub trait TextEmbedding: Send + Sync {
    /// 为一批文本生成向量，返回顺序与输入一致
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// 多模态嵌入契约
///
/// 在文本嵌入之上增加图像嵌入能力。`supports_images()` 是能力声明：
/// 返回 false 的实现不得注册为图像通道嵌入器。
#[async_trait]
pub trait MultimodalEmbedding: TextEmbedding {
    /// 是否具备图像嵌入能力
    fn supports_images(&self) -> bool;

    /// 为一批图片生成向量，返回顺序与输入一致
    async fn embed_images(&self, images: &[NodeImage]) -> Result<Vec<Vec<f32>>>;
}

// ============================================================================
// OpenAI 兼容 API 实现
// ============================================================================

/// 嵌入服务配置
#[derive(Debug, Clone)]
pub struct EmbeddingServiceConfig {
    /// API 基础地址（如 `https://api.example.com/v1`）
    pub base_url: String,
    /// API 密钥
    pub api_key: String,
    /// 文本嵌入模型名
    pub text_model: String,
    /// 多模态嵌入模型名（未配置时服务不声明图像能力）
    pub image_model: Option<String>,
    /// 单次 API 调用的最大文本输入数量
    pub text_batch_size: usize,
    /// 单次 API 调用的最大图像输入数量
    pub image_batch_size: usize,
}

impl EmbeddingServiceConfig {
    /// 创建仅含文本模型的配置
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        text_model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            text_model: text_model.into(),
            image_model: None,
            text_batch_size: DEFAULT_TEXT_BATCH_SIZE,
            image_batch_size: DEFAULT_IMAGE_BATCH_SIZE,
        }
    }

    /// 设置多模态嵌入模型
    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = Some(model.into());
        self
    }
}

/// OpenAI 兼容嵌入服务
///
/// 通过 `/embeddings` 端点生成向量。文本输入直接作为字符串数组提交；
/// 图像输入编码为 `data:` URI 后以对象数组提交（Qwen3-VL-Embedding 格式）。
pub struct ApiEmbeddingService {
    client: reqwest::Client,
    config: EmbeddingServiceConfig,
}

impl ApiEmbeddingService {
    /// 创建新的嵌入服务实例
    pub fn new(config: EmbeddingServiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// 当前配置
    pub fn config(&self) -> &EmbeddingServiceConfig {
        &self.config
    }

    /// 调用 `/embeddings` 端点并解析返回向量
    async fn post_embeddings(
        &self,
        model: &str,
        input: Value,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let request_body = json!({
            "model": model,
            "input": input,
            "encoding_format": "float"
        });

        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let mut request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("Accept-Encoding", "identity");

        if let Ok(parsed_url) = Url::parse(&self.config.base_url) {
            if (parsed_url.scheme() == "http" || parsed_url.scheme() == "https")
                && parsed_url.host_str().is_some()
            {
                let origin_val = format!(
                    "{}://{}",
                    parsed_url.scheme(),
                    parsed_url.host_str().unwrap_or_default()
                );
                request_builder = request_builder.header("Origin", origin_val);
            }
        }

        let response = request_builder
            .json(&request_body)
            .send()
            .await
            .map_err(|e| AppError::network(format!("嵌入API请求失败: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            // 记录完整错误到日志（仅开发调试用）
            log::error!("[Embedding] API error {}: {}", status, error_text);
            // 返回用户友好的错误消息，不暴露敏感信息
            let user_message = match status.as_u16() {
                401 => "API 密钥无效或已过期，请检查设置",
                403 => "API 访问被拒绝，请检查账户权限",
                429 => "请求过于频繁，请稍后重试",
                500..=599 => "嵌入服务暂时不可用，请稍后重试",
                _ => "嵌入请求失败，请重试",
            };
            return Err(AppError::embedding(user_message.to_string()));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| AppError::embedding(format!("解析嵌入API响应失败: {}", e)))?;

        let data = response_json["data"]
            .as_array()
            .ok_or_else(|| AppError::embedding("嵌入API响应格式无效：缺少data字段"))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item["embedding"]
                .as_array()
                .ok_or_else(|| AppError::embedding("嵌入API响应格式无效：缺少embedding字段"))?;

            let vector: Result<Vec<f32>> = embedding
                .iter()
                .map(|v| {
                    v.as_f64()
                        .map(|f| f as f32)
                        .ok_or_else(|| AppError::embedding("嵌入向量包含无效数值"))
                })
                .collect();

            embeddings.push(vector?);
        }

        if embeddings.len() != expected {
            return Err(AppError::embedding(format!(
                "嵌入API返回数量不匹配: 期望 {}, 实际 {}",
                expected,
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl TextEmbedding for ApiEmbeddingService {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let total = texts.len();
        let batch_size = self.config.text_batch_size.max(1);
        log::info!(
            "📊 文本嵌入服务：开始处理 {} 个文本，批量大小 {}",
            total,
            batch_size
        );

        let mut all_embeddings = Vec::with_capacity(total);
        for (batch_idx, chunk) in texts.chunks(batch_size).enumerate() {
            log::debug!(
                "  处理批次 {}: 输入 {}-{} / {}",
                batch_idx + 1,
                batch_idx * batch_size + 1,
                (batch_idx * batch_size + chunk.len()).min(total),
                total
            );

            let input = json!(chunk);
            let embeddings = self
                .post_embeddings(&self.config.text_model, input, chunk.len())
                .await?;
            all_embeddings.extend(embeddings);
        }

        log::info!(
            "✅ 文本嵌入服务：完成 {} 个文本的向量化，维度 {}",
            all_embeddings.len(),
            all_embeddings.first().map(|v| v.len()).unwrap_or(0)
        );
        Ok(all_embeddings)
    }
}

#[async_trait]
impl MultimodalEmbedding for ApiEmbeddingService {
    fn supports_images(&self) -> bool {
        self.config.image_model.is_some()
    }

    async fn embed_images(&self, images: &[NodeImage]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let model = self
            .config
            .image_model
            .clone()
            .ok_or_else(|| AppError::configuration("未配置多模态嵌入模型"))?;

        let total = images.len();
        let batch_size = self.config.image_batch_size.max(1);
        log::info!(
            "🖼️ 多模态嵌入服务：开始处理 {} 个图像输入，批量大小 {}",
            total,
            batch_size
        );

        let mut all_embeddings = Vec::with_capacity(total);
        for chunk in images.chunks(batch_size) {
            let input: Vec<Value> = chunk
                .iter()
                .map(|img| json!({ "image": img.to_api_ref() }))
                .collect();

            let embeddings = self.post_embeddings(&model, json!(input), chunk.len()).await?;
            all_embeddings.extend(embeddings);
        }

        log::info!(
            "✅ 多模态嵌入服务：完成 {} 个图像输入的向量化",
            all_embeddings.len()
        );
        Ok(all_embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding_response(vectors: &[Vec<f32>]) -> String {
        let data: Vec<Value> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| json!({ "index": i, "embedding": v }))
            .collect();
        json!({ "data": data }).to_string()
    }

    #[tokio::test]
    async fn test_embed_texts_parses_vectors() {
        let mut server = mockito::Server::new_async().await;
        let body = embedding_response(&[vec![0.1, 0.2], vec![0.3, 0.4]]);
        let mock = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let service = ApiEmbeddingService::new(EmbeddingServiceConfig::new(
            server.url(),
            "test-key",
            "text-embed-v1",
        ));

        let result = service
            .embed_texts(&["hello".to_string(), "world".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], vec![0.1, 0.2]);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_embed_texts_count_mismatch_is_error() {
        let mut server = mockito::Server::new_async().await;
        let body = embedding_response(&[vec![0.1, 0.2]]);
        let _mock = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let service = ApiEmbeddingService::new(EmbeddingServiceConfig::new(
            server.url(),
            "test-key",
            "text-embed-v1",
        ));

        let err = service
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(err.message.contains("数量不匹配"));
    }

    #[tokio::test]
    async fn test_embed_texts_maps_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/embeddings")
            .with_status(401)
            .with_body("{\"error\": \"bad key\"}")
            .create_async()
            .await;

        let service = ApiEmbeddingService::new(EmbeddingServiceConfig::new(
            server.url(),
            "bad-key",
            "text-embed-v1",
        ));

        let err = service.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(err.message.contains("API 密钥无效"));
    }

    #[tokio::test]
    async fn test_embed_images_without_model_is_configuration_error() {
        let service = ApiEmbeddingService::new(EmbeddingServiceConfig::new(
            "http://localhost:1",
            "key",
            "text-embed-v1",
        ));
        assert!(!service.supports_images());

        let err = service
            .embed_images(&[NodeImage::Url {
                url: "https://example.com/x.png".into(),
            }])
            .await
            .unwrap_err();
        assert!(err.message.contains("未配置多模态嵌入模型"));
    }

    #[test]
    fn test_config_capability_declaration() {
        let config = EmbeddingServiceConfig::new("http://x", "k", "t").with_image_model("vl");
        let service = ApiEmbeddingService::new(config);
        assert!(service.supports_images());
        assert_eq!(service.config().image_batch_size, DEFAULT_IMAGE_BATCH_SIZE);
    }
}
