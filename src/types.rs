//! 多模态索引核心类型定义
//!
//! 本模块定义索引写入层的核心数据类型，包括：
//! - Node: 文本/图像两种内容节点（标签联合类型，分流时穷尽匹配）
//! - NodeImage: 图片内容表示（Base64 或 URL）
//! - RefDocInfo: 逻辑文档到节点的反向索引信息
//! - ScoredNode: 检索结果类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// 图片内容类型
// ============================================================================

/// 节点图片内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeImage {
    /// Base64 编码的图片
    Base64 {
        /// Base64 编码的图片数据（不含 data: 前缀）
        data: String,
        /// MIME 类型（如 image/png, image/jpeg）
        media_type: String,
    },
    /// URL 引用的图片
    Url {
        /// 图片 URL
        url: String,
    },
}

impl NodeImage {
    /// 获取 Base64 数据（如果是 Base64 类型）
    pub fn as_base64(&self) -> Option<(&str, &str)> {
        match self {
            NodeImage::Base64 { data, media_type } => Some((data, media_type)),
            NodeImage::Url { .. } => None,
        }
    }

    /// 获取 URL（如果是 URL 类型）
    pub fn as_url(&self) -> Option<&str> {
        match self {
            NodeImage::Base64 { .. } => None,
            NodeImage::Url { url } => Some(url),
        }
    }

    /// 转换为嵌入 API 可用的引用形式
    ///
    /// Base64 图片编码为 `data:` URI，URL 图片原样返回。
    pub fn to_api_ref(&self) -> String {
        match self {
            NodeImage::Base64 { data, media_type } => {
                format!("data:{};base64,{}", media_type, data)
            }
            NodeImage::Url { url } => url.clone(),
        }
    }
}

// ============================================================================
// 内容节点类型
// ============================================================================

/// 生成节点 ID（node_ 前缀 + 12位 nanoid）
pub fn generate_node_id() -> String {
    format!("node_{}", nanoid::nanoid!(12))
}

/// 纯文本节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextNode {
    /// 节点唯一标识
    pub id: String,
    /// 所属逻辑文档 ID（同一来源拆分出的节点共享）
    pub source_id: String,
    /// 文本内容
    pub text: String,
    /// 额外元数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// 嵌入向量（仅在入库路径上临时携带，文档库镜像中始终为 None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl TextNode {
    /// 创建新的文本节点
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: generate_node_id(),
            source_id: source_id.into(),
            text: text.into(),
            metadata: None,
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// 指定节点 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置元数据
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 图像节点（可附带文本说明）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageNode {
    /// 节点唯一标识
    pub id: String,
    /// 所属逻辑文档 ID
    pub source_id: String,
    /// 图片内容
    pub image: NodeImage,
    /// 图片说明文本（可选；非空时节点同时走文本通道）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// 额外元数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// 嵌入向量（仅在入库路径上临时携带）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl ImageNode {
    /// 创建新的图像节点
    pub fn new(source_id: impl Into<String>, image: NodeImage) -> Self {
        Self {
            id: generate_node_id(),
            source_id: source_id.into(),
            image,
            text: None,
            metadata: None,
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// 指定节点 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置图片说明文本
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// 设置元数据
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 内容节点
///
/// 两种节点类型的标签联合。入库分流在此类型上穷尽匹配，
/// 不做运行时反射式类型判断。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Text(TextNode),
    Image(ImageNode),
}

impl Node {
    /// 节点 ID
    pub fn id(&self) -> &str {
        match self {
            Node::Text(n) => &n.id,
            Node::Image(n) => &n.id,
        }
    }

    /// 所属逻辑文档 ID
    pub fn source_id(&self) -> &str {
        match self {
            Node::Text(n) => &n.source_id,
            Node::Image(n) => &n.source_id,
        }
    }

    /// 文本内容（图像节点返回其说明文本）
    pub fn text(&self) -> Option<&str> {
        match self {
            Node::Text(n) => Some(n.text.as_str()),
            Node::Image(n) => n.text.as_deref(),
        }
    }

    /// 是否携带非空文本
    ///
    /// 决定节点是否进入文本嵌入通道：文本节点要求正文非空，
    /// 图像节点要求说明文本非空。
    pub fn has_text(&self) -> bool {
        self.text().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// 是否为图像节点
    pub fn is_image(&self) -> bool {
        matches!(self, Node::Image(_))
    }

    /// 节点类型标识
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Text(_) => "text",
            Node::Image(_) => "image",
        }
    }

    /// 嵌入向量
    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            Node::Text(n) => n.embedding.as_deref(),
            Node::Image(n) => n.embedding.as_deref(),
        }
    }

    /// 元数据
    pub fn metadata(&self) -> Option<&serde_json::Value> {
        match self {
            Node::Text(n) => n.metadata.as_ref(),
            Node::Image(n) => n.metadata.as_ref(),
        }
    }

    /// 图片内容（仅图像节点）
    pub fn image(&self) -> Option<&NodeImage> {
        match self {
            Node::Text(_) => None,
            Node::Image(n) => Some(&n.image),
        }
    }

    /// 生成携带指定嵌入向量的节点副本
    pub fn with_embedding(&self, embedding: Vec<f32>) -> Node {
        let mut copy = self.clone();
        match &mut copy {
            Node::Text(n) => n.embedding = Some(embedding),
            Node::Image(n) => n.embedding = Some(embedding),
        }
        copy
    }

    /// 生成剥离嵌入向量的节点副本
    ///
    /// 文档库镜像使用此副本，避免大向量在向量库之外重复落盘。
    pub fn without_embedding(&self) -> Node {
        let mut copy = self.clone();
        match &mut copy {
            Node::Text(n) => n.embedding = None,
            Node::Image(n) => n.embedding = None,
        }
        copy
    }
}

// ============================================================================
// 反向索引与检索结果
// ============================================================================

/// 逻辑文档信息
///
/// 由文档库的反向索引返回：一个 source_id 对应的全部节点 ID。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefDocInfo {
    pub source_id: String,
    pub node_ids: Vec<String>,
}

/// 检索结果（带分数）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredNode {
    /// 节点 ID
    pub node_id: String,
    /// 所属逻辑文档 ID（来自存储记录，可能缺失）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// 文本内容（向量库保留文本时直接返回，否则经文档库镜像解析）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// 相关性分数（余弦相似度，降序）
    pub score: f32,
}
