//! 配置管理
//!
//! 整个客户端的配置在启动时加载一次，之后以普通数据的形式显式
//! 传入各组件；核心代码不持有任何全局可变状态。

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{DrawError, Result};

/// DRAW客户端完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawConfig {
    /// 远程API配置
    pub api: ApiConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 流水线各阶段的工作目录
    pub directories: DirectoryConfig,
    /// 去标识化配置
    pub deidentification: DeidentificationConfig,
    /// 安全配置
    pub security: SecurityConfig,
}

/// 远程API配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API基础URL
    pub base_url: String,
    /// 客户端实例标识
    pub client_id: String,
    /// 上传接口路径
    pub upload_endpoint: String,
    /// 状态查询接口路径模板，包含 {task_id} 占位符
    pub status_endpoint: String,
    /// 结果下载接口路径模板，包含 {task_id} 占位符
    pub download_endpoint: String,
    /// 完成通知接口路径模板，包含 {task_id} 占位符
    pub notify_endpoint: String,
    /// 健康检查接口路径
    pub health_endpoint: String,
    /// 令牌刷新接口路径
    pub refresh_endpoint: String,
    /// 单个请求的最大重试次数
    pub max_retries: u32,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 跳过上传前的健康检查
    pub bypass_health_check: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            client_id: "draw-client".to_string(),
            upload_endpoint: "api/upload/".to_string(),
            status_endpoint: "api/upload/{task_id}/status/".to_string(),
            download_endpoint: "api/rtstruct/{task_id}".to_string(),
            notify_endpoint: "segmentation/notify/{task_id}".to_string(),
            health_endpoint: "api/health/".to_string(),
            refresh_endpoint: "auth/refresh".to_string(),
            max_retries: 3,
            request_timeout_secs: 60,
            bypass_health_check: false,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 连接字符串
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/draw_client".to_string(),
            max_connections: 10,
        }
    }
}

/// 工作目录配置
///
/// 目录名不是稳定契约，但每个阶段一个目录、阶段间以移动交接的
/// 约定是；目录的存在与否参与状态机。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// 数据店（远程影像归档的挂载点），扫描来源
    pub datastore: PathBuf,
    /// 导入目录，复制任务的目标
    pub import: PathBuf,
    /// 系列分拣后的处理目录
    pub processing: PathBuf,
    /// 待去标识化目录
    pub deidentification_input: PathBuf,
    /// 去标识化输出目录
    pub deidentification_output: PathBuf,
    /// 上传压缩包的暂存目录
    pub temp_upload: PathBuf,
    /// 已上传压缩包的归档目录
    pub archive: PathBuf,
    /// 下载的去标识化RTSTRUCT目录
    pub deidentified_download: PathBuf,
    /// 重识别输出目录
    pub reidentified_output: PathBuf,
    /// 导出到数据店的目录
    pub export: PathBuf,
}

impl DirectoryConfig {
    /// 按阶段顺序列出全部工作目录
    pub fn all(&self) -> Vec<&PathBuf> {
        vec![
            &self.import,
            &self.processing,
            &self.deidentification_input,
            &self.deidentification_output,
            &self.temp_upload,
            &self.archive,
            &self.deidentified_download,
            &self.reidentified_output,
            &self.export,
        ]
    }
}

/// 去标识化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeidentificationConfig {
    /// 采集模态白名单，不在名单内的文件在入口处拒绝
    pub modality_allow_list: Vec<String>,
}

impl Default for DeidentificationConfig {
    fn default() -> Self {
        Self {
            modality_allow_list: vec![
                "CT".to_string(),
                "MR".to_string(),
                "PT".to_string(),
                "US".to_string(),
            ],
        }
    }
}

/// 安全配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// 凭证加密主密钥，64位十六进制（32字节）
    pub master_key_hex: String,
}

impl DrawConfig {
    /// 从配置文件与环境变量加载配置
    ///
    /// 环境变量以 `DRAW__` 为前缀，层级用双下划线分隔，
    /// 例如 `DRAW__API__BASE_URL`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        let config = builder
            .add_source(Environment::with_prefix("DRAW").separator("__"))
            .build()
            .map_err(|e| DrawError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| DrawError::Config(e.to_string()))
    }

    /// 校验配置的基本一致性
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.is_empty() {
            return Err(DrawError::Config("api.base_url 不能为空".to_string()));
        }
        for (name, endpoint) in [
            ("status_endpoint", &self.api.status_endpoint),
            ("download_endpoint", &self.api.download_endpoint),
            ("notify_endpoint", &self.api.notify_endpoint),
        ] {
            if !endpoint.contains("{task_id}") {
                return Err(DrawError::Config(format!(
                    "api.{} 缺少 {{task_id}} 占位符",
                    name
                )));
            }
        }
        if self.api.max_retries == 0 {
            return Err(DrawError::Config("api.max_retries 至少为1".to_string()));
        }
        if self.security.master_key_hex.len() != 64 {
            return Err(DrawError::Config(
                "security.master_key_hex 必须是64位十六进制".to_string(),
            ));
        }
        Ok(())
    }

    /// 解析主密钥
    pub fn master_key(&self) -> Result<[u8; 32]> {
        let hex = &self.security.master_key_hex;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DrawError::Config(
                "security.master_key_hex 必须是64位十六进制".to_string(),
            ));
        }
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|e| DrawError::Config(e.to_string()))?;
        }
        Ok(key)
    }
}
