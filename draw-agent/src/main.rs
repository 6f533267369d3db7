//! DRAW客户端代理主程序
//!
//! 操作员与外部调度器的入口：导出/导入流水线、单独的轮询与
//! 通知、失败系列重启、凭证与模板登记。长时任务不在这里调度，
//! 外部定时器按固定间隔重复调用即可，每条命令都设计为可安全
//! 重入。

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use draw_core::store::{
    CredentialStore, IdentityStore, ProcessingStore, TemplateStore, TransferStore,
};
use draw_core::{DrawConfig, Template};
use draw_database::{
    DatabasePool, PgCredentialStore, PgIdentityStore, PgProcessingStore, PgTemplateStore,
    PgTransferStore,
};
use draw_deid::IdentityMapper;
use draw_storage::compute_sha512;
use draw_transfer::{CredentialManager, DrawApiClient};
use draw_workflow::{restart_series, series_status, ExportPipeline, ImportPipeline};

/// DRAW客户端命令行参数
#[derive(Parser, Debug)]
#[command(name = "draw-agent")]
#[command(about = "DRAW 自动分割客户端代理")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 初始化数据库表结构
    InitDb,
    /// 运行导出流水线（复制 → 分拣 → 匹配 → 去标识化 → 传输）
    Export,
    /// 运行导入流水线（轮询 → 重识别 → 导出 → 通知）
    Import,
    /// 只轮询待定传输
    Poll,
    /// 只通知已完成的传输
    Notify,
    /// 重启一个失败的系列
    Restart {
        /// 处理记录ID
        #[arg(long)]
        record_id: Uuid,
    },
    /// 查看系列状态与处理日志
    Status {
        /// 处理记录ID
        #[arg(long)]
        record_id: Uuid,
    },
    /// 保存API令牌对（静态加密后入库）
    SetTokens {
        /// bearer令牌
        #[arg(long)]
        access_token: String,
        /// refresh令牌
        #[arg(long)]
        refresh_token: String,
        /// 有效期（秒）
        #[arg(long, default_value = "3600")]
        expires_in: i64,
    },
    /// 登记一个自动分割模板
    RegisterTemplate {
        /// 模板名称
        #[arg(long)]
        name: String,
        /// 模板工件路径
        #[arg(long)]
        artifact: String,
        /// 协议名称
        #[arg(long)]
        protocol: String,
        /// 描述
        #[arg(long)]
        description: Option<String>,
    },
}

/// 按配置组装的运行环境
struct Runtime {
    config: DrawConfig,
    processing: Arc<dyn ProcessingStore>,
    templates: Arc<dyn TemplateStore>,
    transfers: Arc<dyn TransferStore>,
    credentials: Arc<CredentialManager>,
    mapper: Arc<IdentityMapper>,
    client: Arc<DrawApiClient>,
    pool: DatabasePool,
}

impl Runtime {
    async fn build(config: DrawConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let pool = DatabasePool::connect(&config.database).await?;

        let identity: Arc<dyn IdentityStore> = Arc::new(PgIdentityStore::new(pool.clone()));
        let processing: Arc<dyn ProcessingStore> = Arc::new(PgProcessingStore::new(pool.clone()));
        let templates: Arc<dyn TemplateStore> = Arc::new(PgTemplateStore::new(pool.clone()));
        let transfers: Arc<dyn TransferStore> = Arc::new(PgTransferStore::new(pool.clone()));
        let credential_store: Arc<dyn CredentialStore> =
            Arc::new(PgCredentialStore::new(pool.clone()));

        let credentials = Arc::new(CredentialManager::new(
            credential_store,
            config.master_key()?,
        ));
        let client = Arc::new(DrawApiClient::new(config.api.clone(), credentials.clone())?);
        let mapper = Arc::new(IdentityMapper::new(identity));

        Ok(Self {
            config,
            processing,
            templates,
            transfers,
            credentials,
            mapper,
            client,
            pool,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = DrawConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let runtime = Runtime::build(config).await?;

    match args.command {
        Command::InitDb => {
            draw_database::schema::create_tables(runtime.pool.pool()).await?;
            info!("database initialized");
        }
        Command::Export => {
            let pipeline = ExportPipeline::new(
                runtime.config.clone(),
                runtime.processing.clone(),
                runtime.templates.clone(),
                runtime.transfers.clone(),
                runtime.mapper.clone(),
                runtime.client.clone(),
            );
            let summary = pipeline.run().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Import => {
            let pipeline = ImportPipeline::new(
                runtime.config.clone(),
                runtime.processing.clone(),
                runtime.transfers.clone(),
                runtime.mapper.clone(),
                runtime.client.clone(),
            );
            let summary = pipeline.run().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Poll => {
            let result = draw_transfer::poll_pending_transfers(
                &runtime.client,
                &runtime.transfers,
                &runtime.config.directories.deidentified_download,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Notify => {
            let result =
                draw_transfer::notify_completed_transfers(&runtime.client, &runtime.transfers)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Restart { record_id } => {
            let record = restart_series(&runtime.processing, record_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Status { record_id } => {
            let (record, logs) = series_status(&runtime.processing, record_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            for log in logs {
                println!(
                    "{} [{}] {}",
                    log.created_at.to_rfc3339(),
                    log.status.as_str(),
                    log.message
                );
            }
        }
        Command::SetTokens {
            access_token,
            refresh_token,
            expires_in,
        } => {
            runtime
                .credentials
                .save_tokens(&access_token, Some(&refresh_token), expires_in)
                .await?;
            info!("credentials stored");
        }
        Command::RegisterTemplate {
            name,
            artifact,
            protocol,
            description,
        } => {
            let file_hash = compute_sha512(&artifact).await?;
            runtime
                .templates
                .register_template(&Template {
                    name: name.clone(),
                    artifact_path: artifact,
                    protocol,
                    file_hash,
                    description,
                })
                .await?;
            info!("template {} registered", name);
        }
    }

    Ok(())
}
