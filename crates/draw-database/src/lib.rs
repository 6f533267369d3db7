//! # DRAW Database
//!
//! sqlx/Postgres后端的存储实现。核心代码只通过 `draw-core` 的
//! 存储trait访问这里的类型；计数器分配与传输收尾使用数据库
//! 事务保证读-改-写的原子性。

pub mod connection;
pub mod credential;
pub mod identity;
pub mod processing;
pub mod schema;
pub mod template;
pub mod transfer;

pub use connection::DatabasePool;
pub use credential::PgCredentialStore;
pub use identity::PgIdentityStore;
pub use processing::PgProcessingStore;
pub use template::PgTemplateStore;
pub use transfer::PgTransferStore;
