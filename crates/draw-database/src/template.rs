//! 模板目录查询

use async_trait::async_trait;
use sqlx::FromRow;
use uuid::Uuid;

use crate::connection::DatabasePool;
use draw_core::store::TemplateStore;
use draw_core::{DrawError, Result, Rule, RuleSet, Template};

#[derive(Debug, FromRow)]
struct DbTemplate {
    name: String,
    artifact_path: String,
    protocol: String,
    file_hash: String,
    description: Option<String>,
}

impl From<DbTemplate> for Template {
    fn from(db: DbTemplate) -> Self {
        Template {
            name: db.name,
            artifact_path: db.artifact_path,
            protocol: db.protocol,
            file_hash: db.file_hash,
            description: db.description,
        }
    }
}

/// 模板目录存储的Postgres实现
#[derive(Clone)]
pub struct PgTemplateStore {
    pool: DatabasePool,
}

impl PgTemplateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateStore for PgTemplateStore {
    async fn register_template(&self, template: &Template) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO templates (name, artifact_path, protocol, file_hash, description)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                artifact_path = EXCLUDED.artifact_path,
                protocol = EXCLUDED.protocol,
                file_hash = EXCLUDED.file_hash,
                description = EXCLUDED.description
        "#)
        .bind(&template.name)
        .bind(&template.artifact_path)
        .bind(&template.protocol)
        .bind(&template.file_hash)
        .bind(&template.description)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_template_by_hash(&self, file_hash: &str) -> Result<Option<Template>> {
        let result = sqlx::query_as::<_, DbTemplate>("SELECT * FROM templates WHERE file_hash = $1")
            .bind(file_hash)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(Template::from))
    }

    async fn find_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        let result = sqlx::query_as::<_, DbTemplate>("SELECT * FROM templates WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(result.map(Template::from))
    }

    async fn list_rule_sets(&self) -> Result<Vec<RuleSet>> {
        #[derive(FromRow)]
        struct DbRuleSet {
            id: Uuid,
            name: String,
            description: Option<String>,
            template_name: String,
        }

        #[derive(FromRow)]
        struct DbRule {
            rule_set_id: Uuid,
            tag_name: String,
            tag_value: String,
        }

        let rule_sets = sqlx::query_as::<_, DbRuleSet>("SELECT * FROM rule_sets ORDER BY name")
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        let rules = sqlx::query_as::<_, DbRule>("SELECT rule_set_id, tag_name, tag_value FROM rules")
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        Ok(rule_sets
            .into_iter()
            .map(|rs| RuleSet {
                id: rs.id,
                name: rs.name,
                description: rs.description,
                template_name: rs.template_name,
                rules: rules
                    .iter()
                    .filter(|r| r.rule_set_id == rs.id)
                    .map(|r| Rule {
                        tag_name: r.tag_name.clone(),
                        tag_value: r.tag_value.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn save_rule_set(&self, rule_set: &RuleSet) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        sqlx::query(r#"
            INSERT INTO rule_sets (id, name, description, template_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                template_name = EXCLUDED.template_name
        "#)
        .bind(rule_set.id)
        .bind(&rule_set.name)
        .bind(&rule_set.description)
        .bind(&rule_set.template_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM rules WHERE rule_set_id = $1")
            .bind(rule_set.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        for rule in &rule_set.rules {
            sqlx::query(r#"
                INSERT INTO rules (id, rule_set_id, tag_name, tag_value)
                VALUES ($1, $2, $3, $4)
            "#)
            .bind(Uuid::new_v4())
            .bind(rule_set.id)
            .bind(&rule.tag_name)
            .bind(&rule.tag_value)
            .execute(&mut *tx)
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }
}
