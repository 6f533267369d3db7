//! 自动分割模板匹配
//!
//! 两种匹配方式：系列目录里已附带模板工件时按内容指纹查目录；
//! 没有工件时按规则集对系列标签做全或无匹配。歧义永远上浮为
//! 独立的终态，绝不按优先级悄悄挑一个。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use draw_core::store::TemplateStore;
use draw_core::{ProcessingStatus, Result, RuleSet, Template};
use draw_dicom::{DicomParser, TagValue};
use draw_storage::checksum::compute_sha512;
use draw_storage::workdir;

/// 模板匹配结论
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// 唯一命中
    Matched(Template),
    /// 规则模式下没有任何规则集完全满足
    NoMatch,
    /// 规则模式下多个规则集同时完全满足
    MultipleMatch(Vec<String>),
    /// 附带的模板工件不在目录中
    InvalidAttached,
    /// 目录里有多个模板工件
    MultipleAttached,
}

impl MatchOutcome {
    /// 对应的处理状态
    pub fn to_status(&self) -> ProcessingStatus {
        match self {
            Self::Matched(_) => ProcessingStatus::ReadyForDeidentification,
            Self::NoMatch => ProcessingStatus::NoTemplateFound,
            Self::MultipleMatch(_) => ProcessingStatus::MultipleTemplatesMatched,
            Self::InvalidAttached => ProcessingStatus::TemplateNotMatched,
            Self::MultipleAttached => ProcessingStatus::MultipleTemplatesFound,
        }
    }

    /// 人类可读的结论描述，写入处理日志
    pub fn describe(&self) -> String {
        match self {
            Self::Matched(template) => format!("{} template matched", template.name),
            Self::NoMatch => "no rule set matched".to_string(),
            Self::MultipleMatch(names) => format!("rule sets matched: {}", names.join(", ")),
            Self::InvalidAttached => "attached template not in catalog".to_string(),
            Self::MultipleAttached => "multiple template files in folder".to_string(),
        }
    }
}

/// 对一个系列目录执行模板匹配
///
/// 规则模式唯一命中时把模板工件复制进系列目录，之后该工件随
/// 系列一起去标识化并上传。
pub async fn match_series(
    series_dir: &Path,
    store: &Arc<dyn TemplateStore>,
) -> Result<MatchOutcome> {
    let artifacts = template_artifacts(series_dir).await?;

    match artifacts.len() {
        1 => {
            // 附带工件模式：指纹逐字查目录
            let fingerprint = compute_sha512(&artifacts[0]).await?;
            match store.find_template_by_hash(&fingerprint).await? {
                Some(template) => {
                    info!(
                        "attached template {} matched for {}",
                        template.name,
                        series_dir.display()
                    );
                    Ok(MatchOutcome::Matched(template))
                }
                None => {
                    warn!(
                        "attached template in {} has unknown fingerprint",
                        series_dir.display()
                    );
                    Ok(MatchOutcome::InvalidAttached)
                }
            }
        }
        0 => match_by_rules(series_dir, store).await,
        n => {
            warn!("{} template files found in {}", n, series_dir.display());
            Ok(MatchOutcome::MultipleAttached)
        }
    }
}

/// 规则匹配模式
async fn match_by_rules(series_dir: &Path, store: &Arc<dyn TemplateStore>) -> Result<MatchOutcome> {
    let files = workdir::list_files_recursive(series_dir).await?;
    let representative = files
        .iter()
        .find_map(|f| DicomParser::open(f).ok())
        .ok_or_else(|| {
            draw_core::DrawError::MalformedInput(format!(
                "no parseable file in {}",
                series_dir.display()
            ))
        })?;
    let tag_values = DicomParser::extract_tag_values(&representative);

    let rule_sets = store.list_rule_sets().await?;
    let candidates = evaluate_rule_sets(&tag_values, &rule_sets);

    match candidates.len() {
        0 => Ok(MatchOutcome::NoMatch),
        1 => {
            let rule_set = candidates[0];
            let template = store
                .find_template_by_name(&rule_set.template_name)
                .await?
                .ok_or_else(|| {
                    draw_core::DrawError::NotFound(format!(
                        "template {} referenced by rule set {}",
                        rule_set.template_name, rule_set.name
                    ))
                })?;
            attach_template(series_dir, &template).await?;
            info!(
                "rule set {} matched, template {} attached to {}",
                rule_set.name,
                template.name,
                series_dir.display()
            );
            Ok(MatchOutcome::Matched(template))
        }
        _ => {
            let names = candidates.iter().map(|r| r.name.clone()).collect();
            Ok(MatchOutcome::MultipleMatch(names))
        }
    }
}

/// 全或无的规则集评估
///
/// 只有规则集的每一条规则都被系列标签满足才算候选；满足
/// (N-1)/N 条不算。纯函数，结果顺序与规则集输入顺序一致。
pub fn evaluate_rule_sets<'a>(tag_values: &[TagValue], rule_sets: &'a [RuleSet]) -> Vec<&'a RuleSet> {
    rule_sets
        .iter()
        .filter(|rule_set| {
            !rule_set.rules.is_empty()
                && rule_set.rules.iter().all(|rule| {
                    tag_values
                        .iter()
                        .any(|tv| tv.tag_name == rule.tag_name && tv.tag_value == rule.tag_value)
                })
        })
        .collect()
}

/// 把模板工件复制进系列目录
async fn attach_template(series_dir: &Path, template: &Template) -> Result<()> {
    let source = PathBuf::from(&template.artifact_path);
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.yml", template.name));
    let dest = series_dir.join(file_name);
    tokio::fs::copy(&source, &dest).await?;
    debug!("template artifact copied to {}", dest.display());
    Ok(())
}

/// 列出系列目录里的模板工件文件
async fn template_artifacts(series_dir: &Path) -> Result<Vec<PathBuf>> {
    let files = workdir::list_files_recursive(series_dir).await?;
    Ok(files
        .into_iter()
        .filter(|f| {
            matches!(
                f.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            )
        })
        .collect())
}
