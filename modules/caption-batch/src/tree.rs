//! Character-relationship reference text: cross-verify character tags
//! against stored statistics, arrange them into a forest using the tag
//! graph, and render an indented block for the prompt.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use caption_common::Language;
use tracing::debug;

use crate::traits::{MetadataReader, TagReader};

/// Attributes absent from the image's general tags are still kept when they
/// are globally frequent for the character.
const FREQUENCY_THRESHOLD: f64 = 0.5;

const ZH_HEADER: &str = "角色检索参考信息表：图片中很大概率会出现以下标签的角色，请根据参考信息进行角色判断，把判断在画面的角色自然的在描述中提到其名称，可以看情况选择合适的提到出自哪个系列，提到系列时如果角色标签中带有系列名的话请酌情去除角色中的系列名，如果是皮肤或是特殊形态在你确定的情况下也可以提到";
const ZH_RULE: &str = "══════════════════";
const EN_HEADER: &str = "Character Search Reference Information Table: The following characters are likely to appear in the image, please identify them based on the reference information, and naturally mention the character's name in the description, you can choose the appropriate series to mention according to the situation, if the character's tag contains the series name, please remove the series name according to the situation";
const EN_RULE: &str = "═══════════════════════════";

const ZH_TIP: &str = "\n\n提示：带缩进的角色通常是上级的形态/皮肤版本，应优先识别具体形态。若同时存在父级和子级角色，请同时在描述中指出。\n      这些是一些可能出现在画面中的角色的参考，你可以根据他们的平时的通常特征进行人物判断，提供的信息中子级角色通常是父级角色的某个形态或是皮肤，能判断出子级角色的话就不要重复判断父级角色，除非两者都出现";
const EN_TIP: &str = "\n\nTip: Indented roles are usually alternative forms/skins of parent characters. Prefer identifying specific forms, but include both if coexisting.\n      These are references for characters that may appear in the image; judge by their usual traits. A child entry is typically a form or skin of its parent, so once a child is identified do not also report the parent unless both are present.";

/// Verified context for one character tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifiedCharacter {
    pub attributes: Vec<String>,
    pub series: Vec<String>,
}

/// Build the rendered reference block for an image, or `None` when the
/// image carries no character tags.
pub async fn character_reference<M, T>(
    pics: &M,
    tags: &T,
    id: i64,
    language: Language,
) -> Result<Option<String>>
where
    M: MetadataReader + ?Sized,
    T: TagReader + ?Sized,
{
    let verified = cross_verify(pics, id).await?;
    if verified.is_empty() {
        return Ok(None);
    }

    let names: Vec<String> = verified.keys().cloned().collect();
    let forest = build_forest(tags, &names).await?;
    Ok(Some(render(&forest, &verified, language)))
}

/// Cross-verify every character tag on the image: keep attributes present
/// in the general tags or globally frequent, and series present in the
/// copyright tags.
pub async fn cross_verify<M>(pics: &M, id: i64) -> Result<BTreeMap<String, VerifiedCharacter>>
where
    M: MetadataReader + ?Sized,
{
    let record = pics.record(id).await?;
    let general: BTreeSet<&str> = record.general().iter().map(String::as_str).collect();
    let copyrights: BTreeSet<&str> = record.copyrights().iter().map(String::as_str).collect();

    let mut verified = BTreeMap::new();
    for name in record.characters() {
        let stats = pics.character_stats(name).await?;
        let mut entry = VerifiedCharacter::default();

        for attribute in &stats.attributes {
            if general.contains(attribute.as_str()) {
                entry.attributes.push(attribute.clone());
                continue;
            }
            match pics.attribute_frequency(attribute).await {
                Ok(Some(frequency)) if frequency > FREQUENCY_THRESHOLD => {
                    entry.attributes.push(attribute.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(attribute = %attribute, error = %e, "Attribute frequency lookup failed");
                }
            }
        }

        for (series, _weight) in &stats.series {
            if copyrights.contains(series.as_str()) {
                entry.series.push(series.clone());
            }
        }

        verified.insert(name.clone(), entry);
    }

    Ok(verified)
}

/// Arrange verified character names into a one-level forest: roots are the
/// names with no parent in the tag graph; each root's children are the
/// graph children that are themselves verified. Names appearing as a child
/// are pruned from the top level.
pub async fn build_forest<T>(
    tags: &T,
    names: &[String],
) -> Result<BTreeMap<String, Vec<String>>>
where
    T: TagReader + ?Sized,
{
    let members: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    let mut forest: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in names {
        if tags.is_root(name).await? {
            let mut children: Vec<String> = tags
                .children(name)
                .await?
                .into_iter()
                .filter(|child| child != name && members.contains(child.as_str()))
                .collect();
            children.sort();
            forest.insert(name.clone(), children);
        }
    }

    let child_names: BTreeSet<String> = forest.values().flatten().cloned().collect();
    for child in &child_names {
        forest.remove(child);
    }

    Ok(forest)
}

/// Render the forest as a localized indented block, wrapped in newlines.
pub fn render(
    forest: &BTreeMap<String, Vec<String>>,
    verified: &BTreeMap<String, VerifiedCharacter>,
    language: Language,
) -> String {
    let mut lines: Vec<String> = Vec::new();
    match language {
        Language::Zh => {
            lines.push(ZH_HEADER.to_string());
            lines.push(ZH_RULE.to_string());
        }
        Language::En => {
            lines.push(EN_HEADER.to_string());
            lines.push(EN_RULE.to_string());
        }
    }

    for (root, children) in forest {
        lines.push(node_block(root, verified, 0, language));
        for child in children {
            lines.push(node_block(child, verified, 1, language));
        }
    }

    lines.push(
        match language {
            Language::Zh => ZH_TIP,
            Language::En => EN_TIP,
        }
        .to_string(),
    );

    format!("\n{}\n", lines.join("\n"))
}

fn node_block(
    name: &str,
    verified: &BTreeMap<String, VerifiedCharacter>,
    depth: usize,
    language: Language,
) -> String {
    let indent = "  ".repeat(depth);
    let empty = VerifiedCharacter::default();
    let entry = verified.get(name).unwrap_or(&empty);

    let none = match language {
        Language::Zh => "无",
        Language::En => "None",
    };
    let attributes = if entry.attributes.is_empty() {
        none.to_string()
    } else {
        entry.attributes.join(", ")
    };
    let series = if entry.series.is_empty() {
        none.to_string()
    } else {
        entry.series.join(", ")
    };

    match language {
        Language::Zh => format!(
            "{indent}• {name}\n{indent}  │ 角色特征: {attributes}\n{indent}  └─ 作品系列: {series}"
        ),
        Language::En => format!(
            "{indent}• {name}\n{indent}  │ Features: {attributes}\n{indent}  └─ Series: {series}"
        ),
    }
}
