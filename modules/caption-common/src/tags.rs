use serde::{Deserialize, Deserializer};

/// A tag field as it may appear in stored documents: absent, a bare string,
/// or a list. Normalized to `Vec<String>` at the store boundary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Many(Vec<String>),
    One(String),
    #[default]
    None,
}

impl TagValue {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            TagValue::Many(tags) => tags,
            TagValue::One(tag) => vec![tag],
            TagValue::None => Vec::new(),
        }
    }
}

/// Serde helper: `#[serde(default, deserialize_with = "tag_list")]`.
pub fn tag_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(TagValue::deserialize(deserializer)?.into_vec())
}
