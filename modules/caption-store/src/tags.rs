use mongodb::bson::doc;
use mongodb::Database;
use serde::Deserialize;
use tracing::warn;

use crate::client::StoreClient;
use crate::error::Result;

const TAGS_COLLECTION: &str = "tags";

#[derive(Debug, Deserialize)]
struct ParentsProjection {
    #[serde(default)]
    parents: Vec<ParentRef>,
}

/// Parent entries are stored as subdocuments carrying at least a name.
#[derive(Debug, Deserialize)]
struct ParentRef {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChildrenProjection {
    #[serde(default)]
    children: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RelatedProjection {
    #[serde(default)]
    related: Vec<String>,
}

/// Gateway for the tag graph: parent/child/related lookups, all point reads
/// with projection. A missing node is a warning and an empty result, never
/// an error.
#[derive(Clone)]
pub struct TagStore {
    db: Database,
}

impl TagStore {
    pub fn new(client: &StoreClient) -> Self {
        Self { db: client.metadata_db() }
    }

    /// A tag is a root iff it exists and has no parents.
    pub async fn is_root(&self, name: &str) -> Result<bool> {
        let found = self
            .db
            .collection::<ParentsProjection>(TAGS_COLLECTION)
            .find_one(doc! { "name": name })
            .projection(doc! { "parents": 1 })
            .await?;

        match found {
            Some(tag) => Ok(tag.parents.is_empty()),
            None => {
                warn!(tag = name, "Tag not found in graph");
                Ok(false)
            }
        }
    }

    pub async fn children(&self, name: &str) -> Result<Vec<String>> {
        let found = self
            .db
            .collection::<ChildrenProjection>(TAGS_COLLECTION)
            .find_one(doc! { "name": name })
            .projection(doc! { "children": 1 })
            .await?;

        match found {
            Some(tag) => Ok(tag.children),
            None => {
                warn!(tag = name, "Tag not found in graph");
                Ok(Vec::new())
            }
        }
    }

    pub async fn parents(&self, name: &str) -> Result<Vec<String>> {
        let found = self
            .db
            .collection::<ParentsProjection>(TAGS_COLLECTION)
            .find_one(doc! { "name": name })
            .projection(doc! { "parents": 1 })
            .await?;

        match found {
            Some(tag) => Ok(tag
                .parents
                .into_iter()
                .map(|p| p.name)
                .filter(|n| !n.is_empty())
                .collect()),
            None => {
                warn!(tag = name, "Tag not found in graph");
                Ok(Vec::new())
            }
        }
    }

    pub async fn related(&self, name: &str) -> Result<Vec<String>> {
        let found = self
            .db
            .collection::<RelatedProjection>(TAGS_COLLECTION)
            .find_one(doc! { "name": name })
            .projection(doc! { "related": 1 })
            .await?;

        match found {
            Some(tag) => Ok(tag.related),
            None => {
                warn!(tag = name, "Tag not found in graph");
                Ok(Vec::new())
            }
        }
    }
}
