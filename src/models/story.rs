use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Draft,
    #[default]
    Published,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Draft => "draft",
            StoryStatus::Published => "published",
        }
    }

    /// Stored stories without a recognizable status count as published.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("draft") => StoryStatus::Draft,
            _ => StoryStatus::Published,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub content: String,
    pub description: String,
    pub genre: String,
    pub author_id: String,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: StoryStatus,
}

impl Story {
    pub fn is_published(&self) -> bool {
        self.status == StoryStatus::Published
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryInput {
    pub title: String,
    pub content: String,
    pub description: String,
    pub genre: String,
    pub author_id: String,
    pub author_name: String,
    pub status: StoryStatus,
}

/// Partial story edit. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub status: Option<StoryStatus>,
}
