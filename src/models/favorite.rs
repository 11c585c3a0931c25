use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Favorite {
    pub story_id: String,
    pub favorited_at: DateTime<Utc>,
}
