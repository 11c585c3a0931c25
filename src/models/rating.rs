use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub id: String,
    pub story_id: String,
    pub user_id: String,
    pub value: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingInput {
    pub story_id: String,
    pub user_id: String,
    pub value: u8,
}

impl RatingInput {
    pub fn validate(&self) -> Result<()> {
        if (MIN_RATING..=MAX_RATING).contains(&self.value) {
            Ok(())
        } else {
            Err(AppError::InvalidRating(self.value))
        }
    }
}

/// Arithmetic mean of the given values, 0 for none.
pub fn average(values: &[u8]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let total: u64 = values.iter().map(|&v| u64::from(v)).sum();
    total as f64 / values.len() as f64
}
