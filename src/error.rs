use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage API error: {0}")]
    StorageApi(String),

    #[error("Invalid image URL: {0}")]
    InvalidImageUrl(String),

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Username already taken by another user")]
    UsernameTakenByAnotherUser,

    #[error("Username cannot be changed once set")]
    UsernameImmutable,

    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("Story not found: {0}")]
    StoryNotFound(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("User {user_id} is not the author of story {story_id}")]
    NotAuthor { story_id: String, user_id: String },

    #[error("Failed to {action}")]
    Failed {
        action: &'static str,
        #[source]
        source: Box<AppError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Errors the caller is expected to show to the user as-is.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            AppError::UsernameTaken
                | AppError::UsernameTakenByAnotherUser
                | AppError::UsernameImmutable
                | AppError::InvalidRating(_)
                | AppError::StoryNotFound(_)
                | AppError::ProfileNotFound(_)
                | AppError::NotAuthor { .. }
        )
    }

    pub fn is_username_conflict(&self) -> bool {
        matches!(
            self,
            AppError::UsernameTaken | AppError::UsernameTakenByAnotherUser
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
