use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use rusqlite::types::Type;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    average, Comment, CommentInput, Favorite, NewUserProfile, Rating, RatingInput, SocialLinks,
    Story, StoryInput, StoryStatus, StoryUpdate, UserProfile, UserProfileUpdate,
};

use super::schema::SCHEMA;

const STORY_COLUMNS: &str =
    "id, title, content, description, genre, author_id, author_name, created_at, updated_at, status";
const PROFILE_COLUMNS: &str =
    "id, display_name, username, email, bio, avatar, website, social_links, join_date";
const COMMENT_COLUMNS: &str = "id, story_id, user_id, user_name, user_avatar, text, created_at";
const RATING_COLUMNS: &str = "id, story_id, user_id, value, created_at, updated_at";

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        tracing::debug!("Opened story database at {}", db_path);
        Ok(Self { conn })
    }

    // Story operations

    pub async fn create_story(&self, story: StoryInput) -> Result<String> {
        let id = new_id();
        let story_id = id.clone();
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO stories ({STORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)"
                    ),
                    params![
                        story_id,
                        story.title,
                        story.content,
                        story.description,
                        story.genre,
                        story.author_id,
                        story.author_name,
                        now,
                        story.status.as_str(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        tracing::debug!("Created story {}", id);
        Ok(id)
    }

    pub async fn get_story(&self, id: &str) -> Result<Option<Story>> {
        let id = id.to_string();
        let story = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1"))?;
                let story = stmt.query_row(params![id], story_from_row).optional()?;
                Ok(story)
            })
            .await?;
        Ok(story)
    }

    /// Newest stories first, drafts included.
    pub async fn get_stories(&self, limit: usize) -> Result<Vec<Story>> {
        self.query_stories(
            format!(
                "SELECT {STORY_COLUMNS} FROM stories ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            limit,
        )
        .await
    }

    pub async fn get_published_stories(&self, limit: usize) -> Result<Vec<Story>> {
        self.query_stories(
            format!(
                r#"SELECT {STORY_COLUMNS} FROM stories
                   WHERE status IS NULL OR status != 'draft'
                   ORDER BY created_at DESC, rowid DESC LIMIT ?1"#
            ),
            limit,
        )
        .await
    }

    async fn query_stories(&self, sql: String, limit: usize) -> Result<Vec<Story>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let stories = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let stories = stmt
                    .query_map(params![limit], story_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(stories)
            })
            .await?;
        Ok(stories)
    }

    pub async fn get_stories_by_author(&self, author_id: &str) -> Result<Vec<Story>> {
        let author_id = author_id.to_string();
        let stories = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {STORY_COLUMNS} FROM stories WHERE author_id = ?1 ORDER BY created_at DESC, rowid DESC"
                ))?;
                let stories = stmt
                    .query_map(params![author_id], story_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(stories)
            })
            .await?;
        Ok(stories)
    }

    pub async fn update_story(&self, id: &str, update: StoryUpdate) -> Result<()> {
        let story_id = id.to_string();
        let now = timestamp(Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    r#"UPDATE stories SET
                           title = COALESCE(?1, title),
                           content = COALESCE(?2, content),
                           description = COALESCE(?3, description),
                           genre = COALESCE(?4, genre),
                           status = COALESCE(?5, status),
                           updated_at = ?6
                       WHERE id = ?7"#,
                    params![
                        update.title,
                        update.content,
                        update.description,
                        update.genre,
                        update.status.map(|s| s.as_str()),
                        now,
                        story_id,
                    ],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(AppError::StoryNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Removes the story along with its comments and ratings. Returns whether
    /// the story existed.
    pub async fn delete_story(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM comments WHERE story_id = ?1", params![id])?;
                tx.execute("DELETE FROM ratings WHERE story_id = ?1", params![id])?;
                let removed = tx.execute("DELETE FROM stories WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await?;
        Ok(removed)
    }

    // Rating operations

    pub async fn set_rating(&self, rating: RatingInput) -> Result<()> {
        rating.validate()?;
        let id = new_id();
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        r#"INSERT INTO ratings ({RATING_COLUMNS})
                           VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                           ON CONFLICT(story_id, user_id) DO UPDATE SET
                               value = excluded.value,
                               updated_at = excluded.updated_at"#
                    ),
                    params![id, rating.story_id, rating.user_id, rating.value, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_rating(&self, story_id: &str, user_id: &str) -> Result<Option<Rating>> {
        let story_id = story_id.to_string();
        let user_id = user_id.to_string();
        let rating = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RATING_COLUMNS} FROM ratings WHERE story_id = ?1 AND user_id = ?2"
                ))?;
                let rating = stmt
                    .query_row(params![story_id, user_id], rating_from_row)
                    .optional()?;
                Ok(rating)
            })
            .await?;
        Ok(rating)
    }

    /// Mean of every rating on the story, recomputed from the rows each call.
    pub async fn get_average_rating(&self, story_id: &str) -> Result<f64> {
        let story_id = story_id.to_string();
        let values = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM ratings WHERE story_id = ?1")?;
                let values = stmt
                    .query_map(params![story_id], |row| row.get::<_, u8>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(values)
            })
            .await?;
        Ok(average(&values))
    }

    pub async fn get_rating_count(&self, story_id: &str) -> Result<usize> {
        let story_id = story_id.to_string();
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM ratings WHERE story_id = ?1",
                    params![story_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    // Comment operations

    pub async fn create_comment(&self, comment: CommentInput) -> Result<String> {
        let id = new_id();
        let comment_id = id.clone();
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO comments ({COMMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                    ),
                    params![
                        comment_id,
                        comment.story_id,
                        comment.user_id,
                        comment.user_name,
                        comment.user_avatar,
                        comment.text,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    /// Comments on a story, newest first.
    pub async fn get_comments(&self, story_id: &str) -> Result<Vec<Comment>> {
        let story_id = story_id.to_string();
        let comments = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COMMENT_COLUMNS} FROM comments WHERE story_id = ?1 ORDER BY created_at DESC, rowid DESC"
                ))?;
                let comments = stmt
                    .query_map(params![story_id], comment_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(comments)
            })
            .await?;
        Ok(comments)
    }

    // Profile operations

    /// Writes the whole profile document. An existing profile keeps its join
    /// date and, once set, its username.
    pub async fn create_user_profile(&self, user_id: &str, profile: NewUserProfile) -> Result<()> {
        let user_id = user_id.to_string();
        let username = normalize_username(profile.username.as_deref());
        let social_links = serde_json::to_string(&profile.social_links)?;
        let now = timestamp(Utc::now());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                if let Some(username) = &username {
                    if username_owner(&tx, username)?.is_some_and(|owner| owner != user_id) {
                        return Ok(Err(AppError::UsernameTaken));
                    }
                    if let Some(Some(current)) = current_username(&tx, &user_id)? {
                        if &current != username {
                            return Ok(Err(AppError::UsernameImmutable));
                        }
                    }
                }

                let written = tx.execute(
                    &format!(
                        r#"INSERT INTO users ({PROFILE_COLUMNS})
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                           ON CONFLICT(id) DO UPDATE SET
                               display_name = excluded.display_name,
                               username = COALESCE(users.username, excluded.username),
                               email = excluded.email,
                               bio = excluded.bio,
                               avatar = excluded.avatar,
                               website = excluded.website,
                               social_links = excluded.social_links"#
                    ),
                    params![
                        user_id,
                        profile.display_name,
                        username,
                        profile.email,
                        profile.bio,
                        profile.avatar,
                        profile.website,
                        social_links,
                        now,
                    ],
                );
                match written {
                    Err(e) if is_unique_violation(&e) => return Ok(Err(AppError::UsernameTaken)),
                    other => other?,
                };

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    pub async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let user_id = user_id.to_string();
        let profile = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {PROFILE_COLUMNS} FROM users WHERE id = ?1"))?;
                let profile = stmt.query_row(params![user_id], profile_from_row).optional()?;
                Ok(profile)
            })
            .await?;
        Ok(profile)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<UserProfile>> {
        let Some(username) = normalize_username(Some(username)) else {
            return Ok(None);
        };
        let profile = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {PROFILE_COLUMNS} FROM users WHERE username = ?1"))?;
                let profile = stmt.query_row(params![username], profile_from_row).optional()?;
                Ok(profile)
            })
            .await?;
        Ok(profile)
    }

    /// Whether `username` is free, or already held by `for_user`.
    pub async fn is_username_available(&self, username: &str, for_user: Option<&str>) -> Result<bool> {
        let Some(username) = normalize_username(Some(username)) else {
            return Ok(false);
        };
        let owner = self
            .conn
            .call(move |conn| Ok(username_owner(conn, &username)?))
            .await?;
        Ok(match owner {
            None => true,
            Some(owner) => for_user == Some(owner.as_str()),
        })
    }

    pub async fn update_user_profile(&self, user_id: &str, update: UserProfileUpdate) -> Result<()> {
        let user_id = user_id.to_string();
        let username = normalize_username(update.username.as_deref());
        let social_links = update
            .social_links
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let Some(current) = current_username(&tx, &user_id)? else {
                    return Ok(Err(AppError::ProfileNotFound(user_id)));
                };

                if let Some(username) = &username {
                    match current.as_deref() {
                        Some(current) if current != username.as_str() => {
                            return Ok(Err(AppError::UsernameImmutable));
                        }
                        Some(_) => {}
                        None => {
                            if username_owner(&tx, username)?.is_some_and(|owner| owner != user_id) {
                                return Ok(Err(AppError::UsernameTakenByAnotherUser));
                            }
                        }
                    }
                }

                let written = tx.execute(
                    r#"UPDATE users SET
                           display_name = COALESCE(?1, display_name),
                           username = COALESCE(username, ?2),
                           email = COALESCE(?3, email),
                           bio = COALESCE(?4, bio),
                           avatar = COALESCE(?5, avatar),
                           website = COALESCE(?6, website),
                           social_links = COALESCE(?7, social_links)
                       WHERE id = ?8"#,
                    params![
                        update.display_name,
                        username,
                        update.email,
                        update.bio,
                        update.avatar,
                        update.website,
                        social_links,
                        user_id,
                    ],
                );
                match written {
                    Err(e) if is_unique_violation(&e) => {
                        return Ok(Err(AppError::UsernameTakenByAnotherUser));
                    }
                    other => other?,
                };

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
    }

    // Favorite operations

    pub async fn add_favorite(&self, user_id: &str, story_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let story_id = story_id.to_string();
        let now = timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO favorite_stories (user_id, story_id, favorited_at)
                       VALUES (?1, ?2, ?3)
                       ON CONFLICT(user_id, story_id) DO UPDATE SET
                           favorited_at = excluded.favorited_at"#,
                    params![user_id, story_id, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn remove_favorite(&self, user_id: &str, story_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let story_id = story_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM favorite_stories WHERE user_id = ?1 AND story_id = ?2",
                    params![user_id, story_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn is_favorited(&self, user_id: &str, story_id: &str) -> Result<bool> {
        let user_id = user_id.to_string();
        let story_id = story_id.to_string();
        let exists = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM favorite_stories WHERE user_id = ?1 AND story_id = ?2",
                    params![user_id, story_id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?;
        Ok(exists)
    }

    /// The user's favorites, most recently favorited first.
    pub async fn get_favorites(&self, user_id: &str) -> Result<Vec<Favorite>> {
        let user_id = user_id.to_string();
        let favorites = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT story_id, favorited_at FROM favorite_stories
                       WHERE user_id = ?1
                       ORDER BY favorited_at DESC, rowid DESC"#,
                )?;
                let favorites = stmt
                    .query_map(params![user_id], favorite_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(favorites)
            })
            .await?;
        Ok(favorites)
    }

    pub async fn get_favorite_story_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .get_favorites(user_id)
            .await?
            .into_iter()
            .map(|f| f.story_id)
            .collect())
    }

    /// Resolve the user's favorites into stories with one point-read each,
    /// at most `concurrency` in flight. Order follows the favorites list;
    /// stories that no longer exist are skipped.
    pub async fn get_favorite_stories(&self, user_id: &str, concurrency: usize) -> Result<Vec<Story>> {
        let ids = self.get_favorite_story_ids(user_id).await?;

        let stories: Vec<Story> = stream::iter(ids)
            .map(|id| async move {
                match self.get_story(&id).await {
                    Ok(story) => {
                        if story.is_none() {
                            tracing::debug!("Favorite story {} no longer exists", id);
                        }
                        story
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load favorite story {}: {}", id, e);
                        None
                    }
                }
            })
            .buffered(concurrency.max(1))
            .filter_map(|story| async { story })
            .collect()
            .await;

        Ok(stories)
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fixed-width RFC 3339 so text order matches time order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn normalize_username(username: Option<&str>) -> Option<String> {
    username
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn username_owner(conn: &rusqlite::Connection, username: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM users WHERE username = ?1",
        params![username],
        |row| row.get(0),
    )
    .optional()
}

/// `None` when the profile does not exist, `Some(None)` when it has no username.
fn current_username(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> rusqlite::Result<Option<Option<String>>> {
    conn.query_row(
        "SELECT username FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56.000000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    // Millisecond epoch strings
    s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

fn required_datetime(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_datetime(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unparseable timestamp {:?}", raw).into(),
        )
    })
}

fn story_from_row(row: &Row) -> rusqlite::Result<Story> {
    let created_at = required_datetime(row, 7)?;
    Ok(Story {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        description: row.get(3)?,
        genre: row.get(4)?,
        author_id: row.get(5)?,
        author_name: row.get(6)?,
        created_at,
        updated_at: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| parse_datetime(&s))
            .unwrap_or(created_at),
        status: StoryStatus::parse(row.get::<_, Option<String>>(9)?.as_deref()),
    })
}

fn profile_from_row(row: &Row) -> rusqlite::Result<UserProfile> {
    let social_links = row
        .get::<_, Option<String>>(7)?
        .and_then(|s| serde_json::from_str::<SocialLinks>(&s).ok())
        .unwrap_or_default();
    Ok(UserProfile {
        id: row.get(0)?,
        display_name: row.get(1)?,
        username: row.get(2)?,
        email: row.get(3)?,
        bio: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        avatar: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        website: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        social_links,
        join_date: required_datetime(row, 8)?,
    })
}

fn comment_from_row(row: &Row) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        story_id: row.get(1)?,
        user_id: row.get(2)?,
        user_name: row.get(3)?,
        user_avatar: row.get(4)?,
        text: row.get(5)?,
        created_at: required_datetime(row, 6)?,
    })
}

fn rating_from_row(row: &Row) -> rusqlite::Result<Rating> {
    Ok(Rating {
        id: row.get(0)?,
        story_id: row.get(1)?,
        user_id: row.get(2)?,
        value: row.get(3)?,
        created_at: required_datetime(row, 4)?,
        updated_at: required_datetime(row, 5)?,
    })
}

fn favorite_from_row(row: &Row) -> rusqlite::Result<Favorite> {
    Ok(Favorite {
        story_id: row.get(0)?,
        favorited_at: required_datetime(row, 1)?,
    })
}
