use serde::Serialize;

use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{
    AuthUser, Comment, CommentInput, NewUserProfile, ProfileForm, Rating, RatingInput, Story,
    StoryInput, StoryUpdate, UserProfile, UserProfileUpdate,
};
use crate::storage::{ImageStore, ImageUpload, ProgressFn};

/// Everything a story page shows.
#[derive(Debug, Clone, Serialize)]
pub struct StoryDetails {
    pub story: Story,
    pub comments: Vec<Comment>,
    pub average_rating: f64,
    pub rating_count: usize,
    pub viewer_rating: Option<u8>,
    pub is_favorited: bool,
}

/// Service facade over the repository and image store.
///
/// Reads fail soft: an error is logged and the caller gets an empty value.
/// Writes fail loud: an error is logged and returned as
/// [`AppError::Failed`], except business errors which pass through as-is.
pub struct App {
    pub repository: Repository,
    images: ImageStore,
    story_limit: usize,
    favorites_concurrency: usize,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;
        let images = ImageStore::from_config(&config.storage)?;

        Ok(Self::with_parts(
            repository,
            images,
            config.story_limit,
            config.favorites_concurrency,
        ))
    }

    pub fn with_parts(
        repository: Repository,
        images: ImageStore,
        story_limit: usize,
        favorites_concurrency: usize,
    ) -> Self {
        Self {
            repository,
            images,
            story_limit,
            favorites_concurrency,
        }
    }

    // Stories

    pub async fn create_story(&self, story: StoryInput) -> Result<String> {
        fail_loud("create story", self.repository.create_story(story).await)
    }

    pub async fn get_story(&self, id: &str) -> Option<Story> {
        fail_soft("get story", self.repository.get_story(id).await)
    }

    /// Newest stories, drafts included. `None` uses the configured limit.
    pub async fn get_stories(&self, limit: Option<usize>) -> Vec<Story> {
        let limit = limit.unwrap_or(self.story_limit);
        fail_soft("get stories", self.repository.get_stories(limit).await)
    }

    pub async fn get_published_stories(&self, limit: Option<usize>) -> Vec<Story> {
        let limit = limit.unwrap_or(self.story_limit);
        fail_soft(
            "get published stories",
            self.repository.get_published_stories(limit).await,
        )
    }

    pub async fn get_stories_by_author(&self, author_id: &str) -> Vec<Story> {
        fail_soft(
            "get stories by author",
            self.repository.get_stories_by_author(author_id).await,
        )
    }

    pub async fn update_story(&self, id: &str, update: StoryUpdate) -> Result<()> {
        fail_loud("update story", self.repository.update_story(id, update).await)
    }

    pub async fn delete_story(&self, id: &str) -> Result<()> {
        fail_loud("delete story", self.repository.delete_story(id).await.map(|_| ()))
    }

    /// Update a story on behalf of `user`, who must be its author.
    pub async fn edit_story(&self, user: &AuthUser, id: &str, update: StoryUpdate) -> Result<()> {
        self.check_author(user, id).await?;
        self.update_story(id, update).await
    }

    /// Delete a story on behalf of `user`, who must be its author.
    pub async fn remove_story(&self, user: &AuthUser, id: &str) -> Result<()> {
        self.check_author(user, id).await?;
        self.delete_story(id).await
    }

    async fn check_author(&self, user: &AuthUser, id: &str) -> Result<()> {
        let story = fail_loud("load story", self.repository.get_story(id).await)?
            .ok_or_else(|| AppError::StoryNotFound(id.to_string()))?;
        if story.author_id != user.uid {
            tracing::warn!("User {} tried to modify story {} by {}", user.uid, id, story.author_id);
            return Err(AppError::NotAuthor {
                story_id: id.to_string(),
                user_id: user.uid.clone(),
            });
        }
        Ok(())
    }

    // Ratings

    pub async fn set_rating(&self, rating: RatingInput) -> Result<()> {
        fail_loud("set rating", self.repository.set_rating(rating).await)
    }

    pub async fn get_rating(&self, story_id: &str, user_id: &str) -> Option<Rating> {
        fail_soft("get rating", self.repository.get_rating(story_id, user_id).await)
    }

    pub async fn get_average_rating(&self, story_id: &str) -> f64 {
        fail_soft(
            "get average rating",
            self.repository.get_average_rating(story_id).await,
        )
    }

    // Comments

    pub async fn create_comment(&self, comment: CommentInput) -> Result<String> {
        fail_loud("create comment", self.repository.create_comment(comment).await)
    }

    pub async fn get_comments(&self, story_id: &str) -> Vec<Comment> {
        fail_soft("get comments", self.repository.get_comments(story_id).await)
    }

    pub async fn story_details(&self, story_id: &str, viewer: Option<&str>) -> Option<StoryDetails> {
        let story = self.get_story(story_id).await?;

        let (viewer_rating, is_favorited) = match viewer {
            Some(user_id) => (
                self.get_rating(story_id, user_id).await.map(|r| r.value),
                self.is_favorited(user_id, story_id).await,
            ),
            None => (None, false),
        };

        Some(StoryDetails {
            comments: self.get_comments(story_id).await,
            average_rating: self.get_average_rating(story_id).await,
            rating_count: fail_soft(
                "get rating count",
                self.repository.get_rating_count(story_id).await,
            ),
            viewer_rating,
            is_favorited,
            story,
        })
    }

    // Profiles

    pub async fn create_user_profile(&self, user_id: &str, profile: NewUserProfile) -> Result<()> {
        fail_loud(
            "create user profile",
            self.repository.create_user_profile(user_id, profile).await,
        )
    }

    pub async fn get_user_profile(&self, user_id: &str) -> Option<UserProfile> {
        fail_soft("get user profile", self.repository.get_user_profile(user_id).await)
    }

    pub async fn update_user_profile(&self, user_id: &str, update: UserProfileUpdate) -> Result<()> {
        fail_loud(
            "update user profile",
            self.repository.update_user_profile(user_id, update).await,
        )
    }

    pub async fn is_username_available(&self, username: &str, for_user: Option<&str>) -> bool {
        fail_soft(
            "check username",
            self.repository.is_username_available(username, for_user).await,
        )
    }

    /// Load the user's profile, creating it from the auth identity on first use.
    pub async fn ensure_user_profile(&self, user: &AuthUser) -> Result<UserProfile> {
        if let Some(profile) = fail_loud("load user profile", self.repository.get_user_profile(&user.uid).await)? {
            return Ok(profile);
        }

        tracing::info!("Creating profile for {}", user.uid);
        self.create_user_profile(&user.uid, NewUserProfile::from(user)).await?;
        self.reload_profile(&user.uid).await
    }

    /// Apply a profile form: update the stored profile if there is one,
    /// otherwise create it. Returns the profile as stored.
    pub async fn save_user_profile(&self, user: &AuthUser, form: ProfileForm) -> Result<UserProfile> {
        let existing = fail_loud("load user profile", self.repository.get_user_profile(&user.uid).await)?;
        let profile = form.into_profile(user, existing.as_ref());

        if existing.is_some() {
            self.update_user_profile(&user.uid, profile.into()).await?;
        } else {
            self.create_user_profile(&user.uid, profile).await?;
        }

        self.reload_profile(&user.uid).await
    }

    async fn reload_profile(&self, user_id: &str) -> Result<UserProfile> {
        fail_loud("load user profile", self.repository.get_user_profile(user_id).await)?
            .ok_or_else(|| AppError::ProfileNotFound(user_id.to_string()))
    }

    // Favorites

    pub async fn add_favorite(&self, user_id: &str, story_id: &str) -> Result<()> {
        fail_loud("add favorite", self.repository.add_favorite(user_id, story_id).await)
    }

    pub async fn remove_favorite(&self, user_id: &str, story_id: &str) -> Result<()> {
        fail_loud(
            "remove favorite",
            self.repository.remove_favorite(user_id, story_id).await,
        )
    }

    pub async fn is_favorited(&self, user_id: &str, story_id: &str) -> bool {
        fail_soft("check favorite", self.repository.is_favorited(user_id, story_id).await)
    }

    /// Flip the favorite and return the new state.
    pub async fn toggle_favorite(&self, user_id: &str, story_id: &str) -> Result<bool> {
        let favorited = fail_loud(
            "toggle favorite",
            self.repository.is_favorited(user_id, story_id).await,
        )?;
        if favorited {
            self.remove_favorite(user_id, story_id).await?;
        } else {
            self.add_favorite(user_id, story_id).await?;
        }
        Ok(!favorited)
    }

    pub async fn get_favorite_stories(&self, user_id: &str) -> Vec<Story> {
        fail_soft(
            "get favorite stories",
            self.repository
                .get_favorite_stories(user_id, self.favorites_concurrency)
                .await,
        )
    }

    // Profile images

    pub async fn upload_profile_image(
        &self,
        user_id: &str,
        upload: ImageUpload,
        on_progress: Option<ProgressFn>,
    ) -> Result<String> {
        fail_loud(
            "upload profile image",
            self.images.upload_profile_image(user_id, upload, on_progress).await,
        )
    }

    pub async fn delete_profile_image(&self, image_url: &str) -> Result<()> {
        fail_loud(
            "delete profile image",
            self.images.delete_profile_image(image_url).await,
        )
    }

    /// Upload a new avatar, point the profile at it and drop the previous
    /// image if this store held it.
    pub async fn change_profile_image(
        &self,
        user: &AuthUser,
        upload: ImageUpload,
        on_progress: Option<ProgressFn>,
    ) -> Result<String> {
        let profile = self.ensure_user_profile(user).await?;
        let url = self.upload_profile_image(&user.uid, upload, on_progress).await?;

        let saved = self
            .update_user_profile(
                &user.uid,
                UserProfileUpdate {
                    avatar: Some(url.clone()),
                    ..Default::default()
                },
            )
            .await;

        if let Err(e) = saved {
            if let Err(cleanup) = self.images.delete_profile_image(&url).await {
                tracing::warn!("Failed to delete unused profile image {}: {}", url, cleanup);
            }
            return Err(e);
        }

        let old = profile.avatar;
        if !old.is_empty() && old != url && self.images.owns_url(&old) {
            if let Err(e) = self.images.delete_profile_image(&old).await {
                tracing::warn!("Failed to delete previous profile image {}: {}", old, e);
            }
        }

        Ok(url)
    }
}

fn fail_soft<T: Default>(what: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        tracing::error!("Error trying to {}: {}", what, e);
        T::default()
    })
}

fn fail_loud<T>(action: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        if e.is_business() {
            e
        } else {
            tracing::error!("Error trying to {}: {}", action, e);
            AppError::Failed {
                action,
                source: Box::new(e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::models::StoryStatus;
    use crate::storage::LocalImageStore;

    async fn app(dir: &tempfile::TempDir) -> App {
        let repository = Repository::new(":memory:").await.unwrap();
        let images = ImageStore::Local(LocalImageStore::new(dir.path(), "http://localhost/storage"));
        App::with_parts(repository, images, 50, 4)
    }

    fn user(uid: &str) -> AuthUser {
        AuthUser {
            uid: uid.to_string(),
            display_name: Some(format!("{uid} display")),
            email: Some(format!("{uid}@example.com")),
            photo_url: None,
        }
    }

    fn story_by(author: &str) -> StoryInput {
        StoryInput {
            title: "Tale".to_string(),
            content: "Once upon a time".to_string(),
            description: "A tale".to_string(),
            genre: "fable".to_string(),
            author_id: author.to_string(),
            author_name: author.to_string(),
            status: StoryStatus::Published,
        }
    }

    #[tokio::test]
    async fn reads_fail_soft() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        app.repository
            .execute_batch("DROP TABLE comments; DROP TABLE ratings; DROP TABLE stories;")
            .await
            .unwrap();

        assert!(app.get_comments("s1").await.is_empty());
        assert_eq!(app.get_average_rating("s1").await, 0.0);
        assert!(app.get_story("s1").await.is_none());
        assert!(app.get_stories(None).await.is_empty());
    }

    #[tokio::test]
    async fn writes_fail_loud() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        app.repository.execute_batch("DROP TABLE stories;").await.unwrap();

        let err = assert_err!(app.create_story(story_by("a")).await);
        assert_eq!(err.to_string(), "Failed to create story");

        let err = assert_err!(app.delete_profile_image("https://elsewhere.example/x.png").await);
        assert_eq!(err.to_string(), "Failed to delete profile image");
    }

    #[tokio::test]
    async fn business_errors_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let err = assert_err!(
            app.set_rating(RatingInput {
                story_id: "s".to_string(),
                user_id: "u".to_string(),
                value: 0,
            })
            .await
        );
        assert!(matches!(err, AppError::InvalidRating(0)));

        assert_ok!(
            app.save_user_profile(
                &user("u1"),
                ProfileForm {
                    username: "ada".to_string(),
                    ..Default::default()
                },
            )
            .await
        );
        let err = assert_err!(
            app.save_user_profile(
                &user("u2"),
                ProfileForm {
                    username: "ada".to_string(),
                    ..Default::default()
                },
            )
            .await
        );
        assert!(err.is_username_conflict());
    }

    #[tokio::test]
    async fn only_author_edits_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        let id = app.create_story(story_by("alice")).await.unwrap();

        let update = StoryUpdate {
            content: Some("edited".to_string()),
            ..Default::default()
        };
        let err = assert_err!(app.edit_story(&user("mallory"), &id, update.clone()).await);
        assert!(matches!(err, AppError::NotAuthor { .. }));
        assert_err!(app.remove_story(&user("mallory"), &id).await);

        assert_ok!(app.edit_story(&user("alice"), &id, update).await);
        assert_eq!(app.get_story(&id).await.unwrap().content, "edited");

        assert_ok!(app.remove_story(&user("alice"), &id).await);
        assert!(app.get_story(&id).await.is_none());

        let err = assert_err!(app.remove_story(&user("alice"), &id).await);
        assert!(matches!(err, AppError::StoryNotFound(_)));
    }

    #[tokio::test]
    async fn profile_created_lazily_then_saved() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        let ada = user("u1");

        assert!(app.get_user_profile("u1").await.is_none());
        let created = app.ensure_user_profile(&ada).await.unwrap();
        assert_eq!(created.display_name, "u1 display");
        assert_eq!(created.email, "u1@example.com");

        let again = app.ensure_user_profile(&ada).await.unwrap();
        assert_eq!(again.join_date, created.join_date);

        let saved = app
            .save_user_profile(
                &ada,
                ProfileForm {
                    display_name: "Ada".to_string(),
                    username: "ada".to_string(),
                    bio: "Poetical science".to_string(),
                    twitter: "ada".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(saved.display_name, "Ada");
        assert_eq!(saved.username.as_deref(), Some("ada"));
        assert_eq!(saved.social_links.twitter.as_deref(), Some("ada"));
        assert!(!app.is_username_available("ada", Some("u2")).await);

        let err = assert_err!(
            app.save_user_profile(
                &ada,
                ProfileForm {
                    username: "lovelace".to_string(),
                    ..Default::default()
                },
            )
            .await
        );
        assert!(matches!(err, AppError::UsernameImmutable));
    }

    #[tokio::test]
    async fn toggle_favorite_and_details() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        let id = app.create_story(story_by("alice")).await.unwrap();

        assert!(app.toggle_favorite("bob", &id).await.unwrap());
        assert!(app.is_favorited("bob", &id).await);
        assert_eq!(app.get_favorite_stories("bob").await.len(), 1);

        app.set_rating(RatingInput {
            story_id: id.clone(),
            user_id: "bob".to_string(),
            value: 4,
        })
        .await
        .unwrap();
        app.create_comment(CommentInput {
            story_id: id.clone(),
            user_id: "bob".to_string(),
            user_name: "Bob".to_string(),
            user_avatar: None,
            text: "Lovely".to_string(),
        })
        .await
        .unwrap();

        let details = app.story_details(&id, Some("bob")).await.unwrap();
        assert_eq!(details.viewer_rating, Some(4));
        assert_eq!(details.average_rating, 4.0);
        assert_eq!(details.rating_count, 1);
        assert_eq!(details.comments.len(), 1);
        assert!(details.is_favorited);

        let anonymous = app.story_details(&id, None).await.unwrap();
        assert_eq!(anonymous.viewer_rating, None);
        assert!(!anonymous.is_favorited);

        assert!(!app.toggle_favorite("bob", &id).await.unwrap());
        assert!(!app.is_favorited("bob", &id).await);
        assert!(app.story_details("missing", None).await.is_none());
    }

    #[tokio::test]
    async fn changing_avatar_replaces_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        let ada = user("u1");

        let upload = |name: &str| ImageUpload {
            file_name: name.to_string(),
            data: vec![1, 2, 3],
        };

        let first = app.change_profile_image(&ada, upload("a.png"), None).await.unwrap();
        let first_path = dir.path().join(crate::storage::path_from_url(&first).unwrap());
        assert!(first_path.exists());

        // Ensure a distinct millisecond timestamp in the object name.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let second = app.change_profile_image(&ada, upload("b.jpg"), None).await.unwrap();
        assert_ne!(first, second);
        assert!(!first_path.exists());

        let profile = app.get_user_profile("u1").await.unwrap();
        assert_eq!(profile.avatar, second);
    }

    #[tokio::test]
    async fn explicit_limit_overrides_configured_one() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Repository::new(":memory:").await.unwrap();
        let images = ImageStore::Local(LocalImageStore::new(dir.path(), "http://localhost/storage"));
        let app = App::with_parts(repository, images, 2, 4);

        for _ in 0..3 {
            app.create_story(story_by("alice")).await.unwrap();
        }
        app.create_story(StoryInput {
            status: StoryStatus::Draft,
            ..story_by("alice")
        })
        .await
        .unwrap();

        assert_eq!(app.get_stories(None).await.len(), 2);
        let everything = app.get_stories(Some(10)).await;
        assert_eq!(everything.len(), 4);
        assert_eq!(everything.iter().filter(|s| !s.is_published()).count(), 1);
        assert_eq!(app.get_published_stories(Some(10)).await.len(), 3);
        assert_eq!(app.get_published_stories(Some(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_avatar_save_removes_new_upload() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;
        let ada = user("u1");
        app.ensure_user_profile(&ada).await.unwrap();

        app.repository
            .execute_batch(
                "CREATE TRIGGER users_locked BEFORE UPDATE ON users \
                 BEGIN SELECT RAISE(ABORT, 'locked'); END;",
            )
            .await
            .unwrap();

        let upload = ImageUpload {
            file_name: "a.png".to_string(),
            data: vec![1, 2, 3],
        };
        let err = assert_err!(app.change_profile_image(&ada, upload, None).await);
        assert_eq!(err.to_string(), "Failed to update user profile");

        let images = dir.path().join(crate::storage::PROFILE_IMAGE_DIR);
        let mut left = tokio::fs::read_dir(&images).await.unwrap();
        assert!(left.next_entry().await.unwrap().is_none());

        let profile = app.get_user_profile("u1").await.unwrap();
        assert!(profile.avatar.is_empty());
    }
}
