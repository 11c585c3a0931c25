pub const SCHEMA: &str = r#"
-- stories collection
CREATE TABLE IF NOT EXISTS stories (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    genre TEXT NOT NULL DEFAULT '',
    author_id TEXT NOT NULL,
    author_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    status TEXT
);

CREATE INDEX IF NOT EXISTS idx_stories_created_at ON stories(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_stories_author_id ON stories(author_id);

-- users collection (profiles, keyed by auth uid)
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    username TEXT,
    email TEXT NOT NULL DEFAULT '',
    bio TEXT,
    avatar TEXT,
    website TEXT,
    social_links TEXT,
    join_date TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username ON users(username) WHERE username IS NOT NULL;

-- comments collection (append-only)
CREATE TABLE IF NOT EXISTS comments (
    id TEXT PRIMARY KEY,
    story_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    user_name TEXT NOT NULL,
    user_avatar TEXT,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_comments_story_created ON comments(story_id, created_at DESC);

-- ratings collection, one row per (story, user)
CREATE TABLE IF NOT EXISTS ratings (
    id TEXT PRIMARY KEY,
    story_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    value INTEGER NOT NULL CHECK (value BETWEEN 1 AND 5),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(story_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_ratings_story_id ON ratings(story_id);

-- favoriteStories subcollection per user
CREATE TABLE IF NOT EXISTS favorite_stories (
    user_id TEXT NOT NULL,
    story_id TEXT NOT NULL,
    favorited_at TEXT NOT NULL,
    PRIMARY KEY (user_id, story_id)
);

CREATE INDEX IF NOT EXISTS idx_favorite_stories_user ON favorite_stories(user_id, favorited_at DESC);
"#;
