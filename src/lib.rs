//! Story publishing backend.
//!
//! Stories, ratings, comments, user profiles and favorites persisted as
//! document collections, plus profile image storage. [`App`] is the entry
//! point; it wraps [`Repository`] and [`ImageStore`] with the error policy
//! callers rely on (reads fail soft, writes fail loud).

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod storage;
pub mod util;

pub use app::{App, StoryDetails};
pub use config::Config;
pub use db::Repository;
pub use error::{AppError, Result};
pub use storage::{ImageStore, ImageUpload, ProgressFn};
