mod comment;
mod favorite;
mod profile;
mod rating;
mod story;

pub use comment::{Comment, CommentInput};
pub use favorite::Favorite;
pub use profile::{AuthUser, NewUserProfile, ProfileForm, SocialLinks, UserProfile, UserProfileUpdate};
pub use rating::{average, Rating, RatingInput, MAX_RATING, MIN_RATING};
pub use story::{Story, StoryInput, StoryStatus, StoryUpdate};
