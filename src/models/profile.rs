use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub username: Option<String>,
    pub email: String,
    pub bio: String,
    pub avatar: String,
    pub website: String,
    pub social_links: SocialLinks,
    pub join_date: DateTime<Utc>,
}

/// Full profile document written on creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUserProfile {
    pub display_name: String,
    pub username: Option<String>,
    pub email: String,
    pub bio: String,
    pub avatar: String,
    pub website: String,
    pub social_links: SocialLinks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfileUpdate {
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub website: Option<String>,
    pub social_links: Option<SocialLinks>,
}

impl From<NewUserProfile> for UserProfileUpdate {
    fn from(p: NewUserProfile) -> Self {
        Self {
            display_name: Some(p.display_name),
            username: p.username,
            email: Some(p.email),
            bio: Some(p.bio),
            avatar: Some(p.avatar),
            website: Some(p.website),
            social_links: Some(p.social_links),
        }
    }
}

/// Identity handed over by the external auth provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthUser {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

/// Flat profile edit form as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileForm {
    pub display_name: String,
    pub username: String,
    pub avatar: String,
    pub bio: String,
    pub website: String,
    pub twitter: String,
    pub github: String,
    pub linkedin: String,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl ProfileForm {
    /// Resolve the form into a full profile document, falling back to the
    /// stored profile and then to the auth identity for blank fields.
    pub fn into_profile(self, user: &AuthUser, existing: Option<&UserProfile>) -> NewUserProfile {
        let display_name = non_empty(&self.display_name)
            .or_else(|| user.display_name.as_deref().and_then(non_empty))
            .unwrap_or_else(|| "User".to_string());

        let avatar = non_empty(&self.avatar)
            .or_else(|| existing.and_then(|p| non_empty(&p.avatar)))
            .or_else(|| user.photo_url.as_deref().and_then(non_empty))
            .unwrap_or_default();

        NewUserProfile {
            display_name,
            username: non_empty(&self.username),
            email: user.email.clone().unwrap_or_default(),
            bio: self.bio,
            avatar,
            website: self.website,
            social_links: SocialLinks {
                twitter: non_empty(&self.twitter),
                github: non_empty(&self.github),
                linkedin: non_empty(&self.linkedin),
                website: None,
            },
        }
    }
}

impl From<&AuthUser> for NewUserProfile {
    fn from(user: &AuthUser) -> Self {
        Self {
            display_name: user
                .display_name
                .clone()
                .unwrap_or_else(|| "User".to_string()),
            email: user.email.clone().unwrap_or_default(),
            avatar: user.photo_url.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}
