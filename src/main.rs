use std::path::PathBuf;
use std::sync::Arc;

use storyshelf::models::{AuthUser, Story};
use storyshelf::util::{excerpt, format_date};
use storyshelf::{App, Config, ImageUpload, ProgressFn, Result};

const USAGE: &str = "usage: storyshelf <command>

commands:
  list [--all] [limit]           newest published stories (--all includes drafts)
  show <story-id> [viewer-id]    a story with its comments and ratings
  author <user-id>               stories written by a user
  favorites <user-id>            a user's favorite stories
  upload-avatar <user-id> <file> upload a new profile image
  delete-image <url>             delete a stored profile image";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (info and above by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let arg = |i: usize| args.get(i).map(String::as_str);

    // Load configuration
    let config = Config::load()?;
    let app = App::new(&config).await?;

    match (arg(1), arg(2), arg(3)) {
        (Some("list"), first, second) => {
            let all = first == Some("--all");
            let limit = match if all { second } else { first } {
                Some(raw) => match raw.parse::<usize>() {
                    Ok(limit) => Some(limit),
                    Err(_) => {
                        eprintln!("{}", USAGE);
                        return Err(anyhow::anyhow!("invalid limit: {}", raw).into());
                    }
                },
                None => None,
            };

            let stories = if all {
                app.get_stories(limit).await
            } else {
                app.get_published_stories(limit).await
            };
            print_stories(&stories);
        }

        (Some("show"), Some(story_id), viewer) => {
            let Some(details) = app.story_details(story_id, viewer).await else {
                println!("Story {} not found", story_id);
                return Ok(());
            };
            let story = &details.story;
            println!("{} ({})", story.title, story.status.as_str());
            println!("by {} · {} · {}", story.author_name, story.genre, format_date(story.created_at));
            println!(
                "rating {:.1} from {} reader(s){}",
                details.average_rating,
                details.rating_count,
                details
                    .viewer_rating
                    .map(|v| format!(", yours: {}", v))
                    .unwrap_or_default()
            );
            if details.is_favorited {
                println!("★ in your favorites");
            }
            println!("\n{}\n", story.content);
            println!("{} comment(s)", details.comments.len());
            for comment in &details.comments {
                println!("  {} ({}): {}", comment.user_name, format_date(comment.created_at), comment.text);
            }
        }

        (Some("author"), Some(user_id), _) => {
            print_stories(&app.get_stories_by_author(user_id).await);
        }

        (Some("favorites"), Some(user_id), _) => {
            print_stories(&app.get_favorite_stories(user_id).await);
        }

        (Some("upload-avatar"), Some(user_id), Some(file)) => {
            let path = PathBuf::from(file);
            let data = tokio::fs::read(&path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file.to_string());

            let progress: ProgressFn = Arc::new(|p| eprint!("\rUploading... {:>3.0}%", p));
            let user = AuthUser {
                uid: user_id.to_string(),
                ..Default::default()
            };
            let url = app
                .change_profile_image(&user, ImageUpload { file_name, data }, Some(progress))
                .await?;
            eprintln!();
            println!("{}", url);
        }

        (Some("delete-image"), Some(url), _) => {
            app.delete_profile_image(url).await?;
            println!("Deleted {}", url);
        }

        _ => {
            eprintln!("{}", USAGE);
            return Err(anyhow::anyhow!("unrecognized command").into());
        }
    }

    Ok(())
}

fn print_stories(stories: &[Story]) {
    if stories.is_empty() {
        println!("No stories yet");
        return;
    }
    for story in stories {
        let draft = if story.is_published() { "" } else { " (draft)" };
        println!(
            "{}  {}{} by {} [{}] {}",
            story.id,
            story.title,
            draft,
            story.author_name,
            story.genre,
            format_date(story.created_at)
        );
        if !story.description.is_empty() {
            println!("    {}", excerpt(&story.description, 100));
        }
    }
}
