//! Verdant: real-time sync client for the plant-care dashboard
//!
//! Main binary with subcommands:
//! - `watch`: Connect the push channel and log live dashboard stats
//! - `stats`: Hydrate over REST and print dashboard stats once

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verdant_sync::{
    CacheChange, ChangeKind, Comment, Credentials, SyncClient, SyncConfig, Topic,
};

#[derive(Parser)]
#[command(name = "verdant")]
#[command(about = "Real-time sync client for the Verdant plant-care dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectArgs {
    /// Push channel URL
    #[arg(long, env = "VERDANT_WS_URL", default_value = "ws://localhost:3001/ws")]
    ws_url: String,

    /// REST API base URL
    #[arg(long, env = "VERDANT_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Authenticated user id
    #[arg(long, env = "VERDANT_USER_ID")]
    user_id: String,

    /// Bearer token from the auth flow
    #[arg(long, env = "VERDANT_TOKEN", hide_env_values = true)]
    token: String,

    /// Connect timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Seconds without frames before the connection is considered lost
    #[arg(long, default_value = "90")]
    idle_timeout: u64,

    /// Failed attempts before the disconnected alert is raised
    #[arg(long, default_value = "5")]
    alert_after: u32,
}

impl ConnectArgs {
    fn config(&self) -> SyncConfig {
        SyncConfig::builder()
            .ws_url(&self.ws_url)
            .api_url(&self.api_url)
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .idle_timeout(Duration::from_secs(self.idle_timeout))
            .alert_after(self.alert_after)
            .build()
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(&self.user_id, &self.token)
    }

    fn client(&self) -> Result<SyncClient> {
        SyncClient::new(self.config(), self.credentials()).into_diagnostic()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log dashboard stats as the caches change
    Watch {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Also follow these plants (repeatable)
        #[arg(long = "plant")]
        plants: Vec<String>,

        /// Also follow weather for this location
        #[arg(long)]
        weather: Option<String>,

        /// Seconds to wait for the first connection
        #[arg(long, default_value = "30")]
        ready_timeout: u64,

        /// Minimum seconds between stats lines
        #[arg(long, default_value = "2")]
        stats_interval: u64,
    },

    /// Load caches over REST and print dashboard stats as JSON
    Stats {
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            connect,
            plants,
            weather,
            ready_timeout,
            stats_interval,
        } => {
            run_watch(
                &connect,
                plants,
                weather,
                Duration::from_secs(ready_timeout),
                Duration::from_secs(stats_interval.max(1)),
            )
            .await
        }

        Commands::Stats { connect } => run_stats(&connect).await,
    }
}

async fn run_stats(connect: &ConnectArgs) -> Result<()> {
    let client = connect.client()?;
    client.hydrate_tasks().await.into_diagnostic()?;
    client.hydrate_posts().await.into_diagnostic()?;

    let stats = serde_json::to_string_pretty(&client.stats()).into_diagnostic()?;
    println!("{stats}");
    Ok(())
}

async fn run_watch(
    connect: &ConnectArgs,
    plants: Vec<String>,
    weather: Option<String>,
    ready_timeout: Duration,
    stats_interval: Duration,
) -> Result<()> {
    let client = connect.client()?;

    let mut scope = client.scope();
    scope.subscribe(Topic::CareTasks, None);
    scope.subscribe(Topic::Community, None);
    scope.subscribe(Topic::User(connect.user_id.clone()), None);
    for plant in plants {
        scope.subscribe(Topic::Plant(plant), None);
    }
    if let Some(location) = weather {
        scope.subscribe(Topic::Weather(location), None);
    }
    info!(topics = scope.topics().len(), "subscriptions registered");

    let mut task_changes = client.tasks().subscribe();
    let mut health_changes = client.health().subscribe();
    let mut post_changes = client.community().posts().subscribe();
    let mut comment_changes = client.community().comments().subscribe();
    let mut state = client.connection().state();
    let mut alert = client.connection().alert();

    client.connect();
    match client.wait_ready(ready_timeout).await {
        Ok(()) => info!("push channel ready"),
        Err(e) => warn!(error = %e, "push channel not ready yet, continuing in background"),
    }

    // Hydration failures are not fatal; pushed events keep the caches moving.
    if let Err(e) = client.hydrate_tasks().await {
        warn!(error = %e, "failed to hydrate care tasks");
    }
    if let Err(e) = client.hydrate_posts().await {
        warn!(error = %e, "failed to hydrate community posts");
    }
    log_stats(&client)?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(stats_interval);
    let mut dirty = false;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.into_diagnostic()?;
                info!("received ctrl-c, shutting down");
                break;
            }

            change = task_changes.recv() => dirty |= observe("care-task", change),
            change = health_changes.recv() => dirty |= observe("health", change),
            change = post_changes.recv() => dirty |= observe("post", change),
            change = comment_changes.recv() => {
                if let Ok(change) = &change
                    && let Some(comment) = new_comment(&client, change)
                {
                    info!(post_id = %comment.post_id, author = %comment.author_id, "new comment");
                }
                dirty |= observe("comment", change);
            }

            Ok(()) = state.changed() => {
                info!(state = %*state.borrow_and_update(), "connection state");
            }

            Ok(()) = alert.changed() => {
                if *alert.borrow_and_update() {
                    warn!("push channel unavailable, dashboard may be stale");
                } else {
                    info!("push channel restored");
                }
            }

            _ = ticker.tick() => {
                if dirty {
                    log_stats(&client)?;
                    dirty = false;
                }
            }
        }
    }

    scope.close();
    client.shutdown().await;
    Ok(())
}

/// Returns whether the change should trigger a stats refresh.
fn observe(kind: &str, change: Result<CacheChange, broadcast::error::RecvError>) -> bool {
    match change {
        Ok(change) => {
            tracing::debug!(kind, id = %change.id, change = ?change.kind, ts = %change.timestamp, "cache changed");
            true
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(kind, skipped, "change stream lagged");
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

/// The comment a change introduced, if it added one that is still cached.
fn new_comment(client: &SyncClient, change: &CacheChange) -> Option<Comment> {
    if change.kind != ChangeKind::Created {
        return None;
    }
    client.community().comments().get(&change.id)
}

fn log_stats(client: &SyncClient) -> Result<()> {
    let stats = serde_json::to_string(&client.stats()).into_diagnostic()?;
    info!(%stats, "dashboard");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verdant_sync::{Event, EventBody, Timestamp};

    fn client() -> SyncClient {
        SyncClient::new(SyncConfig::default(), Credentials::new("me", "tok")).unwrap()
    }

    fn comment(id: &str) -> Comment {
        Comment {
            id: id.to_string(),
            post_id: "p1".to_string(),
            author_id: "friend".to_string(),
            author_name: None,
            content: "lovely variegation".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_pushed_comment_is_reported() {
        let client = client();
        let mut changes = client.community().comments().subscribe();

        client
            .dispatcher()
            .dispatch(&Event::new(Timestamp(3), EventBody::CommentAdded(comment("c1"))));

        let change = changes.try_recv().unwrap();
        let reported = new_comment(&client, &change).unwrap();
        assert_eq!(reported.post_id, "p1");
        assert_eq!(reported.author_id, "friend");
    }

    #[test]
    fn test_deleted_comment_is_not_reported() {
        let client = client();
        client.community().add_comment(comment("c1"), Timestamp(1));
        let mut changes = client.community().comments().subscribe();

        client.community().delete_post("p1", Timestamp(2));

        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Deleted);
        assert!(new_comment(&client, &change).is_none());
    }
}
