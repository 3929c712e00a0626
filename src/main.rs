use anyhow::{Context, Result};
use clap::Parser;
use datasockets::schema::{self, TemplateKind, TemplateNode};
use datasockets::session::Participant;
use datasockets::{Color, DataOptions, DataSockets, Player, Pose, Roster, Vec3};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "datasockets")]
#[command(about = "Simulates players joining and leaving a server with persistent data")]
struct Cli {
    /// Number of simulated players
    #[arg(long, default_value_t = 3)]
    players: u64,

    /// How many times every player joins and leaves
    #[arg(long, default_value_t = 2)]
    sessions: u32,

    /// Account age of every simulated player, in days
    #[arg(long, default_value_t = 30)]
    account_age: u32,

    /// JSON template (array of value nodes) for the default record shape
    #[arg(long)]
    template: Option<PathBuf>,

    /// Keep records as JSON files in this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON options file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn default_template() -> Vec<TemplateNode> {
    vec![
        TemplateNode::new("loginAmount", TemplateKind::IntValue(0)),
        TemplateNode::new("Title", TemplateKind::StringValue("Newcomer".to_string())),
        TemplateNode::new("Tint", TemplateKind::Color3Value(Color::new(0.2, 0.6, 1.0))),
        TemplateNode::new(
            "Spawn",
            TemplateKind::CFrameValue(Pose::at(Vec3::new(0.0, 5.0, 0.0))),
        ),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => DataOptions::from_json_file(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => DataOptions::default(),
    };
    if let Some(dir) = &cli.data_dir {
        options = options.data_dir(dir);
    }
    let structure = match &cli.template {
        Some(path) => schema::load_template(path)?,
        None => default_template(),
    };

    let sockets = DataSockets::import_network(options, &structure, &[])?;

    sockets.constructed().connect(|constructed| {
        let logins = constructed
            .record
            .get("loginAmount")
            .and_then(|value| value.as_i64())
            .unwrap_or(0);
        if let Err(err) = constructed.record.set("loginAmount", logins + 1) {
            warn!("Could not count login: {}", err);
        }
    });
    sockets.changed().connect(|changed| {
        info!(
            "{} changed {} to {}",
            changed.participant.display_name(),
            changed.path.join("."),
            changed.value
        );
    });

    let roster = Arc::new(Roster::new());
    let listener = sockets.listen_for_players(roster.clone());

    for round in 1..=cli.sessions {
        info!("Session round {}", round);
        let players: Vec<Arc<Player>> = (1..=cli.players)
            .map(|id| Player::shared(id, &format!("Player{}", id), cli.account_age))
            .collect();
        for player in &players {
            roster.join(player.clone());
        }

        for player in &players {
            match sockets.request_record(player.clone()).await? {
                Some(record) => info!(
                    "{} loaded (logins: {})",
                    player.display_name(),
                    record
                        .get("loginAmount")
                        .map(|value| value.to_string())
                        .unwrap_or_default()
                ),
                None => info!(
                    "{} has no data: {}",
                    player.display_name(),
                    player.kick_messages().join("; ")
                ),
            }
        }

        for player in &players {
            roster.leave(player.user_id());
        }
        for player in &players {
            while sockets.has_session(player.user_id()).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    sockets.shutdown().await;
    listener.abort();
    info!("Done");
    Ok(())
}
