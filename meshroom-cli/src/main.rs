use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use meshroom_cli::{
    profile::{
        load_profile, normalize_display_name, profile_path, save_profile_with_retry,
    },
    simulate::{self, SimulationOptions},
};
use meshroom_core::{invite_link, normalize_room_code, parse_invite};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "meshroom")]
struct MeshroomArgs {
    /// Profile file; defaults to `$MESHROOM_DATA_DIR/profile.json`.
    #[arg(long)]
    profile: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a host and several members in-process and report what they saw.
    Simulate {
        #[arg(long, default_value_t = 3)]
        peers: usize,
        /// Stop the host after the chat round and wait for re-election.
        #[arg(long, default_value_t = false)]
        crash_host: bool,
        /// Have the host ban the first member; the ban is saved to the profile.
        #[arg(long, default_value_t = false)]
        ban_first: bool,
        /// Have the host send a file of this many bytes to everyone.
        #[arg(long)]
        file_size: Option<usize>,
        #[arg(long, default_value_t = 10)]
        step_timeout_secs: u64,
    },
    /// Print the room code carried by an invite link.
    Invite { link: String },
    /// Build an invite link for a room code.
    Link {
        code: String,
        #[arg(long, default_value = "https://meshroom.app/")]
        origin: String,
    },
    /// Show or edit the saved profile.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    Show,
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        avatar: Option<String>,
        #[arg(long)]
        notifications: Option<bool>,
    },
    Unban {
        room: String,
        name: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = MeshroomArgs::parse();
    let profile_file = args.profile.unwrap_or_else(profile_path);

    let result = match args.command {
        Command::Simulate {
            peers,
            crash_host,
            ban_first,
            file_size,
            step_timeout_secs,
        } => {
            let options = SimulationOptions {
                peers,
                crash_host,
                ban_first,
                file_size,
                step_timeout: Duration::from_secs(step_timeout_secs),
            };
            run_simulation(&options, &profile_file).await
        }
        Command::Invite { link } => parse_invite(&link)
            .map(|code| println!("{code}"))
            .map_err(|err| err.to_string()),
        Command::Link { code, origin } => normalize_room_code(&code)
            .map(|code| println!("{}", invite_link(&origin, &code)))
            .map_err(|err| err.to_string()),
        Command::Profile { action } => edit_profile(&profile_file, action),
    };

    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
}

async fn run_simulation(options: &SimulationOptions, profile_file: &Path) -> Result<(), String> {
    let mut profile = load_profile(profile_file);
    let report = simulate::run(options, profile.session_config())
        .await
        .map_err(|err| err.to_string())?;
    info!(room_code = %report.room_code, "simulation report");
    println!("room:             {}", report.room_code);
    println!("chats delivered:  {}/{}", report.chats_delivered, options.peers);
    if options.file_size.is_some() {
        println!("files delivered:  {}/{}", report.files_delivered, options.peers);
    }
    println!("peers seen:       {}", report.peers_seen_by_host);
    println!("host:             {} (epoch {})", report.final_host, report.epoch);

    if let Some((room_code, bans)) = report.bans {
        println!("banned:           {}", bans.keys().cloned().collect::<Vec<_>>().join(", "));
        profile.record_bans(&room_code, bans);
        save_profile_with_retry(profile_file, &profile).map_err(|err| err.to_string())?;
    }
    Ok(())
}

fn edit_profile(path: &Path, action: ProfileAction) -> Result<(), String> {
    let mut profile = load_profile(path);
    match action {
        ProfileAction::Show => {
            let text = serde_json::to_string_pretty(&profile).map_err(|err| err.to_string())?;
            println!("{text}");
            return Ok(());
        }
        ProfileAction::Set {
            name,
            avatar,
            notifications,
        } => {
            if let Some(name) = name {
                profile.display_name = normalize_display_name(&name)
                    .ok_or_else(|| "display name must not be empty".to_owned())?;
            }
            if let Some(avatar) = avatar {
                profile.avatar = Some(avatar).filter(|a| !a.trim().is_empty());
            }
            if let Some(notifications) = notifications {
                profile.notifications = notifications;
            }
        }
        ProfileAction::Unban { room, name } => {
            if !profile.unban(&room.to_ascii_lowercase(), &name) {
                return Err(format!("{name} is not banned in room {room}"));
            }
        }
    }
    save_profile_with_retry(path, &profile).map_err(|err| err.to_string())?;
    info!(path = %path.display(), "profile saved");
    Ok(())
}
