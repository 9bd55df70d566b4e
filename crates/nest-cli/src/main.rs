// ABOUTME: nest CLI entry point.
// ABOUTME: Provides udp, radio, and swarm subcommands dispatching into the swarm runner.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nest_config::{Mode, Settings};
use nest_swarm::{Runner, RunnerEvent};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nest")]
#[command(about = "Multi-agent control over UDP and radio links")]
#[command(version)]
struct Cli {
    /// Path to settings file (defaults to ~/.config/nest/nest.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Load and validate settings without touching hardware
    #[arg(long, global = true)]
    dry_run: bool,

    /// Override log level (e.g. info, debug)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to agents over the UDP socket
    Udp,
    /// Connect over a radio link using a channel key (e.g. 7, 8, 9)
    Radio {
        /// Radio channel key mapped to a device in device_by_channel
        channel: String,
    },
    /// Coordinate a swarm over the UDP socket plus one radio link per channel
    Swarm {
        /// Radio channel keys (e.g. 7 8 9)
        #[arg(required = true)]
        channels: Vec<String>,
    },
}

fn build_settings(cli: &Cli) -> Result<Settings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(Settings::default_path);

    let mut settings = if path.exists() {
        Settings::load(&path)?
    } else {
        tracing::debug!(path = %path.display(), "No settings file, using defaults");
        Settings::default()
    };
    settings.apply_env_overrides()?;

    match &cli.command {
        Commands::Udp => {
            settings.mode = Mode::Udp;
        }
        Commands::Radio { channel } => {
            settings.mode = Mode::Radio;
            let device = settings.resolve_channel(channel)?;
            settings.radio_device_paths = vec![device];
        }
        Commands::Swarm { channels } => {
            settings.mode = Mode::Swarm;
            let devices: Result<Vec<String>, _> = channels
                .iter()
                .map(|c| settings.resolve_channel(c))
                .collect();
            settings.radio_device_paths = devices?;
        }
    }

    if let Some(ref level) = cli.log_level {
        settings.log_level = level.clone();
    }
    // Flags only layer on top; an absent flag keeps the file's value
    if cli.dry_run {
        settings.dry_run = true;
    }
    settings.validate()?;
    Ok(settings)
}

/// Forward runner events to the log so operators see losses and failures.
fn spawn_event_logger(runner: &Runner) {
    let mut events = runner.subscribe_events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RunnerEvent::AgentSeen { agent, kind } => {
                    tracing::info!(agent = %agent, %kind, "Agent seen");
                }
                RunnerEvent::AgentLost { agent } => {
                    tracing::warn!(agent = %agent, "Agent lost");
                }
                RunnerEvent::DeliveryFailed { agent, seq, reason } => {
                    tracing::warn!(agent = %agent, seq, reason = %reason, "Delivery failed");
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let settings = build_settings(&cli)?;
    nest_log::init_with_level(&settings.log_level);

    // Always snapshot the resolved settings for reproducibility
    let snapshot_dir = settings.logs_dir_expanded();
    nest_config::write_settings_snapshot(&settings, &snapshot_dir)
        .context("Failed to write settings snapshot")?;

    if settings.dry_run {
        tracing::info!(mode = %settings.mode, "Dry run: settings validated, skipping hardware");
        return Ok(());
    }

    let runner = Runner::start(&settings)
        .await
        .context("Failed to start runner")?;
    spawn_event_logger(&runner);

    tracing::info!(mode = %settings.mode, "Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    runner.stop().await.context("Runner did not stop cleanly")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_udp_mode_from_subcommand() {
        let cli = Cli::parse_from(["nest", "udp"]);
        assert!(matches!(cli.command, Commands::Udp));
    }

    #[test]
    fn test_radio_requires_channel() {
        assert!(Cli::try_parse_from(["nest", "radio"]).is_err());
        let cli = Cli::parse_from(["nest", "radio", "7"]);
        match cli.command {
            Commands::Radio { channel } => assert_eq!(channel, "7"),
            _ => panic!("expected radio subcommand"),
        }
    }

    #[test]
    fn test_swarm_takes_multiple_channels() {
        let cli = Cli::parse_from(["nest", "swarm", "7", "8", "9"]);
        match cli.command {
            Commands::Swarm { channels } => assert_eq!(channels, vec!["7", "8", "9"]),
            _ => panic!("expected swarm subcommand"),
        }
        assert!(Cli::try_parse_from(["nest", "swarm"]).is_err());
    }

    #[test]
    fn test_build_settings_resolves_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nest.toml");
        std::fs::write(
            &path,
            r#"
            [device_by_channel]
            "7" = "/dev/ttyUSB0"
            "8" = "/dev/ttyUSB1"
        "#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "nest",
            "--config",
            path.to_str().unwrap(),
            "swarm",
            "7",
            "8",
        ]);
        let settings = build_settings(&cli).unwrap();
        assert_eq!(settings.mode, Mode::Swarm);
        assert_eq!(
            settings.radio_device_paths,
            vec!["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()]
        );
    }

    #[test]
    fn test_build_settings_rejects_unknown_channel() {
        let cli = Cli::parse_from(["nest", "radio", "99"]);
        assert!(build_settings(&cli).is_err());
    }

    #[test]
    fn test_dry_run_flag_carries_into_settings() {
        let cli = Cli::parse_from(["nest", "--dry-run", "udp"]);
        let settings = build_settings(&cli).unwrap();
        assert!(settings.dry_run);
        assert_eq!(settings.mode, Mode::Udp);
    }

    #[test]
    fn test_absent_dry_run_flag_keeps_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nest.toml");
        std::fs::write(&path, "dry_run = true\n").unwrap();

        let cli = Cli::parse_from(["nest", "--config", path.to_str().unwrap(), "udp"]);
        let settings = build_settings(&cli).unwrap();
        assert!(settings.dry_run, "file-configured dry_run survives without the flag");
    }
}
