#![forbid(unsafe_code)]

mod cmd;
mod output;

use std::env;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use opsdeck_core::ErrorCode;
use opsdeck_core::config::LogConfig;
use output::{CliError, OutputMode};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "deck: task board triage and live-stream sync tooling",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output format; defaults to pretty on a terminal, text when piped.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Alias for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    /// Config file to use instead of the per-user one.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        output::resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Board",
        about = "Classify a task snapshot",
        long_about = "Group tasks into kanban columns and review-column triage buckets.",
        after_help = "EXAMPLES:\n    # Show columns and triage counts\n    deck board tasks.json\n\n    # Only blocked review tasks\n    deck board tasks.json --filter blocked\n\n    # Emit machine-readable output\n    deck board tasks.json --format json"
    )]
    Board(cmd::board::BoardArgs),

    #[command(
        next_help_heading = "Board",
        about = "Plan a card drop",
        long_about = "Run a drag transition against a snapshot without contacting a server and show the status update it would send.",
        after_help = "EXAMPLES:\n    # Move a task to done\n    deck drop tasks.json t-17 done\n\n    # Same column is a no-op\n    deck drop tasks.json t-17 review\n\n    # Emit machine-readable output\n    deck drop tasks.json t-17 done --format json"
    )]
    Drop(cmd::drop::DropArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Run stream simulation campaigns",
        long_about = "Stream a generated event log through a faulty transport and check the merged feed against an oracle.",
        after_help = "EXAMPLES:\n    # Run 100 seeds\n    deck sim\n\n    # A server that ignores resume cursors\n    deck sim --seeds 0..20 --replay-server\n\n    # Replay one seed in detail\n    deck sim --replay 42"
    )]
    Sim(cmd::sim::SimArgs),

    #[command(
        next_help_heading = "Setup",
        about = "Show effective configuration",
        after_help = "EXAMPLES:\n    # Print config as TOML\n    deck config --format text\n\n    # Use a specific file\n    deck --config ./deck.toml config"
    )]
    Config,

    #[command(
        next_help_heading = "Setup",
        about = "Generate shell completions",
        after_help = "EXAMPLES:\n    # Bash\n    deck completions bash > ~/.local/share/bash-completion/completions/deck"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_env("OPSDECK_LOG").unwrap_or_else(|_| {
        let fallback = if env::var("DEBUG").is_ok() {
            "opsdeck=debug,info"
        } else {
            "opsdeck=info,warn"
        };
        EnvFilter::new(log.level.as_deref().unwrap_or(fallback))
    });

    let format = env::var("OPSDECK_LOG_FORMAT").unwrap_or_else(|_| log.format.clone());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let output = cli.output_mode();
    let config = match cmd::config::load(cli.config_file.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            let mut error = CliError::from(ErrorCode::ConfigParseError);
            error.message = format!("{err:#}");
            output::render_error(output, &error)?;
            return Err(err);
        }
    };
    init_tracing(&config.log);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    match cli.command {
        Commands::Board(ref args) => cmd::board::run_board(args, output),
        Commands::Drop(ref args) => cmd::drop::run_drop(args, &config, output),
        Commands::Sim(ref args) => cmd::sim::run_sim(args, output),
        Commands::Config => cmd::config::run_config(&config, cli.config_file.as_deref(), output),
        Commands::Completions(ref args) => {
            cmd::completions::run_completions(args, &mut Cli::command())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdeck_triage::{KanbanColumn, TriageBucket};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn format_flag_parses_after_subcommand() {
        let cli = Cli::parse_from(["deck", "board", "tasks.json", "--format", "json"]);
        assert_eq!(cli.format, Some(OutputMode::Json));
        assert!(cli.output_mode().is_json());
    }

    #[test]
    fn json_alias_sets_output_mode() {
        let cli = Cli::parse_from(["deck", "--json", "config"]);
        assert!(cli.json);
        assert!(cli.output_mode().is_json());
    }

    #[test]
    fn board_filter_parses_bucket_names() {
        let cli = Cli::parse_from(["deck", "board", "t.json", "--filter", "approval-needed"]);
        let Commands::Board(args) = cli.command else {
            panic!("expected board");
        };
        assert_eq!(args.filter, Some(TriageBucket::ApprovalNeeded));
    }

    #[test]
    fn drop_parses_destination_column() {
        let cli = Cli::parse_from(["deck", "drop", "t.json", "t-1", "in_progress", "--read-only"]);
        let Commands::Drop(args) = cli.command else {
            panic!("expected drop");
        };
        assert_eq!(args.task_id, "t-1");
        assert_eq!(args.column, KanbanColumn::InProgress);
        assert!(args.read_only);
    }

    #[test]
    fn drop_rejects_unknown_column() {
        assert!(Cli::try_parse_from(["deck", "drop", "t.json", "t-1", "backlog"]).is_err());
    }

    #[test]
    fn sim_seed_range_and_replay() {
        let cli = Cli::parse_from(["deck", "sim", "--seeds", "5..9", "--replay-server"]);
        let Commands::Sim(args) = cli.command else {
            panic!("expected sim");
        };
        assert_eq!(args.seeds, 5..9);
        assert!(args.replay_server);
        assert!(args.replay.is_none());

        let cli = Cli::parse_from(["deck", "sim", "--replay", "42"]);
        let Commands::Sim(args) = cli.command else {
            panic!("expected sim");
        };
        assert_eq!(args.replay, Some(42));
    }

    #[test]
    fn config_path_is_global() {
        let cli = Cli::parse_from(["deck", "config", "--config", "deck.toml"]);
        assert_eq!(cli.config_file, Some(PathBuf::from("deck.toml")));
    }
}
