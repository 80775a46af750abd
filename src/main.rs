/*!
 * Taskguard CLI
 *
 * Operator tooling for the dead-letter store plus config scaffolding.
 */

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use taskguard::{
    cli_style::{
        self, entries_table, print_error, print_info, print_success, section_header, stats_table,
    },
    config::{ToolkitConfig, DEFAULT_CONFIG_FILE},
    error::{EXIT_FATAL, EXIT_NOT_FOUND, EXIT_SUCCESS},
    logging,
};
use taskguard_core_dead_letter::DeadLetterStore;

#[derive(Parser)]
#[command(name = "taskguard")]
#[command(version, about = "Resilience toolkit: inspect and resolve dead-lettered tasks", long_about = None)]
struct Cli {
    /// Config file (default: ./taskguard.toml if present)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and resolve dead-lettered tasks
    #[command(subcommand)]
    Dlq(DlqCommands),

    /// Create or print configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List entries, most recently failed first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(short, long, default_value = "0")]
        offset: usize,

        /// Print one JSON object per line instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one entry as pretty JSON
    Show { task_id: String },

    /// Remove a resolved entry
    Remove { task_id: String },

    /// Number of entries in the store
    Count,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a config file with every default spelled out
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e), None);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let mut config =
        ToolkitConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.logging.verbose |= cli.verbose;

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "taskguard", &mut std::io::stdout());
            Ok(EXIT_SUCCESS)
        }
        Commands::Config(command) => handle_config_command(command, &config),
        Commands::Dlq(command) => {
            if let Err(e) = logging::init_logging(&config.logging) {
                cli_style::print_warning(&format!("Failed to initialize logging: {}", e));
            }
            config.validate().context("Invalid configuration")?;

            let runtime =
                tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(handle_dlq_command(command, &config))
        }
    }
}

fn handle_config_command(command: ConfigCommands, config: &ToolkitConfig) -> anyhow::Result<i32> {
    match command {
        ConfigCommands::Init { path, force } => {
            write_default_config(&path, force)?;
            print_success(&format!("Wrote {}", path.display()));
            Ok(EXIT_SUCCESS)
        }
        ConfigCommands::Show => {
            let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
            print!("{}", rendered);
            Ok(EXIT_SUCCESS)
        }
    }
}

fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ToolkitConfig::default()
        .to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn handle_dlq_command(command: DlqCommands, config: &ToolkitConfig) -> anyhow::Result<i32> {
    let store = DeadLetterStore::open(config.dead_letter.to_store_config())
        .await
        .with_context(|| {
            format!(
                "Failed to open dead-letter store at {}",
                config.dead_letter.path.display()
            )
        })?;

    let code = match command {
        DlqCommands::List {
            limit,
            offset,
            json,
        } => {
            let entries = store.get_entries(limit, offset).await?;
            if json {
                for entry in &entries {
                    println!("{}", serde_json::to_string(entry)?);
                }
            } else if entries.is_empty() {
                print_info("No dead-lettered tasks");
            } else {
                let total = store.count().await?;
                section_header(&format!("Dead letters ({} total)", total));
                println!("{}", entries_table(&entries));
            }
            EXIT_SUCCESS
        }
        DlqCommands::Show { task_id } => match store.get_entry(&task_id).await? {
            Some(entry) => {
                println!("{}", serde_json::to_string_pretty(&entry)?);
                EXIT_SUCCESS
            }
            None => {
                print_error(&format!("No dead-letter entry for '{}'", task_id), None);
                EXIT_NOT_FOUND
            }
        },
        DlqCommands::Remove { task_id } => {
            if store.remove_entry(&task_id).await? {
                print_success(&format!("Removed '{}'", task_id));
                EXIT_SUCCESS
            } else {
                print_error(
                    &format!("No dead-letter entry for '{}'", task_id),
                    Some("run `taskguard dlq list` to see stored tasks"),
                );
                EXIT_NOT_FOUND
            }
        }
        DlqCommands::Count => {
            let count = store.count().await?;
            let stats = store.cache_stats();
            println!(
                "{}",
                stats_table(&[
                    ("Entries", count.to_string()),
                    ("Store", config.dead_letter.path.display().to_string()),
                    ("Connections opened", stats.opened.to_string()),
                ])
            );
            EXIT_SUCCESS
        }
    };

    store.close().await;
    Ok(code)
}
