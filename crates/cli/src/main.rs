//! idsync command-line tool.
//!
//! Without a subcommand, runs one reconciliation from the identity provider
//! into the directory and prints the report. Subcommands generate and
//! validate configuration files and show the last recorded run outcomes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use console::style;
use tracing_subscriber::EnvFilter;

use idsync_core::config::AppConfig;
use idsync_core::db::Database;
use idsync_core::errors::SyncError;
use idsync_core::models::{EntityKind, RunStatus};
use idsync_core::reconcile::{Phases, Reconciler, RunOptions};
use idsync_core::render_report;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Synchronize users and groups from the identity provider into LDAP.
#[derive(Parser, Debug)]
#[command(
    name = "idsync",
    version,
    about = "Reconcile identity provider users and groups into an LDAP directory"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "idsync.toml")]
    config: PathBuf,

    /// Compute and report changes without applying them.
    #[arg(long)]
    dry_run: bool,

    /// Synchronize users only.
    #[arg(long, conflicts_with = "groups_only")]
    users_only: bool,

    /// Synchronize groups only.
    #[arg(long)]
    groups_only: bool,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn phases(&self) -> Phases {
        if self.users_only {
            Phases::UsersOnly
        } else if self.groups_only {
            Phases::GroupsOnly
        } else {
            Phases::All
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./idsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Show the last recorded outcome of each run type.
    Status,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.command.is_none() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Some(Commands::Init { output }) => cmd_init(output).map(|()| ExitCode::SUCCESS),
        Some(Commands::Validate) => cmd_validate(&cli.config).map(|()| ExitCode::SUCCESS),
        Some(Commands::Status) => cmd_status(&cli.config).map(|()| ExitCode::SUCCESS),
        None => cmd_sync(&cli).await.map(ExitCode::from),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::new(&config.database.path).context("failed to open audit database")?;
    db.initialize().context("failed to initialize audit database")?;
    Ok(db)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

/// Run one reconciliation and return the process exit code.
async fn cmd_sync(cli: &Cli) -> Result<u8> {
    let config = load_config(&cli.config)?;

    if let Err(SyncError::Disabled) = config.ensure_enabled() {
        println!("Synchronization is disabled in configuration");
        return Ok(1);
    }

    config.validate().context("invalid configuration")?;

    let options = RunOptions {
        dry_run: cli.dry_run || config.sync.dry_run,
        phases: cli.phases(),
        ..RunOptions::from_config(&config.sync)
    };

    let reconciler = Reconciler::from_config(config).context("failed to set up reconciler")?;
    let outcome = reconciler
        .run(&options)
        .await
        .context("synchronization failed")?;

    print!("{}", render_report(&outcome));
    Ok(outcome.exit_code())
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# idsync configuration

[sync]
enabled = true
dry_run = false
delete_missing_users = false
delete_missing_groups = false
interval_secs = 3600

[source]
tenant_url = "https://idcs-tenant.identity.oraclecloud.com"
client_id = "your-client-id"
client_secret_env = "IDCS_CLIENT_SECRET"
page_size = 100
timeout_secs = 30

[directory]
url = "ldap://localhost:389"
bind_dn = "cn=admin,dc=example,dc=com"
bind_password_env = "LDAP_BIND_PASSWORD"
base_dn = "dc=example,dc=com"
# user_dn = "ou=users,dc=example,dc=com"
# group_dn = "ou=groups,dc=example,dc=com"
# placeholder_member_dn = "cn=placeholder,dc=example,dc=com"
timeout_secs = 30
starttls = false

[database]
path = "idsync.db"

[logging]
level = "info"
# file = "logs/idsync.log"

[mapping]
user = "uid:userName,mail:emails[0].value,givenName:name.givenName,sn:name.familyName"
group = "cn:displayName,description:description"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your identity provider and LDAP details");
    println!("  2. Set IDCS_CLIENT_SECRET and LDAP_BIND_PASSWORD");
    println!(
        "  3. Validate with: idsync validate --config {}",
        output.display()
    );
    println!(
        "  4. Preview changes: idsync --dry-run --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let ok = style("[OK]").green();
    let warn = style("[WARN]").yellow();

    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {ok} TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    match config.require_secrets() {
        Ok(()) => println!("  {ok} Secrets resolved from environment"),
        Err(e) => println!("  {warn} {e}"),
    }

    if let Err(e) = config.validate() {
        println!("  {} Validation error: {}", style("[FAIL]").red(), e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  {ok} All required fields are valid");

    let set = |present: bool| if present { "set" } else { "NOT SET" };

    println!();
    println!("Configuration summary:");
    println!("  Sync enabled   : {}", config.sync.enabled);
    println!("  Tenant URL     : {}", config.source.tenant_url);
    println!("  Client id      : {}", config.source.client_id);
    println!("  Client secret  : {}", set(config.source.client_secret.is_some()));
    println!("  Directory URL  : {}", config.directory.url);
    println!("  Bind DN        : {}", config.directory.bind_dn);
    println!("  Bind password  : {}", set(config.directory.bind_password.is_some()));
    println!("  User base      : {}", config.directory.user_base());
    println!("  Group base     : {}", config.directory.group_base());
    println!("  User mapping   : {}", config.mapping.user.to_compact());
    println!("  Group mapping  : {}", config.mapping.group.to_compact());
    println!(
        "  Delete missing : users={} groups={}",
        config.sync.delete_missing_users, config.sync.delete_missing_groups
    );
    println!("  Interval       : {}s", config.sync.interval_secs);
    println!("  Database       : {}", config.database.path.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let db = open_database(&config)?;

    let statuses = db
        .list_run_statuses()
        .context("failed to read run statuses")?;
    let users = db
        .count_entity_snapshots(Some(EntityKind::User))
        .context("failed to count user snapshots")?;
    let groups = db
        .count_entity_snapshots(Some(EntityKind::Group))
        .context("failed to count group snapshots")?;

    println!("{}", style("idsync status").bold());
    println!();
    println!("  Users recorded  : {users}");
    println!("  Groups recorded : {groups}");
    println!();

    if statuses.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Run type", "Status", "Last run", "Mode", "Users", "Groups", "Errors",
    ]);

    for entry in &statuses {
        let record = entry
            .to_audit_record()
            .context("failed to decode run details")?;
        let status_cell = match record.status {
            RunStatus::Success => Cell::new("success").fg(Color::Green),
            RunStatus::PartialFailure => Cell::new("partial_failure").fg(Color::Yellow),
            RunStatus::Error => Cell::new("error").fg(Color::Red),
        };
        let counts = |kind: &str| {
            let c = &record.details["stats"][kind];
            if c.is_null() {
                "-".to_string()
            } else {
                format!(
                    "{}/{}/{}/{}",
                    c["processed"], c["created"], c["updated"], c["deleted"]
                )
            }
        };
        let errors = record.details["errors"]
            .as_array()
            .map(|e| e.len().to_string())
            .unwrap_or_else(|| {
                if record.details.get("error").is_some() {
                    "init".to_string()
                } else {
                    "-".to_string()
                }
            });

        table.add_row(vec![
            Cell::new(&record.sync_type),
            status_cell,
            Cell::new(record.last_sync.format("%Y-%m-%d %H:%M:%S UTC")),
            Cell::new(if entry.dry_run { "dry run" } else { "live" }),
            Cell::new(counts("users")),
            Cell::new(counts("groups")),
            Cell::new(errors),
        ]);
    }

    println!("{table}");
    println!("Counts are processed/created/updated/deleted.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_flags() {
        let cli = Cli::try_parse_from(["idsync", "--users-only"]).unwrap();
        assert_eq!(cli.phases(), Phases::UsersOnly);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["idsync", "--groups-only", "--dry-run", "-v"]).unwrap();
        assert_eq!(cli.phases(), Phases::GroupsOnly);
        assert!(cli.dry_run && cli.verbose);

        let cli = Cli::try_parse_from(["idsync"]).unwrap();
        assert_eq!(cli.phases(), Phases::All);
    }

    #[test]
    fn test_users_only_conflicts_with_groups_only() {
        assert!(Cli::try_parse_from(["idsync", "--users-only", "--groups-only"]).is_err());
    }

    #[test]
    fn test_init_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idsync.toml");
        cmd_init(&path).unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert!(config.sync.enabled);
        assert_eq!(config.mapping.user.len(), 4);

        assert!(cmd_init(&path).is_err());
    }

    #[tokio::test]
    async fn test_disabled_sync_exits_with_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idsync.toml");
        cmd_init(&path).unwrap();
        let contents = std::fs::read_to_string(&path)
            .unwrap()
            .replace("enabled = true", "enabled = false");
        std::fs::write(&path, contents).unwrap();

        let cli = Cli::try_parse_from(["idsync", "--config", path.to_str().unwrap()]).unwrap();
        let code = cmd_sync(&cli).await.unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn test_status_with_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idsync.toml");
        cmd_init(&path).unwrap();
        let db_path = dir.path().join("audit.db");
        let contents = std::fs::read_to_string(&path).unwrap().replace(
            "path = \"idsync.db\"",
            &format!("path = {:?}", db_path.display().to_string()),
        );
        std::fs::write(&path, contents).unwrap();

        cmd_status(&path).unwrap();
        assert!(db_path.exists());
    }
}
