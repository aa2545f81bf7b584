use clap::{Parser, Subcommand};

mod commands;

/// Scheduled maintenance for try-on records and stored images
#[derive(Parser)]
#[command(name = "tryon-maintenance", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set retention expiry on tasks created without one
    Backfill(commands::JobArgs),

    /// Delete expired tasks and their stored images
    Cleanup(commands::JobArgs),

    /// Delete stored images that no record refers to
    Orphans(commands::JobArgs),

    /// Re-run tasks left in PROCESSING
    Resume(commands::JobArgs),
}

#[tokio::main]
async fn main() {
    tryon_observability::init_cli();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Backfill(args) => commands::backfill(args).await,
        Commands::Cleanup(args) => commands::cleanup(args).await,
        Commands::Orphans(args) => commands::orphans(args).await,
        Commands::Resume(args) => commands::resume(args).await,
    };

    match result {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_flag_is_per_subcommand() {
        let cli = Cli::try_parse_from(["tryon-maintenance", "orphans", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Commands::Orphans(args) if args.dry_run));

        let cli = Cli::try_parse_from(["tryon-maintenance", "cleanup"]).unwrap();
        assert!(matches!(cli.command, Commands::Cleanup(args) if !args.dry_run));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["tryon-maintenance", "vacuum"]).is_err());
    }
}
