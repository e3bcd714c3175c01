use clap::{Parser, Subcommand};
use ki::paths;
use ki::sync;

/// Version control for Anki collections
#[derive(Debug, Parser)]
#[command(name = "ki", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clone an Anki collection into a directory
    #[command(arg_required_else_help = true)]
    Clone {
        /// Path to the collection file
        collection: String,
        /// Target directory (defaults to the collection filename stem)
        directory: Option<String>,
    },
    /// Pull changes made in the collection database into the working copy
    Pull,
    /// Push working-copy changes into the collection database
    Push,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Clone {
            collection,
            directory,
        } => {
            sync::clone(&collection, directory.as_deref()).await?;
        }
        Commands::Pull => {
            let cwd = paths::current_dir()?;
            sync::pull(&cwd).await?;
        }
        Commands::Push => {
            let cwd = paths::current_dir()?;
            sync::push(&cwd).await?;
        }
    }
    Ok(())
}
