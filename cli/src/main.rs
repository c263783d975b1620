use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cloudconfig_resources::{from_addr, ResourceStore, ResourceStoreConfig};
use cloudconfig_tracing::TracingBuilder;
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    /// A global log level to use when printing logs.
    /// `RUST_LOG` always has priority.
    #[arg(long)]
    log_level: Option<Level>,

    #[arg(
        long,
        env = "CLOUDCONFIG_STORE_ADDR",
        default_value = "sqlite:///var/lib/cloudconfig/store.db"
    )]
    store_addr: String,

    /// A TOML file with the store configuration. Takes precedence over
    /// `--store-addr`.
    #[arg(long, env = "CLOUDCONFIG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prints the type and modification time of a resource.
    Get {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Writes the content of a resource to stdout.
    Cat {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Replaces the content of a resource, reading from FILE or stdin.
    Put {
        #[clap(value_name = "PATH")]
        path: String,

        #[clap(value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Lists the children of a directory.
    Ls {
        #[clap(value_name = "PATH", default_value = "")]
        path: String,
    },
    /// Creates a directory and its ancestors.
    Mkdir {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Moves a resource or directory.
    Mv {
        #[clap(value_name = "SOURCE")]
        source: String,

        #[clap(value_name = "TARGET")]
        target: String,
    },
    /// Removes a resource, or a directory with everything below it.
    Rm {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Prints the local file holding the content of a resource.
    File {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Copies a directory with everything below it to local disk and prints
    /// where.
    Dir {
        #[clap(value_name = "PATH")]
        path: String,
    },
    /// Deletes database rows below ignored directories, which are not
    /// reachable anymore.
    PurgeIgnored,
}

fn open_store(cli: &Cli) -> Result<ResourceStore, Box<dyn std::error::Error + Send + Sync>> {
    Ok(match &cli.config {
        Some(config) => {
            let config: ResourceStoreConfig = toml::from_str(&std::fs::read_to_string(config)?)?;
            config.build()?
        }
        None => from_addr(&cli.store_addr)?,
    })
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = open_store(&cli)?;

    match cli.command {
        Commands::Get { path } => {
            let resource = store.get(&path)?;
            println!(
                "{}\t{}\t{}{}",
                resource.kind(),
                resource.last_modified(),
                resource.path(),
                if resource.is_filesystem_only() {
                    "\t(local)"
                } else {
                    ""
                }
            );
        }
        Commands::Cat { path } => {
            let content = store.read(&path)?;
            io::stdout().lock().write_all(&content)?;
        }
        Commands::Put { path, file } => {
            let content = match file {
                Some(file) if file.as_os_str() != "-" => std::fs::read(file)?,
                _ => {
                    let mut content = Vec::new();
                    io::stdin().lock().read_to_end(&mut content)?;
                    content
                }
            };
            let resource = store.write(&path, &content)?;
            info!(path=%resource.path(), len=content.len(), "wrote resource");
        }
        Commands::Ls { path } => {
            for child in store.list(&path)? {
                println!("{}\t{}", child.kind(), child.name());
            }
        }
        Commands::Mkdir { path } => {
            store.mkdirs(&path)?;
        }
        Commands::Mv { source, target } => {
            if !store.rename(&source, &target)? {
                return Err(format!("unable to move {} to {}", source, target).into());
            }
        }
        Commands::Rm { path } => {
            if !store.remove(&path)? {
                info!(%path, "nothing to remove");
            }
        }
        Commands::File { path } => {
            println!("{}", store.file(&path)?.display());
        }
        Commands::Dir { path } => {
            println!("{}", store.dir(&path)?.display());
        }
        Commands::PurgeIgnored => {
            let purged = store.purge_ignored_rows()?;
            info!(purged, "purged rows below ignored directories");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .json(cli.json)
        .build()?;

    // all store operations block on sqlite and the local disk
    tokio::task::spawn_blocking(move || run(cli)).await?
}
