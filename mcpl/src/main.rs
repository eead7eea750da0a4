use clap::{Args, Parser, Subcommand, ValueEnum};
use mcpline::servers::{minimal, papers};
use mcpline::settings::SettingsStore;
use mcpline_server::{McpServer, ServerConfig, StdioTransport, UnixSocketTransport};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Globals {
    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// JSON file where settings changed by tools are persisted.
    ///
    /// If not specified, settings only live as long as the process.
    #[arg(long, value_name = "FILE", env = "MCPLINE_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    /// Directory the papers server stores topics in, unless overridden by the `papers_dir`
    /// setting
    #[arg(
        long,
        value_name = "DIR",
        env = "MCPLINE_PAPERS_DIR",
        default_value = "papers",
        global = true
    )]
    papers_dir: PathBuf,

    /// Fail any tool call that runs longer than this many seconds
    #[arg(long, value_name = "SECS", env = "MCPLINE_TIMEOUT_SECS", global = true)]
    timeout_secs: Option<u64>,

    /// Longest input line, in bytes, that will be processed.  Longer lines are skipped.
    #[arg(long, value_name = "BYTES", global = true)]
    max_line_length: Option<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ServerKind {
    /// Greeting, calculator and a counter that streams progress
    Minimal,
    /// Research notebook that saves papers by topic
    Papers,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tool server, listening on stdin and responding on stdout
    /// Log events are written to stderr
    Serve {
        /// Which server to run
        server: ServerKind,

        /// Listen on the specified Unix domain socket
        ///
        /// If not specified, the default behavior is to listen on stdin and respond on stdout.
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Print a server's manifest and exit
    Manifest {
        /// Which server to describe
        server: ServerKind,
    },
}

impl Globals {
    fn server_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            call_timeout: self.timeout_secs.map(Duration::from_secs),
            max_line_length: self.max_line_length.unwrap_or(defaults.max_line_length),
            ..defaults
        }
    }

    fn settings(&self) -> anyhow::Result<SettingsStore> {
        Ok(match &self.settings {
            Some(path) => {
                debug!(path = %path.display(), "Loading settings");
                SettingsStore::load(path)?
            }
            None => SettingsStore::in_memory(),
        })
    }

    fn build_server(&self, kind: ServerKind) -> anyhow::Result<McpServer> {
        let config = self.server_config();
        let server = match kind {
            ServerKind::Minimal => minimal::server(config)?,
            ServerKind::Papers => papers::server(config, self.settings()?, &self.papers_dir)?,
        };

        Ok(server)
    }
}

impl Commands {
    async fn execute(self, globals: &Globals) -> anyhow::Result<()> {
        use Commands::*;
        match self {
            Serve { server, socket } => {
                let server = globals.build_server(server)?;

                let cancellation_token = CancellationToken::new();
                tokio::spawn({
                    let cancellation_token = cancellation_token.clone();
                    async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("Ctrl-C detected; shutting down");
                            cancellation_token.cancel();
                        }
                    }
                });

                match socket {
                    Some(path) => {
                        info!("Waiting for a connection on socket {}", path.display());
                        let mut transport = tokio::select! {
                            transport = UnixSocketTransport::bind(&path) => transport?,
                            _ = cancellation_token.cancelled() => return Ok(()),
                        };
                        transport.serve(&server, cancellation_token).await?;
                    }
                    None => {
                        info!(server = %server.manifest().name, "Listening on stdin");
                        StdioTransport::stdio()
                            .serve(&server, cancellation_token)
                            .await?;
                    }
                }
            }
            Manifest { server } => {
                let server = globals.build_server(server)?;
                println!("{}", serde_json::to_string_pretty(server.manifest())?);
            }
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Standard output is reserved for protocol lines, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = cli.command.execute(&cli.globals).await {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("command executed successfully");
        // A pending blocking read on stdin would otherwise keep the runtime from shutting down
        exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that there aren't any invalid attributes in the CLI definition that can only be
    /// detected at runtime
    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn timeout_and_line_length_reach_the_server() {
        let cli = Cli::parse_from([
            "mcpl",
            "--timeout-secs",
            "3",
            "--max-line-length",
            "64",
            "manifest",
            "minimal",
        ]);
        let config = cli.globals.server_config();

        assert_eq!(config.call_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.max_line_length, 64);
    }

    #[test]
    fn both_servers_build() {
        let cli = Cli::parse_from(["mcpl", "manifest", "papers"]);
        for kind in [ServerKind::Minimal, ServerKind::Papers] {
            let server = cli.globals.build_server(kind).unwrap();
            assert!(!server.manifest().tools.is_empty());
        }
    }
}
