//! rcc entry point: the daemon plus the management subcommands.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rcc::daemon::socket::{SockListener, DEFAULT_SOCK_PATH};
use rcc::daemon::{parse_servers_file, parse_servers_list, Daemon, DaemonSettings};
use rcc::{logging, manage};

/// Client daemon of the distributed C/C++ build cache.
#[derive(Parser)]
#[command(name = "rcc", version)]
struct Cli {
    /// Remote workers: a `;`-joined list of host:port.
    #[arg(long, env = "RCC_SERVERS")]
    servers: Option<String>,

    /// A file with one host:port per line (`#` comments). Used when
    /// --servers is not set.
    #[arg(long, env = "RCC_SERVERS_FILENAME")]
    servers_filename: Option<PathBuf>,

    /// Client id; random when omitted (every daemon run is a new client).
    #[arg(long, env = "RCC_CLIENT_ID")]
    client_id: Option<String>,

    /// Log file; stderr when omitted.
    #[arg(long, env = "RCC_LOG_FILENAME")]
    log_filename: Option<PathBuf>,

    /// Verbosity: -1 errors only, 0 info, 1 debug, 2 trace.
    #[arg(long, default_value_t = 0, env = "RCC_LOG_VERBOSITY")]
    log_verbosity: i32,

    /// Never reuse compiled objects from the workers' object caches.
    #[arg(long, env = "RCC_DISABLE_OBJ_CACHE")]
    disable_obj_cache: bool,

    /// Collect dependencies with the real preprocessor (`cxx -M`)
    /// instead of the built-in include walker. Much slower, 100% exact.
    #[arg(long, env = "RCC_DISABLE_OWN_INCLUDES")]
    disable_own_includes: bool,

    /// Parallelism of the local-compile fallback queue; 0 disables local
    /// compilation entirely. Defaults to the CPU count.
    #[arg(long, env = "RCC_LOCAL_CXX_QUEUE_SIZE")]
    local_parallelism: Option<usize>,

    /// Minutes before an in-flight invocation is force-interrupted.
    #[arg(long, default_value_t = 8, env = "RCC_FORCE_INTERRUPT_TIMEOUT")]
    force_interrupt_timeout: u64,

    /// Unix socket the wrapper connects to.
    #[arg(long, default_value = DEFAULT_SOCK_PATH, env = "RCC_SOCK")]
    sock: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (spawned by the wrapper, rarely by hand).
    Start,

    /// Print every configured worker's status and exit.
    CheckServers,

    /// Fetch every worker's log files into a directory and exit.
    DumpLogs {
        #[arg(long, default_value = "/tmp/rcc-dump-logs")]
        output_dir: PathBuf,
    },

    /// Drop the src and obj caches on every worker and exit.
    DropCaches,

    /// One-shot compile without a wrapper, for development:
    /// `rcc compile -- g++ -c main.cpp -o main.o`.
    Compile {
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

fn servers_from(cli: &Cli) -> Vec<String> {
    if let Some(joined) = &cli.servers {
        return parse_servers_list(joined);
    }
    if let Some(path) = &cli.servers_filename {
        match std::fs::read_to_string(path) {
            Ok(contents) => return parse_servers_file(&contents),
            Err(e) => {
                eprintln!("[rcc] can't read {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }
    Vec::new()
}

fn require_servers(cli: &Cli) -> Vec<String> {
    let servers = servers_from(cli);
    if servers.is_empty() {
        eprintln!("[rcc] no remote workers set; use RCC_SERVERS or RCC_SERVERS_FILENAME");
        std::process::exit(1);
    }
    servers
}

fn daemon_settings(cli: &Cli, servers: Vec<String>) -> DaemonSettings {
    DaemonSettings {
        servers,
        client_id: cli.client_id.clone(),
        disable_obj_cache: cli.disable_obj_cache,
        disable_own_includes: cli.disable_own_includes,
        local_parallelism: cli.local_parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }),
        force_interrupt_after: Duration::from_secs(cli.force_interrupt_timeout * 60),
    }
}

fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start => {
            if let Err(e) = logging::init(cli.log_filename.clone(), cli.log_verbosity) {
                // the spawning wrapper listens on our stdout for a verdict
                println!("daemon not started: {e}");
                std::process::exit(1);
            }
            let servers = servers_from(&cli);
            let daemon = Daemon::new(daemon_settings(&cli, servers));
            let sock = SockListener::new(daemon, &cli.sock);
            let listener = match sock.bind() {
                Ok(listener) => listener,
                Err(e) => {
                    println!("daemon not started: {e}");
                    std::process::exit(1);
                }
            };
            // the spawning wrapper waits for this exact line on stdout
            println!("1\0");
            sock.run(listener);
        }

        Commands::CheckServers => {
            manage::check_servers(&require_servers(&cli));
        }

        Commands::DumpLogs { output_dir } => {
            if let Err(e) = manage::dump_server_logs(&require_servers(&cli), output_dir) {
                eprintln!("[rcc] {e}");
                std::process::exit(1);
            }
        }

        Commands::DropCaches => {
            manage::drop_all_caches(&require_servers(&cli));
        }

        Commands::Compile { cmd } => {
            let _ = logging::init(cli.log_filename.clone(), cli.log_verbosity);
            let servers = require_servers(&cli);
            let daemon = Daemon::new(daemon_settings(&cli, servers));
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            let result = daemon.handle_request(cwd, cmd.clone());
            daemon.quit_gracefully("one-shot compile finished");
            use std::io::Write;
            let _ = std::io::stdout().write_all(&result.stdout);
            let _ = std::io::stderr().write_all(&result.stderr);
            std::process::exit(result.exit_code);
        }
    }
}
