//! Arca server entry point.

use arca::{Config, Role, Server, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct Cli {
    config: Option<PathBuf>,
    port: Option<u16>,
    role: Option<Role>,
    dir: Option<PathBuf>,
    io_threads: Option<usize>,
    help: bool,
    version: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    if cli.help {
        print_help();
        return;
    }
    if cli.version {
        println!("arca-server {VERSION}");
        return;
    }

    let mut config = match cli.config {
        Some(ref path) => match Config::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error loading config file: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
        config.repl_port = port + 1;
    }
    if let Some(role) = cli.role {
        config.role = role;
    }
    if let Some(dir) = cli.dir {
        config.dir = dir;
    }
    if let Some(io_threads) = cli.io_threads {
        config.io_threads = io_threads;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.loglevel.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            eprintln!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run() {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli {
        config: None,
        port: None,
        role: None,
        dir: None,
        io_threads: None,
        help: false,
        version: false,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => cli.help = true,
            "-v" | "--version" => cli.version = true,
            "--config" => cli.config = Some(PathBuf::from(take_value(args, &mut i)?)),
            "--port" => {
                cli.port = Some(
                    take_value(args, &mut i)?
                        .parse()
                        .map_err(|_| "invalid --port value".to_string())?,
                )
            }
            "--role" => {
                cli.role = Some(match take_value(args, &mut i)?.as_str() {
                    "master" => Role::Master,
                    "slave" | "replica" => Role::Slave,
                    other => return Err(format!("invalid --role '{other}'")),
                })
            }
            "--dir" => cli.dir = Some(PathBuf::from(take_value(args, &mut i)?)),
            "--io-threads" => {
                cli.io_threads = Some(
                    take_value(args, &mut i)?
                        .parse()
                        .map_err(|_| "invalid --io-threads value".to_string())?,
                )
            }
            other => return Err(format!("unknown argument '{other}' (try --help)")),
        }
        i += 1;
    }
    Ok(cli)
}

fn take_value(args: &[String], i: &mut usize) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("missing value for {}", args[*i - 1]))
}

fn print_help() {
    println!(
        "arca-server {VERSION}\n\
         \n\
         USAGE:\n\
         \tarca-server [OPTIONS]\n\
         \n\
         OPTIONS:\n\
         \t--config <file>     load a directive config file\n\
         \t--port <port>       client port (replication uses port+1)\n\
         \t--role <role>       master | slave\n\
         \t--dir <path>        data directory for AOF and snapshots\n\
         \t--io-threads <n>    I/O worker threads (0 = inline)\n\
         \t-v, --version       print version\n\
         \t-h, --help          print this help"
    );
}
