//! kvbridge - command-line client
//!
//! Connects to the backend, runs one or more commands over the gateway and
//! prints the decoded replies. Commands are separated by a lone `,` so that
//! cursor commands can share one session connection within a single run.

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use kvbridge::gateway::{Gateway, GatewayConfig, Route, Timeouts};
use kvbridge::protocol::Request;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Client configuration
struct Config {
    /// Backend host
    host: String,
    /// Backend port
    port: u16,
    /// Session id; commands go over the pool when absent
    session: Option<String>,
    /// Per-operation timeout
    timeout: Duration,
    /// Pool size
    pool_size: usize,
    /// Command words, split on `,`
    commands: Vec<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: kvbridge::DEFAULT_HOST.to_string(),
            port: kvbridge::DEFAULT_PORT,
            session: None,
            timeout: Duration::from_secs(5),
            pool_size: 1,
            commands: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();
        let mut words = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host").to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--session" | "-s" => {
                    config.session = Some(value_of(&args, i, "--session").to_string());
                    i += 2;
                }
                "--timeout" | "-t" => {
                    let secs: f64 = value_of(&args, i, "--timeout").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid timeout");
                        std::process::exit(1);
                    });
                    config.timeout = Duration::from_secs_f64(secs.max(0.0));
                    i += 2;
                }
                "--pool-size" => {
                    config.pool_size = value_of(&args, i, "--pool-size")
                        .parse()
                        .unwrap_or_else(|_| {
                            eprintln!("Error: invalid pool size");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("kvbridge version {}", kvbridge::VERSION);
                    std::process::exit(0);
                }
                "," => {
                    if !words.is_empty() {
                        config.commands.push(std::mem::take(&mut words));
                    }
                    i += 1;
                }
                word => {
                    words.push(word.to_string());
                    i += 1;
                }
            }
        }
        if !words.is_empty() {
            config.commands.push(words);
        }

        if config.commands.is_empty() {
            print_help();
            std::process::exit(1);
        }

        config
    }

    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            pool_size: self.pool_size,
            connect_timeout: self.timeout,
            timeouts: Timeouts {
                acquire: self.timeout,
                request: self.timeout,
            },
            ..Default::default()
        }
    }

    fn route(&self) -> Route {
        match &self.session {
            Some(id) => Route::session(id.clone()),
            None => Route::Pooled,
        }
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value.as_str(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
kvbridge - client for the binary key-value backend

USAGE:
    kvbridge [OPTIONS] <COMMAND> [ARGS...] [, <COMMAND> [ARGS...]]...

OPTIONS:
    -h, --host <HOST>         Backend host (default: 127.0.0.1)
    -p, --port <PORT>         Backend port (default: 8080)
    -s, --session <ID>        Send over a dedicated session connection
    -t, --timeout <SECS>      Connect, acquire and request timeout (default: 5)
        --pool-size <N>       Pooled connections to open (default: 1)
    -v, --version             Print version information
        --help                Print this help message

COMMANDS:
    get <KEY>
    set <KEY> <VALUE>
    remove <KEY>
    create-cursor <NAME> [START_KEY]
    delete-cursor <NAME>
    get-ff <CURSOR> <AMOUNT>
    get-fb <CURSOR> <AMOUNT>
    get-keys <CURSOR> <AMOUNT>
    get-keys-prefix <CURSOR> <PREFIX> <AMOUNT>

EXAMPLES:
    kvbridge set name alice , get name
    kvbridge -p 9000 remove name
    kvbridge -s s1 create-cursor c , get-ff c 10 , delete-cursor c

Cursor commands need --session: a cursor lives on the connection that
created it. Set RUST_LOG=debug to see connection events.
"#
    );
}

/// Turns one command's words into a request.
fn parse_command(words: &[String]) -> anyhow::Result<Request> {
    let (name, args) = words
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let arg = |index: usize, what: &str| -> anyhow::Result<Bytes> {
        args.get(index)
            .map(|s| Bytes::from(s.clone()))
            .ok_or_else(|| anyhow!("{} requires <{}>", name, what))
    };
    let amount = |index: usize| -> anyhow::Result<u16> {
        let raw = args
            .get(index)
            .ok_or_else(|| anyhow!("{} requires <AMOUNT>", name))?;
        raw.parse::<u16>()
            .with_context(|| format!("invalid amount {:?} (0-65535)", raw))
    };

    let request = match name.as_str() {
        "get" => Request::get(arg(0, "KEY")?),
        "set" => Request::set(arg(0, "KEY")?, arg(1, "VALUE")?),
        "remove" | "delete" => Request::remove(arg(0, "KEY")?),
        "create-cursor" => Request::create_cursor(arg(0, "NAME")?, arg(1, "START_KEY").ok()),
        "delete-cursor" => Request::delete_cursor(arg(0, "NAME")?),
        "get-ff" => Request::get_forward(arg(0, "CURSOR")?, amount(1)?),
        "get-fb" => Request::get_backward(arg(0, "CURSOR")?, amount(1)?),
        "get-keys" => Request::get_keys(arg(0, "CURSOR")?, amount(1)?),
        "get-keys-prefix" => {
            Request::get_keys_prefix(arg(0, "CURSOR")?, arg(1, "PREFIX")?, amount(2)?)
        }
        other => bail!("unknown command: {}", other),
    };
    Ok(request)
}

async fn run(gateway: &Gateway, route: &Route, requests: &[Request]) -> anyhow::Result<()> {
    for request in requests {
        let reply = gateway
            .execute(route, request)
            .await
            .with_context(|| format!("{} failed", request.command()))?;
        println!("{}", reply);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Validate every command before opening any connection
    let requests = config
        .commands
        .iter()
        .map(|words| parse_command(words))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let gateway = Gateway::connect(&config.gateway_config())
        .await
        .with_context(|| format!("cannot reach backend at {}:{}", config.host, config.port))?;
    info!(host = %config.host, port = config.port, route = %config.route(), "Connected");

    let route = config.route();
    let result = tokio::select! {
        result = run(&gateway, &route, &requests) => result,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Ok(())
        }
    };

    gateway.shutdown().await;
    result
}
