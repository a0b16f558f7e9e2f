//! EasyCluster
//!
//! Serve the demo definitions module or call functions on a running server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cluster::config::Config;
use cluster::{logging, Client, Definitions, ExportRegistry, Kwargs, RemoteError, Server, Value};
use protocol::SharedKey;
use tokio::net::TcpListener;

/// EasyCluster - remote object invocation over authenticated connections.
#[derive(Parser, Debug)]
#[command(name = "easycluster")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Shared key, hex encoded (overrides config and EASYCLUSTER_KEY)
    #[arg(short, long, global = true, value_name = "HEX")]
    pub key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept connections and serve the demo definitions module
    Serve {
        /// Address to listen on (defaults to the configured address)
        #[arg(long, short)]
        listen: Option<String>,
    },

    /// Call a function on a server and print its result
    Call {
        /// Function name
        function: String,

        /// Arguments; integers, floats and true/false are converted,
        /// everything else is passed as a string
        args: Vec<String>,

        /// Server address
        #[arg(long, default_value = "127.0.0.1:11998")]
        host: String,
    },

    /// Print a new random shared key
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_env_overrides();
    if cli.verbose {
        config.log_level = "debug".to_string();
    }
    config.validate()?;
    logging::init(&config.log_level);

    match cli.command {
        Commands::Keygen => {
            println!("{}", SharedKey::generate().to_hex());
        }
        Commands::Serve { listen } => {
            let key = resolve_key(cli.key.as_deref(), &config)?;
            let addr = listen.unwrap_or_else(|| config.server.listen.clone());
            serve(&addr, key, config).await?;
        }
        Commands::Call {
            function,
            args,
            host,
        } => {
            let key = resolve_key(cli.key.as_deref(), &config)?;
            let client = Client::connect(host.as_str(), &key, &config.connection)
                .await
                .with_context(|| format!("Failed to connect to {}", host))?;
            client.spawn_reader();
            let args = args.iter().map(|arg| parse_arg(arg)).collect();
            let result = client.call(&function, args, Kwargs::new()).await;
            client.close();
            println!("{}", render(&result?));
        }
    }

    Ok(())
}

fn resolve_key(flag: Option<&str>, config: &Config) -> anyhow::Result<SharedKey> {
    if let Some(hex) = flag {
        return SharedKey::from_hex(hex).context("Invalid --key");
    }
    config
        .server
        .key()?
        .context("No shared key given; use --key, EASYCLUSTER_KEY or the config file")
}

async fn serve(addr: &str, key: SharedKey, config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    let definitions = Arc::new(Definitions::new().with_module(
        config.connection.definitions_module.clone(),
        demo_registry(),
    ));
    tracing::info!(address = %addr, module = %config.connection.definitions_module, "Listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let server = match Server::from_tcp(stream, &key, Arc::clone(&definitions), &config.connection) {
                    Ok(server) => server,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Rejecting connection");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = server.run().await {
                        tracing::warn!(peer = %peer, error = %e, "Connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}

/// Functions served by `easycluster serve`.
fn demo_registry() -> ExportRegistry {
    ExportRegistry::new()
        .function("echo", |args, _| Ok(args.into_iter().next().unwrap_or_default()))
        .function("add", |args, _| {
            if args.iter().all(|a| a.as_int().is_some()) {
                return Ok(Value::Int(args.iter().filter_map(Value::as_int).sum()));
            }
            args.iter()
                .map(|a| {
                    a.as_float()
                        .ok_or_else(|| RemoteError::type_error(format!("cannot add a {}", a.kind_name())))
                })
                .sum::<Result<f64, RemoteError>>()
                .map(Value::Float)
        })
        .function("version", |_, _| Ok(Value::from(env!("CARGO_PKG_VERSION"))))
}

fn parse_arg(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::from(text),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => hex::encode(b),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(render).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Map(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, render(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        Value::Ref(r) => format!("<ref {}>", r.id),
        Value::Proxy(p) => format!("<proxy {}>", p.object_id()),
        Value::Local(_) => "<object>".to_string(),
    }
}
