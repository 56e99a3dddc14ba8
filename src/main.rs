//! The `wn` binary.
//!
//! `wn serve` runs the agent runtime as a JSON-RPC 2.0 server over
//! stdin/stdout: inbound NDJSON requests on stdin, responses and
//! notifications on stdout, diagnostics on stderr.  The hidden
//! `agent-worker` subcommand is the sub-agent worker entrypoint and is only
//! ever invoked by the runtime itself.
//!
//! Exit codes: 0 on clean shutdown (end of input or a stop signal), 1 on
//! startup failure (config load, provider construction, resource loading).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;

use wn_core::wn::config::RootConfig;
use wn_core::wn::resources::ResourceSet;
use wn_core::wn::rpc::server::{RpcNotifier, RpcServer};
use wn_core::wn::runtime::Runtime;
use wn_core::wn::subagent::agent_worker_main;

#[derive(Parser)]
#[command(name = "wn", version, about = "LLM agent runtime core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON-RPC agent runtime over stdin/stdout.
    Serve {
        /// Provider name (overrides the config default).
        #[arg(long)]
        provider: Option<String>,
        /// Model name (overrides the config default).
        #[arg(long)]
        model: Option<String>,
        /// Persona name (overrides the config default).
        #[arg(long)]
        persona: Option<String>,
    },
    /// Sub-agent worker entrypoint (spawned by the runtime).
    #[command(name = "agent-worker", hide = true)]
    AgentWorker,
}

/// The global resource directory, `~/.wn`.
fn global_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".wn"))
}

/// The project-local resource directory, `.wn` next to the working directory.
fn local_dir() -> Option<PathBuf> {
    let local = PathBuf::from(".wn");
    local.is_dir().then_some(local)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            provider,
            model,
            persona,
        } => {
            std::process::exit(serve(provider, model, persona).await);
        }
        Commands::AgentWorker => {
            std::process::exit(agent_worker_main().await);
        }
    }
}

async fn serve(
    provider: Option<String>,
    model: Option<String>,
    persona: Option<String>,
) -> i32 {
    let global = global_dir();
    let local = local_dir();

    // Project-local config wins over the global one when both exist.
    let config_path = local
        .as_ref()
        .map(|dir| dir.join("config.json"))
        .filter(|path| path.is_file())
        .or_else(|| global.as_ref().map(|dir| dir.join("config.json")));

    let config = match config_path {
        Some(path) => match RootConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("wn: {}", err);
                return 1;
            }
        },
        None => RootConfig::default(),
    };

    let resources = match ResourceSet::load_layered(global.as_deref(), local.as_deref()) {
        Ok(resources) => resources,
        Err(err) => {
            eprintln!("wn: {}", err);
            return 1;
        }
    };

    let notifier = RpcNotifier::new(tokio::io::stdout());
    let runtime = match Runtime::build(config, resources, notifier.clone(), provider, model, persona)
        .await
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("wn: {}", err);
            return 1;
        }
    };

    let mut server = RpcServer::new(
        BufReader::new(tokio::io::stdin()),
        notifier,
        runtime.clone() as Arc<dyn wn_core::wn::rpc::server::RpcHandler>,
    );
    let stop = server.stop_handle();

    // SIGINT / SIGTERM: cancel the in-flight turn and stop the read loop.
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    log::warn!("cannot install SIGTERM handler: {}", err);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            eprintln!("wn: shutting down");
            runtime.abort().await;
            stop.stop();
        });
    }

    server.start().await;
    runtime.shutdown().await;
    0
}
