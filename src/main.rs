mod agent;
mod cache;
mod config;
mod logging;
mod net;
mod server;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::agent::{Agent, FetchOutcome};
use crate::cache::SqliteStorage;
use crate::net::{AgentRequest, Fetch, HttpClient};

#[derive(Parser, Debug)]
#[command(name = "stowaway")]
#[command(about = "An offline-capable request interception and caching agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./stowaway.yaml or $XDG_CONFIG_HOME/stowaway/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Upstream origin to resolve intercepted requests against
  #[arg(short, long, global = true)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the agent and serve requests until ctrl-c (default)
  Serve,
  /// Precache the manifest into the static store and report the result
  Install,
  /// Delete every store that is not part of the current version
  Prune,
  /// List stores, marking current and stale ones
  Stores,
  /// Run a single GET through the agent and print the outcome
  Fetch {
    /// Path (resolved against the origin) or absolute URL
    target: String,
    /// Accept hint, e.g. text/html for a navigation
    #[arg(long)]
    accept: Option<String>,
  },
  /// Send a control message to a running agent
  Message {
    #[arg(value_enum)]
    kind: MessageKind,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MessageKind {
  SkipWaiting,
  GetVersion,
}

impl MessageKind {
  fn wire_type(self) -> &'static str {
    match self {
      Self::SkipWaiting => "SKIP_WAITING",
      Self::GetVersion => "GET_VERSION",
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };
  config.origin_url()?;

  let _log_guard = logging::init(&config)?;
  let config = Arc::new(config);

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => {
      let (agent, network) = build_agent(&config)?;
      let state = server::ServerState {
        agent: Arc::new(agent),
        network,
        origin: config.origin_url()?,
      };
      server::serve(state, &config.listen).await
    }
    Command::Install => {
      let (agent, _) = build_agent(&config)?;
      let report = agent.lifecycle().precache().await;
      println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| eyre!("Failed to render report: {}", e))?
      );
      Ok(())
    }
    Command::Prune => {
      let (agent, _) = build_agent(&config)?;
      let deleted = agent.registry().reconcile(&config.whitelist()).await?;
      if deleted.is_empty() {
        println!("No stale stores");
      }
      for name in deleted {
        println!("deleted {}", name);
      }
      Ok(())
    }
    Command::Stores => {
      let (agent, _) = build_agent(&config)?;
      let whitelist = config.whitelist();
      for name in agent.registry().list_names().await? {
        let status = if whitelist.contains(&name) { "current" } else { "stale" };
        println!("{:<8} {}", status, name);
      }
      Ok(())
    }
    Command::Fetch { target, accept } => {
      let (agent, _) = build_agent(&config)?;
      agent.install().await;
      agent.lifecycle().skip_waiting().await;

      let url = match Url::parse(&target) {
        Ok(url) => url,
        Err(_) => config
          .origin_url()?
          .join(&target)
          .map_err(|e| eyre!("Invalid target '{}': {}", target, e))?,
      };
      let mut request = AgentRequest::get(url);
      request.accept = accept;

      match agent.handle_fetch(&request).await {
        FetchOutcome::Respond(served) => {
          println!(
            "{} {} {} ({} bytes)",
            served.response.status,
            served.source.as_str(),
            served.response.header("content-type").unwrap_or("-"),
            served.response.body.len()
          );
          if let Some(cached_at) = served.cached_at {
            println!("cached at {}", cached_at.to_rfc3339());
          }
          if let Ok(text) = std::str::from_utf8(&served.response.body) {
            println!("{}", text);
          }
        }
        FetchOutcome::PassThrough => println!("passed through (not intercepted)"),
      }
      Ok(())
    }
    Command::Message { kind } => send_message(&config.listen, kind).await,
  }
}

fn build_agent(config: &Arc<config::Config>) -> Result<(Agent<SqliteStorage>, Arc<dyn Fetch>)> {
  let storage = SqliteStorage::open(&config.database_path()?)?;
  let network: Arc<dyn Fetch> = Arc::new(HttpClient::new(config)?);
  let agent = Agent::new(Arc::clone(config), storage, Arc::clone(&network))?;
  Ok((agent, network))
}

/// Post a control message to the agent served on `listen`.
async fn send_message(listen: &str, kind: MessageKind) -> Result<()> {
  let endpoint = format!("http://{}/__stowaway/message", listen);
  let body = serde_json::json!({ "type": kind.wire_type() }).to_string();

  let response = reqwest::Client::new()
    .post(&endpoint)
    .header(reqwest::header::CONTENT_TYPE, "application/json")
    .body(body)
    .send()
    .await
    .map_err(|e| eyre!("Failed to reach agent at {}: {}", endpoint, e))?;

  let status = response.status();
  let text = response
    .text()
    .await
    .map_err(|e| eyre!("Failed to read agent reply: {}", e))?;

  if text.is_empty() {
    println!("{}", status);
  } else {
    println!("{}", text);
  }
  Ok(())
}
