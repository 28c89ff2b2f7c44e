use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use prepdash::api::{cache_key, ApiClient, ApiResponse, HttpTransport, ResourceKind, SessionTokens};
use prepdash::config::Config;
use prepdash::logging;
use prepdash::offline::{
  now_ms, Connectivity, ConnectivityProbe, Method, OfflineService, OfflineStorage, SqliteStorage,
  SyncReport, TokenProvider,
};

#[derive(Parser, Debug)]
#[command(name = "prepdash")]
#[command(about = "Offline-resilient client for the test-prep admin API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/prepdash/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and queue state
  Status,
  /// List queued actions in replay order
  Queue,
  /// Replay queued actions now
  Sync,
  /// Probe connectivity and replay on reconnect until Ctrl-C
  Watch,
  /// Send a request, queueing it if offline
  Request {
    method: Method,
    path: String,
    /// JSON body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Manage an admin collection
  Resource {
    kind: ResourceKind,
    #[command(subcommand)]
    action: ResourceAction,
  },
  /// Inspect the offline cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Persist a session token
  Login {
    #[arg(long)]
    token: String,
  },
  /// Forget the persisted session token
  Logout,
}

#[derive(Subcommand, Debug)]
enum ResourceAction {
  List,
  Get { id: String },
  Create { data: String },
  Update { id: String, data: String },
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Show the cached response for a path
  Get { path: String },
  /// Drop expired entries and enforce the size bound
  Sweep,
}

/// Everything a command needs, wired once at startup.
struct Context {
  config: Config,
  client: ApiClient<SqliteStorage, HttpTransport>,
  offline: Arc<OfflineService<SqliteStorage, HttpTransport>>,
  tokens: Arc<SessionTokens<SqliteStorage>>,
  probe: ConnectivityProbe,
}

impl Context {
  fn new(config: Config) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::open_at(&config.storage_path()?)?);
    let transport = Arc::new(HttpTransport::new(config.timeout())?);
    let tokens = Arc::new(SessionTokens::new(
      Arc::clone(&storage),
      Config::api_token(),
    ));
    // Offline until the first probe says otherwise
    let connectivity = Connectivity::new(false);

    let offline = Arc::new(OfflineService::new(
      storage,
      Arc::clone(&transport),
      connectivity.clone(),
      config.sync_policy(),
      Some(Arc::clone(&tokens) as Arc<dyn TokenProvider>),
    ));

    let client = ApiClient::new(
      &config.api.base_url,
      Arc::clone(&transport),
      Arc::clone(&offline),
      Arc::clone(&tokens),
    )?
    .with_cache_ttl(config.cache_ttl());

    let probe_url = client.resolve(&config.sync.probe_path)?;
    let probe = ConnectivityProbe::new(
      transport.client().clone(),
      probe_url.as_str(),
      config.probe_interval(),
      connectivity,
    );

    Ok(Self {
      config,
      client,
      offline,
      tokens,
      probe,
    })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  let ctx = Context::new(config)?;
  run(ctx, args.command).await
}

async fn run(ctx: Context, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let online = ctx.probe.check().await;
      let dead = ctx.offline.storage().dead_letters()?.len();
      println!("online:        {}", online);
      println!("pending:       {}", ctx.offline.check_pending_actions());
      println!("dead letters:  {}", dead);
      println!("cached:        {}", ctx.offline.storage().entry_count()?);
      println!("api:           {}", ctx.config.api.base_url);
    }
    Command::Queue => {
      let actions = ctx.offline.pending_actions()?;
      if actions.is_empty() {
        println!("No pending actions");
      }
      for action in actions {
        println!(
          "{:>5}  {:<6} {}  attempts={}{}",
          action.seq,
          action.method,
          action.url,
          action.attempts,
          action
            .last_error
            .map(|e| format!("  last_error={}", e))
            .unwrap_or_default()
        );
      }
    }
    Command::Sync => {
      if !ctx.probe.check().await {
        return Err(eyre!("Backend unreachable, nothing replayed"));
      }
      print_report(&ctx.offline.sync_offline_actions().await);
    }
    Command::Watch => watch(ctx).await?,
    Command::Request { method, path, data } => {
      ctx.probe.check().await;
      let body = data.as_deref().map(parse_json).transpose()?;
      print_response(ctx.client.request(method, &path, body).await?)?;
    }
    Command::Resource { kind, action } => {
      ctx.probe.check().await;
      let resource = ctx.client.resource(kind);
      let response = match action {
        ResourceAction::List => resource.list().await?.try_map(|items| Ok(Value::Array(items)))?,
        ResourceAction::Get { id } => resource.get(&id).await?,
        ResourceAction::Create { data } => resource.create(&parse_json(&data)?).await?,
        ResourceAction::Update { id, data } => resource.update(&id, &parse_json(&data)?).await?,
        ResourceAction::Delete { id } => resource.delete(&id).await?,
      };
      print_response(response)?;
    }
    Command::Cache { action } => match action {
      CacheAction::Get { path } => {
        let url = ctx.client.resolve(&path)?;
        match ctx.offline.get_offline_data::<Value>(&cache_key(url.as_str())) {
          Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
          None => println!("Not cached: {}", url),
        }
      }
      CacheAction::Sweep => {
        let removed = ctx
          .offline
          .storage()
          .sweep_entries(now_ms(), ctx.config.cache.max_entries)?;
        println!("Removed {} entries", removed);
      }
    },
    Command::Login { token } => {
      ctx.tokens.set_token(&token)?;
      println!("Token stored");
    }
    Command::Logout => {
      ctx.tokens.clear();
      println!("Token cleared");
    }
  }

  Ok(())
}

async fn watch(ctx: Context) -> Result<()> {
  let observer = ctx.offline.watch();
  let mut status = ctx.offline.subscribe_status();
  let probe = ctx.probe.spawn();

  println!("Watching {} (Ctrl-C to stop)", ctx.config.api.base_url);
  loop {
    tokio::select! {
      changed = status.changed() => {
        if changed.is_err() {
          break;
        }
        let s = *status.borrow_and_update();
        println!(
          "online={} syncing={} pending={}{}",
          s.online,
          s.syncing,
          s.pending,
          if s.auth_required { " (login required)" } else { "" }
        );
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  probe.abort();
  observer.abort();
  Ok(())
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON body: {}", e))
}

fn print_response(response: ApiResponse<Value>) -> Result<()> {
  match response {
    ApiResponse::Network(data) => println!("{}", serde_json::to_string_pretty(&data)?),
    ApiResponse::Cached(data) => {
      eprintln!("(offline, served from cache)");
      println!("{}", serde_json::to_string_pretty(&data)?);
    }
    ApiResponse::Queued(action) => {
      println!("Offline: queued {} as #{}", action.type_tag, action.seq);
    }
  }
  Ok(())
}

fn print_report(report: &SyncReport) {
  println!(
    "replayed={} failed={} dead_lettered={} remaining={}",
    report.replayed, report.failed, report.dead_lettered, report.remaining
  );
  if report.auth_required {
    println!("Replay stopped: the backend rejected the session token, run `prepdash login`");
  }
}
