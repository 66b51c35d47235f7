use anyhow::{bail, Context};
use clap::Parser;
use farmhand_engine::{Engine, NewBuildTask, NewTrainingTask, TaskFilter};
use farmhand_runner::activity::ActivityLog;
use farmhand_runner::cache::VillageCache;
use farmhand_runner::config::{status_addr, AddBuildArgs, AddTrainingArgs, Cli, Command, FarmArgs, GameArgs, Settings};
use farmhand_runner::farm::{FarmBuilder, FarmSource};
use farmhand_runner::feed::{CoordFeed, InactiveFeed};
use farmhand_runner::game::{Credentials, GameClient};
use farmhand_runner::scanner::Scanner;
use farmhand_runner::scheduler::{FarmSchedule, TaskRunner};
use farmhand_runner::status::{self, AppState, RunnerStatus};
use farmhand_runner::webdriver::WebDriverPage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

type Client = GameClient<WebDriverPage>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.settings.as_deref())?;
    let engine = Engine::new(cli.db_path());

    match cli.command {
        Command::Run {
            game,
            farm,
            farm_interval_min,
            night_mode,
            status_port,
        } => run(engine, settings, &game, &farm, farm_interval_min, night_mode, status_port).await,
        Command::Scan { game } => {
            let client = connect(&game).await?;
            let result = scan(&client, &settings).await;
            close(&client).await;
            result
        }
        Command::Villages { game } => {
            let client = connect(&game).await?;
            let result = client.villages().await;
            close(&client).await;
            for v in result? {
                println!("{}\t{}", v.id, v.name);
            }
            Ok(())
        }
        Command::AddBuild(args) => add_build(&engine, args),
        Command::AddTraining(args) => add_training(&engine, args),
        Command::Tasks { village, limit } => {
            let filter = TaskFilter { village };
            let builds = engine.pending_build_tasks(&filter, limit)?;
            let trainings = engine.pending_training_tasks(&filter, limit)?;
            let out = serde_json::json!({ "builds": builds, "trainings": trainings });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::Farm { game, farm } => {
            let feed = inactive_feed(&farm)?;
            let client = connect(&game).await?;
            let mut builder = FarmBuilder::new(&client);
            if let Some(feed) = feed.as_deref() {
                builder = builder.with_feed(feed);
            }
            let result = builder.run(&farm.options()).await;
            close(&client).await;
            let report = result?;
            ActivityLog::new(engine).success(
                "farm_lists",
                &format!("{} farm targets added", report.added_count()),
                serde_json::to_value(&report)?,
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Status { port } => {
            let addr = status_addr(port);
            eprintln!("[farmhand] status endpoint on http://{addr}");
            status::serve(addr, AppState::detached(engine)).await
        }
    }
}

/// Starts a browser, reuses the stored session when it is still valid and
/// switches to the requested village.
async fn connect(game: &GameArgs) -> anyhow::Result<Client> {
    let page = WebDriverPage::start(&game.browser())
        .await
        .context("starting the webdriver session")?;
    let client = GameClient::new(page, &game.game_url);
    if let Err(e) = sign_in(&client, game).await {
        close(&client).await;
        return Err(e);
    }
    Ok(client)
}

async fn sign_in(client: &Client, game: &GameArgs) -> anyhow::Result<()> {
    let session = game.session_path();
    match client.page().restore_session(&session, &game.game_url).await {
        Ok(_) => {}
        Err(e) if e.is_session_closed() => return Err(e.into()),
        Err(e) => tracing::warn!(error = %e, "could not restore the stored session"),
    }
    let creds = Credentials {
        username: game.username.clone(),
        password: game.password.clone(),
    };
    client.login(&creds).await?;
    if let Err(e) = client.page().save_session(&session).await {
        tracing::warn!(error = %format!("{e:#}"), "could not save the session");
    }
    if let Some(village) = game.village.as_deref() {
        let mut cache = VillageCache::new();
        if !client.switch_village(village, &mut cache).await? {
            tracing::warn!(village, "staying in the current village");
        }
    }
    Ok(())
}

async fn close(client: &Client) {
    if let Err(e) = client.page().close().await {
        tracing::warn!(error = %e, "closing the browser failed");
    }
}

fn inactive_feed(farm: &FarmArgs) -> anyhow::Result<Option<Box<dyn CoordFeed>>> {
    if FarmSource::from(farm.source) != FarmSource::InactiveSearch {
        return Ok(None);
    }
    let url = farm.inactive_url.as_deref().unwrap_or_default();
    Ok(Some(Box::new(InactiveFeed::new(url, farm.inactive_max_pages)?)))
}

async fn scan(client: &Client, settings: &Settings) -> anyhow::Result<()> {
    let scanner = Scanner {
        retries: settings.scan_retries,
        backoff: settings.scan_backoff(),
    };
    let mut cache = VillageCache::new();
    let fields = scanner.scan_if_needed(client, &mut cache, true).await?;
    let out = serde_json::json!({ "summary": cache.summary(), "fields": fields });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(
    engine: Engine,
    settings: Settings,
    game: &GameArgs,
    farm: &FarmArgs,
    farm_interval_min: u64,
    night_mode: bool,
    status_port: Option<u16>,
) -> anyhow::Result<()> {
    let feed = if farm_interval_min > 0 {
        inactive_feed(farm)?
    } else {
        None
    };
    let client = Arc::new(connect(game).await?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let signal_client = Arc::clone(&client);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        let _ = stop_tx.send(true);
        close(&signal_client).await;
    });

    let (status_tx, status_rx) = watch::channel(RunnerStatus::default());
    if let Some(port) = status_port {
        let state = AppState {
            engine: engine.clone(),
            runner: status_rx,
        };
        tokio::spawn(async move {
            if let Err(e) = status::serve(status_addr(port), state).await {
                tracing::error!(error = %format!("{e:#}"), "status endpoint stopped");
            }
        });
    }

    let activity = ActivityLog::new(engine.clone());
    let mut runner = TaskRunner::new(client.as_ref(), &engine, activity, settings, stop_rx)
        .with_active_village(game.village.clone())
        .with_night_mode(night_mode)
        .with_status(status_tx);
    if farm_interval_min > 0 {
        runner = runner.with_farm(FarmSchedule {
            options: farm.options(),
            interval: Duration::from_secs(farm_interval_min * 60),
            feed,
        });
    }

    let result = runner.run().await;
    close(&client).await;
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn add_build(engine: &Engine, args: AddBuildArgs) -> anyhow::Result<()> {
    let name = args.name.filter(|n| !n.trim().is_empty());
    if args.building_type.is_none() && args.slot.is_none() && name.is_none() {
        bail!("a build task needs --type, --slot or --name");
    }
    if args.building_type.is_some() && (args.slot.is_some() || name.is_some()) {
        bail!("--type selects resource fields and cannot be combined with --slot or --name");
    }
    let task = engine.add_build_task(&NewBuildTask {
        village: args.village,
        building_type: args.building_type,
        building_slot: args.slot,
        building_name: name,
        target_level: args.target_level,
        priority: args.priority,
    })?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

fn add_training(engine: &Engine, args: AddTrainingArgs) -> anyhow::Result<()> {
    let troop_name = args.troop.filter(|n| !n.trim().is_empty());
    if troop_name.is_none() && args.troop_index.is_none() {
        bail!("a training task needs --troop or --troop-index");
    }
    if args.repeat_forever && args.repeat_interval == 0 {
        bail!("--repeat-forever needs --repeat-interval in minutes");
    }
    let task = engine.add_training_task(&NewTrainingTask {
        village: args.village,
        building_type: args.building,
        building_slot: args.slot,
        troop_name,
        troop_index: args.troop_index,
        quantity: args.quantity,
        repeat_forever: args.repeat_forever,
        repeat_interval: args.repeat_interval,
        priority: args.priority,
    })?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
