use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bingo_common::{PatternId, RoomState, FREE_CELL};
use bingo_sync::{
    config::Settings,
    host::{spawn_host, HostConfig, HostHandle},
    local_store::{DeviceStore, FileLocalStore},
    player::{spawn_player, Notice, PlayerConfig, PlayerHandle, PlayerView},
    session::WsConnector,
    storage::{BestEffort, FlatFileStorage, HttpStorage},
    validation, ws_router, AppState,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about = "Multiplayer bingo rooms kept in sync", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, global = true, env = "BINGO_CONFIG", default_value = "bingo.toml")]
    config: PathBuf,

    /// Relay base URL, overrides `server_url`
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay and the room store
    Serve(ServeArgs),
    /// Host a room
    Host(HostArgs),
    /// Join a room as a player
    Play(PlayArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct HostArgs {
    /// Room to host; a fresh id is generated when omitted
    #[arg(long)]
    room: Option<String>,

    #[arg(long)]
    name: Option<String>,

    /// Device profile file, for running several clients on one machine
    #[arg(long)]
    profile: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PlayArgs {
    #[arg(long)]
    room: String,

    /// Display name, remembered on the device
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    profile: Option<PathBuf>,

    /// Join even if the store has no record of the room
    #[arg(long, action = clap::ArgAction::SetTrue)]
    skip_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(server) = cli.server {
        settings.server_url = server;
        settings.validate()?;
    }
    init_tracing(&settings);

    match cli.command {
        Command::Serve(args) => serve(settings, args).await,
        Command::Host(args) => host(settings, args).await,
        Command::Play(args) => play(settings, args).await,
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    // stdout belongs to the command prompt
    let registry = tracing_subscriber::registry().with(filter);
    if settings.log_json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn serve(mut settings: Settings, args: ServeArgs) -> Result<()> {
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }

    let storage = FlatFileStorage::new(&settings.data_dir)?;
    let addr = settings.bind_addr;
    let state = Arc::new(AppState::new(storage, settings));
    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn device(settings: &Settings, profile: Option<PathBuf>) -> DeviceStore {
    let path = profile.unwrap_or_else(|| settings.data_dir.join("device.json"));
    DeviceStore::new(Arc::new(FileLocalStore::open(path)))
}

fn room_store(settings: &Settings) -> Result<BestEffort> {
    let timeout = settings.store.timeout();
    let http = HttpStorage::new(&settings.server_url, timeout)?;
    Ok(BestEffort::with_timeout(Arc::new(http), timeout))
}

fn ws_connector(settings: &Settings) -> WsConnector {
    WsConnector::new(settings.ws_url()).with_connect_timeout(settings.session.connect_timeout())
}

async fn host(settings: Settings, args: HostArgs) -> Result<()> {
    let device = device(&settings, args.profile);
    let room_id = args.room.unwrap_or_else(validation::generate_room_id);
    validation::validate_room_id(&room_id)?;

    let mut config = HostConfig::from_settings(&room_id, device.client_id(), &settings);
    config.username = args.name.or_else(|| device.display_name());
    let store = room_store(&settings)?;
    let connector = Arc::new(ws_connector(&settings));
    let host = spawn_host(config, connector, store, device).await?;

    let mut updates = host.state();
    tokio::spawn(async move {
        let mut announced = BTreeSet::new();
        while updates.changed().await.is_ok() {
            let room = updates.borrow_and_update().clone();
            for claim in room.pending_claims() {
                if announced.insert(claim.id.clone()) {
                    println!("claim {} from {} awaits review", claim.id, claim.username);
                }
            }
        }
    });

    println!("hosting room {room_id}");
    println!("commands: draw | pattern <id> | custom <i,j,..> | approve <id> | reject <id> | reset | status | quit");
    prompt_loop(|line| host_command(&host, line)).await?;
    host.shutdown().await?;
    Ok(())
}

async fn host_command(host: &HostHandle, line: String) -> Result<bool> {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (None, _) => Ok(()),
        (Some("quit" | "exit"), _) => return Ok(false),
        (Some("draw"), _) => host.draw().await.map(|ball| println!("drew {ball}")),
        (Some("pattern"), Some(id)) => match id.parse::<PatternId>() {
            Ok(pattern) => host.set_pattern(pattern, None).await,
            Err(e) => {
                println!("{e}");
                Ok(())
            },
        },
        (Some("custom"), Some(cells)) => {
            let cells: Result<Vec<usize>, _> = cells.split(',').map(|c| c.trim().parse()).collect();
            match cells {
                Ok(cells) => host.set_pattern(PatternId::Custom, Some(cells)).await,
                Err(e) => {
                    println!("bad cell list: {e}");
                    Ok(())
                },
            }
        },
        (Some("approve"), Some(id)) => host.approve(id).await.map(|c| println!("approved {}", c.username)),
        (Some("reject"), Some(id)) => host.reject(id).await.map(|c| println!("rejected {}", c.username)),
        (Some("reset"), _) => host.reset().await.map(|n| println!("new round ({n})")),
        (Some("status"), _) => {
            print_room(&host.current());
            let presence = host.presence().borrow().clone();
            println!(
                "online: {}  players: {}",
                presence.online_count,
                presence.player_names.join(", ")
            );
            for claim in host.current().pending_claims() {
                println!("pending claim {} by {} (card {})", claim.id, claim.username, claim.card_version);
            }
            Ok(())
        },
        (Some(other), _) => {
            println!("unknown command: {other}");
            Ok(())
        },
    };
    if let Err(e) = result {
        println!("error: {e}");
    }
    Ok(true)
}

async fn play(settings: Settings, args: PlayArgs) -> Result<()> {
    let device = device(&settings, args.profile);
    validation::validate_room_id(&args.room)?;
    let Some(name) = args.name.or_else(|| device.display_name()) else {
        bail!("a display name is needed, pass --name");
    };
    let name = validation::validate_username(&name)?.to_string();
    device.set_display_name(&name);

    if !args.skip_check {
        let store = room_store(&settings)?;
        if !store.exists(&args.room).await {
            bail!("room {} was not found, check the id or pass --skip-check", args.room);
        }
    }

    let config = PlayerConfig::from_settings(&args.room, device.client_id(), &name, &settings);
    let connector = Arc::new(ws_connector(&settings));
    let player = spawn_player(config, connector, device).await?;

    let mut notices = player.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::WinnerAnnounced { username, .. } => println!("BINGO! {username} won"),
                Notice::ClaimResolved { status, .. } => println!("your claim was {status:?}"),
                Notice::Reset { .. } => println!("the host started a new round"),
            }
        }
    });

    println!("joined room {} as {name}", args.room);
    println!("commands: punch <cell> | claim | refresh | status | quit");
    prompt_loop(|line| player_command(&player, line)).await?;
    player.shutdown().await?;
    Ok(())
}

async fn player_command(player: &PlayerHandle, line: String) -> Result<bool> {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (None, _) => Ok(()),
        (Some("quit" | "exit"), _) => return Ok(false),
        (Some("punch"), Some(cell)) => match cell.parse::<usize>() {
            Ok(cell) => player
                .punch(cell)
                .await
                .map(|on| println!("cell {cell} {}", if on { "punched" } else { "cleared" })),
            Err(e) => {
                println!("bad cell: {e}");
                Ok(())
            },
        },
        (Some("claim"), _) => player.claim().await.map(|()| println!("claim sent to the host")),
        (Some("refresh"), _) => player.refresh_card().await.map(|v| println!("new card (version {v})")),
        (Some("status"), _) => {
            print_player(&player.view());
            Ok(())
        },
        (Some(other), _) => {
            println!("unknown command: {other}");
            Ok(())
        },
    };
    if let Err(e) = result {
        println!("error: {e}");
    }
    Ok(true)
}

/// Feed stdin lines to `handle` until it returns false, stdin ends or ctrl-c.
async fn prompt_loop<F, Fut>(mut handle: F) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle(line.trim().to_string()).await? {
                        break;
                    }
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_room(room: &RoomState) {
    let pattern = room.pattern.map_or("none", |p| p.label());
    let current = room.current_ball.map_or("-".to_string(), |b| b.to_string());
    println!(
        "round {}  pattern: {pattern}  current: {current}  drawn ({}): {:?}",
        room.reset_count,
        room.drawn_balls.len(),
        room.drawn_balls
    );
}

fn print_player(view: &PlayerView) {
    match &view.room {
        Some(room) => print_room(room),
        None => println!("waiting for the host"),
    }
    println!("card version {}", view.card_version);
    for row in 0..5 {
        let line: Vec<String> = (0..5)
            .map(|col| {
                let index = row * 5 + col;
                let cell = match view.card.number(index) {
                    _ if index == FREE_CELL => "FREE".to_string(),
                    Some(n) => format!("{n:>2}"),
                    None => "--".to_string(),
                };
                let mark = if view.punched.contains(index) { '*' } else { ' ' };
                format!("{index:>2}:{cell:>4}{mark}")
            })
            .collect();
        println!("{}", line.join(" "));
    }
    if view.claimed {
        println!("claim submitted");
    } else if view.can_claim {
        println!("you can claim bingo");
    }
}
