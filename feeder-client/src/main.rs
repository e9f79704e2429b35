// Smart feeder client: browse recorded videos, list feeders, watch a live feeder stream.

mod catalog;
mod config;
mod playback;
mod player;
mod session;
mod settings;
mod transport;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use feeder_core::{ClientId, ConnectionState, ServerAddress};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::playback::StreamPlayback;
use crate::player::{ExternalPlayer, MediaPlayer};
use crate::session::SessionHandle;
use crate::settings::SettingsStore;
use crate::transport::SocketIoConnector;

const DISCONNECT_GRACE: Duration = Duration::from_secs(3);

fn cli() -> Command {
    Command::new("smartfeeder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Smart pet feeder client")
        .subcommand_required(true)
        .subcommand(
            Command::new("connect")
                .about("Obtain a client id from the server and save address and id")
                .arg(
                    Arg::new("address")
                        .value_name("ADDRESS")
                        .help("Server address as host:port (default: saved or configured address)"),
                ),
        )
        .subcommand(Command::new("feeders").about("List feeders currently online"))
        .subcommand(Command::new("videos").about("List recorded videos"))
        .subcommand(
            Command::new("download")
                .about("Download a recorded video")
                .arg(Arg::new("filename").value_name("FILENAME").required(true)),
        )
        .subcommand(
            Command::new("play")
                .about("Play a recorded video (Ctrl-C stops it)")
                .arg(Arg::new("filename").value_name("FILENAME").required(true)),
        )
        .subcommand(
            Command::new("watch")
                .about("Watch a feeder's live stream (Ctrl-C stops it)")
                .arg(Arg::new("feeder").value_name("FEEDER").required(true)),
        )
        .subcommand(
            Command::new("settings")
                .about("Show or clear saved settings")
                .subcommand_required(true)
                .subcommand(Command::new("show"))
                .subcommand(Command::new("clear")),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let matches = cli().get_matches();
    let cfg = config::load();
    let store = SettingsStore::new(cfg.settings_path.clone());

    match matches.subcommand() {
        Some(("connect", m)) => connect(&cfg, &store, m).await,
        Some(("feeders", _)) => feeders(&cfg, &store).await,
        Some(("videos", _)) => videos(&cfg, &store).await,
        Some(("download", m)) => download(&cfg, &store, m).await,
        Some(("play", m)) => play(&cfg, &store, m).await,
        Some(("watch", m)) => watch(&cfg, &store, m).await,
        Some(("settings", m)) => settings_cmd(&store, m),
        _ => Ok(()),
    }
}

fn connector(cfg: &Config) -> SocketIoConnector {
    SocketIoConnector::new(cfg.connect_timeout(), cfg.ack_timeout())
}

async fn connect(cfg: &Config, store: &SettingsStore, m: &ArgMatches) -> Result<()> {
    let saved = store.load()?;
    let address = m
        .get_one::<String>("address")
        .cloned()
        .or(saved.server_address)
        .unwrap_or_else(|| cfg.default_server_address.clone());
    ServerAddress::parse(&address)?;

    let session = SessionHandle::spawn(connector(cfg));
    let mut attempt = session.acquire_identity(&address);
    let client_id = attempt.identity().await.context("requesting client id")?;
    store.save_server_address(&address)?;
    store.save_client_id(Some(client_id.as_str()))?;
    attempt.connected().await.context("connecting with client id")?;
    info!(client_id = ?session.client_id(), "session established");
    println!("Connected to {} as {}", address, client_id);

    session.disconnect();
    wait_disconnected(&session).await;
    Ok(())
}

async fn feeders(cfg: &Config, store: &SettingsStore) -> Result<()> {
    let settings = store.load()?;
    let client = Catalog::new(cfg.http_timeout()).service(settings.server_address.as_deref())?;
    let feeders = client.list_feeders().await?;
    if feeders.is_empty() {
        println!("No active feeders");
    }
    for f in feeders {
        println!("{}", f);
    }
    Ok(())
}

async fn videos(cfg: &Config, store: &SettingsStore) -> Result<()> {
    let settings = store.load()?;
    let client = Catalog::new(cfg.http_timeout()).service(settings.server_address.as_deref())?;
    for v in client.list_videos().await? {
        println!("{}\t{}", v.filename, v.url);
    }
    Ok(())
}

async fn download(cfg: &Config, store: &SettingsStore, m: &ArgMatches) -> Result<()> {
    let Some(filename) = m.get_one::<String>("filename") else {
        bail!("missing FILENAME");
    };
    let settings = store.load()?;
    let client = Catalog::new(cfg.http_timeout()).service(settings.server_address.as_deref())?;
    let videos = client.list_videos().await?;
    let Some(item) = videos.iter().find(|v| &v.filename == filename) else {
        bail!("no video named {:?}", filename);
    };
    let dest = client.download(item, &cfg.download_dir).await?;
    println!("Saved {}", dest.display());
    Ok(())
}

async fn play(cfg: &Config, store: &SettingsStore, m: &ArgMatches) -> Result<()> {
    let Some(filename) = m.get_one::<String>("filename") else {
        bail!("missing FILENAME");
    };
    let settings = store.load()?;
    let client = Catalog::new(cfg.http_timeout()).service(settings.server_address.as_deref())?;
    let videos = client.list_videos().await?;
    let Some(item) = videos.iter().find(|v| &v.filename == filename) else {
        bail!("no video named {:?}", filename);
    };
    let url = client.video_url(item)?;

    let mut player = ExternalPlayer::new(cfg.player_command.clone());
    player.play(url.as_str())?;
    println!("Playing {}", url);
    tokio::select! {
        _ = player.exited() => info!("player closed"),
        r = shutdown_signal() => {
            r?;
            info!("interrupted");
        }
    }
    player.stop();
    Ok(())
}

async fn watch(cfg: &Config, store: &SettingsStore, m: &ArgMatches) -> Result<()> {
    let Some(feeder) = m.get_one::<String>("feeder") else {
        bail!("missing FEEDER");
    };
    let settings = store.load()?;
    let (Some(address), Some(client_id)) = (settings.server_address, settings.client_id) else {
        bail!("no saved server address and client id; run `smartfeeder connect` first");
    };
    let server = ServerAddress::parse(&address)?;
    let client_id = ClientId::new(client_id)?;

    let session = SessionHandle::spawn(connector(cfg));
    session
        .establish_session(&address, client_id)
        .connected()
        .await
        .context("connecting to feeder server")?;

    let mut forced = session.watch_force_stop();
    let mut state = session.watch_state();
    let player = ExternalPlayer::new(cfg.player_command.clone());
    let mut playback = StreamPlayback::new(session.clone(), player, server, cfg.stream_port);
    let url = playback.request_and_start(feeder).await?;
    println!("Playing {}", url);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = forced.changed() => {
                if changed.is_err() {
                    break;
                }
                let stopped = forced.borrow_and_update().clone();
                if let Some(stopped) = stopped {
                    session.clear_force_stop();
                    if playback.handle_server_stream_stop(&stopped) {
                        println!("Stream stopped by server");
                        break;
                    }
                }
            }
            changed = state.changed() => {
                let current = *state.borrow_and_update();
                if changed.is_err() || matches!(current, ConnectionState::Disconnected | ConnectionState::Error) {
                    warn!(?current, "lost connection to server");
                    break;
                }
            }
            _ = playback.player_mut().exited() => {
                info!("player closed");
                break;
            }
            r = &mut shutdown => {
                r?;
                info!("interrupted");
                break;
            }
        }
    }

    if let Err(e) = playback.stop().await {
        warn!("stopping stream: {}", e);
    }
    wait_disconnected(&session).await;
    Ok(())
}

fn settings_cmd(store: &SettingsStore, m: &ArgMatches) -> Result<()> {
    match m.subcommand() {
        Some(("clear", _)) => {
            store.clear()?;
            println!("Settings cleared");
        }
        _ => {
            let s = store.load()?;
            println!("file:           {}", store.path().display());
            println!("server address: {}", s.server_address.as_deref().unwrap_or("-"));
            println!("client id:      {}", s.client_id.as_deref().unwrap_or("-"));
            if !s.are_available() {
                println!("run `smartfeeder connect` to complete setup");
            }
        }
    }
    Ok(())
}

async fn wait_disconnected(session: &SessionHandle) {
    let mut state = session.watch_state();
    let done = state.wait_for(|s| matches!(s, ConnectionState::Disconnected | ConnectionState::Error));
    if tokio::time::timeout(DISCONNECT_GRACE, done).await.is_err() {
        warn!("server did not confirm disconnect");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let m = cli().try_get_matches_from(["smartfeeder", "watch", "feeder-1"]).unwrap();
        let (name, sub) = m.subcommand().unwrap();
        assert_eq!(name, "watch");
        assert_eq!(sub.get_one::<String>("feeder").unwrap(), "feeder-1");

        let m = cli().try_get_matches_from(["smartfeeder", "connect"]).unwrap();
        assert!(m.subcommand_matches("connect").unwrap().get_one::<String>("address").is_none());

        let m = cli().try_get_matches_from(["smartfeeder", "play", "cam1.mp4"]).unwrap();
        let sub = m.subcommand_matches("play").unwrap();
        assert_eq!(sub.get_one::<String>("filename").unwrap(), "cam1.mp4");
        assert!(cli().try_get_matches_from(["smartfeeder", "play"]).is_err());

        assert!(cli().try_get_matches_from(["smartfeeder", "download"]).is_err());
        assert!(cli().try_get_matches_from(["smartfeeder"]).is_err());
    }
}
