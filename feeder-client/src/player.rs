//! Local media player: plays a stream URL.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub trait MediaPlayer: Send {
    /// Start playing `url`, replacing whatever was playing.
    fn play(&mut self, url: &str) -> Result<(), PlayerError>;
    /// Stop playback. No-op when idle.
    fn stop(&mut self);
    fn is_playing(&self) -> bool;
}

/// Runs an external command (e.g. `ffplay`) with the stream URL as its argument.
#[derive(Debug)]
pub struct ExternalPlayer {
    command: String,
    child: Option<Child>,
}

impl ExternalPlayer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: None,
        }
    }

    /// Wait until the player process exits by itself. Pending forever when idle.
    pub async fn exited(&mut self) {
        match self.child.as_mut() {
            Some(child) => {
                match child.wait().await {
                    Ok(status) => info!(%status, "player exited"),
                    Err(e) => warn!("waiting for player: {}", e),
                }
                self.child = None;
            }
            None => std::future::pending().await,
        }
    }
}

impl MediaPlayer for ExternalPlayer {
    fn play(&mut self, url: &str) -> Result<(), PlayerError> {
        self.stop();
        info!(player = %self.command, url, "starting playback");
        let child = Command::new(&self.command)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PlayerError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("stopping player");
            if let Err(e) = child.start_kill() {
                debug!("player already gone: {}", e);
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.child.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("cannot start player {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
