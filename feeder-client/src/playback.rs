//! Stream playback: asks the session for a stream path and drives the local player.

use feeder_core::{FeederId, ServerAddress, SessionError};
use tracing::{debug, info, warn};

use crate::player::{MediaPlayer, PlayerError};
use crate::session::SessionHandle;

pub struct StreamPlayback<P> {
    session: SessionHandle,
    player: P,
    address: ServerAddress,
    stream_port: u16,
    current: Option<FeederId>,
}

impl<P: MediaPlayer> StreamPlayback<P> {
    pub fn new(session: SessionHandle, player: P, address: ServerAddress, stream_port: u16) -> Self {
        Self {
            session,
            player,
            address,
            stream_port,
            current: None,
        }
    }

    /// Feeder whose stream is playing locally.
    pub fn current_feeder(&self) -> Option<&FeederId> {
        self.current.as_ref()
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn player_mut(&mut self) -> &mut P {
        &mut self.player
    }

    /// Request `feeder`'s stream and play it. Returns the playback URL.
    pub async fn request_and_start(&mut self, feeder: &str) -> Result<String, PlaybackError> {
        let feeder = FeederId::new(feeder).map_err(|_| PlaybackError::InvalidFeeder)?;
        if !self.session.is_connected() {
            return Err(SessionError::NotConnected.into());
        }
        if self.current.as_ref().is_some_and(|c| *c != feeder) {
            debug!(previous = ?self.current, "switching feeder, stopping local playback");
            self.stop_local();
            self.current = None;
        }
        info!(feeder = %feeder, "requesting stream");
        let path = self.session.request_stream(&feeder).await?;
        let url = self.address.stream_url(self.stream_port, &path);
        self.player.play(&url)?;
        self.current = Some(feeder);
        Ok(url)
    }

    /// Stop the tracked stream on the server and locally, then disconnect.
    /// The local player is stopped whatever the server answers.
    pub async fn stop(&mut self) -> Result<(), PlaybackError> {
        let Some(feeder) = self.current.take() else {
            self.stop_local();
            if self.session.is_connected() {
                self.session.disconnect();
            }
            return Ok(());
        };
        if !self.session.is_connected() {
            debug!(feeder = %feeder, "not connected, stopping locally only");
            self.stop_local();
            return Ok(());
        }
        info!(feeder = %feeder, "stopping stream");
        let result = self.session.stop_stream(&feeder).await;
        if let Err(e) = &result {
            warn!(feeder = %feeder, "server did not confirm stop: {}", e);
        }
        self.stop_local();
        self.session.disconnect();
        result.map_err(PlaybackError::from)
    }

    /// React to a server-side forced stop. Only the tracked feeder is torn down.
    pub fn handle_server_stream_stop(&mut self, feeder: &FeederId) -> bool {
        if self.current.as_ref() != Some(feeder) {
            debug!(feeder = %feeder, current = ?self.current, "ignoring forced stop for another feeder");
            return false;
        }
        info!(feeder = %feeder, "stream stopped by server");
        self.stop_local();
        self.current = None;
        true
    }

    fn stop_local(&mut self) {
        if self.player.is_playing() {
            self.player.stop();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("invalid feeder id")]
    InvalidFeeder,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Player(#[from] PlayerError),
}
