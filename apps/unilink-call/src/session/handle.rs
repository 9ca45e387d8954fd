use tokio::sync::{mpsc, oneshot, watch};

use super::state::SessionSnapshot;
use crate::error::ChatError;

pub(crate) enum Command {
    Hangup {
        done: oneshot::Sender<()>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    SetAudio(bool),
    SetVideo(bool),
    ToggleMute {
        reply: oneshot::Sender<Option<bool>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Option<bool>>,
    },
    RetryNegotiation,
}

/// Caller-side handle to a running call session. Cheap to clone; the session
/// hangs up once every handle is dropped.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CallHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self { commands, snapshot }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Resolves with the first published snapshot matching `predicate`, or the
    /// final one if the session stops before that happens.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = self.snapshot.clone();
        let matched = rx.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        matched.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Ends the call and waits until every resource is released.
    pub async fn hangup(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Hangup { done }).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ChatError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SendChat {
                text: text.into(),
                reply,
            })
            .map_err(|_| ChatError::SessionClosed)?;
        response.await.map_err(|_| ChatError::SessionClosed)?
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetAudio(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetVideo(enabled));
    }

    /// Returns the new audio state, `None` without an audio track.
    pub async fn toggle_mute(&self) -> Option<bool> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::ToggleMute { reply }).ok()?;
        response.await.ok().flatten()
    }

    pub async fn toggle_camera(&self) -> Option<bool> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::ToggleCamera { reply }).ok()?;
        response.await.ok().flatten()
    }

    /// Re-attempts the offer after a failed negotiation step.
    pub fn retry_negotiation(&self) {
        let _ = self.commands.send(Command::RetryNegotiation);
    }
}
