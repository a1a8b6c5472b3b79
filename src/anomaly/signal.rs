use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::config::SyncMode;
use crate::errors::{LabError, Result};

/// Sending half of a one-shot step signal.
pub(crate) struct Cue {
    sender: Option<Sender<()>>,
}

impl Cue {
    /// Releases the waiting side. Dropping a cue without giving it also
    /// releases the waiter, so a failed session never strands its peer.
    pub(crate) fn give(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        }
    }
}

/// Receiving half of a one-shot step signal.
pub(crate) struct CueWait {
    name: &'static str,
    receiver: Option<Receiver<()>>,
    fallback: Duration,
}

impl CueWait {
    /// Blocks until the cue is given (rendezvous mode) or for the fallback
    /// offset (timed mode). `limit` is reported if the deadline passes.
    pub(crate) fn wait(&self, deadline: Instant, limit: Duration) -> Result<()> {
        let Some(receiver) = &self.receiver else {
            thread::sleep(self.fallback);
            return Ok(());
        };
        match receiver.recv_deadline(deadline) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Peer dropped cue '{}' without giving it", self.name);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("Gave up waiting for cue '{}'", self.name);
                Err(LabError::Timeout(limit))
            }
        }
    }
}

/// Creates a step signal. In timed mode the waiter sleeps for `fallback`
/// instead of listening.
pub(crate) fn cue(name: &'static str, mode: &SyncMode, fallback: Duration) -> (Cue, CueWait) {
    match mode {
        SyncMode::Rendezvous => {
            let (sender, receiver) = bounded(1);
            (
                Cue {
                    sender: Some(sender),
                },
                CueWait {
                    name,
                    receiver: Some(receiver),
                    fallback,
                },
            )
        }
        SyncMode::Timed(_) => (
            Cue { sender: None },
            CueWait {
                name,
                receiver: None,
                fallback,
            },
        ),
    }
}
