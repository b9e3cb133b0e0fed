//! Image refresh with a patience timer.
//!
//! The pull runs as its own task and races a holding timer. If the timer
//! wins, the user gets one "just a sec" message and we keep waiting for the
//! pull. Whatever happens, the user sees at most one holding message and at
//! most one outcome message, in that order.

use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    sink::{notify, ConversationSink},
    toggle::PullToggle,
};

pub const DOWNLOADED_NEWER: &str = "Status: Downloaded newer";
pub const UP_TO_DATE: &str = "Status: Image is up to date";

pub const DEFAULT_HOLD_AFTER: Duration = Duration::from_secs(3);

pub const BUSY_MESSAGE: &str = "Try again in a sec: I'm busy pulling the latest devops image.";
pub const HOLDING_MESSAGE: &str =
    "Just a sec: I'm checking to see if there's an updated devops image...";

#[derive(Debug, Error)]
pub enum PullError {
    #[error("already pulling image")]
    Busy,
    #[error("image pull failed: {0}")]
    Failed(String),
}

/// How the engine described the outcome of a successful pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStatus {
    Updated,
    UpToDate,
    Unrecognised(String),
}

impl PullStatus {
    pub fn classify(line: &str) -> Self {
        if line.starts_with(DOWNLOADED_NEWER) {
            Self::Updated
        } else if line.starts_with(UP_TO_DATE) {
            Self::UpToDate
        } else {
            Self::Unrecognised(line.to_string())
        }
    }
}

pub struct PullCoordinator {
    toggle: Arc<PullToggle>,
    hold_after: Duration,
}

impl PullCoordinator {
    pub fn new(toggle: Arc<PullToggle>, hold_after: Duration) -> Self {
        Self { toggle, hold_after }
    }

    /// Run `pull` and report to `sink`. Returns whether a newer image arrived.
    ///
    /// Fails fast with [`PullError::Busy`] while another pull is in flight;
    /// `pull` is then dropped without ever being polled.
    pub async fn coordinate<F>(&self, pull: F, sink: &dyn ConversationSink) -> Result<bool, PullError>
    where
        F: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let Some(_pulling) = self.toggle.try_enter() else {
            debug!("pull refused: another pull in flight");
            notify(sink, BUSY_MESSAGE).await;
            return Err(PullError::Busy);
        };

        let mut pull = tokio::spawn(pull);
        let holding = tokio::time::sleep(self.hold_after);
        tokio::pin!(holding);
        let mut held = false;

        let joined = loop {
            tokio::select! {
                res = &mut pull => break res,
                () = &mut holding, if !held => {
                    held = true;
                    notify(sink, HOLDING_MESSAGE).await;
                }
            }
        };

        let outcome = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("pull task aborted: {e}")));

        match outcome {
            Ok(line) => {
                let status = PullStatus::classify(&line);
                info!(?status, held, "image pull finished");
                if let Some(text) = status_message(&status, held) {
                    notify(sink, &text).await;
                }
                Ok(status == PullStatus::Updated)
            }
            Err(e) => {
                let err = format!("{e:#}");
                warn!(held, "image pull failed: {err}");
                notify(sink, &failure_message(&err, held)).await;
                Err(PullError::Failed(err))
            }
        }
    }
}

/// Message for a completed pull. After a holding message the user is always
/// told the outcome, even when nothing changed.
fn status_message(status: &PullStatus, held: bool) -> Option<String> {
    match (status, held) {
        (PullStatus::Updated, true) => Some("Great - there's a newer image that I'm now using.".into()),
        (PullStatus::Updated, false) => Some("Ah! I've just retrieved the latest devops image.".into()),
        (PullStatus::UpToDate, true) => {
            Some("No new image is available: I'll continue using the existing one...".into())
        }
        (PullStatus::UpToDate, false) => None,
        (PullStatus::Unrecognised(line), true) => Some(format!(
            "I received this message whilst checking for the image. Not sure what it means...\n```{line}```"
        )),
        (PullStatus::Unrecognised(line), false) => Some(format!(
            "I'm passing on this message I received when checking for an updated devops image. Not sure what it means...\n```{line}```"
        )),
    }
}

fn failure_message(err: &str, held: bool) -> String {
    if held {
        format!(
            "Oops! I've just received this error whilst checking for the image:\n```{err}```\nYou'll need to dig into it I'm afraid."
        )
    } else {
        format!(
            "I tried and failed to check for an updated devops image. This is the message I received:\n```{err}```\nYou'll need to dig into it I'm afraid."
        )
    }
}
