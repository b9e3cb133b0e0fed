mod logging;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use shipwright_core::{
    channels::Channels,
    config::Config,
    dispatch::{Dispatcher, EventFlow, SharedState},
    sink::{notify, ChatApi},
    slack::{list_channels_with_retry, Slack},
};
use shipwright_docker::DockerCli;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_STEP: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    logging::init(config.debug, config.log_json);
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    info!(
        bot = %config.bot_name,
        image = %config.image,
        tag = %config.tag,
        pull = !config.disable_pull,
        command_channel = %config.command_channel,
        dm = config.enable_dm,
        "starting shipwright"
    );

    let docker = DockerCli::new(
        Duration::from_secs(config.run_timeout_s),
        Duration::from_secs(config.pull_inactivity_s),
    );
    if !docker.available().await {
        warn!("docker daemon not reachable yet; commands will fail until it is");
    }

    let slack = Arc::new(Slack::new(config.slack_token.clone()));
    let identity = slack
        .auth_test()
        .await
        .context("slack authentication failed")?
        .or_named(&config.bot_name);
    let channels = list_channels_with_retry(&slack, config.enable_dm, config.conn_attempts, RETRY_STEP)
        .await
        .context("could not list slack channels")?;
    info!(channels = channels.len(), bot = %identity.name, "joined channels");

    let state = SharedState::with_channels(channels.iter().cloned().collect::<Channels>());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::new(docker),
        Arc::clone(&slack) as Arc<dyn ChatApi>,
        state,
    ));

    let (tx, mut rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let events = Arc::clone(&slack).run_events(
        identity,
        channels,
        config.enable_dm,
        config.poll_interval(),
        tx,
        cancel.clone(),
    );

    let mut sigterm = terminate_signal()?;
    let signal = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if dispatcher.handle_event(event).await == EventFlow::Stop {
                        cancel.cancel();
                        let _ = events.await;
                        anyhow::bail!("slack rejected the bot's credentials");
                    }
                }
                None => {
                    error!("slack event loop ended unexpectedly");
                    break None;
                }
            },
            _ = tokio::signal::ctrl_c() => break Some("interrupt"),
            _ = sigterm.recv() => break Some("terminated"),
        }
    };

    if let Some(signal) = signal {
        info!(signal, "received signal, leaving");
        let farewell = format!("I have received the {signal} signal and am leaving. :anguished:");
        let bc = dispatcher.broadcast();
        if tokio::time::timeout(FAREWELL_TIMEOUT, notify(&bc, &farewell)).await.is_err() {
            warn!(signal, "failed to say goodbye before timeout");
        }
    }
    cancel.cancel();
    let _ = tokio::time::timeout(FAREWELL_TIMEOUT, events).await;
    info!("stopped");
    Ok(())
}

#[cfg(unix)]
fn terminate_signal() -> anyhow::Result<Terminate> {
    use tokio::signal::unix::{signal, SignalKind};
    Ok(Terminate(signal(SignalKind::terminate()).context("install SIGTERM handler")?))
}

#[cfg(not(unix))]
fn terminate_signal() -> anyhow::Result<Terminate> {
    Ok(Terminate)
}

#[cfg(unix)]
struct Terminate(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Terminate {
    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct Terminate;

#[cfg(not(unix))]
impl Terminate {
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}
