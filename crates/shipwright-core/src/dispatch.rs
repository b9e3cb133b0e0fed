//! Routes chat events and commands to their handlers.
//!
//! One task per inbound message. Shared state lives in [`SharedState`]:
//! per-stack deploy keys, the pull toggle, channel membership and the
//! catalog. None of its locks is held across a container call.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{ActionVerb, Catalog, Playbook, RunAction, Stack},
    channels::Channels,
    config::Config,
    lock::DeployLocks,
    pull::PullCoordinator,
    report::{interpret, Invocation, Outcome, MAX_MESSAGE_LEN},
    runtime::ContainerRuntime,
    sink::{notify, Broadcast, ChannelSink, ChatApi, ConversationSink, Reply},
    text::{bullets, desentence, plural},
    toggle::PullToggle,
    trigger::{classify, mention_hint, Trigger},
    types::{BotIdentity, ChannelKind, ChatEvent, Command, IncomingMessage, Membership},
};

/// Environment for every playbook container.
pub const ANSIBLE_ENV: [&str; 2] = ["ANSIBLE_STDOUT_CALLBACK=json", "ANSIBLE_RETRY_FILES_ENABLED=0"];

const NO_STACKS: &str = "Sorry, there aren't any stacks at the moment.";

/// Process-wide mutable state, injected so tests get fresh instances.
#[derive(Clone, Default)]
pub struct SharedState {
    pub locks: Arc<DeployLocks>,
    pub pull_toggle: Arc<PullToggle>,
    pub channels: Arc<RwLock<Channels>>,
    pub catalog: Arc<RwLock<Catalog>>,
    /// Set once a catalog has been read from the image. Until then every
    /// refresh retries the read, whether or not the image changed.
    pub catalog_loaded: Arc<AtomicBool>,
}

impl SharedState {
    /// State with a catalog that is already loaded.
    pub fn new(channels: Channels, catalog: Catalog) -> Self {
        Self {
            channels: Arc::new(RwLock::new(channels)),
            catalog: Arc::new(RwLock::new(catalog)),
            catalog_loaded: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        }
    }

    /// State whose catalog still has to be read from the image.
    pub fn with_channels(channels: Channels) -> Self {
        Self {
            channels: Arc::new(RwLock::new(channels)),
            ..Default::default()
        }
    }

    pub fn catalog_loaded(&self) -> bool {
        self.catalog_loaded.load(Ordering::SeqCst)
    }
}

/// What the event loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Stop,
}

pub struct Dispatcher {
    config: Arc<Config>,
    runtime: Arc<dyn ContainerRuntime>,
    api: Arc<dyn ChatApi>,
    state: SharedState,
    puller: PullCoordinator,
    identity: RwLock<Option<BotIdentity>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        api: Arc<dyn ChatApi>,
        state: SharedState,
    ) -> Self {
        let puller = PullCoordinator::new(Arc::clone(&state.pull_toggle), config.hold_after());
        Self {
            config,
            runtime,
            api,
            state,
            puller,
            identity: RwLock::new(None),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub async fn set_identity(&self, identity: BotIdentity) {
        *self.identity.write().await = Some(identity);
    }

    pub fn broadcast(&self) -> Broadcast {
        Broadcast::new(Arc::clone(&self.api), Arc::clone(&self.state.channels))
    }

    // ── Events ────────────────────────────────────────────────────────────

    /// Route one transport event. Messages and (re)connects are handled on
    /// their own tasks so the receive loop never waits on a deployment.
    pub async fn handle_event(self: &Arc<Self>, event: ChatEvent) -> EventFlow {
        match event {
            ChatEvent::Connected(identity) => {
                info!(bot = %identity.name, id = %identity.id, "connected");
                self.set_identity(identity).await;
                let this = Arc::clone(self);
                tokio::spawn(async move { this.on_connected().await });
            }
            ChatEvent::Message(msg) => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.handle_message(msg).await });
            }
            ChatEvent::MembershipChanged { channel, change } => {
                info!(channel = %channel.name, id = %channel.id, ?change, "membership changed");
                match change {
                    Membership::Joined => {
                        let greet = (channel.kind != ChannelKind::Direct)
                            .then(|| ChannelSink::new(Arc::clone(&self.api), channel.id.clone()));
                        self.state.channels.write().await.add(channel);
                        if let Some(sink) = greet {
                            notify(&sink, "You rang...?").await;
                        }
                    }
                    Membership::Left => {
                        self.state.channels.write().await.remove(&channel.id);
                    }
                }
            }
            ChatEvent::Disconnected { intentional } => {
                if intentional {
                    info!("sent away");
                } else {
                    warn!("forcibly disconnected");
                }
            }
            ChatEvent::ConnectionError(e) => warn!("transport error: {e}"),
            ChatEvent::AuthError(e) => {
                error!("invalid credentials: {e}");
                return EventFlow::Stop;
            }
        }
        EventFlow::Continue
    }

    /// Reload the catalog (refreshing the image first) and say hello.
    /// A failed load is retried by the next command that refreshes.
    pub async fn on_connected(&self) {
        let bc = self.broadcast();
        self.state.catalog_loaded.store(false, Ordering::SeqCst);
        if self.refresh(&bc).await.is_ok() {
            notify(&bc, "You rang...?").await;
        }
    }

    // ── Messages ──────────────────────────────────────────────────────────

    pub async fn handle_message(&self, msg: IncomingMessage) {
        let Some(identity) = self.identity.read().await.clone() else {
            debug!("message before connect, dropping");
            return;
        };
        let reply = Reply::new(Arc::clone(&self.api), msg.channel_id.clone(), msg.thread_ts.clone());

        let text = match classify(&msg, &identity, self.config.enable_dm) {
            Trigger::Ignore => return,
            Trigger::NameOnly => {
                notify(&reply, &mention_hint(&msg, &identity)).await;
                return;
            }
            Trigger::Command(text) => text,
        };

        let Some(cmd) = Command::parse(&text) else {
            notify(&reply, "You rang?").await;
            return;
        };
        debug!(verb = %cmd.verb, args = ?cmd.args, channel = %msg.channel_id, "command");

        match cmd.verb.as_str() {
            "help" => self.help(&reply, &cmd.args).await,
            "list" => self.list(&reply, &cmd.args).await,
            "version" => notify(&reply, &version_text()).await,
            verb => {
                if self.authorized(&msg).await {
                    self.run(&reply, ActionVerb::from_verb(verb), &cmd.args).await;
                } else {
                    debug!(channel = %msg.channel_id, "run refused outside command channel");
                    notify(&reply, &self.redirect_text()).await;
                }
            }
        }
    }

    /// Run-type commands are confined to the command channel (and DMs when
    /// enabled) so every deploy is visible to the team.
    pub async fn authorized(&self, msg: &IncomingMessage) -> bool {
        if msg.is_direct {
            return self.config.enable_dm;
        }
        let channels = self.state.channels.read().await;
        match channels.get(&msg.channel_id) {
            None => false,
            Some(_) if self.config.command_channel.is_empty() => true,
            Some(c) => c.name == self.config.command_channel,
        }
    }

    fn redirect_text(&self) -> String {
        let mut text = if self.config.command_channel.is_empty() {
            "I'm sorry, you can only run playbook commands on a group channel I'm a member of. This way everyone is notified.".to_string()
        } else {
            format!(
                "I'm sorry, you can only run playbook commands on the *#{}* channel. This way everyone is notified.",
                self.config.command_channel
            )
        };
        if !self.config.enable_dm {
            text.push_str(" Direct messages can be enabled with `SHIPWRIGHT_ENABLE_DM`.");
        }
        text
    }

    // ── Image and catalog ─────────────────────────────────────────────────

    /// Check for a newer devops image; reload the catalog if one arrived
    /// or no load has succeeded yet. Returns whether the image changed.
    pub async fn refresh(&self, sink: &dyn ConversationSink) -> Result<bool> {
        let updated = if self.config.disable_pull {
            false
        } else {
            let runtime = Arc::clone(&self.runtime);
            let (image, tag, auth) = (
                self.config.image.clone(),
                self.config.tag.clone(),
                self.config.registry.clone(),
            );
            let pull = async move { runtime.pull(&image, &tag, &auth).await };
            self.puller.coordinate(pull, sink).await?
        };

        if updated || !self.state.catalog_loaded() {
            self.load_catalog(sink).await?;
        }
        Ok(updated)
    }

    /// Read the catalog file out of the image.
    pub async fn load_catalog(&self, sink: &dyn ConversationSink) -> Result<()> {
        let file = &self.config.catalog_file;
        let args = vec!["cat".to_string(), file.clone()];
        let out = match self.runtime.run(&self.config.image, &self.config.tag, &args, &[]).await {
            Ok(out) => out,
            Err(e) => {
                warn!("catalog read failed: {e:#}");
                notify(
                    sink,
                    &format!("I'm sorry, I couldn't update my configuration from the image. The message I got is:\n```{e:#}```"),
                )
                .await;
                return Err(e);
            }
        };

        if out.exit_code != 0 {
            let raw = String::from_utf8_lossy(&out.output).trim().to_string();
            warn!(exit_code = out.exit_code, "catalog read exited non-zero");
            notify(
                sink,
                &format!("I'm sorry, I couldn't update my configuration from the image. This is the output I got:\n```{raw}```"),
            )
            .await;
            anyhow::bail!("reading {file} failed: {raw}");
        }

        match Catalog::from_yaml(&out.output) {
            Ok(catalog) => {
                info!(stacks = catalog.len(), "catalog loaded");
                *self.state.catalog.write().await = catalog;
                self.state.catalog_loaded.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                warn!("catalog parse failed: {e:#}");
                notify(
                    sink,
                    &format!("Oh dear! I couldn't read the {file} file from the image:\n```{e:#}```"),
                )
                .await;
                Err(e)
            }
        }
    }

    // ── help / list ───────────────────────────────────────────────────────

    async fn help(&self, sink: &dyn ConversationSink, args: &[String]) {
        let text = match args.first().map(String::as_str) {
            None => help_overview("Sure"),
            Some("run") | Some("deploy") => "Use *`run <stack> <playbook>`* to run a playbook from a stack. Name several playbooks to run them one after another. If a playbook has custom actions, replace `run` with the name of the action.".to_string(),
            Some("restart") => "Use *`restart <stack> <playbook>`* to run only the restart tasks of a playbook.".to_string(),
            Some("list") => help_list(""),
            Some("version") => "This tells you the version I'm tagged with and the commit I was built from.".to_string(),
            Some(_) => "How about giving me a chance and using a command I understand?!".to_string(),
        };
        notify(sink, &text).await;
    }

    async fn list(&self, sink: &dyn ConversationSink, args: &[String]) {
        if self.refresh(sink).await.is_err() {
            return;
        }
        let catalog = self.state.catalog.read().await.clone();
        if catalog.is_empty() {
            notify(sink, NO_STACKS).await;
            return;
        }

        let text = match args {
            [] => list_stacks(&catalog),
            [stack] => match catalog.stack(stack) {
                Some(st) => list_stack(stack, st),
                None => unknown_stack(stack),
            },
            [stack, playbook] => match catalog.stack(stack) {
                None => unknown_stack(stack),
                Some(st) => match st.playbooks.get(playbook) {
                    Some(pb) => list_playbook(playbook, pb),
                    None => unknown_playbooks(stack, std::slice::from_ref(playbook)),
                },
            },
            _ => help_list("I'm sorry, I have no idea what you're asking"),
        };
        notify(sink, &text).await;
    }

    // ── run ───────────────────────────────────────────────────────────────

    /// `<verb> <stack> <playbook>...`
    async fn run(&self, sink: &dyn ConversationSink, verb: ActionVerb, args: &[String]) {
        if self.refresh(sink).await.is_err() {
            return;
        }
        let catalog = self.state.catalog.read().await.clone();
        if catalog.is_empty() {
            notify(sink, NO_STACKS).await;
            return;
        }

        let Some((stack_name, requested)) = args.split_first() else {
            notify(sink, &prompt_for_stack(&catalog, &verb)).await;
            return;
        };
        let Some(stack) = catalog.stack(stack_name) else {
            notify(sink, &unknown_stack(stack_name)).await;
            return;
        };
        if requested.is_empty() {
            notify(sink, &prompt_for_playbook(stack_name, stack)).await;
            return;
        }

        let unknown: Vec<String> = requested
            .iter()
            .filter(|p| !stack.playbooks.contains_key(p.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            debug!(stack = %stack_name, ?unknown, "unknown playbooks");
            notify(sink, &unknown_playbooks(stack_name, &unknown)).await;
            return;
        }

        let mut plan: Vec<(&str, &Playbook, RunAction)> = Vec::with_capacity(requested.len());
        for name in requested {
            let playbook = &stack.playbooks[name.as_str()];
            match verb.resolve(playbook) {
                Some(action) => plan.push((name.as_str(), playbook, action)),
                None => {
                    notify(sink, &unknown_action(verb.as_str(), name, playbook)).await;
                    return;
                }
            }
        }

        let Some(_deploying) = self.state.locks.try_lock(stack_name) else {
            debug!(stack = %stack_name, "stack busy");
            notify(
                sink,
                &format!("Patience! I'm already busy running a playbook from *{stack_name}* - please wait until I'm done."),
            )
            .await;
            return;
        };

        // Keep going after a failure: each playbook gets its own report.
        for (name, playbook, action) in plan {
            self.run_playbook(sink, stack_name, name, playbook, &action).await;
        }
    }

    async fn run_playbook(
        &self,
        sink: &dyn ConversationSink,
        stack: &str,
        name: &str,
        playbook: &Playbook,
        action: &RunAction,
    ) -> Outcome {
        let start = match action {
            RunAction::Default => format!("OK, I'm running the *{stack} {name}* playbook..."),
            other => format!(
                "OK, I'm running the *{}* action on the *{stack} {name}* playbook...",
                other.name()
            ),
        };
        notify(sink, &start).await;

        let inv = Invocation {
            action: action.name().to_string(),
            stack: stack.to_string(),
            playbook: name.to_string(),
            image: self.config.image.clone(),
            tag: self.config.tag.clone(),
            args: action.ansible_args(playbook),
        };
        let env: Vec<String> = ANSIBLE_ENV.iter().map(|s| s.to_string()).collect();

        info!(stack, playbook = name, action = action.name(), "running playbook");
        let outcome = match self.runtime.run(&inv.image, &inv.tag, &inv.args, &env).await {
            Ok(out) => {
                let report = interpret(&inv, out.exit_code, &out.output, MAX_MESSAGE_LEN);
                for text in &report.messages {
                    notify(sink, text).await;
                }
                report.outcome
            }
            Err(e) => {
                for text in inv.runtime_failure(&format!("{e:#}"), MAX_MESSAGE_LEN) {
                    notify(sink, &text).await;
                }
                Outcome::Failure
            }
        };
        match outcome {
            Outcome::Success => info!(stack, playbook = name, "playbook succeeded"),
            other => warn!(stack, playbook = name, outcome = ?other, "playbook did not succeed"),
        }
        outcome
    }
}

// ── Reply text ───────────────────────────────────────────────────────────

fn version_text() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("SHIPWRIGHT_COMMIT") {
        Some(commit) if !commit.is_empty() => {
            format!("I'm tagged as version {version} built from commit {commit}.")
        }
        _ => format!("It looks like I'm running as a development build of version {version}."),
    }
}

fn help_overview(intro: &str) -> String {
    format!(
        "{intro}. I can help with the following commands:\n{}\nUse *`help <command>`* for further details.",
        bullets(&[
            "*`run`* - run a playbook.",
            "*`restart`* - run only the restart tasks of a playbook.",
            "*`list`* - list playbooks I can run.",
            "*`version`* - give an idea of how advanced I am.",
        ])
    )
}

fn help_list(intro: &str) -> String {
    let mut text = String::new();
    if !intro.is_empty() {
        text.push_str(intro);
        text.push_str(". ");
    }
    text.push_str("Use *`list`* as follows:\n  • Simply *`list`* to find the stacks I can deal with;\n  • *`list <stack>`* to find playbooks associated with a stack;\n  • and *`list <stack> <playbook>`* to describe any custom actions available for a playbook.");
    text
}

fn list_stacks(catalog: &Catalog) -> String {
    let names = catalog.stack_names();
    match names.as_slice() {
        [] => NO_STACKS.to_string(),
        [only] => format!("I only know about the *{only}* stack."),
        many => format!(
            "I know about the following {} stacks:\n{}",
            many.len(),
            bullets(many)
        ),
    }
}

fn actions_suffix(count: usize) -> String {
    match count {
        0 => String::new(),
        n => format!(" (with {})", plural(n, "action")),
    }
}

fn list_stack(name: &str, stack: &Stack) -> String {
    let playbooks = stack.playbook_names();
    match playbooks.as_slice() {
        [] => format!("It doesn't look like there are any playbooks associated with *{name}*."),
        [only] => {
            let pb = &stack.playbooks[only];
            let mut text = format!("The *{name}* stack only has the *{only}* playbook");
            if pb.about.is_empty() {
                text.push_str(" associated with it.");
            } else {
                text.push_str(&format!(" designed to {}.", desentence(&pb.about)));
            }
            if !pb.actions.is_empty() {
                text.push_str(&format!(
                    " This has {} you can invoke.",
                    plural(pb.actions.len(), "additional action")
                ));
            }
            text
        }
        many => {
            let lines: Vec<String> = many
                .iter()
                .map(|p| {
                    let pb = &stack.playbooks[p];
                    let mut line = format!("*{p}*{}", actions_suffix(pb.actions.len()));
                    if !pb.about.is_empty() {
                        line.push_str(&format!(": {}", desentence(&pb.about)));
                    }
                    line
                })
                .collect();
            format!(
                "The *{name}* stack has {} playbooks associated with it:\n{}",
                many.len(),
                bullets(&lines)
            )
        }
    }
}

fn list_playbook(name: &str, pb: &Playbook) -> String {
    let actions = pb.action_names();
    match actions.as_slice() {
        [] => format!("There aren't any additional actions associated with *{name}*."),
        [only] => {
            let about = &pb.actions[only].about;
            let mut text = format!("In addition to `run`, the *{name}* playbook has the *{only}* action");
            if about.is_empty() {
                text.push_str(" associated with it.");
            } else {
                text.push_str(&format!(" designed to {}.", desentence(about)));
            }
            text
        }
        many => {
            let lines: Vec<String> = many
                .iter()
                .map(|a| {
                    let about = &pb.actions[a].about;
                    if about.is_empty() {
                        format!("*{a}*")
                    } else {
                        format!("*{a}*: {}", desentence(about))
                    }
                })
                .collect();
            format!(
                "The *{name}* playbook has {} actions associated with it:\n{}",
                many.len(),
                bullets(&lines)
            )
        }
    }
}

fn prompt_for_stack(catalog: &Catalog, verb: &ActionVerb) -> String {
    let names = catalog.stack_names();
    match names.as_slice() {
        [only] => format!(
            "Which stack should I {}? I only know about the *{only}* stack.",
            verb.as_str()
        ),
        many => format!(
            "Which stack should I {}? Choose one of these {} stacks:\n{}",
            verb.as_str(),
            many.len(),
            bullets(many)
        ),
    }
}

fn prompt_for_playbook(name: &str, stack: &Stack) -> String {
    let playbooks = stack.playbook_names();
    match playbooks.as_slice() {
        [] => format!("It doesn't look like there are any playbooks associated with *{name}*."),
        [only] => format!(
            "The *{name}* stack only has the *{only}* playbook associated with it but you need to explicitly type it."
        ),
        many => format!(
            "Please specify a playbook from the *{name}* stack:\n{}",
            bullets(many)
        ),
    }
}

fn unknown_stack(name: &str) -> String {
    format!(
        "Oh dear. I'm afraid I don't know anything about the *{name}* stack. Perhaps it's a typo or perhaps you need to configure it?"
    )
}

fn unknown_playbooks(stack: &str, unknown: &[String]) -> String {
    match unknown {
        [] => String::new(),
        [one] => format!("Hmmm. I'm not aware of the *{one}* playbook being part of the *{stack}* stack."),
        [a, b] => format!(
            "Hmmm. Neither *{a}* nor *{b}* are playbooks in the *{stack}* stack, so I haven't run anything."
        ),
        many => {
            let names: Vec<String> = many.iter().map(|p| format!("*{p}*")).collect();
            format!(
                "Hmmm. These {} playbooks aren't part of the *{stack}* stack, so I haven't run anything:\n{}",
                many.len(),
                bullets(&names)
            )
        }
    }
}

fn unknown_action(action: &str, playbook: &str, pb: &Playbook) -> String {
    let actions = pb.action_names();
    match actions.as_slice() {
        [] => format!("I'm afraid the *{playbook}* playbook doesn't have any custom actions, so I can't *{action}* it."),
        [only] => format!(
            "Hmmm. I don't know the *{action}* action: the only custom action associated with *{playbook}* is *{only}*."
        ),
        [a, b] => format!(
            "Hmmm. I don't know the *{action}* action: the custom actions associated with *{playbook}* are *{a}* and *{b}*."
        ),
        many => format!(
            "Hmmm. I don't know the *{action}* action: these are the custom actions for *{playbook}* that I'm aware of:\n{}",
            bullets(many)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Action;

    fn playbook_with(actions: &[&str]) -> Playbook {
        Playbook {
            location: "pb.yml".into(),
            actions: actions.iter().map(|a| (a.to_string(), Action::default())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_action_phrasing_by_count() {
        assert!(unknown_action("x", "pb", &playbook_with(&[])).contains("doesn't have any custom actions"));
        assert!(unknown_action("x", "pb", &playbook_with(&["a"])).contains("the only custom action associated with *pb* is *a*"));
        assert!(unknown_action("x", "pb", &playbook_with(&["a", "b"])).contains("are *a* and *b*"));
        assert!(unknown_action("x", "pb", &playbook_with(&["a", "b", "c"])).contains("  • c"));
    }

    #[test]
    fn unknown_playbook_phrasing_by_count() {
        let one = unknown_playbooks("web", &["x".into()]);
        assert!(one.contains("*x* playbook"));
        let two = unknown_playbooks("web", &["x".into(), "y".into()]);
        assert!(two.starts_with("Hmmm. Neither *x* nor *y*"));
        let three = unknown_playbooks("web", &["x".into(), "y".into(), "z".into()]);
        assert!(three.contains("These 3 playbooks"));
    }

    #[test]
    fn stack_prompt_singular_and_plural() {
        let mut catalog = Catalog::default();
        catalog.stacks.insert("web".into(), Stack::default());
        assert!(prompt_for_stack(&catalog, &ActionVerb::Default).contains("I only know about the *web* stack"));
        catalog.stacks.insert("db".into(), Stack::default());
        assert!(prompt_for_stack(&catalog, &ActionVerb::Default).contains("Choose one of these 2 stacks"));
    }

    #[test]
    fn list_stack_mentions_action_counts() {
        let mut stack = Stack::default();
        stack.playbooks.insert("api".into(), playbook_with(&["rollback"]));
        stack.playbooks.insert("web".into(), playbook_with(&[]));
        let text = list_stack("prod", &stack);
        assert!(text.contains("*api* (with 1 action)"));
        assert!(text.contains("  • *web*"));
    }
}
