//! Turn an `ansible-playbook` run into chat messages.
//!
//! Input is the exit code plus combined output of a run with the JSON stdout
//! callback. Output is a list of messages, none longer than the transport
//! allows, with each host's failures kept together in one message.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{
    runtime::image_ref,
    text::{clamp, clamp_tail, plural, sentence},
};

/// Slack's limit on message text.
pub const MAX_MESSAGE_LEN: usize = 4000;

const GENERIC_TASK: &str = "Running the play";

// ── Parsed report ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaybookReport {
    #[serde(default)]
    pub plays: Vec<Play>,
    #[serde(default)]
    pub stats: BTreeMap<String, HostStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct HostStats {
    #[serde(default)]
    pub changed: u64,
    #[serde(default)]
    pub ok: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default, alias = "failures", alias = "failure")]
    pub failed: u64,
    #[serde(default)]
    pub unreachable: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Named {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Play {
    #[serde(default)]
    pub play: Named,
    #[serde(default)]
    pub tasks: Vec<PlayTask>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayTask {
    #[serde(default)]
    pub task: Named,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostResult {
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub msg: Value,
}

impl HostResult {
    fn message(&self) -> String {
        match &self.msg {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub name: String,
    pub message: String,
}

/// A failing play's hosts, each with its failing tasks in run order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayFailures {
    pub play: String,
    pub hosts: BTreeMap<String, Vec<FailedTask>>,
}

impl PlaybookReport {
    /// Parse the JSON callback output. Anything printed before the document
    /// (warnings, deprecation notices) and anything after it (stderr) is
    /// ignored.
    pub fn parse(output: &[u8]) -> Result<Self, serde_json::Error> {
        let start = json_start(output).unwrap_or(0);
        let mut docs = serde_json::Deserializer::from_slice(&output[start..]).into_iter::<Self>();
        match docs.next() {
            Some(doc) => doc,
            None => serde_json::from_slice(b""),
        }
    }

    /// Failed or unreachable task results, grouped per play and host.
    pub fn failures(&self) -> Vec<PlayFailures> {
        let mut out = Vec::new();
        for play in &self.plays {
            let mut hosts: BTreeMap<String, Vec<FailedTask>> = BTreeMap::new();
            for task in &play.tasks {
                for (host, result) in &task.hosts {
                    if result.failed || result.unreachable {
                        hosts.entry(host.clone()).or_default().push(FailedTask {
                            name: task.task.name.clone(),
                            message: result.message(),
                        });
                    }
                }
            }
            if !hosts.is_empty() {
                out.push(PlayFailures {
                    play: play.play.name.clone(),
                    hosts,
                });
            }
        }
        out
    }
}

/// Offset of the first line that opens a JSON object.
fn json_start(output: &[u8]) -> Option<usize> {
    if output.first() == Some(&b'{') {
        return Some(0);
    }
    output
        .windows(2)
        .position(|w| w == b"\n{")
        .map(|i| i + 1)
}

// ── Rendering ────────────────────────────────────────────────────────────

/// What was run, for headlines and the reproduction command.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub action: String,
    pub stack: String,
    pub playbook: String,
    pub image: String,
    pub tag: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn title(&self) -> String {
        format!("*{} {}*", self.stack, self.playbook)
    }

    fn failure_headline(&self) -> String {
        format!("I'm sorry, *{}* failed on {}:", self.action, self.title())
    }

    /// Shell command an operator can paste to rerun the playbook by hand.
    pub fn reproduce_command(&self) -> String {
        let image = image_ref(&self.image, &self.tag);
        format!(
            "docker pull {image} && \\\ndocker run -t --rm {image} {}",
            self.args.join(" ")
        )
    }

    pub fn reproduce_message(&self, max_len: usize) -> String {
        clamp(
            &format!(
                "You can replicate this problem from a terminal with:\n```{}```",
                self.reproduce_command()
            ),
            max_len,
        )
    }

    /// Report for a run the container engine could not carry out at all.
    pub fn runtime_failure(&self, err: &str, max_len: usize) -> Vec<String> {
        vec![
            clamp(&format!("{} {err}", self.failure_headline()), max_len),
            self.reproduce_message(max_len),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exit 0 and a readable report.
    Success,
    /// Non-zero exit, with or without a readable report.
    Failure,
    /// Exit 0 but the output was not the expected JSON.
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    pub messages: Vec<String>,
}

/// Interpret a finished run. Pure: the same input always yields the same
/// messages.
pub fn interpret(inv: &Invocation, exit_code: i64, output: &[u8], max_len: usize) -> Report {
    let parsed = PlaybookReport::parse(output);

    match (exit_code, parsed) {
        (0, Ok(report)) => Report {
            outcome: Outcome::Success,
            messages: render_success(inv, &report, max_len),
        },
        (0, Err(e)) => Report {
            outcome: Outcome::Unreadable,
            messages: vec![clamp(
                &format!("Oh dear! I couldn't read the JSON returned by Ansible:\n```{e}```"),
                max_len,
            )],
        },
        (code, Ok(report)) => {
            let mut messages = render_failures(inv, code, &report, max_len);
            messages.push(inv.reproduce_message(max_len));
            Report {
                outcome: Outcome::Failure,
                messages,
            }
        }
        (_, Err(_)) => {
            // Ansible prints its ERROR! line last, so long output loses its head.
            let raw = String::from_utf8_lossy(output);
            let head = format!("{}\n>>>", inv.failure_headline());
            let dump = format!(
                "{head}{}",
                clamp_tail(raw.trim(), max_len.saturating_sub(head.len()))
            );
            Report {
                outcome: Outcome::Failure,
                messages: vec![dump, inv.reproduce_message(max_len)],
            }
        }
    }
}

/// One host's failures: numbered tasks, messages quoted line by line.
fn host_block(host: &str, tasks: &[FailedTask]) -> String {
    let mut block = format!(
        "The *{host}* host has {} failing:",
        plural(tasks.len(), "task")
    );
    for (i, task) in tasks.iter().enumerate() {
        let name = if task.name.trim().is_empty() {
            GENERIC_TASK.to_string()
        } else {
            sentence(&task.name)
        };
        block.push_str(&format!(
            "\n*{}. {name}* returned this error:\n>{}",
            i + 1,
            task.message.replace('\n', "\n>")
        ));
    }
    block
}

fn render_failures(inv: &Invocation, exit_code: i64, report: &PlaybookReport, max_len: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    for play in report.failures() {
        for (host, tasks) in &play.hosts {
            blocks.push(host_block(host, tasks));
        }
    }
    if blocks.is_empty() {
        blocks.push(format!(
            "Ansible exited with code {exit_code} without saying which task failed."
        ));
    }
    pack(inv.failure_headline(), blocks, max_len)
}

fn stats_phrase(stats: &HostStats) -> String {
    format!(
        "{} changed, {} unchanged and {} skipped",
        stats.changed, stats.ok, stats.skipped
    )
}

fn render_success(inv: &Invocation, report: &PlaybookReport, max_len: usize) -> Vec<String> {
    let headline = format!("All {} tasks ran ok", inv.title());
    match report.stats.len() {
        0 => vec![clamp(&format!("{headline}, but no hosts reported any results."), max_len)],
        1 => {
            let (host, stats) = report
                .stats
                .iter()
                .next()
                .map(|(h, s)| (h.as_str(), *s))
                .unwrap_or_default();
            let detail = if stats.changed == 0 {
                "with no changes reported".to_string()
            } else {
                format!("with {}", stats_phrase(&stats))
            };
            vec![clamp(&format!("{headline} on the *{host}* host {detail}."), max_len)]
        }
        n => {
            let lines = report
                .stats
                .iter()
                .map(|(host, stats)| {
                    if stats.changed == 0 {
                        format!("  • *{host}*: no changes reported.")
                    } else {
                        format!("  • *{host}*: {}.", stats_phrase(stats))
                    }
                })
                .collect();
            pack(format!("{headline} on the following {n} hosts:"), lines, max_len)
        }
    }
}

/// Concatenate `blocks` under `headline`, starting a new message whenever
/// the next block would push the current one past `max_len`. Blocks are
/// never split; one that alone exceeds the limit is truncated.
fn pack(headline: String, blocks: Vec<String>, max_len: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut buf = clamp(&headline, max_len);
    for block in blocks {
        let block = clamp(&block, max_len);
        if buf.len() + 1 + block.len() > max_len {
            if !buf.is_empty() {
                messages.push(std::mem::take(&mut buf));
            }
            buf = block;
        } else {
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&block);
        }
    }
    if !buf.is_empty() {
        messages.push(buf);
    }
    messages
}
