use serde_json::json;
use shipwright_core::report::{interpret, Invocation, Outcome, MAX_MESSAGE_LEN};

fn invocation() -> Invocation {
    Invocation {
        action: "run".into(),
        stack: "web".into(),
        playbook: "frontend".into(),
        image: "ops/devops".into(),
        tag: "latest".into(),
        args: vec!["ansible-playbook".into(), "frontend.yml".into()],
    }
}

/// A failing report where each of `hosts` has one failing task with a
/// message of `msg_len` bytes.
fn failing(hosts: &[&str], msg_len: usize) -> Vec<u8> {
    let results: serde_json::Map<String, serde_json::Value> = hosts
        .iter()
        .map(|h| (h.to_string(), json!({"failed": true, "msg": "x".repeat(msg_len)})))
        .collect();
    json!({
        "plays": [{"play": {"name": "site"}, "tasks": [{"task": {"name": "converge"}, "hosts": results}]}],
        "stats": {}
    })
    .to_string()
    .into_bytes()
}

#[test]
fn interpretation_is_deterministic() {
    let out = failing(&["a", "b", "c"], 100);
    let first = interpret(&invocation(), 2, &out, MAX_MESSAGE_LEN);
    let second = interpret(&invocation(), 2, &out, MAX_MESSAGE_LEN);
    assert_eq!(first, second);
    assert_eq!(first.outcome, Outcome::Failure);
}

#[test]
fn host_blocks_are_never_split_across_messages() {
    let out = failing(&["alpha", "beta", "gamma"], 300);
    let report = interpret(&invocation(), 2, &out, 500);

    for host in ["alpha", "beta", "gamma"] {
        let holders: Vec<&String> = report
            .messages
            .iter()
            .filter(|m| m.contains(&format!("The *{host}* host")))
            .collect();
        assert_eq!(holders.len(), 1, "{host} appears in exactly one message");
        assert!(holders[0].contains(&"x".repeat(300)), "{host} block is complete");
    }
    assert!(report.messages.iter().all(|m| m.len() <= 500));
    // headline+alpha, beta, gamma, repro
    assert_eq!(report.messages.len(), 4);
    assert!(report.messages[0].starts_with("I'm sorry, *run* failed on *web frontend*:"));
}

#[test]
fn small_blocks_share_a_message() {
    let out = failing(&["a", "b", "c"], 10);
    let report = interpret(&invocation(), 1, &out, MAX_MESSAGE_LEN);
    assert_eq!(report.messages.len(), 2);
    assert!(report.messages[0].contains("The *a* host"));
    assert!(report.messages[0].contains("The *c* host"));
}

#[test]
fn oversize_block_is_truncated_not_split() {
    let out = failing(&["huge"], 10_000);
    let report = interpret(&invocation(), 2, &out, MAX_MESSAGE_LEN);
    assert!(report.messages.iter().all(|m| m.len() <= MAX_MESSAGE_LEN));
    let block = report
        .messages
        .iter()
        .find(|m| m.contains("The *huge* host"))
        .unwrap();
    assert!(block.ends_with('…'));
    assert_eq!(report.messages.iter().filter(|m| m.contains("xxxx")).count(), 1);
}

#[test]
fn success_without_hosts_says_so() {
    let out = br#"{"plays": [], "stats": {}}"#;
    let report = interpret(&invocation(), 0, out, MAX_MESSAGE_LEN);
    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(
        report.messages,
        vec!["All *web frontend* tasks ran ok, but no hosts reported any results.".to_string()]
    );
}

#[test]
fn single_host_without_changes() {
    let out = br#"{"plays": [], "stats": {"web1": {"changed": 0, "ok": 4}}}"#;
    let report = interpret(&invocation(), 0, out, MAX_MESSAGE_LEN);
    assert_eq!(
        report.messages[0],
        "All *web frontend* tasks ran ok on the *web1* host with no changes reported."
    );
}

#[test]
fn exit_zero_with_garbage_is_unreadable() {
    let report = interpret(&invocation(), 0, b"PLAY RECAP ****", MAX_MESSAGE_LEN);
    assert_eq!(report.outcome, Outcome::Unreadable);
    assert_eq!(report.messages.len(), 1);
    assert!(report.messages[0].starts_with("Oh dear! I couldn't read the JSON returned by Ansible"));
}

#[test]
fn failure_without_failed_tasks_mentions_exit_code() {
    let out = br#"{"plays": [], "stats": {}}"#;
    let report = interpret(&invocation(), 3, out, MAX_MESSAGE_LEN);
    assert!(report.messages[0].contains("Ansible exited with code 3"));
    assert!(report.messages[1].starts_with("You can replicate this problem"));
}

#[test]
fn runtime_failure_keeps_repro() {
    let msgs = invocation().runtime_failure("container timed out after 1800s", MAX_MESSAGE_LEN);
    assert_eq!(
        msgs[0],
        "I'm sorry, *run* failed on *web frontend*: container timed out after 1800s"
    );
    assert!(msgs[1].contains("docker run -t --rm ops/devops:latest ansible-playbook frontend.yml"));
}

#[test]
fn long_raw_failure_keeps_the_trailing_error() {
    let mut out = "PLAY [all] ****\n".repeat(500);
    out.push_str("ERROR! the role 'nginx' was not found");
    let report = interpret(&invocation(), 4, out.as_bytes(), 1000);

    let dump = &report.messages[0];
    assert!(dump.len() <= 1000);
    assert!(dump.starts_with("I'm sorry, *run* failed on *web frontend*:\n>>>…"));
    assert!(dump.ends_with("ERROR! the role 'nginx' was not found"));
    assert_eq!(report.messages.len(), 2, "dump and repro");
}
