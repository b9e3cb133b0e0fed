use serde_json::json;
use shipwright_core::{
    slack::{diff_membership, parse_channel, parse_history_message},
    ChannelInfo, ChannelKind, Membership,
};

#[test]
fn channel_kinds() {
    let public = parse_channel(&json!({"id": "C1", "name": "deploys", "is_channel": true})).unwrap();
    assert_eq!(public, ChannelInfo::new("C1", "deploys", ChannelKind::Channel));

    let private = parse_channel(&json!({"id": "G1", "name": "ops", "is_private": true})).unwrap();
    assert_eq!(private.kind, ChannelKind::Group);

    let im = parse_channel(&json!({"id": "D1", "is_im": true, "user": "U42"})).unwrap();
    assert_eq!(im, ChannelInfo::new("D1", "U42", ChannelKind::Direct));

    assert!(parse_channel(&json!({"name": "no-id"})).is_none());
}

#[test]
fn user_messages_become_incoming() {
    let channel = ChannelInfo::new("C1", "deploys", ChannelKind::Channel);
    let msg = parse_history_message(
        &json!({"type": "message", "user": "U1", "text": "<@UBOT> list", "ts": "1.000100", "thread_ts": "0.5"}),
        &channel,
    )
    .unwrap();
    assert_eq!(msg.text, "<@UBOT> list");
    assert_eq!(msg.sender_id, "U1");
    assert_eq!(msg.channel_id, "C1");
    assert_eq!(msg.thread_ts.as_deref(), Some("0.5"));
    assert!(!msg.is_direct);
}

#[test]
fn system_and_bot_messages_are_dropped() {
    let channel = ChannelInfo::new("D1", "U1", ChannelKind::Direct);
    assert!(parse_history_message(&json!({"subtype": "channel_join", "user": "U1", "text": "joined"}), &channel).is_none());
    assert!(parse_history_message(&json!({"bot_id": "B1", "text": "hi"}), &channel).is_none());
    let dm = parse_history_message(&json!({"user": "U1", "text": "list"}), &channel).unwrap();
    assert!(dm.is_direct);
}

#[test]
fn membership_diff_reports_joins_then_leaves() {
    let a = ChannelInfo::new("C1", "a", ChannelKind::Channel);
    let b = ChannelInfo::new("C2", "b", ChannelKind::Channel);
    let c = ChannelInfo::new("C3", "c", ChannelKind::Channel);

    let changes = diff_membership(&[a.clone(), b.clone()], &[b, c.clone()]);
    assert_eq!(changes, vec![(c, Membership::Joined), (a, Membership::Left)]);
    assert!(diff_membership(&[], &[]).is_empty());
}
