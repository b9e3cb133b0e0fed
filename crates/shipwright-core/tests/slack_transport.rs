//! Slack transport against a local HTTP stub.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use shipwright_core::{
    slack::{list_channels_with_retry, Slack, SlackError},
    BotIdentity, ChannelInfo, ChannelKind, ChatEvent,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Requests seen by the stub (method line plus form body), in arrival order.
type Seen = Arc<Mutex<Vec<String>>>;

/// Serve `respond(request)` to every connection until the test ends.
async fn stub<F>(respond: F) -> (Slack, Seen)
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::default();
    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let Ok(request) = read_request(&mut stream).await else {
                continue;
            };
            if request.is_empty() {
                continue;
            }
            log.lock().unwrap().push(request.clone());
            let _ = stream.write_all(respond(&request).as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    let slack = Slack::new("xoxb-test").with_base_url(format!("http://{addr}"));
    (slack, seen)
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn http(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

fn rate_limited(retry_after: &str) -> String {
    http("429 Too Many Requests", &[("retry-after", retry_after)], "")
}

#[tokio::test]
async fn channel_listing_retries_rate_limits_until_exhausted() {
    let (slack, seen) = stub(|_| rate_limited("0")).await;

    let err = list_channels_with_retry(&slack, false, 3, Duration::from_millis(10))
        .await
        .unwrap_err();

    assert!(matches!(err, SlackError::RateLimited(d) if d == Duration::ZERO), "{err:?}");
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn channel_listing_recovers_after_a_transient_failure() {
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let (slack, seen) = stub(move |_| {
        let mut n = counter.lock().unwrap();
        *n += 1;
        if *n == 1 {
            http("200 OK", &[], &json!({"ok": false, "error": "internal_error"}).to_string())
        } else {
            let body = json!({"ok": true, "channels": [{"id": "C1", "name": "deploys"}]});
            http("200 OK", &[], &body.to_string())
        }
    })
    .await;

    let channels = list_channels_with_retry(&slack, false, 3, Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(channels, vec![ChannelInfo::new("C1", "deploys", ChannelKind::Channel)]);
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn channel_listing_gives_up_at_once_on_bad_credentials() {
    let (slack, seen) = stub(|_| {
        http("200 OK", &[], &json!({"ok": false, "error": "invalid_auth"}).to_string())
    })
    .await;

    let err = list_channels_with_retry(&slack, false, 5, Duration::from_millis(10))
        .await
        .unwrap_err();

    assert!(matches!(err, SlackError::Auth(code) if code == "invalid_auth"));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn history_follows_pages_until_exhausted() {
    let (slack, seen) = stub(|req| {
        let body = if req.contains("cursor=page2") {
            json!({"ok": true, "has_more": false, "messages": [{"ts": "1.0", "text": "first"}]})
        } else {
            json!({
                "ok": true,
                "has_more": true,
                "messages": [{"ts": "3.0", "text": "third"}, {"ts": "2.0", "text": "second"}],
                "response_metadata": {"next_cursor": "page2"}
            })
        };
        http("200 OK", &[], &body.to_string())
    })
    .await;

    let messages = slack.history("C1", "0.5").await.unwrap();

    let texts: Vec<&str> = messages.iter().filter_map(|m| m["text"].as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn rate_limited_poll_waits_instead_of_hammering() {
    let (slack, seen) = stub(|_| rate_limited("1")).await;
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let events = Arc::new(slack).run_events(
        BotIdentity::new("UBOT", "shipwright"),
        vec![ChannelInfo::new("C1", "deploys", ChannelKind::Channel)],
        false,
        Duration::from_millis(10),
        tx,
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    events.await.unwrap();

    let mut got = Vec::new();
    while let Ok(event) = rx.try_recv() {
        got.push(event);
    }
    assert_eq!(seen.lock().unwrap().len(), 1, "one request, then the requested pause");
    assert!(matches!(got.first(), Some(ChatEvent::Connected(_))));
    assert!(matches!(got.last(), Some(ChatEvent::Disconnected { intentional: true })));
    assert!(
        !got.iter().any(|e| matches!(e, ChatEvent::ConnectionError(_))),
        "rate limiting is not a connection error: {got:?}"
    );
}
