use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use parking_lot::Mutex;
use tempfile::TempDir;

use super::*;
use crate::{client::ClientError, relay::dns::StaticResolver};

/// Replies per host: `None` delivers, `Some(code)` refuses with `code`.
#[derive(Default)]
struct Scripted {
    replies: HashMap<String, Option<u32>>,
    attempts: Mutex<Vec<String>>,
}

#[async_trait]
impl Deliver for Scripted {
    async fn deliver(
        &self,
        server: &MailServer,
        _address: SocketAddr,
        _mail: &Mail,
        _message: &[u8],
    ) -> Result<(), RelayError> {
        self.attempts.lock().push(server.host.clone());

        match self.replies.get(&server.host).copied().flatten() {
            None => Ok(()),
            Some(code) => Err(RelayError::Client(ClientError::SmtpError {
                code,
                message: String::from("scripted"),
            })),
        }
    }
}

#[derive(Default)]
struct Outbox(Mutex<Vec<MessageBuilder>>);

#[async_trait]
impl Notify for Outbox {
    async fn notify(&self, message: MessageBuilder) -> anyhow::Result<()> {
        self.0.lock().push(message);
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    relay: Arc<Relay>,
    deliver: Arc<Scripted>,
    outbox: Arc<Outbox>,
    source: PathBuf,
}

fn fixture(replies: &[(&str, Option<u32>)]) -> Fixture {
    fixture_with(replies, |_| {})
}

fn fixture_with(replies: &[(&str, Option<u32>)], adjust: impl FnOnce(&mut Config)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.relay.queue_dir = dir.path().join("queue");
    config.relay.retry_base_interval = 60;
    adjust(&mut config);

    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let resolver = StaticResolver::default()
        .with_mx(
            "example.org",
            vec![
                MailServer::new("mx2.example.org", 20, 25),
                MailServer::new("mx1.example.org", 10, 25),
            ],
        )
        .with_ip("mx1.example.org", vec![localhost])
        .with_ip("mx2.example.org", vec![localhost])
        .with_ip("example.net", vec![localhost]);

    let deliver = Arc::new(Scripted {
        replies: replies
            .iter()
            .map(|(host, reply)| ((*host).to_string(), *reply))
            .collect(),
        ..Scripted::default()
    });
    let outbox = Arc::new(Outbox::default());

    let relay = Relay::new(
        Arc::new(config),
        Arc::new(resolver),
        Arc::clone(&deliver) as Arc<dyn Deliver>,
        Arc::clone(&outbox) as Arc<dyn Notify>,
    );

    let source = dir.path().join("source.msg");
    std::fs::write(&source, "Subject: Hello\r\n\r\nHello World\r\n").unwrap();

    Fixture {
        _dir: dir,
        relay,
        deliver,
        outbox,
        source,
    }
}

fn envelope(from: &str, to: &[&str]) -> Envelope {
    Envelope {
        from: Some(from.to_string()),
        to: to.iter().map(|to| (*to).to_string()).collect(),
    }
}

impl Fixture {
    async fn add(&self, from: &str, to: &[&str]) -> Vec<Mail> {
        self.relay
            .add(&envelope(from, to), &self.source, Headers::default())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn add_stores_a_copy_per_recipient() {
    let fixture = fixture(&[]);
    let added = fixture
        .add("a@example.com", &["b@example.org", "c@example.org"])
        .await;

    assert_eq!(added.len(), 2);
    assert_ne!(added[0].id, added[1].id);
    assert_ne!(added[0].file, added[1].file);
    for mail in &added {
        assert_eq!(mail.recipients().len(), 1);
        assert!(mail.file.exists());
        assert_eq!(Mail::read(&mail.meta).await.unwrap(), *mail);
    }
    assert_eq!(fixture.relay.queued(), 2);

    fixture.relay.remove(&added[0]).await;
    assert!(added[1].file.exists());
}

#[tokio::test]
async fn add_rejects_incomplete_envelopes() {
    let fixture = fixture(&[]);

    let err = fixture
        .relay
        .add(&envelope("a@example.com", &[]), &fixture.source, Headers::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidEnvelope(_)));

    let err = fixture
        .relay
        .add(&Envelope::default(), &fixture.source, Headers::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidEnvelope(_)));
    assert_eq!(fixture.relay.queued(), 0);
}

#[tokio::test]
async fn permanent_failure_bounces_once_and_removes() {
    let fixture = fixture(&[("mx1.example.org", Some(550)), ("mx2.example.org", Some(554))]);
    let mail = fixture.add("a@example.com", &["b@example.org"]).await.remove(0);

    fixture.relay.process(mail.clone()).await.unwrap();

    assert_eq!(
        *fixture.deliver.attempts.lock(),
        vec!["mx1.example.org", "mx2.example.org"]
    );
    assert_eq!(fixture.outbox.0.lock().len(), 1);
    let ndr = fixture.outbox.0.lock()[0].clone();
    assert_eq!(ndr.envelope_to().unwrap(), vec!["a@example.com"]);
    assert!(!mail.file.exists());
    assert!(!mail.meta.exists());
}

#[tokio::test]
async fn transient_failure_is_persisted_and_rescheduled() {
    let fixture = fixture(&[("mx1.example.org", Some(451)), ("mx2.example.org", Some(550))]);
    let mail = fixture.add("a@example.com", &["b@example.org"]).await.remove(0);
    let queued = fixture.relay.queued();

    fixture.relay.process(mail.clone()).await.unwrap();

    let stored = Mail::read(&mail.meta).await.unwrap();
    assert_eq!(stored.failures.len(), 1);
    assert!(!stored.failures[0].permanent);
    assert!(stored.failures[0].error.contains("mx1.example.org"));
    assert!(mail.file.exists());
    assert!(fixture.outbox.0.lock().is_empty());
    assert_eq!(fixture.relay.queued(), queued + 1);

    fixture.relay.process(stored).await.unwrap();
    assert_eq!(Mail::read(&mail.meta).await.unwrap().failures.len(), 2);
}

#[tokio::test]
async fn delivered_mail_is_removed() {
    let fixture = fixture(&[("mx1.example.org", None)]);
    let mail = fixture.add("a@example.com", &["b@example.org"]).await.remove(0);

    fixture.relay.process(mail.clone()).await.unwrap();

    assert_eq!(*fixture.deliver.attempts.lock(), vec!["mx1.example.org"]);
    assert!(fixture.outbox.0.lock().is_empty());
    assert!(!mail.file.exists());
    assert!(!mail.meta.exists());
}

#[tokio::test]
async fn falls_back_to_the_domain_without_mx() {
    let fixture = fixture(&[("example.net", Some(550))]);
    let mail = fixture.add("a@example.com", &["b@example.net"]).await.remove(0);

    fixture.relay.process(mail).await.unwrap();

    assert_eq!(*fixture.deliver.attempts.lock(), vec!["example.net"]);
    assert_eq!(fixture.outbox.0.lock().len(), 1);
}

#[tokio::test]
async fn expired_mail_is_bounced_without_an_attempt() {
    let fixture = fixture(&[]);
    let mut mail = fixture.add("a@example.com", &["b@example.org"]).await.remove(0);
    mail.created -= chrono::Duration::hours(49);

    fixture.relay.process(mail.clone()).await.unwrap();

    assert!(fixture.deliver.attempts.lock().is_empty());
    assert_eq!(fixture.outbox.0.lock().len(), 1);
    assert!(!mail.meta.exists());
}

#[tokio::test]
async fn unbounded_retry_window_still_delivers() {
    let fixture = fixture_with(&[("mx1.example.org", None)], |config| {
        config.relay.retry_hours = u64::MAX;
    });
    let mail = fixture.add("a@example.com", &["b@example.org"]).await.remove(0);

    fixture.relay.process(mail.clone()).await.unwrap();

    assert_eq!(*fixture.deliver.attempts.lock(), vec!["mx1.example.org"]);
    assert!(!mail.meta.exists());
}

#[tokio::test]
async fn unresolvable_hosts_are_retried() {
    let fixture = fixture(&[]);
    let mail = fixture.add("a@example.com", &["b@unknown.example"]).await.remove(0);

    let err = fixture.relay.send(&mail).await.unwrap_err();
    assert!(!err.is_permanent());
    assert_eq!(
        err.to_string(),
        "unknown.example: DNS error: Domain does not exist: unknown.example"
    );

    fixture.relay.process(mail.clone()).await.unwrap();

    assert!(fixture.deliver.attempts.lock().is_empty());
    assert!(fixture.outbox.0.lock().is_empty());
    let stored = Mail::read(&mail.meta).await.unwrap();
    assert_eq!(stored.failures.len(), 1);
    assert!(!stored.failures[0].permanent);
}

#[tokio::test]
async fn null_sender_mail_is_not_bounced() {
    let fixture = fixture(&[("mx1.example.org", Some(550)), ("mx2.example.org", Some(550))]);
    let mail = fixture.add("<>", &["b@example.org"]).await.remove(0);

    fixture.relay.process(mail.clone()).await.unwrap();

    assert!(fixture.outbox.0.lock().is_empty());
    assert!(!mail.file.exists());
}

#[tokio::test]
async fn remove_is_idempotent() {
    let fixture = fixture(&[]);
    let mail = fixture.add("a@example.com", &["b@example.org"]).await.remove(0);

    fixture.relay.remove(&mail).await;
    fixture.relay.remove(&mail).await;
    assert!(!mail.file.exists());
}

#[tokio::test]
async fn reload_skips_corrupt_records() {
    let fixture = fixture(&[]);
    let added = fixture.add("a@example.com", &["b@example.org"]).await;
    std::fs::write(fixture.relay.queue_dir().join("broken.msg.info"), "{not json").unwrap();

    let reloaded = fixture.relay.reload().await.unwrap();

    assert_eq!(reloaded, 1);
    assert_eq!(fixture.relay.queued(), added.len() + 1);
}
