use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::broadcast,
    task::JoinHandle,
};

use super::{Session, SessionConfig};
use crate::{
    Config, Server, Signal,
    error::SessionResult,
    relay::dns::StaticResolver,
    smtp::{
        command::Payload,
        context::{Envelope, User},
        handler::{Verdict, handler_fn},
    },
    status::Status,
};

const HOSTNAME: &str = "mx.courier.test";

fn config() -> Config {
    let mut config = Config::default();
    config.hostname = HOSTNAME.to_string();
    config.domains = vec![String::from("courier.test")];
    config.relay.enabled = false;
    config.limits.idle_timeout = 5_000;
    config
}

struct Harness {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    session: JoinHandle<SessionResult<()>>,
    shutdown: broadcast::Sender<Signal>,
}

impl Harness {
    fn start<T>(config: Config, setup: impl FnOnce(&mut Session<DuplexStream>) -> T) -> (Self, T) {
        let server = Server::builder(config)
            .with_resolver(Arc::new(StaticResolver::default()))
            .build()
            .unwrap();

        let (client, stream) = tokio::io::duplex(64 * 1024);
        let mut session = Session::create(stream, SessionConfig::builder().build(), server);
        let extra = setup(&mut session);

        let (shutdown, receiver) = broadcast::channel(4);
        let session = tokio::spawn(session.run(receiver));
        let (reader, writer) = tokio::io::split(client);

        (
            Self {
                reader: BufReader::new(reader),
                writer,
                session,
                shutdown,
            },
            extra,
        )
    }

    /// One line, without its terminator. Empty at end of stream.
    async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for the server")
            .unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Every line of a possibly multi-line reply.
    async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                return lines;
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await.pop().unwrap_or_default()
    }

    async fn reply_to_ehlo(&mut self) {
        self.send("EHLO client").await;
        let lines = self.reply().await;
        assert!(lines.iter().all(|line| line.starts_with("250")));
    }

    async fn greeted(config: Config) -> Self {
        let (mut harness, ()) = Self::start(config, |_| ());
        assert_eq!(harness.line().await, format!("220 {HOSTNAME} courier"));
        harness
    }

    async fn finished(mut self) {
        assert_eq!(self.line().await, "");
        self.session.await.unwrap().unwrap();
    }
}

#[derive(Debug, Default, Clone)]
struct Seen {
    envelope: Envelope,
    user: Option<User>,
    transaction: u64,
    accepted: Vec<String>,
}

/// Records the session state whenever the client sends `NOOP`.
fn observe(session: &mut Session<DuplexStream>) -> Arc<Mutex<Seen>> {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let shared = Arc::clone(&seen);

    session.on(
        "noop",
        handler_fn(move |_req, res| {
            let mut accepted: Vec<String> = res.session.accepted.keys().cloned().collect();
            accepted.sort();
            *shared.lock() = Seen {
                envelope: res.session.envelope.clone(),
                user: res.session.user.clone(),
                transaction: res.session.transaction,
                accepted,
            };
            Ok(Verdict::accept())
        }),
    );

    seen
}

#[tokio::test]
async fn greets_and_says_goodbye() {
    let mut harness = Harness::greeted(config()).await;

    assert_eq!(harness.command("HELO client.example").await, format!("250 {HOSTNAME}"));
    assert_eq!(harness.command("NOOP").await, "250 OK");
    assert_eq!(
        harness.command("QUIT").await,
        format!("221 {HOSTNAME} closing connection")
    );

    harness.finished().await;
}

#[tokio::test]
async fn ehlo_advertises_extensions_without_starttls() {
    let mut harness = Harness::greeted(config()).await;

    harness.send("EHLO client.example").await;
    assert_eq!(
        harness.reply().await,
        vec![
            format!("250-{HOSTNAME}"),
            String::from("250-AUTH LOGIN PLAIN"),
            String::from("250-8BITMIME"),
            String::from("250-PIPELINING"),
            format!("250 SIZE {}", 100 * 1024 * 1024),
        ]
    );
}

#[tokio::test]
async fn mail_needs_a_greeting() {
    let mut harness = Harness::greeted(config()).await;

    assert_eq!(
        harness.command("MAIL FROM:<a@example.org>").await,
        "503 Error: Need HELO or EHLO command"
    );
    assert_eq!(harness.command("HELO client").await, format!("250 {HOSTNAME}"));
    assert_eq!(
        harness.command("MAIL").await,
        "501 Error: Incomplete MAIL command"
    );
}

#[tokio::test]
async fn null_sender_is_accepted_once() {
    let (mut harness, seen) = Harness::start(config(), observe);
    harness.line().await;

    harness.command("HELO client").await;
    assert_eq!(harness.command("MAIL FROM:<>").await, "250 OK");
    assert_eq!(
        harness.command("MAIL FROM:<b@example.org>").await,
        "503 Error: Nested MAIL command"
    );
    assert_eq!(harness.command("NOOP").await, "250 OK");

    assert_eq!(seen.lock().envelope.from.as_deref(), Some("<>"));
}

#[tokio::test]
async fn rset_keeps_the_greeting_but_ehlo_does_not_keep_the_transaction() {
    let (mut harness, seen) = Harness::start(config(), observe);
    harness.line().await;

    harness.command("HELO client").await;
    harness.command("MAIL FROM:<a@example.org>").await;
    harness.command("RCPT TO:<b@courier.test>").await;
    assert_eq!(harness.command("RSET").await, "250 OK");
    harness.command("NOOP").await;

    {
        let seen = seen.lock();
        assert_eq!(seen.envelope, Envelope::default());
        assert!(seen.accepted.contains(&String::from("helo")));
        assert!(!seen.accepted.contains(&String::from("mail")));
    }

    harness.command("MAIL FROM:<a@example.org>").await;
    harness.reply_to_ehlo().await;
    harness.command("NOOP").await;

    let seen = seen.lock();
    assert_eq!(seen.envelope.from, None);
    assert_eq!(seen.accepted, vec![String::from("ehlo")]);
}

#[tokio::test]
async fn recipients_are_limited_and_deduplicated() {
    let mut config = config();
    config.limits.max_recipients = 2;
    let (mut harness, seen) = Harness::start(config, observe);
    harness.line().await;

    harness.command("HELO client").await;
    assert_eq!(
        harness.command("RCPT TO:<a@courier.test>").await,
        "503 Error: need MAIL command"
    );
    harness.command("MAIL FROM:<x@example.org>").await;
    assert_eq!(harness.command("RCPT TO:<A@courier.test>").await, "250 OK");
    assert_eq!(harness.command("RCPT TO:<a@courier.test>").await, "250 OK");
    assert_eq!(harness.command("RCPT TO:<b@courier.test>").await, "250 OK");
    assert_eq!(
        harness.command("RCPT TO:<c@courier.test>").await,
        "502 Error: too many recipients"
    );
    harness.command("NOOP").await;

    assert_eq!(
        seen.lock().envelope.to,
        vec![String::from("a@courier.test"), String::from("b@courier.test")]
    );
}

#[tokio::test]
async fn auth_login_prompts_for_credentials() {
    let (mut harness, seen) = Harness::start(config(), observe);
    harness.line().await;

    harness.command("EHLO client").await;
    assert_eq!(harness.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    assert_eq!(harness.command(&STANDARD.encode("user")).await, "334 UGFzc3dvcmQ6");
    assert_eq!(
        harness.command(&STANDARD.encode("pass")).await,
        "235 authentication successful"
    );
    assert_eq!(
        harness.command("AUTH LOGIN").await,
        "503 Error: already authenticated"
    );
    harness.command("NOOP").await;

    assert_eq!(seen.lock().user, Some(User::new("user", "pass")));
}

#[tokio::test]
async fn auth_plain_accepts_an_initial_response() {
    let (mut harness, seen) = Harness::start(config(), observe);
    harness.line().await;

    harness.command("EHLO client").await;
    let token = STANDARD.encode("\0user\0secret");
    assert_eq!(
        harness.command(&format!("AUTH PLAIN {token}")).await,
        "235 authentication successful"
    );
    harness.command("NOOP").await;

    assert_eq!(seen.lock().user, Some(User::new("user", "secret")));
}

#[tokio::test]
async fn too_many_failed_authentications_close_the_session() {
    let mut config = config();
    config.limits.auth_failures = 1;
    let mut harness = Harness::greeted(config).await;

    harness.command("EHLO client").await;
    assert_eq!(
        harness.command("AUTH PLAIN bm9wZQ==").await,
        "500 Error: invalid user data"
    );
    assert_eq!(
        harness.command("AUTH PLAIN bm9wZQ==").await,
        "554 Error: Too many failed authentications"
    );

    harness.finished().await;
}

#[tokio::test]
async fn unknown_and_reserved_commands_are_unrecognized() {
    let mut config = config();
    config.limits.unrecognized_commands = 2;
    let mut harness = Harness::greeted(config).await;

    assert_eq!(harness.command("FOO bar").await, "502 Error: command not recognized");
    assert_eq!(harness.command("QUEUE").await, "502 Error: command not recognized");
    assert_eq!(
        harness.command("TIMEOUT").await,
        "554 error: too many unrecognized commands"
    );

    harness.finished().await;
}

#[tokio::test]
async fn session_handlers_run_after_registered_ones() {
    let (mut harness, ()) = Harness::start(config(), |session| {
        session.on(
            "noop",
            handler_fn(|_req, _res| Ok(Verdict::accept_with(Status::Ok, "from the session"))),
        );
    });
    harness.line().await;

    assert_eq!(harness.command("NOOP").await, "250 from the session");
}

#[tokio::test]
async fn read_continuations_receive_the_next_line() {
    let (mut harness, ()) = Harness::start(config(), |session| {
        session.on(
            "xecho",
            handler_fn(|_req, res| {
                res.write("354 go ahead");
                Ok(Verdict::read(|line, _req, _res| {
                    Ok(Verdict::accept_with(Status::Ok, format!("echo {line}")))
                }))
            }),
        );
    });
    harness.line().await;

    assert_eq!(harness.command("XECHO").await, "354 go ahead");
    assert_eq!(harness.command("NOOP").await, "250 echo NOOP");
    assert_eq!(harness.command("NOOP").await, "250 OK");
}

#[tokio::test]
async fn failing_handlers_end_the_session() {
    let (mut harness, ()) = Harness::start(config(), |session| {
        session.on("noop", handler_fn(|_req, _res| anyhow::bail!("boom")));
    });
    harness.line().await;

    assert_eq!(harness.command("NOOP").await, "500 Error: Internal server error");
    harness.finished().await;
}

#[tokio::test]
async fn panicking_handlers_end_the_session() {
    let (mut harness, ()) = Harness::start(config(), |session| {
        session.on(
            "noop",
            handler_fn(|_req, _res| -> anyhow::Result<Verdict> { panic!("boom") }),
        );
    });
    harness.line().await;

    assert_eq!(harness.command("NOOP").await, "500 Error: Internal server error");
    harness.finished().await;
}

#[tokio::test]
async fn idle_clients_are_disconnected() {
    let mut config = config();
    config.limits.idle_timeout = 50;
    let mut harness = Harness::greeted(config).await;

    assert_eq!(
        harness.line().await,
        "451 idle timeout (0.05s) expired - closing connection"
    );
    harness.finished().await;
}

#[tokio::test]
async fn overlong_lines_are_refused() {
    let mut harness = Harness::greeted(config()).await;

    let line = "a".repeat(5000);
    assert_eq!(
        harness.command(&line).await,
        "500 Error: line exceeds 4096 bytes"
    );
    assert_eq!(harness.command("NOOP").await, "250 OK");
}

#[tokio::test]
async fn starttls_without_certificates_is_refused() {
    let mut harness = Harness::greeted(config()).await;

    harness.reply_to_ehlo().await;
    assert_eq!(
        harness.command("STARTTLS").await,
        "454 Error: TLS not available"
    );
}

#[tokio::test]
async fn shutdown_closes_the_session() {
    let mut harness = Harness::greeted(config()).await;

    harness.shutdown.send(Signal::Shutdown).unwrap();
    assert_eq!(
        harness.line().await,
        format!("421 {HOSTNAME} Server shutting down")
    );
    harness.finished().await;
}

#[tokio::test]
async fn data_is_spooled_and_queued() {
    let (mut harness, (seen, spooled)) = Harness::start(config(), |session| {
        let spooled = Arc::new(Mutex::new(None::<(String, Option<String>)>));
        let shared = Arc::clone(&spooled);
        session.on(
            "queue",
            handler_fn(move |req, _res| {
                let Payload::File(path) = &req.command.data else {
                    anyhow::bail!("queue without a file");
                };
                anyhow::ensure!(req.file.as_ref() == Some(path), "spool path not attached");
                let body = std::fs::read_to_string(path)?;
                let subject = req
                    .mail
                    .as_ref()
                    .and_then(|mail| mail.get("subject"))
                    .map(str::to_string);
                *shared.lock() = Some((body, subject));
                Ok(Verdict::accept())
            }),
        );
        (observe(session), spooled)
    });
    harness.line().await;

    assert_eq!(harness.command("DATA").await, "503 Error: Need HELO or EHLO command");
    harness.command("HELO client").await;
    assert_eq!(harness.command("DATA").await, "503 Error: No valid sender");
    harness.command("MAIL FROM:<a@example.org>").await;
    assert_eq!(harness.command("DATA").await, "503 Error: No valid recipients");
    harness.command("RCPT TO:<b@courier.test>").await;
    assert_eq!(harness.command("DATA").await, "354 OK");

    harness.send("Subject: Hello").await;
    harness.send("").await;
    harness.send("..leading dot").await;
    harness.send("body").await;
    assert_eq!(harness.command(".").await, "250 OK");
    harness.command("NOOP").await;

    let (body, subject) = spooled.lock().clone().expect("Message was queued");
    assert!(body.starts_with("Received: from [127.0.0.1] (127.0.0.1)\r\n"));
    assert!(body.contains(&format!("by {HOSTNAME} (127.0.0.1) with SMTP;")));
    assert!(body.ends_with("Subject: Hello\r\n\r\n.leading dot\r\nbody\r\n"));
    assert_eq!(subject.as_deref(), Some("Hello"));

    let seen = seen.lock();
    assert_eq!(seen.transaction, 1);
    assert_eq!(seen.envelope, Envelope::default());
    assert!(!seen.accepted.contains(&String::from("mail")));
    assert!(seen.accepted.contains(&String::from("helo")));
}

#[tokio::test]
async fn oversized_messages_are_refused() {
    let mut config = config();
    config.limits.message_size = 16;
    let (mut harness, seen) = Harness::start(config, observe);
    harness.line().await;

    harness.command("HELO client").await;
    harness.command("MAIL FROM:<a@example.org>").await;
    harness.command("RCPT TO:<b@courier.test>").await;
    harness.command("DATA").await;
    harness.send("This line is longer than sixteen bytes").await;
    assert_eq!(
        harness.command(".").await,
        "552 Error: Message size exceeds fixed maximum message size"
    );
    harness.command("NOOP").await;

    let seen = seen.lock();
    assert_eq!(seen.transaction, 0);
    assert_eq!(seen.envelope, Envelope::default());
}

#[tokio::test]
async fn spool_failures_are_reported_after_the_message() {
    let spool = tempfile::tempdir().unwrap();
    let mut config = config();
    config.spool_dir = spool.path().join("missing");
    let (mut harness, seen) = Harness::start(config, observe);
    harness.line().await;

    harness.command("HELO client").await;
    harness.command("MAIL FROM:<a@example.org>").await;
    harness.command("RCPT TO:<b@courier.test>").await;
    assert_eq!(harness.command("DATA").await, "354 OK");
    harness.send("Subject: Lost").await;
    harness.send("").await;
    harness.send("body").await;
    assert_eq!(
        harness.command(".").await,
        "451 Error: Error while processing the mail"
    );
    assert_eq!(harness.command("NOOP").await, "250 OK");

    {
        let seen = seen.lock();
        assert_eq!(seen.transaction, 0);
        assert_eq!(seen.envelope, Envelope::default());
        assert!(seen.accepted.contains(&String::from("helo")));
    }

    assert_eq!(
        harness.command("QUIT").await,
        format!("221 {HOSTNAME} closing connection")
    );
    harness.finished().await;
}

#[tokio::test]
async fn auth_is_not_permitted_during_a_transaction() {
    let mut harness = Harness::greeted(config()).await;

    harness.reply_to_ehlo().await;
    harness.command("MAIL FROM:<a@example.org>").await;
    let token = STANDARD.encode("\0user\0secret");
    assert_eq!(
        harness.command(&format!("AUTH PLAIN {token}")).await,
        "503 Error: not permitted"
    );
}

#[tokio::test]
async fn authentication_survives_a_delivered_message() {
    let (mut harness, seen) = Harness::start(config(), observe);
    harness.line().await;

    harness.reply_to_ehlo().await;
    let token = STANDARD.encode("\0user\0secret");
    assert_eq!(
        harness.command(&format!("AUTH PLAIN {token}")).await,
        "235 authentication successful"
    );
    harness.command("MAIL FROM:<user@courier.test>").await;
    harness.command("RCPT TO:<b@courier.test>").await;
    assert_eq!(harness.command("DATA").await, "354 OK");
    harness.send("Subject: Hello").await;
    harness.send("").await;
    assert_eq!(harness.command(".").await, "250 OK");
    harness.command("NOOP").await;

    let seen = seen.lock();
    assert_eq!(seen.transaction, 1);
    assert_eq!(seen.user, Some(User::new("user", "secret")));
    assert!(seen.accepted.contains(&String::from("auth")));
    assert!(seen.accepted.contains(&String::from("ehlo")));
    assert!(!seen.accepted.contains(&String::from("mail")));
}
