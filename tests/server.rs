//! End to end tests against a listening server.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier::{
    Config, Server, Signal,
    client::{MessageBuilder, SmtpClient, Timeouts},
    error::RelayError,
    listener::{Listener, Mode},
    relay::{
        Deliver,
        dns::{MailServer, StaticResolver},
        mail::Mail,
    },
    server::ServerBuilder,
    smtp::{HandlerDef, Verdict, connection::TlsContext, handler_fn},
    status::Status,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::{sync::broadcast, task::JoinHandle};

const TIMEOUTS: Timeouts = Timeouts {
    greeting: Duration::from_secs(5),
    command: Duration::from_secs(5),
};

#[derive(Debug, Clone)]
struct Delivery {
    host: String,
    to: Vec<String>,
    message: String,
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Delivery>>);

#[async_trait]
impl Deliver for Recorder {
    async fn deliver(
        &self,
        server: &MailServer,
        _address: SocketAddr,
        mail: &Mail,
        message: &[u8],
    ) -> Result<(), RelayError> {
        self.0.lock().push(Delivery {
            host: server.host.clone(),
            to: mail.recipients().to_vec(),
            message: String::from_utf8_lossy(message).into_owned(),
        });
        Ok(())
    }
}

struct Running {
    _queue: TempDir,
    server: Arc<Server>,
    address: SocketAddr,
    recorder: Arc<Recorder>,
    shutdown: broadcast::Sender<Signal>,
    listener: JoinHandle<anyhow::Result<()>>,
}

fn config(queue: &Path) -> Config {
    let mut config = Config::default();
    config.hostname = String::from("mx.courier.test");
    config.domains = vec![String::from("courier.test")];
    config.listen.smtp = None;
    config.listen.submission = None;
    config.relay.queue_dir = queue.to_path_buf();
    config.relay.tick_interval_ms = 20;
    config
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

async fn start(adjust: impl FnOnce(&mut Config)) -> Running {
    start_with(adjust, |builder| builder).await
}

async fn start_with(
    adjust: impl FnOnce(&mut Config),
    customise: impl FnOnce(ServerBuilder) -> ServerBuilder,
) -> Running {
    let queue = tempfile::tempdir().unwrap();
    let mut config = config(queue.path());
    adjust(&mut config);

    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let resolver = StaticResolver::default()
        .with_mx("example.org", vec![MailServer::new("mx.example.org", 10, 25)])
        .with_ip("mx.example.org", vec![localhost]);
    let recorder = Arc::new(Recorder::default());

    let builder = Server::builder(config)
        .with_resolver(Arc::new(resolver))
        .with_deliver(Arc::clone(&recorder) as Arc<dyn Deliver>);
    let server = customise(builder).build().unwrap();

    let listener = Listener::bind(SocketAddr::new(localhost, 0), Mode::Plain)
        .await
        .unwrap();
    let address = listener.local_addr().unwrap();

    let (shutdown, _) = broadcast::channel(4);
    let listener = tokio::spawn(listener.serve(Arc::clone(&server), shutdown.clone()));

    // The submission address is recorded before the first accept.
    let (mut client, _) = SmtpClient::connect(address, "localhost", "test", TIMEOUTS)
        .await
        .unwrap();
    client.quit().await.unwrap();

    Running {
        _queue: queue,
        server,
        address,
        recorder,
        shutdown,
        listener,
    }
}

impl Running {
    async fn client(&self) -> SmtpClient {
        let (mut client, greeting) = SmtpClient::connect(self.address, "localhost", "test", TIMEOUTS)
            .await
            .unwrap();
        assert_eq!(greeting.code, 220);
        client.ehlo("client.example").await.unwrap();
        client
    }

    fn queued_files(&self) -> usize {
        std::fs::read_dir(&self.server.config().relay.queue_dir)
            .map(|entries| entries.count())
            .unwrap_or_default()
    }

    async fn stop(self) {
        self.shutdown.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.listener)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn unauthenticated_clients_may_only_deliver_inbound() {
    let running = start(|_| {}).await;
    let mut client = running.client().await;

    client.mail_from("user@courier.test").await.unwrap();
    let reply = client.command("RCPT TO:<far@example.org>").await.unwrap();
    assert_eq!(reply.code, 502);
    assert_eq!(reply.message(), "Error: relay access denied");

    // A local sender must authenticate even for local recipients.
    let reply = client.command("RCPT TO:<other@courier.test>").await.unwrap();
    assert_eq!(reply.code, 502);

    client.command("RSET").await.unwrap();
    client.mail_from("stranger@example.org").await.unwrap();
    client.rcpt_to("user@courier.test").await.unwrap();
    let reply = client.command("RCPT TO:<far@example.org>").await.unwrap();
    assert_eq!(reply.code, 502);

    client.quit().await.unwrap();
    running.stop().await;
}

#[tokio::test]
async fn authenticated_local_senders_are_relayed() {
    let running = start(|_| {}).await;
    let mut client = running.client().await;

    client.auth_plain("user", "secret").await.unwrap();
    client.mail_from("user@courier.test").await.unwrap();
    client.rcpt_to("far@example.org").await.unwrap();
    client.rcpt_to("near@courier.test").await.unwrap();
    client.data().await.unwrap();
    let reply = client
        .send_data(b"Subject: Outbound\r\n\r\nHello there\r\n")
        .await
        .unwrap();
    assert_eq!(reply.code, 250);
    client.quit().await.unwrap();

    // Only the foreign recipient is queued: one message and one record.
    assert_eq!(running.server.relay().unwrap().queued(), 1);
    assert_eq!(running.queued_files(), 2);

    running.stop().await;
}

#[tokio::test]
async fn authenticated_foreign_senders_need_an_open_relay() {
    let running = start(|_| {}).await;
    let mut client = running.client().await;

    client.auth_plain("user", "secret").await.unwrap();
    client.mail_from("someone@example.net").await.unwrap();
    let reply = client.command("RCPT TO:<far@example.org>").await.unwrap();
    assert_eq!(reply.code, 502);
    // Inbound mail is still fine.
    client.rcpt_to("user@courier.test").await.unwrap();
    client.quit().await.unwrap();
    running.stop().await;

    let running = start(|config| config.relay.open_relay = true).await;
    let mut client = running.client().await;

    client.auth_plain("user", "secret").await.unwrap();
    client.mail_from("someone@example.net").await.unwrap();
    client.rcpt_to("far@example.org").await.unwrap();
    client.quit().await.unwrap();
    running.stop().await;
}

#[tokio::test]
async fn auth_login_over_the_wire() {
    let running = start(|_| {}).await;
    let mut client = running.client().await;

    let reply = client.command("AUTH LOGIN").await.unwrap();
    assert_eq!((reply.code, reply.message()), (334, String::from("VXNlcm5hbWU6")));
    let reply = client.command("dXNlcg==").await.unwrap();
    assert_eq!((reply.code, reply.message()), (334, String::from("UGFzc3dvcmQ6")));
    let reply = client.command("c2VjcmV0").await.unwrap();
    assert_eq!(reply.code, 235);

    client.quit().await.unwrap();
    running.stop().await;
}

#[tokio::test]
async fn send_mail_is_relayed_through_the_queue() {
    let running = start(|_| {}).await;
    running.server.relay().unwrap().start().await.unwrap();

    let reply = running
        .server
        .send_mail(
            MessageBuilder::new()
                .from("noreply@courier.test")
                .to("someone@example.org")
                .subject("Hello")
                .text("Sent through the API"),
        )
        .await
        .unwrap();
    assert_eq!(reply.code, 250);

    let delivery = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(delivery) = running.recorder.0.lock().first().cloned() {
                return delivery;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(delivery.host, "mx.example.org");
    assert_eq!(delivery.to, vec![String::from("someone@example.org")]);
    assert!(delivery.message.starts_with("Received: from "));
    assert!(delivery.message.contains("with ESMTPA;"));
    assert!(delivery.message.contains("Subject: Hello\r\n"));
    assert!(delivery.message.contains("Sent through the API"));

    // Delivered mail leaves the queue directory.
    tokio::time::timeout(Duration::from_secs(5), async {
        while running.queued_files() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    running.server.relay().unwrap().stop();
    running.stop().await;
}

#[tokio::test]
async fn handlers_added_at_runtime_reach_new_sessions_only() {
    let running = start_with(
        |_| {},
        |builder| {
            builder.on_session(|_context, overlay| {
                overlay.on(
                    "xping",
                    handler_fn(|_req, _res| Ok(Verdict::accept_with(Status::Ok, "pong"))),
                );
            })
        },
    )
    .await;

    let mut before = running.client().await;
    running
        .server
        .add_handler(
            "noop",
            HandlerDef::new(
                "late",
                handler_fn(|_req, _res| Ok(Verdict::accept_with(Status::Ok, "late"))),
            ),
        )
        .unwrap();
    let mut after = running.client().await;

    assert_eq!(before.command("NOOP").await.unwrap().message(), "OK");
    assert_eq!(after.command("NOOP").await.unwrap().message(), "late");
    assert_eq!(before.command("XPING").await.unwrap().message(), "pong");
    assert_eq!(after.command("XPING").await.unwrap().message(), "pong");

    before.quit().await.unwrap();
    after.quit().await.unwrap();
    running.stop().await;
}

#[tokio::test]
async fn starttls_secures_and_resets_the_session() {
    let running = start_with(
        |config| {
            config.tls = Some(TlsContext {
                certificate: fixture("cert.pem"),
                key: fixture("key.pem"),
            });
        },
        |builder| {
            builder.on_session(|_context, overlay| {
                overlay.on(
                    "xstate",
                    handler_fn(|_req, res| {
                        let mut accepted: Vec<&str> =
                            res.session.accepted.keys().map(String::as_str).collect();
                        accepted.sort_unstable();
                        let state = format!(
                            "secure={} accepted={}",
                            res.session.secure,
                            accepted.join(",")
                        );
                        Ok(Verdict::accept_with(Status::Ok, state))
                    }),
                );
            })
        },
    )
    .await;
    let mut client = running.client().await;

    client.auth_plain("user", "secret").await.unwrap();
    assert_eq!(
        client.command("XSTATE").await.unwrap().message(),
        "secure=false accepted=auth,ehlo"
    );

    assert_eq!(client.starttls().await.unwrap().code, 220);
    assert_eq!(
        client.command("XSTATE").await.unwrap().message(),
        "secure=true accepted="
    );

    let reply = client.command("STARTTLS").await.unwrap();
    assert_eq!((reply.code, reply.message()), (554, String::from("Error: tls already active")));

    let reply = client.command("MAIL FROM:<user@courier.test>").await.unwrap();
    assert_eq!(reply.code, 503);
    client.ehlo("client.example").await.unwrap();
    client.mail_from("user@courier.test").await.unwrap();

    client.quit().await.unwrap();
    running.stop().await;
}
