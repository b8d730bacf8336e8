//! A minimal demonstration of `binder-rpc`'s [`RpcStub`] over an
//! in-memory duplex pipe: one side registers an API, the other calls
//! it and subscribes to an event, proving the wiring end to end
//! without any real transport.

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::info;

use binder_core::apiset::{ApiHandler, ApiItem, ApiSet};
use binder_core::error::ReplyStatus;
use binder_core::event::EventFabric;
use binder_core::limits::Limits;
use binder_core::request::CommonRequest;
use binder_core::scheduler::{GroupToken, Scheduler, TokioScheduler};
use binder_core::session::{SessionStore, TokenStore};

use binder_rpc::{AllowAllPermissions, RpcStub};

/// Replies with its first argument unchanged, demonstrating a
/// round trip through the wire without touching any real state.
struct PingHandler;

impl ApiHandler for PingHandler {
    fn process(&self, req: CommonRequest) {
        let mut replies = SmallVec::new();
        if let Some(value) = req.param(0) {
            replies.push(value);
        }
        req.reply(ReplyStatus::NoReply, replies);
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({ "verbs": ["ping"] })
    }
}

/// Builds the demo API set: a single `ping` API with one verb.
pub fn demo_apiset() -> Arc<ApiSet> {
    let apiset = Arc::new(ApiSet::new());
    apiset
        .add("ping", ApiItem { handler: Arc::new(PingHandler), group: GroupToken::new() })
        .expect("demo api set starts empty");
    apiset
}

/// The shared collaborators a stub needs: API set, scheduler, event
/// fabric, session/token stores.
pub struct Daemon {
    pub apiset: Arc<ApiSet>,
    pub scheduler: Arc<dyn Scheduler>,
    pub events: Arc<EventFabric>,
    pub sessions: Arc<SessionStore>,
    pub tokens: Arc<TokenStore>,
}

impl Daemon {
    #[must_use]
    pub fn new(apiset: Arc<ApiSet>) -> Self {
        Daemon {
            apiset,
            scheduler: Arc::new(TokioScheduler::new()),
            events: Arc::new(EventFabric::new(Limits::default())),
            sessions: Arc::new(SessionStore::new(4096, Duration::from_secs(3600))),
            tokens: Arc::new(TokenStore::new()),
        }
    }

    /// Wraps one end of a duplex pipe in an [`RpcStub`], pumping reads
    /// from the pipe into the stub and writes from the stub back onto
    /// the pipe on a background task.
    pub fn attach(&self, permitted: Vec<String>, pipe: DuplexStream) -> RpcStub {
        let (mut reader, mut writer) = tokio::io::split(pipe);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let stub = RpcStub::new(
            self.apiset.clone(),
            self.scheduler.clone(),
            self.events.clone(),
            self.sessions.clone(),
            self.tokens.clone(),
            permitted,
            Arc::new(AllowAllPermissions),
            move |bytes: &[u8]| {
                let _ = tx.send(bytes.to_vec());
            },
        );

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let feeder = stub.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => feeder.feed(&buf[..n]),
                }
            }
            feeder.disconnect();
        });

        stub
    }
}

/// Opens a loopback pair of stubs over an in-memory duplex pipe,
/// negotiates a wire version, and drives one `ping` call end to end.
/// This is the whole of `binderd`'s demonstration — there is no real
/// socket listener here, only the in-process wiring.
pub async fn run_loopback_demo() {
    let daemon = Daemon::new(demo_apiset());
    let (client_end, server_end) = tokio::io::duplex(8192);

    let server = daemon.attach(Vec::new(), server_end);
    let client = daemon.attach(vec!["ping".to_owned()], client_end);
    let _ = &server;

    client.open();

    let (status, args) = client
        .call("ping", "ping", vec![serde_json::json!("hello")], None, None, Duration::from_secs(2))
        .await
        .expect("call delivers a reply");

    info!(?status, ?args, "loopback call completed");
}
