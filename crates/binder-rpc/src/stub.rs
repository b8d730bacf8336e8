//! The RPC stub: one connection's worth of state, bridging decoded wire
//! messages to `binder_core`'s dispatch/event fabric and encoding
//! outgoing calls, replies and event pushes back onto the wire
//! (`spec.md` §4.7.4). Transport-agnostic: `feed` consumes bytes read
//! from wherever, `notify` is handed bytes to write wherever.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use binder_core::apiset::ApiSet;
use binder_core::data::{DataValue, TypeId};
use binder_core::error::{CoreError, ReplyStatus};
use binder_core::event::{Event, EventFabric, Listener, ListenerInterface};
use binder_core::request::{process, process_on_behalf, CommonRequest, PermissionChecker, QueryInterface};
use binder_core::scheduler::{GroupToken, Scheduler};
use binder_core::session::{Session, SessionStore, Token, TokenStore};

use binder_wire::{v0, v1, v3, Coder, Decoder, WireError};

use crate::ids::CallIdAllocator;
use crate::legacy::{status_to_wire_code, wire_code_to_status, wrap_v1_reply};
use crate::proxy::ProxyTables;

type PendingTx = oneshot::Sender<(Option<ReplyStatus>, Vec<serde_json::Value>)>;

struct State {
    version: u8,
    recv_buf: Vec<u8>,
    seqno: u16,
    calls: CallIdAllocator,
    pending: HashMap<u16, PendingTx>,
    proxy: ProxyTables,
}

impl State {
    fn new() -> Self {
        State {
            version: v0::VERSION_UNSET,
            recv_buf: Vec::new(),
            seqno: 0,
            calls: CallIdAllocator::new(),
            pending: HashMap::new(),
            proxy: ProxyTables::new(),
        }
    }

    fn next_seqno(&mut self) -> u16 {
        self.seqno = self.seqno.wrapping_add(1);
        self.seqno
    }
}

struct Inner {
    apiset: Arc<ApiSet>,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<EventFabric>,
    sessions: Arc<SessionStore>,
    tokens: Arc<TokenStore>,
    permitted: Vec<String>,
    permissions: Arc<dyn PermissionChecker>,
    peer_listener: Listener,
    notify: Box<dyn Fn(&[u8]) + Send + Sync>,
    state: Mutex<State>,
}

type BoolFuture<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>>;

/// Grants every `on-behalf-credential` check unconditionally. The default
/// for a stub built without a dedicated permission backend of its own.
pub struct AllowAllPermissions;

impl PermissionChecker for AllowAllPermissions {
    fn check<'a>(&'a self, _credential_label: Option<&'a str>, _permission: &'a str) -> BoolFuture<'a> {
        Box::pin(async { true })
    }
}

/// One peer connection. Cloning shares the same underlying state; the
/// clone handed to a dispatched [`CommonRequest`]'s [`QueryInterface`]
/// is how a reply finds its way back onto the wire.
#[derive(Clone)]
pub struct RpcStub(Arc<Inner>);

impl RpcStub {
    /// Builds a stub wired to the given API set, scheduler and event
    /// fabric. `permitted` is a list of `globmatch` patterns gating
    /// which API names an incoming call may reach (empty means
    /// unrestricted). `notify` is called with each outgoing byte chunk.
    #[must_use]
    pub fn new(
        apiset: Arc<ApiSet>,
        scheduler: Arc<dyn Scheduler>,
        events: Arc<EventFabric>,
        sessions: Arc<SessionStore>,
        tokens: Arc<TokenStore>,
        permitted: Vec<String>,
        permissions: Arc<dyn PermissionChecker>,
        notify: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let push_weak = weak.clone();
            let push_cb: Arc<dyn Fn(&str, u16, Arc<serde_json::Value>) + Send + Sync> =
                Arc::new(move |fullname, eventid, payload| {
                    if let Some(inner) = push_weak.upgrade() {
                        RpcStub(inner).forward_event_push(fullname, eventid, (*payload).clone());
                    }
                });
            let broadcast_weak = weak.clone();
            let broadcast_cb: Arc<dyn Fn(&str, Arc<serde_json::Value>, [u8; 16], u8) + Send + Sync> =
                Arc::new(move |name, _payload, uuid, hop| {
                    if let Some(inner) = broadcast_weak.upgrade() {
                        RpcStub(inner).forward_broadcast(name, uuid, hop);
                    }
                });
            let peer_listener = Listener::new(
                ListenerInterface {
                    push: Some(push_cb),
                    broadcast: Some(broadcast_cb),
                    ..Default::default()
                },
                GroupToken::new(),
            );
            Inner {
                apiset,
                scheduler,
                events,
                sessions,
                tokens,
                permitted,
                permissions,
                peer_listener,
                notify: Box::new(notify),
                state: Mutex::new(State::new()),
            }
        });
        RpcStub(inner)
    }

    /// Sends a V0 version offer. Called by the side that opens the
    /// connection; the other side answers via [`RpcStub::feed`].
    pub fn open(&self) {
        let mut coder = Coder::new();
        if v0::code_version_offer_v1_or_v3(&mut coder).is_ok() {
            flush(&coder, self.0.notify.as_ref());
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.state.lock().version != v0::VERSION_UNSET
    }

    /// Feeds newly-received bytes into the connection, decoding and
    /// dispatching as many complete messages as are now available.
    pub fn feed(&self, data: &[u8]) {
        {
            let mut state = self.0.state.lock();
            state.recv_buf.extend_from_slice(data);
        }
        loop {
            let version = self.0.state.lock().version;
            let progressed = match version {
                v0::VERSION_UNSET => self.feed_handshake(),
                v0::VERSION_3 => self.feed_v3(),
                v0::VERSION_1 => self.feed_v1(),
                _ => false,
            };
            if !progressed {
                break;
            }
        }
    }

    fn feed_handshake(&self) -> bool {
        let mut state = self.0.state.lock();
        if state.recv_buf.is_empty() {
            return false;
        }
        let decoder = Decoder::new(&state.recv_buf);
        if !v0::peek_is_v0(&decoder) {
            warn!("expected a version handshake, dropping buffered bytes");
            state.recv_buf.clear();
            return false;
        }
        let mut decoder = Decoder::new(&state.recv_buf);
        let message = match v0::decode(&mut decoder) {
            Ok(msg) => msg,
            Err(WireError::Truncated) => return false,
            Err(_) => {
                state.recv_buf.clear();
                return false;
            }
        };
        let consumed = decoder.position();
        state.recv_buf.drain(0..consumed);
        match message {
            v0::Message::VersionOffer(offered) => match v0::negotiate(&offered, &[v0::VERSION_3, v0::VERSION_1]) {
                Some(version) => {
                    state.version = version;
                    drop(state);
                    let mut coder = Coder::new();
                    if v0::code_version_set(&mut coder, version).is_ok() {
                        flush(&coder, self.0.notify.as_ref());
                    }
                }
                None => warn!("no mutually supported rpc version offered"),
            },
            v0::Message::VersionSet(version) => state.version = version,
        }
        true
    }

    fn feed_v3(&self) -> bool {
        let (packets, consumed) = {
            let state = self.0.state.lock();
            binder_wire::stream_framing::drain_decoded(&state.recv_buf)
        };
        if consumed == 0 {
            return false;
        }
        self.0.state.lock().recv_buf.drain(0..consumed);
        for packet in packets {
            self.dispatch_v3(packet.body);
        }
        false
    }

    fn feed_v1(&self) -> bool {
        let message = {
            let mut state = self.0.state.lock();
            let mut decoder = Decoder::new(&state.recv_buf);
            match v1::decode(&mut decoder) {
                Ok(msg) => {
                    let consumed = decoder.position();
                    state.recv_buf.drain(0..consumed);
                    Some(msg)
                }
                Err(WireError::Truncated) => None,
                Err(_) => {
                    state.recv_buf.clear();
                    None
                }
            }
        };
        match message {
            Some(msg) => {
                self.dispatch_v1(msg);
                true
            }
            None => false,
        }
    }

    /// Issues a call to the peer and awaits its reply, or `NoReply` if
    /// `timeout` elapses first.
    pub async fn call(
        &self,
        api: &str,
        verb: &str,
        args: Vec<serde_json::Value>,
        session: Option<&Session>,
        token: Option<&Token>,
        timeout: Duration,
    ) -> Result<(Option<ReplyStatus>, Vec<serde_json::Value>), CoreError> {
        let (callid, rx) = {
            let mut state = self.0.state.lock();
            if state.version == v0::VERSION_UNSET {
                return Err(CoreError::NotSupported);
            }
            let callid = state.calls.allocate()?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(callid, tx);
            (callid, rx)
        };

        self.send_call(callid, api, verb, &args, session, token, timeout);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            _ => {
                let mut state = self.0.state.lock();
                state.pending.remove(&callid);
                state.calls.release(callid);
                Ok((Some(ReplyStatus::NoReply), Vec::new()))
            }
        }
    }

    fn send_call(
        &self,
        callid: u16,
        api: &str,
        verb: &str,
        args: &[serde_json::Value],
        session: Option<&Session>,
        token: Option<&Token>,
        timeout: Duration,
    ) {
        let mut state = self.0.state.lock();
        match state.version {
            v0::VERSION_3 => {
                let mut outgoing = Vec::new();
                let session_value = announce_session(&mut state, session, &mut outgoing);
                let token_value = announce_token(&mut state, token, &mut outgoing);
                let wire_args = args.iter().map(json_to_wire_value).collect();
                let seqno = state.next_seqno();
                outgoing.push((
                    seqno,
                    v3::Body::CallRequest(v3::CallRequest {
                        callid,
                        verb: v3::Value::ResPlain { kind: v3::kind::VERB, bytes: format!("{api}/{verb}").into_bytes() },
                        session: session_value,
                        token: token_value,
                        creds: v3::Value::Raw(Vec::new()),
                        timeout: timeout.as_secs() as u32,
                        args: wire_args,
                    }),
                ));
                drop(state);
                self.send_v3_packets(outgoing);
            }
            v0::VERSION_1 => {
                let sessionid = session.map(Session::local_id).unwrap_or(0);
                let tokenid = token.map(Token::local_id).unwrap_or(0);
                drop(state);
                let data = serde_json::to_vec(&serde_json::Value::Array(args.to_vec())).unwrap_or_default();
                let message = v1::Message::Call {
                    callid,
                    verb: format!("{api}/{verb}"),
                    sessionid,
                    tokenid,
                    data,
                    user_creds: None,
                };
                self.send_v1(&message);
            }
            _ => {}
        }
    }

    fn send_v3_packets(&self, packets: Vec<(u16, v3::Body)>) {
        for (seqno, body) in packets {
            if let Ok(coder) = v3::code_packet(seqno, &body) {
                flush(&coder, self.0.notify.as_ref());
            }
        }
    }

    fn send_v1(&self, message: &v1::Message) {
        let mut coder = Coder::new();
        if v1::code(&mut coder, message).is_ok() {
            flush(&coder, self.0.notify.as_ref());
        }
    }

    /// Replies to an incoming call, version-branching the same way
    /// [`WireCallInterface::reply`] does for a dispatched request.
    fn send_reply(&self, callid: u16, status: Option<ReplyStatus>, replies: &[DataValue]) {
        let version = self.0.state.lock().version;
        match version {
            v0::VERSION_3 => {
                let seqno = self.0.state.lock().next_seqno();
                let args = replies.iter().map(|d| json_to_wire_value(&data_value_to_json(d))).collect();
                let body = v3::Body::CallReply(v3::CallReply { callid, status: status_to_wire_code(status), args });
                if let Ok(coder) = v3::code_packet(seqno, &body) {
                    flush(&coder, self.0.notify.as_ref());
                }
            }
            v0::VERSION_1 => {
                let object = replies.first().map(data_value_to_json).unwrap_or(serde_json::Value::Null);
                let envelope = wrap_v1_reply(status, object);
                let data = serde_json::to_vec(&envelope).unwrap_or_default();
                let message = v1::Message::Reply {
                    callid,
                    error: status.map(|s| s.as_str().to_owned()),
                    info: None,
                    data,
                };
                self.send_v1(&message);
            }
            _ => {}
        }
    }

    fn resolve_call(&self, callid: u16, status: Option<ReplyStatus>, args: Vec<serde_json::Value>) {
        let tx = {
            let mut state = self.0.state.lock();
            state.calls.release(callid);
            state.pending.remove(&callid)
        };
        if let Some(tx) = tx {
            let _ = tx.send((status, args));
        }
    }

    fn is_permitted(&self, name: &str) -> bool {
        if self.0.permitted.is_empty() {
            return true;
        }
        self.0.permitted.iter().any(|pattern| binder_wire::globmatch::globmatch(pattern, name) > 0)
    }

    fn dispatch_v3(&self, body: v3::Body) {
        match body {
            v3::Body::CallRequest(req) => self.handle_call_v3(req),
            v3::Body::CallReply(reply) => {
                let status = wire_code_to_status(reply.status);
                let args = reply.args.iter().map(wire_value_to_json).collect();
                self.resolve_call(reply.callid, status, args);
            }
            v3::Body::EventPush(push) => {
                let payload = wire_value_to_json(&push.value);
                let event = self.0.state.lock().proxy.events_in.get(&push.eventid).cloned();
                if let Some(event) = event {
                    let _ = self.0.events.push(&*self.0.scheduler, event.id(), payload);
                }
            }
            // Subscription is negotiated at the application layer through
            // the dispatched request's own `subscribe`/`unsubscribe` calls,
            // not as a standalone top-level packet.
            v3::Body::EventSubscribe(_) | v3::Body::EventUnsubscribe(_) => {}
            v3::Body::EventUnexpected(u) => {
                self.0.state.lock().proxy.events_sent.unmark(u.eventid);
            }
            v3::Body::EventBroadcast(b) => {
                self.0.events.rebroadcast(&*self.0.scheduler, &b.event, serde_json::Value::Null, b.uuid, b.hop);
            }
            v3::Body::ResourceCreate(rc) => self.handle_resource_create(rc),
            v3::Body::ResourceDestroy(rd) => self.handle_resource_destroy(rd),
        }
    }

    fn dispatch_v1(&self, message: v1::Message) {
        match message {
            v1::Message::Call { callid, verb, sessionid, tokenid, data, user_creds } => {
                self.handle_call_v1(callid, verb, sessionid, tokenid, data, user_creds);
            }
            v1::Message::Reply { callid, error, data, .. } => {
                let status = error.as_deref().and_then(status_from_tag);
                let args = json_array(&data);
                self.resolve_call(callid, status, args);
            }
            v1::Message::SessionCreate { sessionid, name } => {
                if let Ok(session) = self.0.sessions.get_or_create(name.as_deref()) {
                    self.0.state.lock().proxy.sessions_in.insert(sessionid, session);
                }
            }
            v1::Message::TokenCreate { tokenid, name } => {
                let token = self.0.tokens.intern(&name.unwrap_or_default());
                self.0.state.lock().proxy.tokens_in.insert(tokenid, token);
            }
            v1::Message::EventCreate { eventid, name } => {
                if let Some(event) = self.lookup_or_shadow_event(&name) {
                    self.0.state.lock().proxy.events_in.insert(eventid, event);
                }
            }
            v1::Message::EventPush { eventid, data } => {
                let payload: serde_json::Value = serde_json::from_str(&data).unwrap_or(serde_json::Value::Null);
                let event = self.0.state.lock().proxy.events_in.get(&eventid).cloned();
                if let Some(event) = event {
                    let _ = self.0.events.push(&*self.0.scheduler, event.id(), payload);
                }
            }
            v1::Message::Broadcast { name, uuid, hop, .. } => {
                self.0.events.rebroadcast(&*self.0.scheduler, &name, serde_json::Value::Null, uuid, hop);
            }
            _ => {}
        }
    }

    fn lookup_or_shadow_event(&self, fullname: &str) -> Option<Event> {
        self.0.events.lookup_by_name(fullname).or_else(|| self.0.events.create(fullname).ok())
    }

    fn handle_call_v3(&self, req: v3::CallRequest) {
        let full = match &req.verb {
            v3::Value::ResPlain { kind, bytes } if *kind == v3::kind::VERB => String::from_utf8_lossy(bytes).into_owned(),
            _ => {
                self.send_reply(req.callid, Some(ReplyStatus::UnknownVerb), &[]);
                return;
            }
        };
        let Some((api, verb)) = full.split_once('/') else {
            self.send_reply(req.callid, Some(ReplyStatus::UnknownApi), &[]);
            return;
        };
        if !self.is_permitted(api) {
            self.send_reply(req.callid, Some(ReplyStatus::Unauthorized), &[]);
            return;
        }

        let session = match req.session {
            v3::Value::ResId { kind, id } if kind == v3::kind::SESSION => {
                self.0.state.lock().proxy.sessions_in.get(&id).cloned()
            }
            _ => None,
        };
        let token = match req.token {
            v3::Value::ResId { kind, id } if kind == v3::kind::TOKEN => {
                self.0.state.lock().proxy.tokens_in.get(&id).cloned()
            }
            _ => None,
        };
        let import = match &req.creds {
            v3::Value::Raw(bytes) if !bytes.is_empty() => std::str::from_utf8(bytes).ok().map(str::to_owned),
            _ => None,
        };
        let params: SmallVec<[DataValue; 8]> = req.args.iter().map(|v| json_to_data_value(&wire_value_to_json(v))).collect();

        let itf = Arc::new(WireCallInterface { stub: self.clone(), callid: req.callid });
        let request = CommonRequest::new(itf, api, verb, params, session, token, None);
        self.dispatch_request(request, import);
    }

    fn handle_call_v1(&self, callid: u16, full: String, sessionid: u16, tokenid: u16, data: Vec<u8>, user_creds: Option<String>) {
        let Some((api, verb)) = full.split_once('/') else {
            self.send_reply(callid, Some(ReplyStatus::UnknownApi), &[]);
            return;
        };
        if !self.is_permitted(api) {
            self.send_reply(callid, Some(ReplyStatus::Unauthorized), &[]);
            return;
        }
        let session = if sessionid == 0 { None } else { self.0.state.lock().proxy.sessions_in.get(&sessionid).cloned() };
        let token = if tokenid == 0 { None } else { self.0.state.lock().proxy.tokens_in.get(&tokenid).cloned() };
        let text = String::from_utf8_lossy(&data).into_owned();
        let params: SmallVec<[DataValue; 8]> = json_array(&text).iter().map(json_to_data_value).collect();

        let itf = Arc::new(WireCallInterface { stub: self.clone(), callid });
        let request = CommonRequest::new(itf, api, verb, params, session, token, None);
        self.dispatch_request(request, user_creds);
    }

    /// Dispatches a decoded request. When the wire carried credentials to
    /// import, routes through `process_on_behalf` (which itself checks
    /// the `on-behalf-credential` permission); otherwise dispatches
    /// directly. `process_on_behalf` is async, so carrying it out needs a
    /// spawned task — `handle_call_v3`/`handle_call_v1` themselves stay
    /// synchronous, matching how this stub already posts jobs from sync
    /// wire-decode callbacks elsewhere.
    fn dispatch_request(&self, request: CommonRequest, import: Option<String>) {
        match import {
            Some(import) => {
                let apiset = self.0.apiset.clone();
                let scheduler = self.0.scheduler.clone();
                let permissions = self.0.permissions.clone();
                tokio::spawn(async move {
                    process_on_behalf(&*apiset, &*scheduler, request, &import, &*permissions).await;
                });
            }
            None => process(&self.0.apiset, &*self.0.scheduler, request),
        }
    }

    fn handle_resource_create(&self, rc: v3::ResourceCreate) {
        match rc.kind {
            v3::kind::SESSION => {
                let uuid = String::from_utf8_lossy(&rc.data).into_owned();
                if let Ok(session) = self.0.sessions.get_or_create(Some(&uuid)) {
                    self.0.state.lock().proxy.sessions_in.insert(rc.id, session);
                }
            }
            v3::kind::TOKEN => {
                let text = String::from_utf8_lossy(&rc.data).into_owned();
                let token = self.0.tokens.intern(&text);
                self.0.state.lock().proxy.tokens_in.insert(rc.id, token);
            }
            v3::kind::EVENT => {
                let name = String::from_utf8_lossy(&rc.data).into_owned();
                if let Some(event) = self.lookup_or_shadow_event(&name) {
                    self.0.state.lock().proxy.events_in.insert(rc.id, event);
                }
            }
            other => debug!(kind = other, "ignoring resource_create of unhandled kind"),
        }
    }

    fn handle_resource_destroy(&self, rd: v3::ResourceDestroy) {
        let mut state = self.0.state.lock();
        match rd.kind {
            v3::kind::SESSION => {
                state.proxy.sessions_in.remove(&rd.id);
            }
            v3::kind::TOKEN => {
                state.proxy.tokens_in.remove(&rd.id);
            }
            v3::kind::EVENT => {
                state.proxy.events_in.remove(&rd.id);
            }
            _ => {}
        }
    }

    /// Forwards a local event push to the peer, via the `peer_listener`
    /// a `subscribe()` call registered against the local event fabric.
    fn forward_event_push(&self, fullname: &str, eventid: u16, payload: serde_json::Value) {
        let version = self.0.state.lock().version;
        match version {
            v0::VERSION_3 => {
                let mut outgoing = Vec::new();
                {
                    let mut state = self.0.state.lock();
                    if state.proxy.events_sent.mark(eventid) {
                        let seqno = state.next_seqno();
                        outgoing.push((
                            seqno,
                            v3::Body::ResourceCreate(v3::ResourceCreate {
                                kind: v3::kind::EVENT,
                                id: eventid,
                                data: fullname.as_bytes().to_vec(),
                            }),
                        ));
                    }
                    let seqno = state.next_seqno();
                    outgoing.push((seqno, v3::Body::EventPush(v3::EventPush { eventid, value: json_to_wire_value(&payload) })));
                }
                self.send_v3_packets(outgoing);
            }
            v0::VERSION_1 => {
                let first_announce = self.0.state.lock().proxy.events_sent.mark(eventid);
                if first_announce {
                    self.send_v1(&v1::Message::EventCreate { eventid, name: fullname.to_owned() });
                }
                let data = serde_json::to_string(&payload).unwrap_or_else(|_| "null".to_owned());
                self.send_v1(&v1::Message::EventPush { eventid, data });
            }
            _ => {}
        }
    }

    /// Forwards a local rebroadcast to the peer.
    fn forward_broadcast(&self, name: &str, uuid: [u8; 16], hop: u8) {
        let version = self.0.state.lock().version;
        match version {
            v0::VERSION_3 => {
                let seqno = self.0.state.lock().next_seqno();
                let body = v3::Body::EventBroadcast(v3::EventBroadcast { uuid, hop, event: name.to_owned() });
                if let Ok(coder) = v3::code_packet(seqno, &body) {
                    flush(&coder, self.0.notify.as_ref());
                }
            }
            v0::VERSION_1 => {
                self.send_v1(&v1::Message::Broadcast { name: name.to_owned(), data: None, uuid, hop });
            }
            _ => {}
        }
    }

    /// Tears down the connection's call/proxy state, resolving every
    /// outstanding call with `Disconnected` (`spec.md` §4.7.4).
    pub fn disconnect(&self) {
        let pending = {
            let mut state = self.0.state.lock();
            state.version = v0::VERSION_UNSET;
            state.recv_buf.clear();
            state.proxy.clear();
            let ids = state.calls.drain();
            ids.iter().filter_map(|id| state.pending.remove(id)).collect::<Vec<_>>()
        };
        for tx in pending {
            let _ = tx.send((Some(ReplyStatus::Disconnected), Vec::new()));
        }
    }
}

/// Bridges a dispatched request's reply back onto the wire, and its
/// `subscribe`/`unsubscribe` calls onto the stub's shared peer listener.
struct WireCallInterface {
    stub: RpcStub,
    callid: u16,
}

impl QueryInterface for WireCallInterface {
    fn reply(&self, status: ReplyStatus, replies: SmallVec<[DataValue; 8]>) {
        self.stub.send_reply(self.callid, Some(status), &replies);
    }

    fn unref(&self) {}

    fn subscribe(&self, event_fullname: &str) -> binder_core::error::CoreResult<()> {
        let event = self.stub.0.events.lookup_by_name(event_fullname).ok_or(CoreError::NotFound)?;
        self.stub.0.events.listener_add(&*self.stub.0.scheduler, &event, &self.stub.0.peer_listener);
        Ok(())
    }

    fn unsubscribe(&self, event_fullname: &str) -> binder_core::error::CoreResult<()> {
        let event = self.stub.0.events.lookup_by_name(event_fullname).ok_or(CoreError::NotFound)?;
        self.stub.0.events.listener_remove(&event, &self.stub.0.peer_listener);
        Ok(())
    }
}

fn announce_session(state: &mut State, session: Option<&Session>, outgoing: &mut Vec<(u16, v3::Body)>) -> v3::Value {
    let Some(session) = session else { return v3::Value::Raw(Vec::new()) };
    let id = session.local_id();
    if state.proxy.sessions_sent.mark(id) {
        let seqno = state.next_seqno();
        outgoing.push((
            seqno,
            v3::Body::ResourceCreate(v3::ResourceCreate { kind: v3::kind::SESSION, id, data: session.uuid().as_bytes().to_vec() }),
        ));
    }
    v3::Value::ResId { kind: v3::kind::SESSION, id }
}

fn announce_token(state: &mut State, token: Option<&Token>, outgoing: &mut Vec<(u16, v3::Body)>) -> v3::Value {
    let Some(token) = token else { return v3::Value::Raw(Vec::new()) };
    let id = token.local_id();
    if state.proxy.tokens_sent.mark(id) {
        let seqno = state.next_seqno();
        outgoing.push((
            seqno,
            v3::Body::ResourceCreate(v3::ResourceCreate { kind: v3::kind::TOKEN, id, data: token.text().as_bytes().to_vec() }),
        ));
    }
    v3::Value::ResId { kind: v3::kind::TOKEN, id }
}

fn json_to_wire_value(value: &serde_json::Value) -> v3::Value {
    v3::Value::Typed { typeid: v3::typeid::JSON, bytes: serde_json::to_vec(value).unwrap_or_default() }
}

fn wire_value_to_json(value: &v3::Value) -> serde_json::Value {
    match value {
        v3::Value::Typed { typeid, bytes } if *typeid == v3::typeid::JSON => {
            serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
        }
        v3::Value::Raw(bytes) => serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::Null,
    }
}

fn json_to_data_value(value: &serde_json::Value) -> DataValue {
    DataValue::create_copy(TypeId::JSON, &serde_json::to_vec(value).unwrap_or_default(), false, false)
}

fn data_value_to_json(value: &DataValue) -> serde_json::Value {
    serde_json::from_slice(&value.read()).unwrap_or(serde_json::Value::Null)
}

/// A V1 call/reply `data` blob is a JSON array of arguments, or `null`
/// for none; a bare non-array value is treated as a single argument.
fn json_array(text: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str(text) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(serde_json::Value::Null) | Err(_) => Vec::new(),
        Ok(other) => vec![other],
    }
}

fn status_from_tag(tag: &str) -> Option<ReplyStatus> {
    const ALL: [ReplyStatus; 12] = [
        ReplyStatus::OutOfMemory,
        ReplyStatus::InternalError,
        ReplyStatus::NotAvailable,
        ReplyStatus::UnknownApi,
        ReplyStatus::BadApiState,
        ReplyStatus::UnknownVerb,
        ReplyStatus::InvalidToken,
        ReplyStatus::InsufficientScope,
        ReplyStatus::NoReply,
        ReplyStatus::Disconnected,
        ReplyStatus::Unauthorized,
        ReplyStatus::Forbidden,
    ];
    ALL.into_iter().find(|s| s.as_str() == tag)
}

fn flush(coder: &Coder, notify: &dyn Fn(&[u8])) {
    let mut buf = vec![0u8; coder.output_len() as usize];
    coder.output_get_buffer(&mut buf);
    notify(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use binder_core::apiset::{ApiHandler, ApiItem};
    use binder_core::limits::Limits;
    use binder_core::scheduler::TokioScheduler;
    use std::sync::Mutex as StdMutex;

    struct EchoHandler;
    impl ApiHandler for EchoHandler {
        fn process(&self, req: CommonRequest) {
            let mut replies = SmallVec::new();
            if let Some(first) = req.param(0) {
                replies.push(first);
            }
            req.reply(ReplyStatus::NoReply, replies);
        }
    }

    fn wire_pair() -> (RpcStub, RpcStub) {
        wire_pair_with(Vec::new(), Arc::new(AllowAllPermissions))
    }

    fn wire_pair_with(server_permitted: Vec<String>, server_permissions: Arc<dyn PermissionChecker>) -> (RpcStub, RpcStub) {
        let apiset = Arc::new(ApiSet::new());
        apiset
            .add("echo", ApiItem { handler: Arc::new(EchoHandler), group: GroupToken::new() })
            .unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());
        let events = Arc::new(EventFabric::new(Limits::default()));
        let sessions = Arc::new(SessionStore::new(16, Duration::from_secs(60)));
        let tokens = Arc::new(TokenStore::new());

        let server_slot: Arc<StdMutex<Option<RpcStub>>> = Arc::new(StdMutex::new(None));
        let client_slot: Arc<StdMutex<Option<RpcStub>>> = Arc::new(StdMutex::new(None));

        let server_notify = {
            let client_slot = client_slot.clone();
            move |bytes: &[u8]| {
                if let Some(client) = client_slot.lock().unwrap().clone() {
                    client.feed(bytes);
                }
            }
        };
        let client_notify = {
            let server_slot = server_slot.clone();
            move |bytes: &[u8]| {
                if let Some(server) = server_slot.lock().unwrap().clone() {
                    server.feed(bytes);
                }
            }
        };

        let server = RpcStub::new(
            apiset,
            scheduler.clone(),
            events.clone(),
            sessions.clone(),
            tokens.clone(),
            server_permitted,
            server_permissions,
            server_notify,
        );
        let client = RpcStub::new(
            Arc::new(ApiSet::new()),
            scheduler,
            events,
            sessions,
            tokens,
            Vec::new(),
            Arc::new(AllowAllPermissions),
            client_notify,
        );

        *server_slot.lock().unwrap() = Some(server.clone());
        *client_slot.lock().unwrap() = Some(client.clone());
        (client, server)
    }

    #[test]
    fn version_negotiation_picks_v3() {
        let (client, server) = wire_pair();
        client.open();
        assert_eq!(client.0.state.lock().version, v0::VERSION_3);
        assert_eq!(server.0.state.lock().version, v0::VERSION_3);
    }

    #[tokio::test]
    async fn call_round_trips_through_the_wire() {
        let (client, server) = wire_pair();
        client.open();
        let _ = &server;

        let (status, args) = client
            .call("echo", "ping", vec![serde_json::json!(42)], None, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, Some(ReplyStatus::NoReply));
        assert_eq!(args, vec![serde_json::json!(42)]);
    }

    #[tokio::test]
    async fn call_to_unknown_api_replies_unknown_api() {
        let (client, _server) = wire_pair();
        client.open();
        let (status, _args) = client
            .call("missing", "noop", vec![], None, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, Some(ReplyStatus::UnknownApi));
    }

    #[tokio::test]
    async fn disconnect_resolves_outstanding_calls_as_disconnected() {
        let (client, _server) = wire_pair();
        client.open();
        // Route this call to an api nobody ever answers, then disconnect
        // from underneath it once it's actually pending.
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.call("echo", "never", vec![], None, None, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        client.disconnect();
        let (status, _args) = waiter.await.unwrap().unwrap();
        assert_eq!(status, Some(ReplyStatus::Disconnected));
    }

    #[tokio::test]
    async fn call_to_a_not_permitted_api_is_unauthorized_not_unknown() {
        let (client, _server) = wire_pair_with(vec!["other.*".to_owned()], Arc::new(AllowAllPermissions));
        client.open();
        let (status, _args) = client
            .call("echo", "ping", vec![], None, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, Some(ReplyStatus::Unauthorized));
    }

    struct DenyAllPermissions;
    impl PermissionChecker for DenyAllPermissions {
        fn check<'a>(&'a self, _credential_label: Option<&'a str>, _permission: &'a str) -> BoolFuture<'a> {
            Box::pin(async { false })
        }
    }

    #[tokio::test]
    async fn call_with_creds_denied_by_permission_checker_is_insufficient_scope() {
        let apiset = Arc::new(ApiSet::new());
        apiset
            .add("echo", ApiItem { handler: Arc::new(EchoHandler), group: GroupToken::new() })
            .unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());
        let events = Arc::new(EventFabric::new(Limits::default()));
        let sessions = Arc::new(SessionStore::new(16, Duration::from_secs(60)));
        let tokens = Arc::new(TokenStore::new());
        let sent: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let sent_clone = sent.clone();

        let server = RpcStub::new(
            apiset,
            scheduler,
            events,
            sessions,
            tokens,
            Vec::new(),
            Arc::new(DenyAllPermissions),
            move |bytes: &[u8]| sent_clone.lock().unwrap().extend_from_slice(bytes),
        );
        server.0.state.lock().version = v0::VERSION_3;

        let req = v3::CallRequest {
            callid: 7,
            verb: v3::Value::ResPlain { kind: v3::kind::VERB, bytes: b"echo/ping".to_vec() },
            session: v3::Value::Raw(Vec::new()),
            token: v3::Value::Raw(Vec::new()),
            creds: v3::Value::Raw(b"0:0:1:label".to_vec()),
            timeout: 1,
            args: Vec::new(),
        };
        server.handle_call_v3(req);

        // The on-behalf path runs on a spawned task; give it a tick.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let buf = sent.lock().unwrap().clone();
        let (packets, _consumed) = binder_wire::stream_framing::drain_decoded(&buf);
        let reply_status = packets.iter().find_map(|p| match &p.body {
            v3::Body::CallReply(r) => Some(r.status),
            _ => None,
        });
        assert_eq!(reply_status, Some(status_to_wire_code(Some(ReplyStatus::InsufficientScope))));
    }
}
