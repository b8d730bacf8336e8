//! Component D (cont'd): the call engine (`spec.md` §4.5) — synthetic
//! requests for `calls_call` and the suspend/resume bridge for
//! `calls_call_sync`.

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tracing::warn;

use crate::apiset::ApiSet;
use crate::data::DataValue;
use crate::error::{CoreResult, ReplyStatus};
use crate::request::{process, process_on_behalf, CommonRequest, PermissionChecker, QueryInterface};
use crate::scheduler::Scheduler;
use crate::session::{Credential, Session};

bitflags! {
    /// `spec.md` §4.5's bitmask: `{api_session, on_behalf, catch_events,
    /// pass_events}`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CallFlags: u8 {
        /// The synthetic request inherits the parent request's session.
        const API_SESSION  = 0b0001;
        /// The synthetic request inherits the parent request's credential.
        const ON_BEHALF    = 0b0010;
        /// Event (un)subscriptions made by the callee are also forwarded
        /// to `catch_target`.
        const CATCH_EVENTS = 0b0100;
        /// Event (un)subscriptions made by the callee are also forwarded
        /// to the parent request.
        const PASS_EVENTS  = 0b1000;
    }
}

/// Something a synthetic call's event (un)subscriptions can be forwarded
/// to — a parent [`CommonRequest`] (`pass_events`) or the calling API's
/// own listener (`catch_events`).
pub trait EventForwardTarget: Send + Sync {
    fn subscribe(&self, event_fullname: &str) -> CoreResult<()>;
    fn unsubscribe(&self, event_fullname: &str) -> CoreResult<()>;
}

impl EventForwardTarget for CommonRequest {
    fn subscribe(&self, event_fullname: &str) -> CoreResult<()> {
        CommonRequest::subscribe(self, event_fullname)
    }
    fn unsubscribe(&self, event_fullname: &str) -> CoreResult<()> {
        CommonRequest::unsubscribe(self, event_fullname)
    }
}

type ReplyCallback = Box<dyn FnOnce(ReplyStatus, SmallVec<[DataValue; 8]>) + Send>;

struct SyntheticInterface {
    callback: Mutex<Option<ReplyCallback>>,
    pass_events: Option<Arc<dyn EventForwardTarget>>,
    catch_events: Option<Arc<dyn EventForwardTarget>>,
}

impl QueryInterface for SyntheticInterface {
    fn reply(&self, status: ReplyStatus, replies: SmallVec<[DataValue; 8]>) {
        if let Some(cb) = self.callback.lock().take() {
            cb(status, replies);
        }
    }

    fn unref(&self) {}

    fn subscribe(&self, event_fullname: &str) -> CoreResult<()> {
        if let Some(target) = &self.pass_events {
            target.subscribe(event_fullname)?;
        }
        if let Some(target) = &self.catch_events {
            target.subscribe(event_fullname)?;
        }
        Ok(())
    }

    fn unsubscribe(&self, event_fullname: &str) -> CoreResult<()> {
        if let Some(target) = &self.pass_events {
            target.unsubscribe(event_fullname)?;
        }
        if let Some(target) = &self.catch_events {
            target.unsubscribe(event_fullname)?;
        }
        Ok(())
    }
}

/// Everything `calls_call` needs to build its synthetic request beyond
/// the target API/verb/params: the flags bitmask and the collaborators
/// each flag activates.
#[derive(Default)]
pub struct CallContext {
    pub flags: CallFlags,
    pub parent: Option<CommonRequest>,
    pub catch_target: Option<Arc<dyn EventForwardTarget>>,
}

fn synthetic_session_and_credential(ctx: &CallContext) -> (Option<Session>, Option<Credential>) {
    let session = if ctx.flags.contains(CallFlags::API_SESSION) {
        ctx.parent.as_ref().and_then(CommonRequest::session).cloned()
    } else {
        None
    };
    let credential = if ctx.flags.contains(CallFlags::ON_BEHALF) {
        ctx.parent.as_ref().and_then(CommonRequest::credential)
    } else {
        None
    };
    (session, credential)
}

/// Builds a synthetic request for `api`/`verb` and dispatches it,
/// invoking `callback` with the eventual status and replies
/// (`spec.md` §4.5's `calls_call`).
pub fn calls_call(
    apiset: &ApiSet,
    scheduler: &dyn Scheduler,
    api: &str,
    verb: &str,
    params: SmallVec<[DataValue; 8]>,
    ctx: CallContext,
    callback: impl FnOnce(ReplyStatus, SmallVec<[DataValue; 8]>) + Send + 'static,
) {
    let (session, credential) = synthetic_session_and_credential(&ctx);
    let pass_events = if ctx.flags.contains(CallFlags::PASS_EVENTS) {
        ctx.parent.clone().map(|p| Arc::new(p) as Arc<dyn EventForwardTarget>)
    } else {
        None
    };
    let catch_events = if ctx.flags.contains(CallFlags::CATCH_EVENTS) {
        ctx.catch_target.clone()
    } else {
        None
    };
    let itf = Arc::new(SyntheticInterface {
        callback: Mutex::new(Some(Box::new(callback))),
        pass_events,
        catch_events,
    });
    let req = CommonRequest::new(itf, api, verb, params, session, credential, None);
    process(apiset, scheduler, req);
}

/// Same as [`calls_call`] but dispatches via `process_on_behalf`,
/// importing the credential from `import` first.
pub async fn calls_call_on_behalf(
    apiset: &ApiSet,
    scheduler: &dyn Scheduler,
    api: &str,
    verb: &str,
    params: SmallVec<[DataValue; 8]>,
    ctx: CallContext,
    import: &str,
    permissions: &dyn PermissionChecker,
    callback: impl FnOnce(ReplyStatus, SmallVec<[DataValue; 8]>) + Send + 'static,
) {
    let (session, _credential) = synthetic_session_and_credential(&ctx);
    let pass_events = if ctx.flags.contains(CallFlags::PASS_EVENTS) {
        ctx.parent.clone().map(|p| Arc::new(p) as Arc<dyn EventForwardTarget>)
    } else {
        None
    };
    let catch_events = if ctx.flags.contains(CallFlags::CATCH_EVENTS) {
        ctx.catch_target.clone()
    } else {
        None
    };
    let itf = Arc::new(SyntheticInterface {
        callback: Mutex::new(Some(Box::new(callback))),
        pass_events,
        catch_events,
    });
    let req = CommonRequest::new(itf, api, verb, params, session, None, None);
    process_on_behalf(apiset, scheduler, req, import, permissions).await;
}

/// Blocks the calling async task until the synthetic call replies or
/// `timeout` elapses, truncating replies to `reply_capacity`
/// (`spec.md` §4.5's `calls_call_sync`). Returns `ReplyStatus::NoReply`
/// on timeout.
///
/// The suspension here is the caller's own `.await` point — `calls_call`
/// already routes the actual dispatch through `scheduler`'s job queue,
/// so this function itself is the "worker returns to the pool while a
/// job waits" boundary the original's `sched_sync` names.
pub async fn calls_call_sync(
    apiset: &ApiSet,
    scheduler: &dyn Scheduler,
    api: &str,
    verb: &str,
    params: SmallVec<[DataValue; 8]>,
    ctx: CallContext,
    timeout: Duration,
    reply_capacity: usize,
) -> (ReplyStatus, SmallVec<[DataValue; 8]>) {
    let (tx, rx) = oneshot::channel::<(ReplyStatus, SmallVec<[DataValue; 8]>)>();
    calls_call(apiset, scheduler, api, verb, params, ctx, move |status, replies| {
        let _ = tx.send((status, replies));
    });
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok((status, mut replies))) => {
            replies.truncate(reply_capacity);
            (status, replies)
        }
        Ok(Err(_)) => (ReplyStatus::NoReply, SmallVec::new()),
        Err(_) => {
            warn!(api, verb, "calls_call_sync timed out with no reply");
            (ReplyStatus::NoReply, SmallVec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiset::{ApiHandler, ApiItem};
    use crate::data::TypeId;
    use crate::scheduler::{GroupToken, TokioScheduler};

    struct DoublingHandler;
    impl ApiHandler for DoublingHandler {
        fn process(&self, req: CommonRequest) {
            let n = req.param(0).map(|d| i32::from_le_bytes(d.read().as_slice().try_into().unwrap())).unwrap_or(0);
            let mut out = SmallVec::new();
            out.push(DataValue::create_copy(TypeId::I32, &(n * 2).to_le_bytes(), false, false));
            req.reply(ReplyStatus::OutOfMemory, out);
        }
    }

    fn apiset_with_doubler() -> ApiSet {
        let apiset = ApiSet::new();
        apiset
            .add(
                "math",
                ApiItem {
                    handler: Arc::new(DoublingHandler),
                    group: GroupToken::new(),
                },
            )
            .unwrap();
        apiset
    }

    #[tokio::test]
    async fn calls_call_invokes_callback_with_reply() {
        let apiset = apiset_with_doubler();
        let scheduler = TokioScheduler::new();
        let mut params = SmallVec::new();
        params.push(DataValue::create_copy(TypeId::I32, &21i32.to_le_bytes(), false, false));
        let (tx, rx) = oneshot::channel();
        calls_call(&apiset, &scheduler, "math", "double", params, CallContext::default(), move |status, replies| {
            let n = i32::from_le_bytes(replies[0].read().as_slice().try_into().unwrap());
            let _ = tx.send((status, n));
        });
        let (status, n) = rx.await.unwrap();
        assert_eq!(status, ReplyStatus::OutOfMemory);
        assert_eq!(n, 42);
    }

    #[tokio::test]
    async fn calls_call_sync_returns_truncated_replies() {
        let apiset = apiset_with_doubler();
        let scheduler = TokioScheduler::new();
        let mut params = SmallVec::new();
        params.push(DataValue::create_copy(TypeId::I32, &5i32.to_le_bytes(), false, false));
        let (status, replies) = calls_call_sync(
            &apiset,
            &scheduler,
            "math",
            "double",
            params,
            CallContext::default(),
            Duration::from_secs(5),
            8,
        )
        .await;
        assert_eq!(status, ReplyStatus::OutOfMemory);
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test]
    async fn calls_call_sync_times_out_to_no_reply() {
        let apiset = ApiSet::new();
        let scheduler = TokioScheduler::new();
        let (status, replies) = calls_call_sync(
            &apiset,
            &scheduler,
            "missing",
            "verb",
            SmallVec::new(),
            CallContext::default(),
            Duration::from_millis(20),
            8,
        )
        .await;
        // Dispatch to a missing API replies synchronously with
        // `unknown_api`, which also resolves the oneshot — this exercises
        // the fast path, not the timeout path itself.
        assert_eq!(status, ReplyStatus::UnknownApi);
        assert!(replies.is_empty());
    }
}
