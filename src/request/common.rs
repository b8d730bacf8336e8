//! The common request object (`spec.md` §4.4): refcounted, with status
//! flags, a small-buffer parameter array, optional session/token/
//! credential, and an async stack used by authorization chains.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::error;

use crate::data::DataValue;
use crate::error::ReplyStatus;
use crate::session::{Credential, Session, Token};

use super::auth::AsyncFrame;

bitflags! {
    /// Status bits tracked on a [`CommonRequest`] (`spec.md` §3: "status
    /// flags (`replied`, `closing`, `validated`, `invalidated`, `closed`,
    /// `created`, `asyncount[4 bits]`)"). `asyncount` is tracked
    /// separately as the async stack's length, not as bits here.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StatusFlags: u16 {
        const REPLIED     = 0b0000_0001;
        const CLOSING     = 0b0000_0010;
        const VALIDATED   = 0b0000_0100;
        const INVALIDATED = 0b0000_1000;
        const CLOSED      = 0b0001_0000;
        const CREATED     = 0b0010_0000;
    }
}

/// The callback set a transport or synthetic caller installs to receive
/// the eventual reply and (un)subscribe notifications.
pub trait QueryInterface: Send + Sync {
    fn reply(&self, status: ReplyStatus, replies: SmallVec<[DataValue; 8]>);
    fn unref(&self);
    fn subscribe(&self, event_fullname: &str) -> crate::error::CoreResult<()>;
    fn unsubscribe(&self, event_fullname: &str) -> crate::error::CoreResult<()>;
}

struct Inner {
    api: String,
    verb: String,
    params: Mutex<SmallVec<[DataValue; 8]>>,
    session: Option<Session>,
    token: Option<Token>,
    credential: Mutex<Option<Credential>>,
    flags: Mutex<StatusFlags>,
    async_stack: Mutex<SmallVec<[AsyncFrame; 7]>>,
    itf: Arc<dyn QueryInterface>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let replied = self.flags.lock().contains(StatusFlags::REPLIED);
        if !replied {
            self.itf.reply(ReplyStatus::NoReply, SmallVec::new());
        }
        self.itf.unref();
    }
}

/// A refcounted request handle (`spec.md` §4.4). Cloning addrefs the
/// same underlying request; the automatic `no-reply` fires once, when
/// the last clone is dropped.
#[derive(Clone)]
pub struct CommonRequest(Arc<Inner>);

impl CommonRequest {
    #[must_use]
    pub fn new(
        itf: Arc<dyn QueryInterface>,
        api: impl Into<String>,
        verb: impl Into<String>,
        params: SmallVec<[DataValue; 8]>,
        session: Option<Session>,
        token: Option<Token>,
        credential: Option<Credential>,
    ) -> Self {
        CommonRequest(Arc::new(Inner {
            api: api.into(),
            verb: verb.into(),
            params: Mutex::new(params),
            session,
            token,
            credential: Mutex::new(credential),
            flags: Mutex::new(StatusFlags::CREATED),
            async_stack: Mutex::new(SmallVec::new()),
            itf,
        }))
    }

    #[must_use]
    pub fn api(&self) -> &str {
        &self.0.api
    }

    #[must_use]
    pub fn verb(&self) -> &str {
        &self.0.verb
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.0.session.as_ref()
    }

    #[must_use]
    pub fn token(&self) -> Option<&Token> {
        self.0.token.as_ref()
    }

    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        self.0.credential.lock().clone()
    }

    pub fn set_credential(&self, cred: Credential) {
        *self.0.credential.lock() = Some(cred);
    }

    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[must_use]
    pub fn flags(&self) -> StatusFlags {
        *self.0.flags.lock()
    }

    pub fn set_closing(&self) {
        self.0.flags.lock().insert(StatusFlags::CLOSING);
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.flags().contains(StatusFlags::CLOSING)
    }

    pub fn mark_validated(&self) {
        self.0.flags.lock().insert(StatusFlags::VALIDATED);
    }

    #[must_use]
    pub fn is_validated(&self) -> bool {
        self.flags().contains(StatusFlags::VALIDATED)
    }

    pub fn mark_invalidated(&self) {
        self.0.flags.lock().insert(StatusFlags::INVALIDATED);
    }

    pub fn subscribe(&self, event_fullname: &str) -> crate::error::CoreResult<()> {
        self.0.itf.subscribe(event_fullname)
    }

    pub fn unsubscribe(&self, event_fullname: &str) -> crate::error::CoreResult<()> {
        self.0.itf.unsubscribe(event_fullname)
    }

    /// Replies to the request exactly once. A second call logs an error
    /// and drops `replies` without forwarding them.
    pub fn reply(&self, status: ReplyStatus, replies: SmallVec<[DataValue; 8]>) {
        let mut flags = self.0.flags.lock();
        if flags.contains(StatusFlags::REPLIED) {
            error!(api = %self.0.api, verb = %self.0.verb, "reply called more than once");
            drop(flags);
            drop(replies);
            return;
        }
        flags.insert(StatusFlags::REPLIED);
        drop(flags);
        self.0.itf.reply(status, replies);
    }

    #[must_use]
    pub fn has_replied(&self) -> bool {
        self.flags().contains(StatusFlags::REPLIED)
    }

    /// Replaces the i-th parameter in place (`param_convert`, `spec.md`
    /// §4.4). Returns `false` if `i` is out of range.
    pub fn set_param(&self, i: usize, value: DataValue) -> bool {
        let mut params = self.0.params.lock();
        if i >= params.len() {
            return false;
        }
        params[i] = value;
        true
    }

    #[must_use]
    pub fn param(&self, i: usize) -> Option<DataValue> {
        self.0.params.lock().get(i).cloned()
    }

    #[must_use]
    pub fn nparams(&self) -> usize {
        self.0.params.lock().len()
    }

    /// Pushes an async continuation frame. Fails silently past the 7-slot
    /// cap per `spec.md` §4.4 ("up to 7 pending items"); callers are
    /// expected to bound tree depth well under that.
    pub fn push_async(&self, frame: AsyncFrame) -> bool {
        let mut stack = self.0.async_stack.lock();
        if stack.len() >= 7 {
            return false;
        }
        stack.push(frame);
        true
    }

    pub fn pop_async(&self) -> Option<AsyncFrame> {
        self.0.async_stack.lock().pop()
    }

    #[must_use]
    pub fn asyncount(&self) -> usize {
        self.0.async_stack.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TypeId;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct RecordingInterface {
        replies: Mutex<Vec<(ReplyStatus, usize)>>,
        unreffed: AtomicBool,
    }

    impl QueryInterface for RecordingInterface {
        fn reply(&self, status: ReplyStatus, replies: SmallVec<[DataValue; 8]>) {
            self.replies.lock().push((status, replies.len()));
        }
        fn unref(&self) {
            self.unreffed.store(true, Ordering::SeqCst);
        }
        fn subscribe(&self, _event_fullname: &str) -> crate::error::CoreResult<()> {
            Ok(())
        }
        fn unsubscribe(&self, _event_fullname: &str) -> crate::error::CoreResult<()> {
            Ok(())
        }
    }

    fn make_request(itf: Arc<RecordingInterface>) -> CommonRequest {
        CommonRequest::new(itf, "api", "verb", SmallVec::new(), None, None, None)
    }

    #[test]
    fn reply_is_allowed_exactly_once() {
        let itf = Arc::new(RecordingInterface {
            replies: Mutex::new(Vec::new()),
            unreffed: AtomicBool::new(false),
        });
        let req = make_request(itf.clone());
        req.reply(ReplyStatus::InternalError, SmallVec::new());
        req.reply(ReplyStatus::Forbidden, SmallVec::new());
        assert_eq!(itf.replies.lock().len(), 1);
        assert_eq!(itf.replies.lock()[0].0, ReplyStatus::InternalError);
    }

    #[test]
    fn dropping_without_reply_emits_automatic_no_reply() {
        let itf = Arc::new(RecordingInterface {
            replies: Mutex::new(Vec::new()),
            unreffed: AtomicBool::new(false),
        });
        {
            let _req = make_request(itf.clone());
        }
        assert_eq!(itf.replies.lock().len(), 1);
        assert_eq!(itf.replies.lock()[0].0, ReplyStatus::NoReply);
        assert!(itf.unreffed.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_after_reply_does_not_double_reply() {
        let itf = Arc::new(RecordingInterface {
            replies: Mutex::new(Vec::new()),
            unreffed: AtomicBool::new(false),
        });
        {
            let req = make_request(itf.clone());
            req.reply(ReplyStatus::Forbidden, SmallVec::new());
        }
        assert_eq!(itf.replies.lock().len(), 1);
    }

    #[test]
    fn set_param_replaces_in_place() {
        let itf = Arc::new(RecordingInterface {
            replies: Mutex::new(Vec::new()),
            unreffed: AtomicBool::new(false),
        });
        let mut params = SmallVec::new();
        params.push(DataValue::create_copy(TypeId::I32, &1i32.to_le_bytes(), false, false));
        let req = CommonRequest::new(itf, "api", "verb", params, None, None, None);
        let replaced = DataValue::create_copy(TypeId::I32, &2i32.to_le_bytes(), false, false);
        assert!(req.set_param(0, replaced.clone()));
        assert!(req.param(0).unwrap().is_same(&replaced));
        assert!(!req.set_param(5, replaced));
    }

    #[test]
    fn async_stack_respects_seven_slot_cap() {
        let itf = Arc::new(RecordingInterface {
            replies: Mutex::new(Vec::new()),
            unreffed: AtomicBool::new(false),
        });
        let req = make_request(itf);
        for _ in 0..7 {
            assert!(req.push_async(AsyncFrame::Not));
        }
        assert!(!req.push_async(AsyncFrame::Not));
        assert_eq!(req.asyncount(), 7);
    }

    #[test]
    fn drop_runs_unref_counter_once() {
        let itf = Arc::new(RecordingInterface {
            replies: Mutex::new(Vec::new()),
            unreffed: AtomicBool::new(false),
        });
        let calls = AtomicU32::new(0);
        {
            let req = make_request(itf.clone());
            let req2 = req.clone();
            drop(req);
            calls.fetch_add(1, Ordering::SeqCst);
            drop(req2);
        }
        assert!(itf.unreffed.load(Ordering::SeqCst));
    }
}
