//! Authorization trees and the async, iterative evaluator
//! (`spec.md` §3 GLOSSARY, §4.4).

use std::future::Future;
use std::pin::Pin;

use crate::error::ReplyStatus;

use super::common::CommonRequest;

/// A value-tagged authorization tree. `Or`/`And` short-circuit; leaves
/// `Token` and `Permission` are the only ones that suspend (they need an
/// external check).
#[derive(Debug, Clone, PartialEq)]
pub enum AuthTree {
    No,
    Yes,
    Token,
    Loa(u8),
    Permission(String),
    Or(Box<AuthTree>, Box<AuthTree>),
    And(Box<AuthTree>, Box<AuthTree>),
    Not(Box<AuthTree>),
}

impl AuthTree {
    /// Pretty-printer for `tracing` output when a check is denied
    /// (grounded in the original's `afb-auth.c` diagnostic dump —
    /// `SPEC_FULL.md` §10), so a denial log line names which leaf failed
    /// instead of just "denied".
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            AuthTree::No => "no".to_owned(),
            AuthTree::Yes => "yes".to_owned(),
            AuthTree::Token => "token".to_owned(),
            AuthTree::Loa(n) => format!("LOA>={n}"),
            AuthTree::Permission(p) => format!("permission({p})"),
            AuthTree::Or(a, b) => format!("({} OR {})", a.describe(), b.describe()),
            AuthTree::And(a, b) => format!("({} AND {})", a.describe(), b.describe()),
            AuthTree::Not(a) => format!("NOT {}", a.describe()),
        }
    }
}

/// A continuation saved on the request's async stack while the iterative
/// walk suspends on a `Token`/`Permission` leaf.
#[derive(Clone)]
pub enum AsyncFrame {
    AndPending(AuthTree),
    OrPending(AuthTree),
    Invert,
}

pub(crate) type BoolFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Validates a bearer token out-of-band (cynagora/polkit-shaped external
/// collaborator; this crate only defines the seam).
pub trait TokenValidator: Send + Sync {
    fn validate<'a>(&'a self, token_text: &'a str) -> BoolFuture<'a>;
}

/// Checks whether a credential holds a named permission.
pub trait PermissionChecker: Send + Sync {
    fn check<'a>(&'a self, credential_label: Option<&'a str>, permission: &'a str) -> BoolFuture<'a>;
}

/// Walks `tree` against `req`, iteratively: `Or`/`And`/`Not` push a
/// continuation onto the request's async stack instead of recursing, so
/// a suspending leaf can resume without unwinding a native call stack.
pub async fn evaluate(req: &CommonRequest, tree: AuthTree, validator: &dyn TokenValidator, permissions: &dyn PermissionChecker) -> bool {
    enum Step {
        Eval(AuthTree),
        Done(bool),
    }

    let mut step = Step::Eval(tree);
    loop {
        let current = match step {
            Step::Eval(t) => t,
            Step::Done(value) => match req.pop_async() {
                None => return value,
                Some(AsyncFrame::Invert) => {
                    step = Step::Done(!value);
                    continue;
                }
                Some(AsyncFrame::AndPending(rest)) => {
                    step = if value { Step::Eval(rest) } else { Step::Done(false) };
                    continue;
                }
                Some(AsyncFrame::OrPending(rest)) => {
                    step = if value { Step::Done(true) } else { Step::Eval(rest) };
                    continue;
                }
            },
        };

        step = match current {
            AuthTree::No => Step::Done(false),
            AuthTree::Yes => Step::Done(true),
            AuthTree::Token => {
                let ok = match req.token() {
                    Some(token) => validator.validate(token.text()).await,
                    None => false,
                };
                Step::Done(ok)
            }
            AuthTree::Loa(n) => {
                let ok = req.session().is_some_and(|s| s.loa(req.api()) >= n);
                Step::Done(ok)
            }
            AuthTree::Permission(text) => {
                let label = req.credential();
                let ok = permissions.check(label.as_ref().map(|c| c.label.as_str()), &text).await;
                Step::Done(ok)
            }
            AuthTree::And(a, b) => {
                req.push_async(AsyncFrame::AndPending(*b));
                Step::Eval(*a)
            }
            AuthTree::Or(a, b) => {
                req.push_async(AsyncFrame::OrPending(*b));
                Step::Eval(*a)
            }
            AuthTree::Not(a) => {
                req.push_async(AsyncFrame::Invert);
                Step::Eval(*a)
            }
        };
    }
}

/// Session/LOA/auth knobs carried on a verb declaration
/// (`spec.md` §4.4's `sessionflags`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFlags {
    pub close: bool,
    pub required_loa: Option<u8>,
}

impl SessionFlags {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.close && self.required_loa.is_none()
    }
}

/// `check_and_set_session_async` (`spec.md` §4.4).
pub async fn check_and_set_session_async(
    req: &CommonRequest,
    auth: Option<AuthTree>,
    sessionflags: SessionFlags,
    validator: &dyn TokenValidator,
    permissions: &dyn PermissionChecker,
) -> Result<(), ReplyStatus> {
    if auth.is_none() && sessionflags.is_empty() {
        return Ok(());
    }
    if sessionflags.close {
        req.set_closing();
    }
    if let Some(required) = sessionflags.required_loa {
        let ok = req.session().is_some_and(|s| s.loa(req.api()) >= required);
        if !ok {
            return Err(ReplyStatus::InsufficientScope);
        }
    }
    let token_ok = match req.token() {
        Some(token) => validator.validate(token.text()).await,
        None => auth.is_none(),
    };
    let Some(tree) = auth else {
        return if token_ok { Ok(()) } else { Err(ReplyStatus::InvalidToken) };
    };
    if !token_ok {
        return Err(ReplyStatus::InvalidToken);
    }
    req.mark_validated();
    if evaluate(req, tree, validator, permissions).await {
        Ok(())
    } else {
        Err(ReplyStatus::Forbidden)
    }
}
