//! Dispatch of a [`CommonRequest`] against an [`ApiSet`]
//! (`spec.md` §4.4).

use smallvec::SmallVec;

use crate::apiset::ApiSet;
use crate::error::ReplyStatus;
use crate::scheduler::{Job, Scheduler};
use crate::session::Credential;

use super::auth::PermissionChecker;
use super::common::CommonRequest;

/// Permission name checked before an imported credential is allowed to
/// drive a request (`spec.md` §4.4's `process_on_behalf`).
pub const ON_BEHALF_CREDENTIAL_PERMISSION: &str = "on-behalf-credential";

/// Looks up `req.api()`; on success, posts a job under the API's group
/// to invoke its handler. On not-found, replies `unknown_api` and
/// releases the request without posting anything.
pub fn process(apiset: &ApiSet, scheduler: &dyn Scheduler, req: CommonRequest) {
    let Some(item) = apiset.get_api(req.api()) else {
        req.reply(ReplyStatus::UnknownApi, SmallVec::new());
        return;
    };
    let group = item.group.clone();
    let job: Job = Box::new(move |_signum| {
        item.handler.process(req);
    });
    scheduler.post_job(group, std::time::Duration::ZERO, std::time::Duration::from_secs(30), job);
}

/// Imports credentials from `import`, checks the
/// `on-behalf-credential` permission, and on success installs the
/// imported credential and dispatches via [`process`]. On denial,
/// replies `insufficient_scope`.
pub async fn process_on_behalf(
    apiset: &ApiSet,
    scheduler: &dyn Scheduler,
    req: CommonRequest,
    import: &str,
    permissions: &dyn PermissionChecker,
) {
    let imported = match Credential::import(import) {
        Ok(cred) => cred,
        Err(_) => {
            req.reply(ReplyStatus::InvalidToken, SmallVec::new());
            return;
        }
    };
    let current_label = req.credential().map(|c| c.label);
    let allowed = permissions
        .check(current_label.as_deref(), ON_BEHALF_CREDENTIAL_PERMISSION)
        .await;
    if !allowed {
        req.reply(ReplyStatus::InsufficientScope, SmallVec::new());
        return;
    }
    req.set_credential(imported);
    process(apiset, scheduler, req);
}
