//! Component D: the common request object, authorization trees, and
//! dispatch against an API set.

mod auth;
mod common;
mod dispatch;

pub use auth::{check_and_set_session_async, evaluate, AsyncFrame, AuthTree, PermissionChecker, SessionFlags, TokenValidator};
pub use common::{CommonRequest, QueryInterface, StatusFlags};
pub use dispatch::{process, process_on_behalf, ON_BEHALF_CREDENTIAL_PERMISSION};
