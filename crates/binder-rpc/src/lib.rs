//! Component H: the RPC stub that drives `binder-wire`'s codecs against
//! `binder_core`'s dispatch and event fabric (`spec.md` §4.7).

mod ids;
mod legacy;
mod proxy;
mod stub;

pub use ids::{CallIdAllocator, MAX_OUTSTANDING_CALLS};
pub use legacy::{status_to_wire_code, wire_code_to_status, wrap_v1_reply};
pub use proxy::{ProxyTables, SentFlags};
pub use stub::{AllowAllPermissions, RpcStub};
