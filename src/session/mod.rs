//! Component B: sessions, tokens and credentials.

mod credential;
mod session;
mod token;

pub use credential::Credential;
pub use session::{DisposeFn, Session, SessionStore};
pub use token::{Token, TokenStore};
