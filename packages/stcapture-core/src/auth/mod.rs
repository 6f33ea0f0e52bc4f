//! OAuth token lifecycle: persistence, token endpoint requests and the
//! state machine that keeps an access token valid.

pub mod manager;
pub mod oauth;
pub mod store;

pub use manager::{TokenManager, TokenState, TokenVerifyResult};
pub use oauth::{authorize_url, open_authorize_page, Grant};
pub use store::{
    Credentials, FileTokenStore, MemoryTokenStore, TokenRecord, TokenSet, TokenStore,
};
