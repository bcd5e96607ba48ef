use std::sync::Arc;

use parley_core::accounts::Accounts;
use parley_core::tokens::TokenService;
use parley_gateway::Gateway;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub accounts: Accounts,
    pub tokens: TokenService,
    pub gateway: Gateway,
    /// Adds `Secure` to the refresh cookie.
    pub secure_cookies: bool,
}
