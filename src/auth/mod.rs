pub mod token_manager;
pub mod token_store;

pub use token_manager::{HttpOAuthClient, TokenManager};
pub use token_store::FileTokenStore;
