//! Authentication: password hashing, JWT access/refresh tokens, login and
//! the request authentication middleware.

pub mod claims;
pub mod login;
pub mod middleware;
pub mod password;
pub mod token;

pub use claims::{IdentityClaims, TokenKind};
pub use login::LoginService;
pub use middleware::{extract_token, AuthContext, AuthLayer, AuthService, Authenticator};
pub use password::{hash_password, verify_dummy_password, verify_password};
pub use token::{AccessToken, TokenError, TokenPair, TokenService};
