/// Authentication module
///
/// Password hashing, JWT access tokens, refresh-token material, the token
/// issuer and the service that ties them to the store.

mod claims;
mod issuer;
mod jwt;
mod password;
mod refresh_token;
mod service;

pub use claims::Claims;
pub use issuer::{IssuedRefreshToken, TokenIssuer, TokenPair};
pub use jwt::{generate_access_token, validate_access_token, AccessToken};
pub use password::{PasswordHasher, MAX_PASSWORD_BYTES};
pub use refresh_token::{generate_refresh_token, hash_refresh_token};
pub use service::{AuthSession, AuthenticationService};
