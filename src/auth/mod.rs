//! OAuth 2.0 / OpenID Connect authorization server
//!
//! - **clients**: registered client applications
//! - **codes**: single-use PKCE-bound authorization codes
//! - **keys** / **tokens**: signing keys and JWT issuance/verification
//! - **sessions**: per (user, client) OIDC sessions
//! - **revocation**: the token blacklist and its remote check
//! - **flow**: the authorize/token state machine
//! - **middleware**: extractors guarding protected endpoints
//! - **server**: HTTP routes

pub mod clients;
pub mod codes;
pub mod flow;
pub mod keys;
pub mod middleware;
pub mod profile;
pub mod revocation;
pub mod server;
pub mod sessions;
pub mod sweeper;
pub mod tokens;

pub use clients::{ClientRegistry, ClientSpec, ClientUpdate, RegisteredClient};
pub use codes::{AuthorizationCodeIssuer, AuthorizationGrant, AuthorizationRequest, RedeemedCode};
pub use flow::{
    AuthorizationFlow, AuthorizeOutcome, BasicCredentials, FlowState, Identity, TokenRequest,
};
pub use keys::{HmacKeyProvider, SigningKeyProvider};
pub use middleware::{AdminUser, AuthenticatedUser, ResourceGuard, ServiceCaller, ServiceKeys};
pub use profile::{MergedProfile, merge_profile};
pub use revocation::{RemoteRevocationClient, RevocationCheck, RevocationRegistry, RevocationStatus};
pub use server::{OAuthServerState, create_oauth_routes};
pub use sessions::{NewSession, SessionStore};
pub use sweeper::{SweepReport, Sweeper};
pub use tokens::{
    AccessClaims, IdClaims, IdTokenContext, IssuedTokens, JwtClaims, TokenIssuer, TokenPolicy,
    TokenResponse, TokenUse,
};

use crate::constants::RANDOM_TOKEN_BYTES;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 256 bits of OS randomness, base64url without padding
pub fn generate_random_token() -> String {
    let mut bytes = [0u8; RANDOM_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256, used to store secrets and codes at rest
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Short, non-reversible identifier safe to put in logs
pub fn fingerprint(value: &str) -> String {
    sha256_hex(value)[..12].to_string()
}

/// Constant-time string comparison
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod flow_test;
#[cfg(test)]
mod middleware_test;
#[cfg(test)]
mod server_test;
