pub(crate) mod extractors;
pub mod jwt;
pub mod password;

pub use extractors::AuthUser;
pub use jwt::JwtKeys;
pub use password::PasswordHasher;
