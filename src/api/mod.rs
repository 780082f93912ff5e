//! Public connection and statement API.

pub mod connection;
pub mod stmt;

pub use connection::{AuthAction, AuthResult, Authorizer, ConnMagic, Connection};
pub use stmt::Statement;
