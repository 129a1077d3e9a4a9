//! Domain records and their validation rules.

pub mod filters;
pub mod movies;
pub mod permissions;
pub mod tokens;
pub mod users;

pub use filters::{Filters, Metadata, MovieQuery};
pub use movies::Movie;
pub use permissions::{Permission, Permissions};
pub use tokens::{Scope, Token};
pub use users::{Identity, Password, User};
