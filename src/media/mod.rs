//! Media references and the resource resolver.

pub mod reference;
pub mod resolver;

pub use reference::{MediaKind, MediaReference, Reachability, ResolvedMedia};
pub use resolver::Resolver;
