//! Who is visiting: client IP extraction and the identifier derived from it

pub mod identity;
pub mod ip_extractor;

pub use identity::VisitorIdentity;
pub use ip_extractor::extract_client_ip;
