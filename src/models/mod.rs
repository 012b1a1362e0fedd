pub mod visit;

pub use visit::{VisitCountResponse, VisitLogStats, VisitRecord};
