pub mod handlers;
pub mod routes;
pub mod session;

pub use handlers::AppState;
pub use routes::create_api_router;
