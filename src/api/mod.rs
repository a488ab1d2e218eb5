// Thin namespace wrapper for API-layer components
pub mod handlers {
    pub use crate::handlers::*;
}

pub mod api_models {
    pub use crate::api_models::*;
}
