//! External service integrations.

pub mod research {
    pub use crate::research::*;
}

pub mod services {
    pub use crate::services::*;
}

pub mod generation_client {
    pub use crate::generation_client::*;
}
