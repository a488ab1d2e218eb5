// Domain-layer modules and shared errors/models
pub mod enrichment {
    pub use crate::enrichment::*;
}

pub mod batch {
    pub use crate::batch::*;
}

pub mod extractor {
    pub use crate::extractor::*;
}

pub mod schema {
    pub use crate::schema::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
