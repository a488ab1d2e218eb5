//! Persistence: connection bootstrap, storage operations, research blob sealing.

pub mod db {
    pub use crate::db::*;
}

pub mod db_storage {
    pub use crate::db_storage::*;
}

pub mod research_blob {
    pub use crate::research_blob::*;
}
