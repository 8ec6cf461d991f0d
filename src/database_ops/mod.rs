//! Catalog adapters on one side, storage on the other.
pub mod catalog;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub mod steam {
    pub mod provider;
}

pub mod nintendo {
    pub mod provider;
}
