pub mod bitmap;
pub mod cli;
pub mod collab;
pub mod data_alloc;
pub mod entries;
pub mod error;
pub mod format;
pub mod header;
pub mod layout;
pub mod mapping;
pub mod node_pool;
pub mod nodechain;
pub mod ops;
pub mod path;
