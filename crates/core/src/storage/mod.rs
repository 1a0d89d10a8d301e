pub mod graph_store;

pub use graph_store::{GraphStore, RedbGraphStore};
