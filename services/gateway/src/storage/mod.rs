pub mod fix_store;

pub use fix_store::{FixStore, SharedStore, StoreError, StoredFix};
