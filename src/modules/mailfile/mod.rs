pub mod export;
pub mod flat;
pub mod format;
pub mod import;
pub mod tree;
