pub mod add;
pub mod common;
pub mod completions;
pub mod delete;
pub mod edit;
pub mod key;
pub mod list;
pub mod sync;
