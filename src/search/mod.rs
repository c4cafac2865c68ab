pub mod filter;
pub mod query;
