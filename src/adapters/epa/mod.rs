//! ePA backend services reached outside the TEE3 channel

pub mod lookup;

pub use lookup::{AccountLookup, HttpAccountLookup};
