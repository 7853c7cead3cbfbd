pub mod bronze;
pub mod client;
pub mod gold;
pub mod silver;

pub use client::{TierClient, TierClients, TierOutput};
