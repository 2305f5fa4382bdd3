pub mod bids;
pub mod broadcast;
pub mod clock;
pub mod configure;
pub mod engine;
pub mod errors;
pub mod expiry;
pub mod logger;
pub mod models;
pub mod music;
pub mod slots;
pub mod wallet_ledger;
