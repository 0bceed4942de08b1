pub mod worker;

pub use worker::run_expiry_worker;
