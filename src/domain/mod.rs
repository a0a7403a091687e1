pub mod account;
pub mod eth;
pub mod fee;
pub mod fraud;
pub mod ledger;
pub mod packet;
pub mod pipeline;
pub mod rate_limit;
pub mod routing;
pub mod settlement;
pub mod telemetry;
