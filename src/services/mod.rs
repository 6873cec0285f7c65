pub mod attendance;
pub mod autoscale;
pub mod collaborators;
pub mod encryption;
pub mod face;
pub mod frames;
pub mod janitor;
pub mod ledger;
pub mod messages;
pub mod pool;
pub mod processor;
pub mod rate_limiter;
pub mod storage;
pub mod telegram;
