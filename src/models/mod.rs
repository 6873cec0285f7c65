pub mod job;
pub mod outcome;
pub mod stats;
pub mod verification;
