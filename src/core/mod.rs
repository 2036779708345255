pub mod agent;
pub mod backend;
pub mod compress;
pub mod cron;
pub mod error;
pub mod run;
pub mod schedule;
pub mod scheduler;
pub mod status;
pub mod task;

#[cfg(test)]
pub mod testutil;
