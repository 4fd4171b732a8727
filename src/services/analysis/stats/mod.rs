pub mod distribution;
pub mod multiple_testing;
pub mod trend;
