pub mod artifacts;
pub mod jobs;
pub mod sources;
pub mod spatial;
pub mod stats;
pub mod timeseries;
