mod detection;
mod report;
mod runner;
mod stage2_yearly_count_comparison;
mod stage3_univariate_anomaly;
mod stage4_h3_anomaly;
mod stages;
mod store;
mod types;


pub use runner::{AnalysisJobService, SubmitError};
pub use stages::StageId;
pub use types::*;
