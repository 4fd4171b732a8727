use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "incident-analytics",
    version,
    about = "Incident analysis job worker and client"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Poll the shared job registry and execute claimed jobs until interrupted.
    Worker {
        /// Drain the queue once and exit instead of polling.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Queue a job from a JSON submission document (`-` reads stdin).
    Submit { file: PathBuf },
    /// Print the latest run's status.
    Status { job_id: String },
    /// Print the artifact registry of a job.
    Results { job_id: String },
    /// Print a job's event log.
    Events {
        job_id: String,
        #[arg(long, default_value_t = 0)]
        after: i64,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["incident-analytics", "events", "job-1", "--after", "7"]).unwrap();
        match args.command {
            Command::Events { job_id, after, limit } => {
                assert_eq!(job_id, "job-1");
                assert_eq!(after, 7);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = Args::try_parse_from(["incident-analytics", "worker", "--once"]).unwrap();
        assert!(matches!(args.command, Command::Worker { once: true }));
    }
}
