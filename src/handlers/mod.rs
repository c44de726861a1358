pub mod health;
pub mod job;

pub use health::{health, HealthResponse};
pub use job::{
    create_job, get_job_status, get_queue_stats, CreateJobRequest, JobCreatedResponse,
    JobStatusResponse,
};
