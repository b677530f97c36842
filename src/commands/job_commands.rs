//! Job command handlers

use crate::api::{parse_range, ApiResponse, CreateJobRequest, JobMetricsResponse, ListResponse};
use crate::commands::{guarded, AppState};
use crate::errors::AppError;
use crate::jobs::DryRunReport;
use crate::metrics::JobErrorEntry;
use crate::models::{Job, Run};

fn require_job(state: &AppState, job_id: &str) -> crate::errors::AppResult<Job> {
    state
        .catalog
        .get_job(job_id)
        .ok_or_else(|| AppError::not_found("job", job_id, "JOB_NOT_FOUND"))
}

pub fn list_jobs_command(state: &AppState, token: Option<&str>) -> ApiResponse<ListResponse<Job>> {
    guarded(state, token, "list_jobs", || {
        Ok(state.catalog.list_jobs().into())
    })
}

pub fn create_job_command(
    state: &AppState,
    token: Option<&str>,
    request: CreateJobRequest,
) -> ApiResponse<Job> {
    guarded(state, token, "create_job", || {
        let job = request.to_job()?;
        state.catalog.create_job(job)
    })
}

pub fn start_job_command(state: &AppState, token: Option<&str>, job_id: &str) -> ApiResponse<Job> {
    guarded(state, token, "start_job", || state.jobs.start(job_id))
}

pub fn pause_job_command(state: &AppState, token: Option<&str>, job_id: &str) -> ApiResponse<Job> {
    guarded(state, token, "pause_job", || state.jobs.pause(job_id))
}

pub fn stop_job_command(state: &AppState, token: Option<&str>, job_id: &str) -> ApiResponse<Job> {
    guarded(state, token, "stop_job", || state.jobs.stop(job_id))
}

pub fn delete_job_command(state: &AppState, token: Option<&str>, job_id: &str) -> ApiResponse<()> {
    guarded(state, token, "delete_job", || state.jobs.delete(job_id))
}

pub fn dry_run_job_command(
    state: &AppState,
    token: Option<&str>,
    job_id: &str,
) -> ApiResponse<DryRunReport> {
    guarded(state, token, "dry_run_job", || state.jobs.dry_run(job_id))
}

pub fn job_metrics_command(
    state: &AppState,
    token: Option<&str>,
    job_id: &str,
    range: Option<&str>,
) -> ApiResponse<JobMetricsResponse> {
    guarded(state, token, "job_metrics", || {
        require_job(state, job_id)?;
        let window = parse_range(range);
        let job_metrics = state.metrics.job(job_id);
        Ok(JobMetricsResponse {
            job_id: job_id.to_string(),
            summary: job_metrics.summary(window),
            timeseries: job_metrics.timeseries(window),
        })
    })
}

pub fn job_runs_command(
    state: &AppState,
    token: Option<&str>,
    job_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> ApiResponse<ListResponse<Run>> {
    guarded(state, token, "job_runs", || {
        Ok(state.jobs.runs(job_id, from, to)?.into())
    })
}

pub fn job_errors_command(
    state: &AppState,
    token: Option<&str>,
    job_id: &str,
) -> ApiResponse<ListResponse<JobErrorEntry>> {
    guarded(state, token, "job_errors", || {
        require_job(state, job_id)?;
        Ok(state.metrics.job(job_id).errors().into())
    })
}
