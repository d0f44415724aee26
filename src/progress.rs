use crate::{
    instance::{Instance, RequestContext},
    log_debug,
};

/// Receives `(step, total_steps)` updates while an instance is being resized.
pub trait ProgressReporter: Send + Sync {
    fn update_progress(&self, context: &RequestContext, instance: &Instance, step: u32, total: u32);
}

/// Percentage shown to users, rounded to the nearest whole number.
pub fn progress_percent(step: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let step = step.min(total);
    ((f64::from(step) / f64::from(total)) * 100.0).round() as u8
}

/// Default reporter: the surrounding compute manager reads progress from logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProgress;

impl ProgressReporter for LoggingProgress {
    fn update_progress(
        &self,
        context: &RequestContext,
        instance: &Instance,
        step: u32,
        total: u32,
    ) {
        log_debug!(
            request_id = %context.request_id,
            instance = %instance.name,
            "Updating progress to {}% (step {} of {})",
            progress_percent(step, total),
            step,
            total
        );
    }
}
