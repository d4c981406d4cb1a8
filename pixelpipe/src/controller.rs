//! Thin facade owning the shared services and driving pipeline runs.

use crate::cache::AgingTimer;
use crate::context::PipelineServices;
use crate::error::{PipeError, PipeResult};
use crate::pipeline::Pipeline;
use crate::roi::Roi;

pub struct Controller {
    services: PipelineServices,
    aging: Option<AgingTimer>,
}

impl Controller {
    pub fn new(services: PipelineServices) -> Self {
        Self {
            services,
            aging: None,
        }
    }

    /// Same as [`new`](Self::new), with the periodic cache aging sweep running.
    pub fn with_aging(services: PipelineServices) -> Self {
        let aging = services.cache.start_aging();
        Self {
            services,
            aging: Some(aging),
        }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    pub fn is_aging(&self) -> bool {
        self.aging.as_ref().is_some_and(AgingTimer::is_running)
    }

    /// Processes `pipe` for `roi`, re-running it while a node holds the
    /// re-entry flag, up to the configured number of extra runs.
    pub fn run(&self, pipe: &mut Pipeline, roi: Roi) -> PipeResult<u64> {
        pipe.reset_shutdown();
        if pipe.plan().output_roi != roi && pipe.reentry().is_active() {
            tracing::debug!("[dev_pixelpipe] output ROI changed, dropping re-entry request");
            pipe.reentry().reset();
        }

        let max_reentries = self.services.config.pipeline.max_reentries;
        let mut reentries = 0;
        loop {
            let result = pipe.process(&self.services, roi);
            let retry = pipe.reentry().is_active() && reentries < max_reentries;
            match result {
                Ok(_) | Err(PipeError::MaskMissing { .. }) if retry => {
                    reentries += 1;
                    tracing::debug!(
                        "[dev_pixelpipe] re-running {} pipe ({} of {})",
                        pipe.pipe_type(),
                        reentries,
                        max_reentries
                    );
                }
                Ok(hash) => {
                    if pipe.reentry().is_active() {
                        tracing::warn!(
                            "[dev_pixelpipe] re-entry still requested after {} runs, resetting",
                            reentries
                        );
                        pipe.reentry().reset();
                    }
                    return Ok(hash);
                }
                Err(err) => {
                    match &err {
                        PipeError::Aborted => {}
                        PipeError::CacheFull { .. } | PipeError::MaskMissing { .. } => {
                            tracing::error!("[dev_pixelpipe] {}", err)
                        }
                        _ => tracing::warn!("[dev_pixelpipe] {} pipe failed: {}", pipe.pipe_type(), err),
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Drops the cached output and histogram references of `pipe`.
    pub fn close(&self, pipe: &Pipeline) {
        pipe.release(&self.services);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(mut aging) = self.aging.take() {
            aging.stop();
        }
        self.services.cache.log_stats();
    }
}
