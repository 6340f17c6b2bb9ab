use thiserror::Error;

use threadgrid_pool::PoolError;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("autoscaler loops already running")]
    AlreadyRunning,

    #[error(transparent)]
    Pool(#[from] PoolError),
}
