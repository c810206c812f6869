//! Request dispatch: route matching, the stage pipeline and upstream
//! forwarding.

mod dispatcher;
mod forward;
mod stage;

pub use dispatcher::Dispatcher;
pub use forward::{ForwardError, Forwarder};
pub use stage::{
    AuthStage, BreakerStage, RateLimitStage, RequestContext, Stage, standard_pipeline,
};
