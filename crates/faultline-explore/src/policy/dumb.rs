//! Accept every event as soon as a dispatcher worker picks it up.

use faultline_signal::Event;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::params::PolicyParams;
use crate::policy::{ExplorePolicy, PolicyContext, PolicyError};

pub struct DumbPolicy {
    params: PolicyParams,
    dispatcher: Option<Dispatcher>,
}

impl DumbPolicy {
    pub fn new(params: PolicyParams) -> Self {
        Self {
            params,
            dispatcher: None,
        }
    }
}

impl ExplorePolicy for DumbPolicy {
    fn name(&self) -> &'static str {
        "dumb"
    }

    fn init(&mut self, ctx: PolicyContext) -> Result<(), PolicyError> {
        if self.dispatcher.is_some() {
            return Err(PolicyError::AlreadyInitialized(self.name()));
        }
        self.dispatcher = Some(Dispatcher::from_params(&self.params, ctx.sink, ctx.cancel));
        info!(
            workers = self.params.dispatcher_workers,
            "dumb policy accepting every event"
        );
        Ok(())
    }

    fn queue_event(&self, event: Event) -> Result<(), PolicyError> {
        self.dispatcher
            .as_ref()
            .ok_or(PolicyError::NotInitialized("dumb"))?
            .submit(event)
    }
}
