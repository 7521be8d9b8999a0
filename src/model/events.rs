//! # Event Pipeline
//!
//! Each model keeps one handler chain per event name. Registration
//! appends, so earlier handlers run first. A chain stops at the first
//! error, or as soon as a handler fills `EventContext::result`.
//!
//! Canonical events:
//!
//! | event | runs |
//! |-------|------|
//! | `__operation__before_load` | before reads hit the connector |
//! | `__operation__after_load` | once per loaded instance |
//! | `__operation__before_save` | before create, update and deletes |
//! | `__operation__after_save` | after a successful write |

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use super::context::EventContext;
use super::errors::{ModelError, ModelResult};

const EVENT_PREFIX: &str = "__operation__";

/// One step of a chain
pub type Handler = Arc<dyn Fn(&mut EventContext) -> ModelResult<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    BeforeLoad,
    AfterLoad,
    BeforeSave,
    AfterSave,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeLoad => "__operation__before_load",
            Self::AfterLoad => "__operation__after_load",
            Self::BeforeSave => "__operation__before_save",
            Self::AfterSave => "__operation__after_save",
        }
    }
}

/// `"before save"` becomes `"__operation__before_save"`
pub fn normalize_event(event: &str) -> String {
    let event = event.trim().replace(' ', "_");
    if event.starts_with(EVENT_PREFIX) {
        event
    } else {
        format!("{EVENT_PREFIX}{event}")
    }
}

/// Handler chains keyed by event name
#[derive(Default)]
pub struct Handlers {
    chains: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the chain of `event`
    pub fn on<F>(&self, event: &str, handler: F) -> ModelResult<()>
    where
        F: Fn(&mut EventContext) -> ModelResult<()> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut chains = self
            .chains
            .write()
            .map_err(|_| ModelError::internal("handler registry lock poisoned"))?;
        chains.entry(event.to_string()).or_default().push(handler);
        Ok(())
    }

    pub fn len(&self, event: &str) -> usize {
        self.chains
            .read()
            .map(|chains| chains.get(event).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.chains
            .read()
            .map(|chains| chains.values().all(Vec::is_empty))
            .unwrap_or(true)
    }

    /// Run the chain of `event` against `ctx`
    pub fn dispatch(&self, event: &str, ctx: &mut EventContext) -> ModelResult<()> {
        let chain = {
            let chains = self
                .chains
                .read()
                .map_err(|_| ModelError::internal("handler registry lock poisoned"))?;
            match chains.get(event) {
                Some(chain) => chain.clone(),
                None => return Ok(()),
            }
        };

        for handler in chain {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(
                        event,
                        model = %ctx.model,
                        operation = ctx.operation.name(),
                        message = %message,
                        "event handler panicked"
                    );
                    return Err(ModelError::HandlerPanic {
                        event: event.to_string(),
                        message,
                    });
                }
            }
            if ctx.result.is_some() {
                break;
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::context::{HookResult, RequestContext};
    use crate::model::Operation;
    use std::sync::Mutex;

    fn context() -> EventContext {
        EventContext::new(Arc::new(RequestContext::system()), "Note", Operation::Count)
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl Fn(&mut EventContext) -> ModelResult<()> + Send + Sync + 'static {
        let log = log.clone();
        move |_ctx: &mut EventContext| {
            log.lock().unwrap().push(name);
            Ok(())
        }
    }

    #[test]
    fn test_normalize_event() {
        assert_eq!(normalize_event("before save"), "__operation__before_save");
        assert_eq!(normalize_event("after_load"), "__operation__after_load");
        assert_eq!(
            normalize_event("__operation__before_load"),
            "__operation__before_load"
        );
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new();
        handlers.on("e", recorder(&log, "first")).unwrap();
        handlers.on("e", recorder(&log, "second")).unwrap();

        handlers.dispatch("e", &mut context()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(handlers.len("e"), 2);
    }

    #[test]
    fn test_error_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new();
        handlers
            .on("e", |_ctx: &mut EventContext| Err(ModelError::invalid_input("no")))
            .unwrap();
        handlers.on("e", recorder(&log, "never")).unwrap();

        let err = handlers.dispatch("e", &mut context()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidInput(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_result_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new();
        handlers
            .on("e", |ctx: &mut EventContext| {
                ctx.result = Some(HookResult::Count(7));
                Ok(())
            })
            .unwrap();
        handlers.on("e", recorder(&log, "never")).unwrap();

        let mut ctx = context();
        handlers.dispatch("e", &mut ctx).unwrap();
        assert_eq!(ctx.result, Some(HookResult::Count(7)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panics_become_errors() {
        let handlers = Handlers::new();
        handlers
            .on("e", |_ctx: &mut EventContext| panic!("boom"))
            .unwrap();

        let err = handlers.dispatch("e", &mut context()).unwrap_err();
        match err {
            ModelError::HandlerPanic { message, .. } => assert_eq!(message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
