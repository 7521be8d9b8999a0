//! Operation contexts
//!
//! A `RequestContext` is created once per external request and carries
//! the authoritative principal. Each model operation derives an
//! `EventContext` from it; nested operations derive theirs from the same
//! root, so the principal is never re-read from hook-controlled state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{Bson, Document};
use uuid::Uuid;

use super::errors::{ModelError, ModelResult};
use super::instance::Instance;
use super::operation::Operation;
use crate::auth::Principal;
use crate::datasource::DeleteResult;
use crate::filter::Filter;

/// Root context of one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID for tracing
    pub request_id: Uuid,

    pub principal: Principal,

    /// Skip write-path and where-clause coercion
    pub disable_type_conversions: bool,

    deadline: Option<Instant>,
    started_at: Instant,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            principal,
            disable_type_conversions: false,
            deadline: None,
            started_at: Instant::now(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Principal::anonymous())
    }

    /// Context for internal calls; bypasses authorization
    pub fn system() -> Self {
        Self::new(Principal::system())
    }

    /// Bound every connector call made on behalf of this request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.started_at + timeout);
        self
    }

    pub fn without_type_conversions(mut self) -> Self {
        self.disable_type_conversions = true;
        self
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Value a handler may place in `EventContext::result` to skip the
/// operation body
#[derive(Debug, Clone, PartialEq)]
pub enum HookResult {
    Instances(Vec<Instance>),
    Instance(Instance),
    Count(i64),
    Deleted(DeleteResult),
}

impl HookResult {
    fn shape(&self) -> &'static str {
        match self {
            Self::Instances(_) => "instances",
            Self::Instance(_) => "instance",
            Self::Count(_) => "count",
            Self::Deleted(_) => "deleted",
        }
    }

    fn mismatch(self, operation: Operation, expected: &'static str) -> ModelError {
        ModelError::TypeMismatch {
            operation: operation.name(),
            expected,
            found: self.shape(),
        }
    }

    pub fn into_instances(self, operation: Operation) -> ModelResult<Vec<Instance>> {
        match self {
            Self::Instances(instances) => Ok(instances),
            other => Err(other.mismatch(operation, "instances")),
        }
    }

    /// A single instance; `findOne` also accepts a list and takes its head
    pub fn into_instance(self, operation: Operation) -> ModelResult<Option<Instance>> {
        match self {
            Self::Instance(instance) => Ok(Some(instance)),
            Self::Instances(instances) if operation == Operation::FindOne => {
                Ok(instances.into_iter().next())
            }
            other => Err(other.mismatch(operation, "instance")),
        }
    }

    /// Exactly one instance
    pub fn into_single(self, operation: Operation) -> ModelResult<Instance> {
        match self {
            Self::Instance(instance) => Ok(instance),
            other => Err(other.mismatch(operation, "instance")),
        }
    }

    pub fn into_count(self, operation: Operation) -> ModelResult<i64> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(other.mismatch(operation, "count")),
        }
    }

    pub fn into_deleted(self, operation: Operation) -> ModelResult<DeleteResult> {
        match self {
            Self::Deleted(result) => Ok(result),
            other => Err(other.mismatch(operation, "deleted")),
        }
    }
}

/// Scratch space handed to every handler of one operation
#[derive(Debug, Clone)]
pub struct EventContext {
    request: Arc<RequestContext>,
    pub model: String,
    pub operation: Operation,
    pub filter: Option<Filter>,
    /// Payload of `create` and `updateById`
    pub data: Option<Document>,
    /// Target of the `*ById` operations
    pub id: Option<Bson>,
    /// Loaded or written instance; for guarded writes, the current document
    pub instance: Option<Instance>,
    pub result: Option<HookResult>,
    pub is_new_instance: bool,
    /// Set for relation loads that bypass authorization
    pub skip_auth: bool,
    /// Owner-dependent read check postponed until the document is loaded
    pub(crate) deferred_owner_check: bool,
}

impl EventContext {
    pub fn new(request: Arc<RequestContext>, model: impl Into<String>, operation: Operation) -> Self {
        Self {
            request,
            model: model.into(),
            operation,
            filter: None,
            data: None,
            id: None,
            instance: None,
            result: None,
            is_new_instance: false,
            skip_auth: false,
            deferred_owner_check: false,
        }
    }

    /// Context for a nested operation under the same request
    pub fn child(&self, model: impl Into<String>, operation: Operation) -> Self {
        Self::new(self.request.clone(), model, operation)
    }

    pub fn request(&self) -> &Arc<RequestContext> {
        &self.request
    }

    pub fn principal(&self) -> &Principal {
        &self.request.principal
    }

    pub fn disable_type_conversions(&self) -> bool {
        self.request.disable_type_conversions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_child_shares_the_root_principal() {
        let root = Arc::new(RequestContext::new(Principal::user("u1", vec![])));
        let mut ctx = EventContext::new(root, "Note", Operation::FindMany);
        ctx.skip_auth = true;

        let child = ctx.child("Account", Operation::FindMany);
        assert_eq!(child.principal().user_id.as_deref(), Some("u1"));
        assert!(!child.skip_auth);
        assert_eq!(child.request().request_id, ctx.request().request_id);
    }

    #[test]
    fn test_hook_result_shapes() {
        let instance = Instance::new("Note", doc! {"_id": 1});
        assert!(HookResult::Count(3).into_count(Operation::Count).is_ok());
        assert!(HookResult::Instances(vec![instance.clone()])
            .into_instance(Operation::FindOne)
            .unwrap()
            .is_some());

        let err = HookResult::Count(3)
            .into_instances(Operation::FindMany)
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::TypeMismatch {
                operation: "findMany",
                expected: "instances",
                found: "count"
            }
        ));
        assert!(HookResult::Instances(vec![instance])
            .into_instance(Operation::FindById)
            .is_err());
    }

    #[test]
    fn test_deadline() {
        let ctx = RequestContext::system().with_timeout(Duration::from_secs(30));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(30));
        assert!(RequestContext::anonymous().remaining().is_none());
    }
}
