pub mod property;
pub mod unit;

use std::sync::Arc;

use tarn_host::host::{ExecutionContext, HostContext};

/// Fresh host and execution context for one test.
pub fn test_env() -> (Arc<HostContext>, ExecutionContext) {
    let host = HostContext::new();
    let ctx = ExecutionContext::new(Arc::clone(&host));
    (host, ctx)
}
