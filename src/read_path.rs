//! Read Path
//!
//! Lock-free counter reads. A read never waits on the increment lock, so it may observe
//! the value from before or after a concurrent increment.

use crate::context::ServiceContext;
use crate::counter_codec;
use crate::{CounterError, Result};
use std::sync::Arc;
use tracing::debug;

pub struct CounterReader {
    context: Arc<ServiceContext>,
}

impl CounterReader {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Current committed counter value as seen by the store
    pub async fn read(&self) -> Result<u64> {
        let key = self.context.counter_key();
        let raw = self
            .context
            .client()
            .get(key)
            .await
            .map_err(|e| {
                CounterError::StoreUnavailable(format!("error fetching counter: {}", e.message()))
            })?;

        let value = counter_codec::parse(raw.as_deref());
        debug!("Fetched counter key={} value={}", key, value);
        Ok(value)
    }
}
