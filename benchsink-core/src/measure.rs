use std::time::Duration;

use crate::config::OutputConfig;
use crate::error::Result;
use crate::message::Message;

/// A record derived from a message. The latency feeds the latency timing of the output.
pub trait Timed {
    fn latency(&self) -> Duration;
}

/// Receives the records derived by the consume loop. Dropping the reporter releases it.
#[trait_variant::make(Reporter: Send)]
#[allow(dead_code)]
pub trait LocalReporter<R> {
    /// Hands a record to the reporter, may wait while the reporter is saturated.
    async fn report(&mut self, record: R) -> Result<()>;
}

/// Measure knows how to turn a [Message] into a record and how to build the [Reporter] that
/// consumes those records.
pub trait Measure: Send + Sync + 'static {
    type Record: Timed + Send + 'static;
    type Reporter: Reporter<Self::Record> + Send + 'static;

    /// Derives a record from the message, failing is not fatal for the output.
    fn derive(&self, message: &Message) -> Result<Self::Record>;

    /// Creates the reporter, called once when the consume loop starts. Runs inside the tokio
    /// runtime so the reporter may spawn its own tasks.
    fn reporter(&self, config: &OutputConfig) -> Self::Reporter;
}
