use crate::error::Result;
use crate::types::{Inventory, Trigger};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetch one complete view of running containers and networks.
    async fn inventory(&self) -> Result<Inventory>;

    /// Start monitoring the runtime for container changes.
    /// Each change is sent to the provided channel as a trigger.
    async fn monitor(&self, trigger_tx: mpsc::Sender<Trigger>) -> Result<()>;
}
