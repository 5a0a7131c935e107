use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tasks::TaskChannel;

/// Forces the slave process to exit with a nonzero status. The master half
/// does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Terminate {}

impl Terminate {
    pub(crate) async fn run_master(&self, _ch: &TaskChannel) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn run_slave(&self, _root: &Path, _ch: &TaskChannel) -> Result<()> {
        tracing::warn!("terminate task received, exiting");
        std::process::exit(1);
    }
}
