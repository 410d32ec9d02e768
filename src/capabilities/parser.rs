use std::sync::Arc;

use anyhow::Result;

use super::{CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::args::ArgParser;

/// Gives scripts their own yargs-style parser for ad-hoc argument lists.
pub struct ArgsProvider;

impl CapabilityProvider for ArgsProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Args
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        Ok(CapabilityHandle::Args(Arc::new(ArgParser::new())))
    }
}
