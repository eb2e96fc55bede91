// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use shmbuf_core::{BufferConfig, ConfigLoader, Role, ShmBuffer, SysvIpc};

pub mod check;
pub mod info;
pub mod read;
pub mod write;

/// Buffer selection shared by every command.
pub struct Target<'a> {
    pub config: &'a str,
    pub master: bool,
}

impl Target<'_> {
    pub fn load(&self) -> Result<BufferConfig, Box<dyn std::error::Error>> {
        let mut config = ConfigLoader::load_file(self.config)?;
        if self.master {
            config.role = Role::Master;
        }
        Ok(config)
    }

    pub fn open(&self) -> Result<ShmBuffer, Box<dyn std::error::Error>> {
        let config = self.load()?;
        tracing::debug!(
            buffer = %config.name,
            key = %config.key,
            role = %config.role,
            "Opening buffer"
        );
        Ok(ShmBuffer::open(config, &SysvIpc)?)
    }
}
