// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbuf write` command - Publish a message.

use shmbuf_core::AccessStatus;

use super::Target;

pub fn execute(target: &Target<'_>, message: &str, if_read: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = target.open()?;

    let status = if if_read {
        buffer.write_if_read(message.as_bytes())?
    } else {
        buffer.write(message.as_bytes())?
    };

    match status {
        AccessStatus::WriteBlocked => {
            println!("✗ Previous message has not been read, nothing written");
        }
        _ => println!("✓ Wrote {} bytes", message.len()),
    }
    Ok(())
}
