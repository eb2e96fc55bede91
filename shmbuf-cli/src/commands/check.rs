// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbuf check` command - Report the was-read flag.

use super::Target;

pub fn execute(target: &Target<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = target.open()?;
    if buffer.check_if_read()? {
        println!("read");
    } else {
        println!("unread");
    }
    Ok(())
}
