// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbuf read` command - Print the current message.

use shmbuf_core::AccessStatus;

use super::Target;

pub fn execute(
    target: &Target<'_>,
    peek: bool,
    blocking: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = target.open()?;
    let mut out = Vec::new();

    let status = match (peek, blocking) {
        (true, _) => buffer.peek(&mut out)?,
        (false, Some(secs)) => buffer.blocking_read(&mut out, secs)?,
        (false, None) => buffer.read(&mut out)?,
    };

    match status {
        AccessStatus::ReadNew => println!("{}", String::from_utf8_lossy(&out)),
        _ => println!("(no new data)"),
    }
    Ok(())
}
