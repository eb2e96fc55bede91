// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmbuf info` command - Show configuration and layout.

use super::Target;

pub fn execute(target: &Target<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let config = target.load()?;

    println!("Buffer Settings:");
    println!("  Name:              {}", config.name);
    println!("  Key:               {}", config.key);
    println!("  Size:              {} bytes", config.size);
    println!("  Role:              {}", config.role);
    println!("  Exclusion:         {}", config.exclusion);
    println!(
        "  OS Semaphore:      {}",
        if config.exclusion.needs_os_semaphore() { "yes" } else { "no" }
    );
    println!("  Timeout:           {}", config.timeout);
    match config.notifier_key {
        Some(key) => println!("  Blocking Notifier: {}", key),
        None => println!("  Blocking Notifier: none"),
    }
    println!(
        "  Connection:        {} of {}",
        config.connection_index, config.total_connections
    );
    println!(
        "  Name Tag Header:   {}",
        if config.header_validation_enabled() { "enabled" } else { "disabled" }
    );

    let buffer = target.open()?;
    if let Some(layout) = buffer.layout() {
        println!();
        println!("Segment Layout:");
        println!("  Name Tag:          {} bytes", layout.name_tag_size);
        println!("  Connection Table:  offset {}", layout.connection_table_offset);
        println!(
            "  Auto-key Table:    offset {} ({} bytes)",
            layout.autokey_table_offset, layout.autokey_table_size
        );
        println!("  User Data:         offset {}", layout.user_data_offset);
        println!();
        println!("Size Budgets:");
        println!("  Max Message:       {} bytes", layout.budgets.max_message_size);
        println!("  Max Encoded:       {} bytes", layout.budgets.max_encoded_message_size);
        println!("  Guaranteed Space:  {} bytes", layout.budgets.guaranteed_message_space);
        println!("  Subdivision:       {} bytes", layout.budgets.subdivision_size);
        println!("  Max Payload:       {} bytes", buffer.max_payload());
    }
    Ok(())
}
