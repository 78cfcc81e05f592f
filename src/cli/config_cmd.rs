// Copyright 2024-2026 Stagehand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config subcommands: show, validate.
//!
//! Both read configuration straight from the environment (and the optional
//! `STAGEHAND_CONFIG` file) without touching the platform.

use super::{load_config, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};
use crate::config::SuiteConfig;

/// Print effective config as key-value pairs to stdout.
pub fn run_show() -> i32 {
    match load_config() {
        Some(config) => {
            print_config(&config);
            EXIT_OK
        }
        None => EXIT_CONFIG,
    }
}

/// Validate configuration. Returns 0 if usable, 1 if any problem is found.
pub fn run_validate() -> i32 {
    let Some(config) = load_config() else {
        return EXIT_CONFIG;
    };
    report_problems(&config.validate())
}

fn report_problems(problems: &[String]) -> i32 {
    if problems.is_empty() {
        println!("Configuration is valid.");
        return EXIT_OK;
    }
    for problem in problems {
        eprintln!("WARNING: {}", problem);
    }
    EXIT_FAILURE
}

fn print_config(config: &SuiteConfig) {
    for (key, value) in config.effective() {
        println!("{}={}", key, value);
    }
}
