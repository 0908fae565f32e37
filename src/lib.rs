// Copyright © 2025 Cyberus Technology GmbH
// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::fmt::Write;

/// Renders `top_error` and all of its sources, one per line.
pub fn error_chain(top_error: &dyn Error) -> String {
    let mut out = String::new();
    if top_error.source().is_none() {
        let _ = writeln!(out, "error:");
        let _ = writeln!(out, "  {top_error}");
    } else {
        let _ = writeln!(out, "chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| (*sub_error).source())
            .enumerate()
            .for_each(|(level, error)| {
                let _ = writeln!(out, "  {level}: {error}");
            });
    }
    out
}

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!(
        "Error: {component} exited with the following {}",
        error_chain(top_error)
    );
    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}
