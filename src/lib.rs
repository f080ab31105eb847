// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

use qcow::ErrorClass;

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("Error: {component} failed with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        error_chain(top_error)
            .enumerate()
            .for_each(|(level, error)| eprintln!("  {level}: {error}"));
    }

    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}

fn error_chain<'a>(top_error: &'a dyn Error) -> impl Iterator<Item = &'a dyn Error> {
    std::iter::successors(Some(top_error), |sub_error| {
        // Dereference necessary to mitigate rustc compiler bug.
        // See <https://github.com/rust-lang/rust/issues/141673>
        (*sub_error).source()
    })
}

/// Process exit code for a failure of the given class.
///
/// 2 is reserved for `check` finding errors in an image.
pub fn exit_code(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Io => 1,
        ErrorClass::Usage => 3,
        ErrorClass::Format => 4,
        ErrorClass::Resolution => 5,
        ErrorClass::Resource => 6,
    }
}
