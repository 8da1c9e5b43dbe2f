// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These should
//! not be used in production code.

pub mod poll;

use slog::Drain;
use slog::Logger;

/// Build a terminal logger at `level`, tagged with `component`
pub fn stderr_logger(component: &'static str, level: slog::Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, slog::o!("component" => component))
}

/// Set up a logger appropriate for a test named `test_name`
///
/// Output goes through the test harness's captured stdout, so it only shows
/// up for failing tests (or with `--nocapture`).
pub fn test_setup_log(test_name: &'static str) -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, slog::o!("test_name" => test_name))
}
