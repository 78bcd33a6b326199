// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Logging setup shared by the `nydus-blobd` binary, built on `flexi_logger`
//! the same way the rest of this workspace does.

use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};

/// Initialize logging to stderr (and optionally a log file), honoring a
/// textual level such as `"info"` or `"trace"`.
pub fn setup_logging(log_file: Option<&str>, level: &str) -> Result<LoggerHandle, String> {
    let mut logger = Logger::try_with_str(level).map_err(|e| e.to_string())?;

    logger = if let Some(path) = log_file {
        logger
            .log_to_file(FileSpec::try_from(path).map_err(|e| e.to_string())?)
            .duplicate_to_stderr(Duplicate::Warn)
    } else {
        logger.log_to_stdout()
    };

    logger.start().map_err(|e| e.to_string())
}
