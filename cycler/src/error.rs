// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::OsFamily;
use thiserror::Error;

/// Errors that terminate a cycling campaign.
///
/// Expected hardware flakiness is reported through
/// [`ResetStatus`](crate::ResetStatus) instead; these are reserved for
/// misconfiguration, unsupported environments and collaborator breakage.
#[derive(Error, Debug)]
pub enum CycleError {
    /// A verification step failed and the configuration asks for a hard
    /// failure instead of a logged one.
    #[error("test failed: {0}")]
    TestFail(String),
    /// The test environment could not be prepared.
    #[error("test error: {0}")]
    TestError(String),
    /// The requested operation has no implementation for the SUT's OS.
    #[error("{operation} is not supported on {os:?}")]
    Unsupported {
        /// The operation that was requested.
        operation: &'static str,
        /// The OS family of the SUT.
        os: OsFamily,
    },
    /// A collaborator failed in a way the engine cannot classify.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
