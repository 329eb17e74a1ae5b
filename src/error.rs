// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

use thiserror::Error;

/// Failures raised by a [`ComputeBackend`](crate::backend::ComputeBackend).
///
/// These are fatal to a run: the optimizer never retries them.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to compile kernel '{entry_point}': {message}")]
    Compile {
        entry_point: String,
        message: String,
    },

    #[error("Failed to allocate device buffer of {len} elements: {message}")]
    Allocation { len: usize, message: String },

    #[error("Invalid dispatch (local = {local}, global = {global}): {message}")]
    Dispatch {
        local: u32,
        global: u32,
        message: String,
    },

    #[error("Compute device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum ThomsonError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A point collapsed onto the origin and cannot be projected back onto the sphere
    #[error("Point {index} collapsed to norm {norm:e} and cannot be renormalized")]
    DegenerateConfiguration { index: usize, norm: f32 },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ThomsonError>;
